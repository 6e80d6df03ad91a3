use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("invalid JSON: {0}")]
    InvalidFormat(#[from] serde_json::Error),

    #[error("configuration has no {path} (missing '{missing}')")]
    Structure {
        path: &'static str,
        missing: String,
    },

    #[error("invalid {field}: {reason}")]
    Validation {
        field: &'static str,
        reason: String,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy is already running (pid={0})")]
    AlreadyRunning(u32),

    #[error("proxy is not running")]
    NotRunning,

    #[error("failed to launch {binary}: {reason}")]
    Launch { binary: String, reason: String },

    /// `step` names the sub-setting that failed; earlier steps stay applied.
    #[error("system proxy {step} failed: {detail}")]
    Setting { step: &'static str, detail: String },

    #[error("settings file {}: {reason}", .path.display())]
    Settings { path: PathBuf, reason: String },
}

impl ControlError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setting_error_names_the_step() {
        let error = ControlError::Setting {
            step: "socks host",
            detail: "exit code: 1".into(),
        };
        assert_eq!(
            error.to_string(),
            "system proxy socks host failed: exit code: 1"
        );
    }

    #[test]
    fn structure_error_mentions_missing_segment() {
        let error = ControlError::Structure {
            path: "outbounds[0].settings.servers[0]",
            missing: "settings".into(),
        };
        assert!(error.to_string().contains("missing 'settings'"));
    }
}
