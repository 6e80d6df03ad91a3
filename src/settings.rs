use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};

pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:10809";
const DEFAULT_PORT: u16 = 10809;

/// Controller settings, kept apart from the v2ray JSON document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Settings {
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<PathBuf>,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Milliseconds a freshly spawned proxy must stay alive to count as started.
    #[serde(default = "default_startup_grace")]
    pub startup_grace: u64,
    /// Milliseconds to wait after SIGTERM before killing the proxy.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
    #[serde(default = "default_session_logs")]
    pub session_logs: bool,
}

fn default_config_path() -> PathBuf {
    configuration_directory().join("v2ray").join("config.json")
}

fn default_listen_address() -> String {
    DEFAULT_LISTEN_ADDRESS.into()
}

fn default_startup_grace() -> u64 {
    500
}

fn default_shutdown_timeout() -> u64 {
    5000
}

fn default_session_logs() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: default_config_path(),
            binary_path: None,
            listen_address: default_listen_address(),
            startup_grace: default_startup_grace(),
            shutdown_timeout: default_shutdown_timeout(),
            session_logs: default_session_logs(),
        }
    }
}

pub fn configuration_directory() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn application_directory() -> PathBuf {
    configuration_directory().join("v2ray-control")
}

impl Settings {
    pub fn settings_file_path() -> PathBuf {
        application_directory().join("v2ray-control.toml")
    }

    /// A missing file yields defaults; an unreadable or malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                log::info!(
                    "[settings] no settings file at {}, using defaults",
                    path.display()
                );
                return Ok(Self::default());
            }
            Err(error) => {
                return Err(ControlError::Settings {
                    path: path.to_path_buf(),
                    reason: error.to_string(),
                });
            }
        };

        let settings: Self = toml::from_str(&content).map_err(|error| ControlError::Settings {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })?;
        log::info!("[settings] loaded from {}", path.display());
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| ControlError::io(parent, error))?;
        }
        let content = toml::to_string_pretty(self).map_err(|error| ControlError::Settings {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })?;
        std::fs::write(path, content).map_err(|error| ControlError::io(path, error))
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout)
    }

    pub fn listen_endpoint(&self) -> Result<(String, u16)> {
        parse_host_port(&self.listen_address)
    }
}

/// Accepts `host:port`, `[v6]:port` and a bare host (default port).
pub fn parse_host_port(address: &str) -> Result<(String, u16)> {
    let invalid = |reason: &str| ControlError::Validation {
        field: "listen_address",
        reason: format!("'{address}': {reason}"),
    };
    let port = |text: &str| match text.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid("bad port")),
        Ok(port) => Ok(port),
    };

    if address.starts_with('[') {
        let bracket_end = address.find(']').ok_or_else(|| invalid("unclosed '['"))?;
        let host = &address[1..bracket_end];
        let rest = &address[bracket_end + 1..];
        return match rest.strip_prefix(':') {
            Some(text) => Ok((host.to_string(), port(text)?)),
            None if rest.is_empty() => Ok((host.to_string(), DEFAULT_PORT)),
            None => Err(invalid("unexpected text after ']'")),
        };
    }

    match address.rsplit_once(':') {
        // more than one colon: bare IPv6 without a port
        Some((host, _)) if host.contains(':') => Ok((address.to_string(), DEFAULT_PORT)),
        Some((host, text)) if !host.is_empty() => Ok((host.to_string(), port(text)?)),
        Some(_) => Err(invalid("missing host")),
        None if address.is_empty() => Err(invalid("missing host")),
        None => Ok((address.to_string(), DEFAULT_PORT)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let directory = tempfile::tempdir().unwrap();
        let settings = Settings::load(&directory.path().join("absent.toml")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.listen_address, DEFAULT_LISTEN_ADDRESS);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("settings.toml");
        std::fs::write(
            &path,
            "binary_path = \"/opt/v2ray/v2ray\"\nshutdown_timeout = 250\n",
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();

        assert_eq!(settings.binary_path, Some(PathBuf::from("/opt/v2ray/v2ray")));
        assert_eq!(settings.shutdown_timeout(), Duration::from_millis(250));
        assert_eq!(settings.startup_grace(), Duration::from_millis(500));
        assert!(settings.session_logs);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("settings.toml");
        std::fs::write(&path, "startup_grace = \"soon\"").unwrap();
        assert!(matches!(
            Settings::load(&path),
            Err(ControlError::Settings { .. })
        ));
    }

    #[test]
    fn save_then_load() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("nested").join("settings.toml");
        let settings = Settings {
            listen_address: "127.0.0.1:1080".into(),
            session_logs: false,
            ..Settings::default()
        };

        settings.save(&path).unwrap();

        assert_eq!(Settings::load(&path).unwrap(), settings);
    }

    #[test]
    fn host_port_forms() {
        assert_eq!(
            parse_host_port("127.0.0.1:10809").unwrap(),
            ("127.0.0.1".to_string(), 10809)
        );
        assert_eq!(
            parse_host_port("[::1]:1080").unwrap(),
            ("::1".to_string(), 1080)
        );
        assert_eq!(
            parse_host_port("localhost").unwrap(),
            ("localhost".to_string(), DEFAULT_PORT)
        );
        assert_eq!(
            parse_host_port("::1").unwrap(),
            ("::1".to_string(), DEFAULT_PORT)
        );
        assert_eq!(
            parse_host_port("[::1]").unwrap(),
            ("::1".to_string(), DEFAULT_PORT)
        );
        assert!(parse_host_port("[::1]junk").is_err());
        assert!(parse_host_port("127.0.0.1:http").is_err());
        assert!(parse_host_port(":1080").is_err());
        assert!(parse_host_port("").is_err());
    }
}
