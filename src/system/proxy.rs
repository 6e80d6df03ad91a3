use crate::error::{ControlError, Result};

use super::run_checked;

const PROXY_SCHEMA: &str = "org.gnome.system.proxy";
const SOCKS_SCHEMA: &str = "org.gnome.system.proxy.socks";

/// Host mechanism that routes desktop traffic through the local proxy.
///
/// Nothing is read back: a backend only reports whether its commands ran.
pub trait ProxyBackend: Send {
    fn name(&self) -> &str;

    /// Sub-settings applied before a failing one are left in place.
    fn enable(&mut self, host: &str, port: u16) -> Result<String>;

    fn disable(&mut self) -> Result<String>;
}

/// GNOME-style desktops, configured through `gsettings`.
pub struct GnomeProxy {
    program: String,
}

impl GnomeProxy {
    pub fn new() -> Self {
        Self::with_program("gsettings")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn apply(&self, step: &'static str, schema: &str, key: &str, value: &str) -> Result<()> {
        run_checked(&self.program, &["set", schema, key, value])
            .map(|_| ())
            .map_err(|detail| ControlError::Setting { step, detail })
    }
}

impl Default for GnomeProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyBackend for GnomeProxy {
    fn name(&self) -> &str {
        "GSettings"
    }

    fn enable(&mut self, host: &str, port: u16) -> Result<String> {
        let port_string = port.to_string();
        log::info!("[proxy] GSettings: setting SOCKS5 proxy to {host}:{port}");

        let steps = [
            ("mode", PROXY_SCHEMA, "mode", "manual"),
            ("socks host", SOCKS_SCHEMA, "host", host),
            ("socks port", SOCKS_SCHEMA, "port", port_string.as_str()),
        ];

        let mut applied: Vec<&str> = Vec::new();
        for (step, schema, key, value) in steps {
            if let Err(error) = self.apply(step, schema, key, value) {
                if applied.is_empty() {
                    log::warn!("[proxy] GSettings: {error}");
                } else {
                    log::warn!(
                        "[proxy] GSettings: {error} (already applied: {})",
                        applied.join(", ")
                    );
                }
                return Err(error);
            }
            applied.push(step);
        }

        Ok(format!(
            "System proxy configured via GSettings (SOCKS5 {host}:{port})"
        ))
    }

    fn disable(&mut self) -> Result<String> {
        log::info!("[proxy] GSettings: clearing proxy mode");
        self.apply("mode", PROXY_SCHEMA, "mode", "none")
            .inspect_err(|error| log::warn!("[proxy] GSettings: {error}"))?;
        Ok("System proxy disabled via GSettings".into())
    }
}
