use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::{
    configuration::{ConfigStore, apply_server_fields},
    error::{ControlError, Result},
    process::{ChildExit, ProxyProcess},
    process_log::session_logs_directory,
    settings::{Settings, application_directory},
    system::{find_proxy_binary, host_system, proxy::GnomeProxy, proxy::ProxyBackend},
};

/// Outcome of a launch that got the proxy running.
#[derive(Debug)]
pub enum SessionStart {
    Routed { pid: u32, detail: String },
    /// The proxy runs but the system proxy could not be applied.
    Unrouted { pid: u32, error: ControlError },
}

impl SessionStart {
    pub fn is_routed(&self) -> bool {
        matches!(self, Self::Routed { .. })
    }

    pub fn pid(&self) -> u32 {
        match self {
            Self::Routed { pid, .. } | Self::Unrouted { pid, .. } => *pid,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Routed { pid, detail } => {
                format!("V2Ray started (pid {pid}) and system proxy configured. {detail}")
            }
            Self::Unrouted { pid, error } => format!(
                "V2Ray started (pid {pid}) but traffic is NOT routed through it: {error}"
            ),
        }
    }
}

pub struct ProxyController {
    store: ConfigStore,
    binary_path: Option<PathBuf>,
    listen_host: String,
    listen_port: u16,
    process: ProxyProcess,
    proxy: Box<dyn ProxyBackend>,
}

impl ProxyController {
    pub fn new(
        store: ConfigStore,
        binary_path: Option<PathBuf>,
        (listen_host, listen_port): (String, u16),
        process: ProxyProcess,
        proxy: Box<dyn ProxyBackend>,
    ) -> Self {
        Self {
            store,
            binary_path,
            listen_host,
            listen_port,
            process,
            proxy,
        }
    }

    /// Host services, GSettings routing and optional session logs.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut process = ProxyProcess::new(host_system())
            .with_timeouts(settings.startup_grace(), settings.shutdown_timeout());
        if settings.session_logs {
            process = process.with_session_logs(session_logs_directory(&application_directory()));
        }

        Ok(Self::new(
            ConfigStore::new(&settings.config_path),
            settings.binary_path.clone(),
            settings.listen_endpoint()?,
            process,
            Box::new(GnomeProxy::new()),
        ))
    }

    pub fn config_path(&self) -> &Path {
        self.store.path()
    }

    pub fn process(&self) -> &ProxyProcess {
        &self.process
    }

    pub fn listen_endpoint(&self) -> (&str, u16) {
        (&self.listen_host, self.listen_port)
    }

    pub fn load_config(&self) -> Result<Value> {
        self.store.load()
    }

    pub fn save_field_edits(&self, address: &str, port: &str, protocol: &str) -> Result<String> {
        let config = apply_server_fields(self.store.load()?, address, port, protocol)?;
        self.store.save(&config)?;
        Ok(format!(
            "Configuration saved to {}",
            self.store.path().display()
        ))
    }

    pub fn import_from_text(&self, raw_text: &str) -> Result<String> {
        self.store.replace_from_raw_text(raw_text)?;
        Ok(format!(
            "Configuration imported and saved to {}",
            self.store.path().display()
        ))
    }

    /// Launches the proxy, then routes the system through it. The routing
    /// step only runs once the launch has succeeded.
    pub fn start_session(&mut self) -> Result<SessionStart> {
        log::info!("━━━ START ━━━");

        if !self.store.path().is_file() {
            return Err(ControlError::NotFound(self.store.path().to_path_buf()));
        }
        let binary = self.resolve_binary()?;

        let pid = self.process.start(&binary, self.store.path())?;

        match self.proxy.enable(&self.listen_host, self.listen_port) {
            Ok(detail) => {
                log::info!("[session] {} routing enabled", self.proxy.name());
                Ok(SessionStart::Routed { pid, detail })
            }
            Err(error) => {
                log::warn!("[session] proxy running without system routing: {error}");
                Ok(SessionStart::Unrouted { pid, error })
            }
        }
    }

    /// Stops the proxy, then restores direct routing. A failed stop leaves
    /// the system proxy setting untouched.
    pub fn stop_session(&mut self) -> Result<String> {
        log::info!("━━━ STOP ━━━");

        let exit = self.process.stop()?;
        let detail = self.proxy.disable()?;
        Ok(format!("V2Ray stopped ({exit}). {detail}"))
    }

    /// Restores direct routing regardless of the proxy's state.
    pub fn reset_system_proxy(&mut self) -> Result<String> {
        log::info!("[session] resetting system proxy via {}", self.proxy.name());
        self.proxy.disable()
    }

    pub fn poll_exit(&mut self) -> Option<ChildExit> {
        self.process.try_reap()
    }

    fn resolve_binary(&self) -> Result<PathBuf> {
        if let Some(path) = &self.binary_path {
            return Ok(path.clone());
        }
        find_proxy_binary().ok_or_else(|| ControlError::Launch {
            binary: "v2ray".into(),
            reason: "not found in PATH or standard locations; set binary_path".into(),
        })
    }
}

impl Drop for ProxyController {
    fn drop(&mut self) {
        if !self.process.is_running() {
            return;
        }
        log::info!(
            "[drop] session still active ({:?}), shutting down",
            self.process.state()
        );
        match self.stop_session() {
            Ok(message) => log::info!("[drop] {message}"),
            Err(error) => log::error!("[drop] cleanup failed: {error}"),
        }
    }
}
