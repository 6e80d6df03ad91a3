use std::{
    path::{Path, PathBuf},
    process::{Child, ExitStatus},
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    error::{ControlError, Result},
    process_log::{ProcessLog, SharedLog, create_session_log_file, spawn_reader},
    system::ProcessServices,
};

pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(500);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub code: Option<i32>,
    /// The process ignored SIGTERM and was killed.
    pub forced: bool,
}

impl ChildExit {
    fn from_status(status: ExitStatus, forced: bool) -> Self {
        Self {
            code: status.code(),
            forced,
        }
    }
}

impl std::fmt::Display for ChildExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code: {code}")?,
            None => write!(f, "terminated by signal")?,
        }
        if self.forced {
            write!(f, " (killed after shutdown timeout)")?;
        }
        Ok(())
    }
}

/// Supervises at most one proxy child process.
pub struct ProxyProcess {
    services: Arc<dyn ProcessServices>,
    child: Option<Child>,
    state: ProcessState,
    startup_grace: Duration,
    shutdown_timeout: Duration,
    log: SharedLog,
    logs_directory: Option<PathBuf>,
}

impl ProxyProcess {
    pub fn new(services: Arc<dyn ProcessServices>) -> Self {
        Self {
            services,
            child: None,
            state: ProcessState::NotStarted,
            startup_grace: DEFAULT_STARTUP_GRACE,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            log: Arc::new(Mutex::new(ProcessLog::new())),
            logs_directory: None,
        }
    }

    pub fn with_timeouts(mut self, startup_grace: Duration, shutdown_timeout: Duration) -> Self {
        self.startup_grace = startup_grace;
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Mirrors the proxy's output into a timestamped file under `directory`.
    pub fn with_session_logs(mut self, directory: PathBuf) -> Self {
        self.logs_directory = Some(directory);
        self
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ProcessState::Running
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn log(&self) -> SharedLog {
        self.log.clone()
    }

    /// Spawns `binary -config <configuration_path>` and waits out the startup
    /// grace period, returning early once the proxy prints its banner.
    pub fn start(&mut self, binary: &Path, configuration_path: &Path) -> Result<u32> {
        self.try_reap();
        if let Some(pid) = self.pid() {
            log::warn!("[process] start refused, pid={pid} is still running");
            return Err(ControlError::AlreadyRunning(pid));
        }

        if let Ok(mut locked_log) = self.log.lock() {
            locked_log.reset();
        }

        let launch_error = |reason: String| ControlError::Launch {
            binary: binary.display().to_string(),
            reason,
        };

        let mut child = self
            .services
            .spawn_proxy(binary, configuration_path)
            .map_err(|error| launch_error(error.to_string()))?;

        let session_file = self
            .logs_directory
            .as_deref()
            .and_then(create_session_log_file);
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(
                "stdout",
                stdout,
                self.log.clone(),
                session_file.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader("stderr", stderr, self.log.clone(), session_file));
        } else {
            log::warn!("[process] no stderr pipe from child");
        }

        if let Err(reason) = self.await_startup(&mut child, &readers) {
            log::error!("[process] launch failed: {reason}");
            return Err(launch_error(reason));
        }

        let pid = child.id();
        log::info!("[process] proxy running (pid={pid})");
        self.child = Some(child);
        self.state = ProcessState::Running;
        Ok(pid)
    }

    /// Sends SIGTERM and waits for the exit, killing the process once the
    /// shutdown timeout has passed.
    pub fn stop(&mut self) -> Result<ChildExit> {
        let Some(mut child) = self.child.take() else {
            return Err(ControlError::NotRunning);
        };
        self.state = ProcessState::Stopped;

        if let Ok(Some(status)) = child.try_wait() {
            log::info!("[process] proxy already exited: {status}");
            return Ok(ChildExit::from_status(status, false));
        }

        let pid = child.id();
        if self.services.terminate_process(pid) {
            log::info!("[terminate] sent SIGTERM to pid={pid}");
        } else {
            log::warn!("[terminate] SIGTERM failed for pid={pid}");
        }

        let exit = wait_with_timeout(&mut child, self.shutdown_timeout);
        log::info!("[terminate] proxy stopped (pid={pid}, {exit})");
        Ok(exit)
    }

    /// Notices a proxy that exited on its own and moves the handle to
    /// [`ProcessState::Stopped`].
    pub fn try_reap(&mut self) -> Option<ChildExit> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                log::warn!("[process] proxy exited unexpectedly: {status}");
                self.child = None;
                self.state = ProcessState::Stopped;
                Some(ChildExit::from_status(status, false))
            }
            Ok(None) => None,
            Err(error) => {
                log::warn!("[process] failed to query proxy state: {error}");
                None
            }
        }
    }

    fn await_startup(
        &self,
        child: &mut Child,
        readers: &[JoinHandle<()>],
    ) -> std::result::Result<(), String> {
        let deadline = Instant::now() + self.startup_grace;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    drain_readers(readers);
                    return Err(self.startup_failure(status));
                }
                Ok(None) => {}
                Err(error) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(format!("cannot query process state: {error}"));
                }
            }

            let started = self.log.lock().map(|log| log.started).unwrap_or(false);
            if started || Instant::now() >= deadline {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn startup_failure(&self, status: ExitStatus) -> String {
        let mut reason = match status.code() {
            Some(code) => format!("exited during startup with code {code}"),
            None => "killed by a signal during startup".to_string(),
        };
        if let Ok(log) = self.log.lock()
            && let Some(line) = log.error.as_ref().or(log.lines.last())
        {
            reason.push_str(": ");
            reason.push_str(line);
        }
        reason
    }
}

impl Drop for ProxyProcess {
    fn drop(&mut self) {
        if self.child.is_some() {
            log::info!("[drop] stopping proxy still running");
            let _ = self.stop();
        }
    }
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> ChildExit {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return ChildExit::from_status(status, false),
            Ok(None) if Instant::now() < deadline => std::thread::sleep(POLL_INTERVAL),
            Ok(None) => break,
            Err(error) => {
                log::warn!("[terminate] wait error: {error}");
                break;
            }
        }
    }

    log::warn!(
        "[terminate] graceful shutdown timed out for pid={}, killing",
        child.id()
    );
    if let Err(error) = child.kill() {
        log::warn!("[terminate] kill failed: {error}");
    }
    match child.wait() {
        Ok(status) => ChildExit::from_status(status, true),
        Err(error) => {
            log::warn!("[terminate] child wait error: {error}");
            ChildExit {
                code: None,
                forced: true,
            }
        }
    }
}

/// Gives the output readers a moment to reach EOF so the last lines of a
/// crashed proxy are in the log.
fn drain_readers(readers: &[JoinHandle<()>]) {
    let deadline = Instant::now() + READER_DRAIN_TIMEOUT;
    while Instant::now() < deadline && !readers.iter().all(JoinHandle::is_finished) {
        std::thread::sleep(Duration::from_millis(10));
    }
}
