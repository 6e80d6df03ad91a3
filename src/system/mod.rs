use std::{
    io,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::Arc,
};

pub mod proxy;

/// Seam between [`crate::process::ProxyProcess`] and the operating system.
pub trait ProcessServices: Send + Sync {
    fn spawn_proxy(&self, binary: &Path, configuration_path: &Path) -> io::Result<Child>;

    /// Asks the process to shut down gracefully (SIGTERM).
    fn terminate_process(&self, process_id: u32) -> bool;
}

pub struct HostSystem;

pub fn host_system() -> Arc<dyn ProcessServices> {
    Arc::new(HostSystem)
}

impl ProcessServices for HostSystem {
    fn spawn_proxy(&self, binary: &Path, configuration_path: &Path) -> io::Result<Child> {
        log::info!(
            "[process] spawning: {} -config {}",
            binary.display(),
            configuration_path.display(),
        );
        Command::new(binary)
            .arg("-config")
            .arg(configuration_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }

    fn terminate_process(&self, process_id: u32) -> bool {
        let process_id_string = process_id.to_string();
        run_silent("kill", &["-TERM", &process_id_string])
    }
}

/// Runs `program` to completion. `Ok` carries stdout, `Err` a description of
/// the spawn error or the non-zero exit.
pub fn run_checked(program: &str, arguments: &[&str]) -> Result<String, String> {
    log::debug!("[cmd] {} {}", program, arguments.join(" "));
    let output = Command::new(program)
        .args(arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|error| {
            log::debug!("[cmd] spawn error for {}: {}", program, error);
            format!("cannot run {program}: {error}")
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if output.status.success() {
        log::trace!(
            "[cmd] OK: {} {} → stdout={}",
            program,
            arguments.join(" "),
            stdout.trim(),
        );
        return Ok(stdout);
    }

    log::debug!(
        "[cmd] FAILED (exit {}): {} {}\n  stdout: {}\n  stderr: {}",
        output.status.code().unwrap_or(-1),
        program,
        arguments.join(" "),
        stdout.trim(),
        stderr.trim(),
    );
    let status = match output.status.code() {
        Some(code) => format!("{program} exited with code {code}"),
        None => format!("{program} terminated by signal"),
    };
    if stderr.trim().is_empty() {
        Err(status)
    } else {
        Err(format!("{status}: {}", stderr.trim()))
    }
}

pub fn run_silent(program: &str, arguments: &[&str]) -> bool {
    run_checked(program, arguments).is_ok()
}

pub fn find_proxy_binary() -> Option<PathBuf> {
    let mut candidates = vec![
        PathBuf::from("/usr/local/bin/v2ray"),
        PathBuf::from("/usr/bin/v2ray"),
        PathBuf::from("/opt/v2ray/v2ray"),
    ];
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join("v2ray-linux-64").join("v2ray"));
        candidates.push(home.join("Downloads").join("v2ray-linux-64").join("v2ray"));
    }

    if let Ok(path) = run_checked("which", &["v2ray"]) {
        let path = path.trim();
        if !path.is_empty() {
            log::info!("[binary] found via which: {path}");
            return Some(PathBuf::from(path));
        }
    }

    for candidate in candidates {
        if candidate.is_file() {
            log::info!("[binary] found on disk: {}", candidate.display());
            return Some(candidate);
        }
    }

    log::warn!("[binary] v2ray not found in PATH or standard locations");
    None
}
