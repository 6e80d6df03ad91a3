use std::{
    fs, io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Child,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::system::{HostSystem, ProcessServices};

/// Writes an executable `/bin/sh` script standing in for an external program.
pub fn write_script(directory: &Path, name: &str, body: &str) -> PathBuf {
    let path = directory.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut permissions = fs::metadata(&path).unwrap().permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&path, permissions).unwrap();
    path
}

/// Script that appends its arguments to `calls.log` and fails when the
/// settings key (third argument) equals `failing_key`.
pub fn fake_gsettings(directory: &Path, failing_key: Option<&str>) -> (PathBuf, PathBuf) {
    let calls = directory.join("calls.log");
    let failure = match failing_key {
        Some(key) => format!("if [ \"$3\" = \"{key}\" ]; then echo 'No such key' >&2; exit 1; fi"),
        None => String::new(),
    };
    let body = format!("echo \"$@\" >> '{}'\n{failure}", calls.display());
    (write_script(directory, "gsettings", &body), calls)
}

pub fn recorded_calls(calls: &Path) -> Vec<String> {
    fs::read_to_string(calls)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Real process services that count termination requests.
#[derive(Default)]
pub struct RecordingServices {
    terminate_calls: AtomicUsize,
}

impl RecordingServices {
    pub fn terminate_count(&self) -> usize {
        self.terminate_calls.load(Ordering::SeqCst)
    }
}

impl ProcessServices for RecordingServices {
    fn spawn_proxy(&self, binary: &Path, configuration_path: &Path) -> io::Result<Child> {
        HostSystem.spawn_proxy(binary, configuration_path)
    }

    fn terminate_process(&self, process_id: u32) -> bool {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        HostSystem.terminate_process(process_id)
    }
}
