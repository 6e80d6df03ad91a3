use std::{
    fs,
    io::{BufRead, BufReader, ErrorKind, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread::JoinHandle,
};

const MAX_LOG_LINES: usize = 500;
const MAX_SESSION_FILE_ATTEMPTS: usize = 100;

pub type SharedLog = Arc<Mutex<ProcessLog>>;
pub type SessionFile = Arc<Mutex<fs::File>>;

#[derive(Debug, PartialEq)]
pub enum LogLineEvent {
    Started,
    Error,
    Normal,
}

pub fn classify_log_line(line: &str) -> LogLineEvent {
    let lower = line.to_lowercase();

    if (lower.contains("v2ray") || lower.contains("xray")) && lower.contains(" started") {
        return LogLineEvent::Started;
    }

    if lower.starts_with("error")
        || lower.starts_with("panic:")
        || lower.contains("[error]")
        || lower.contains("failed to")
        || lower.contains("failed on")
        || lower.contains("address already in use")
        || lower.contains("permission denied")
    {
        return LogLineEvent::Error;
    }

    LogLineEvent::Normal
}

/// Bounded capture of the proxy's stdout and stderr.
#[derive(Default)]
pub struct ProcessLog {
    pub lines: Vec<String>,
    pub started: bool,
    pub error: Option<String>,
}

impl ProcessLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.lines.clear();
        self.started = false;
        self.error = None;
    }

    pub fn push_line(&mut self, line: String) {
        match classify_log_line(&line) {
            LogLineEvent::Started => {
                log::info!("[detect] proxy reported startup: {line}");
                self.started = true;
            }
            LogLineEvent::Error => {
                log::warn!("[detect] proxy error: {line}");
                if self.error.is_none() {
                    self.error = Some(line.clone());
                }
            }
            LogLineEvent::Normal => {}
        }

        self.lines.push(line);
        if self.lines.len() > MAX_LOG_LINES {
            self.lines.remove(0);
        }
    }

    pub fn tail(&self, count: usize) -> &[String] {
        &self.lines[self.lines.len().saturating_sub(count)..]
    }
}

pub fn session_logs_directory(base: &Path) -> PathBuf {
    base.join("logs")
}

pub fn create_session_log_file(directory: &Path) -> Option<SessionFile> {
    if let Err(error) = fs::create_dir_all(directory) {
        log::warn!("[logs] failed to create log directory: {error}");
        return None;
    }

    let timestamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();

    for attempt in 0..MAX_SESSION_FILE_ATTEMPTS {
        let name = match attempt {
            0 => format!("{timestamp}.log"),
            _ => format!("{timestamp}_{attempt}.log"),
        };
        let log_path = directory.join(name);

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&log_path)
        {
            Ok(file) => {
                log::info!("[logs] session log: {}", log_path.display());
                return Some(Arc::new(Mutex::new(file)));
            }
            Err(error) if error.kind() == ErrorKind::AlreadyExists => continue,
            Err(error) => {
                log::warn!("[logs] failed to create log file: {error}");
                return None;
            }
        }
    }

    log::warn!("[logs] no free session log name for {timestamp}");
    None
}

/// Feeds every line of `stream` into `shared_log` (and `log_file`) until EOF.
pub fn spawn_reader(
    label: &'static str,
    stream: impl Read + Send + 'static,
    shared_log: SharedLog,
    log_file: Option<SessionFile>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(error) => {
                    log::trace!("[child {label}] reader ended: {error}");
                    break;
                }
            };

            if let Some(ref log_file) = log_file
                && let Ok(mut file) = log_file.lock()
                && let Err(error) = writeln!(file, "{line}")
            {
                log::warn!("[logs] failed to write {label} line: {error}");
            }

            let Ok(mut locked_log) = shared_log.lock() else {
                break;
            };
            locked_log.push_line(line);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_startup_banner() {
        assert_eq!(
            classify_log_line("2024/01/01 10:00:00 [Warning] V2Ray 4.45.2 started"),
            LogLineEvent::Started
        );
        assert_eq!(
            classify_log_line("[Warning] core: Xray 1.8.4 started"),
            LogLineEvent::Started
        );
        assert_eq!(
            classify_log_line("V2Ray 4.45.2 (V2Fly, a community-driven edition of V2Ray.)"),
            LogLineEvent::Normal
        );
    }

    #[test]
    fn recognises_errors() {
        for line in [
            "main: failed to read config files: [config.json]",
            "Failed to start: app/proxyman/inbound: failed to listen TCP on 10809",
            "listen tcp 127.0.0.1:10809: bind: address already in use",
            "panic: runtime error",
        ] {
            assert_eq!(classify_log_line(line), LogLineEvent::Error, "{line}");
        }
    }

    #[test]
    fn keeps_first_error_and_bounds_lines() {
        let mut log = ProcessLog::new();
        log.push_line("failed to load config".into());
        log.push_line("failed to start".into());
        for index in 0..MAX_LOG_LINES {
            log.push_line(format!("line {index}"));
        }

        assert_eq!(log.error.as_deref(), Some("failed to load config"));
        assert_eq!(log.lines.len(), MAX_LOG_LINES);
        assert_eq!(log.tail(1), [format!("line {}", MAX_LOG_LINES - 1)]);

        log.reset();
        assert!(log.lines.is_empty() && log.error.is_none() && !log.started);
    }

    #[test]
    fn reader_collects_lines_and_mirrors_to_file() {
        let directory = tempfile::tempdir().unwrap();
        let shared_log: SharedLog = Arc::new(Mutex::new(ProcessLog::new()));
        let file = create_session_log_file(&session_logs_directory(directory.path())).unwrap();

        let input = std::io::Cursor::new(b"V2Ray 5.1.0 started\nhello\n".to_vec());
        spawn_reader("stdout", input, shared_log.clone(), Some(file))
            .join()
            .unwrap();

        let locked = shared_log.lock().unwrap();
        assert!(locked.started);
        assert_eq!(locked.lines, ["V2Ray 5.1.0 started", "hello"]);

        let logs = fs::read_dir(session_logs_directory(directory.path()))
            .unwrap()
            .flatten()
            .collect::<Vec<_>>();
        assert_eq!(logs.len(), 1);
        assert_eq!(
            fs::read_to_string(logs[0].path()).unwrap(),
            "V2Ray 5.1.0 started\nhello\n"
        );
    }

    #[test]
    fn sessions_in_the_same_second_get_separate_files() {
        let directory = tempfile::tempdir().unwrap();
        let logs_directory = session_logs_directory(directory.path());

        let first = create_session_log_file(&logs_directory).unwrap();
        writeln!(first.lock().unwrap(), "first session").unwrap();
        let second = create_session_log_file(&logs_directory).unwrap();
        writeln!(second.lock().unwrap(), "second session").unwrap();

        let mut contents = fs::read_dir(&logs_directory)
            .unwrap()
            .flatten()
            .map(|entry| fs::read_to_string(entry.path()).unwrap())
            .collect::<Vec<_>>();
        contents.sort();
        assert_eq!(contents, ["first session\n", "second session\n"]);
    }
}
