use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use serde::Serialize;
use serde_json::{Map, Value, ser::PrettyFormatter};

use crate::error::{ControlError, Result};

/// Human-readable form of [`SERVER_POINTER`], used in error messages.
pub const SERVER_PATH: &str = "outbounds[0].settings.servers[0]";
const SERVER_POINTER: &str = "/outbounds/0/settings/servers/0";

#[derive(Debug, Clone, PartialEq)]
pub struct ServerFields {
    pub address: String,
    pub port: Option<u16>,
    pub protocol: String,
}

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Value> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(ControlError::NotFound(self.path.clone()));
            }
            Err(error) => return Err(ControlError::io(&self.path, error)),
        };

        let config = serde_json::from_str(&content)?;
        log::debug!("[configuration] loaded {}", self.path.display());
        Ok(config)
    }

    /// Whole-document replace through a temporary file in the same directory.
    pub fn save(&self, config: &Value) -> Result<()> {
        let directory = self.ensure_directory()?;
        let content = to_pretty_json(config)?;

        let mut file = tempfile::NamedTempFile::new_in(&directory)
            .map_err(|error| ControlError::io(&directory, error))?;
        file.write_all(&content)
            .and_then(|_| file.flush())
            .map_err(|error| ControlError::io(file.path(), error))?;
        file.persist(&self.path)
            .map_err(|error| ControlError::io(&self.path, error.error))?;

        log::info!(
            "[configuration] saved {} ({} bytes)",
            self.path.display(),
            content.len()
        );
        Ok(())
    }

    /// Stores `raw_text` verbatim as the new document. Nothing is written
    /// unless it parses.
    pub fn replace_from_raw_text(&self, raw_text: &str) -> Result<Value> {
        let config: Value = serde_json::from_str(raw_text).inspect_err(|error| {
            log::warn!("[configuration] rejected import: {error}");
        })?;
        self.save(&config)?;
        Ok(config)
    }

    fn ensure_directory(&self) -> Result<PathBuf> {
        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&directory).map_err(|error| ControlError::io(&directory, error))?;
        Ok(directory)
    }
}

pub fn apply_server_fields(
    mut config: Value,
    address: &str,
    port: &str,
    protocol: &str,
) -> Result<Value> {
    let port = parse_port(port)?;
    let server = server_entry_mut(&mut config)?;

    server.insert("address".into(), Value::from(address));
    server.insert("port".into(), Value::from(port));
    server.insert("protocol".into(), Value::from(protocol));

    log::debug!("[configuration] server set to {protocol}://{address}:{port}");
    Ok(config)
}

pub fn server_fields(config: &Value) -> Result<ServerFields> {
    let server = config
        .pointer(SERVER_POINTER)
        .and_then(Value::as_object)
        .ok_or_else(|| structure_error(config))?;

    let text = |key: &str| {
        server
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    Ok(ServerFields {
        address: text("address"),
        port: server
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok()),
        protocol: text("protocol"),
    })
}

fn server_entry_mut(config: &mut Value) -> Result<&mut Map<String, Value>> {
    if !config.pointer(SERVER_POINTER).is_some_and(Value::is_object) {
        return Err(structure_error(config));
    }
    config
        .pointer_mut(SERVER_POINTER)
        .and_then(Value::as_object_mut)
        .ok_or_else(|| ControlError::Structure {
            path: SERVER_PATH,
            missing: SERVER_POINTER.into(),
        })
}

fn structure_error(config: &Value) -> ControlError {
    let mut prefix = String::new();
    for segment in SERVER_POINTER.split('/').skip(1) {
        prefix.push('/');
        prefix.push_str(segment);
        if config.pointer(&prefix).is_none() {
            return ControlError::Structure {
                path: SERVER_PATH,
                missing: prefix,
            };
        }
    }
    ControlError::Structure {
        path: SERVER_PATH,
        missing: format!("{SERVER_POINTER} (not an object)"),
    }
}

fn parse_port(port: &str) -> Result<u16> {
    let trimmed = port.trim();
    match trimmed.parse::<u16>() {
        Ok(0) => Err(ControlError::Validation {
            field: "port",
            reason: "must be between 1 and 65535".into(),
        }),
        Ok(port) => Ok(port),
        Err(error) => Err(ControlError::Validation {
            field: "port",
            reason: format!("'{trimmed}' is not a port number ({error})"),
        }),
    }
}

fn to_pretty_json(config: &Value) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut buffer, PrettyFormatter::with_indent(b"    "));
    config.serialize(&mut serializer)?;
    buffer.push(b'\n');
    Ok(buffer)
}
