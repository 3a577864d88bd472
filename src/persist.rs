//! Persisted state files.
//!
//! The server keeps three kinds of small state on disk: the per-arm config-id
//! counter, the per-arm multrun number, and the DAY_CALIBRATE last-run store.
//! Counters are a single integer; the others are `key=value` property files.
//! Every write goes to a sibling temporary file which is then renamed over the
//! target, so a crash never leaves a half-written file behind.

use crate::error::PersistError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Monotonic counter mirrored to a file.
#[derive(Debug)]
pub struct PersistentCounter {
    path: PathBuf,
    value: Mutex<i64>,
}

impl PersistentCounter {
    /// Read the counter from `path`. A missing file starts the counter at 0.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let path = path.into();
        let value = match fs::read_to_string(&path) {
            Ok(text) => parse_i64(&path, &text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(PersistError::io(&path, e)),
        };
        Ok(Self {
            path,
            value: Mutex::new(value),
        })
    }

    /// Current value.
    pub fn get(&self) -> i64 {
        *self.value.lock()
    }

    /// Increment and persist. The in-memory value only advances once the
    /// file has been written.
    pub fn increment(&self) -> Result<i64, PersistError> {
        let mut value = self.value.lock();
        let next = *value + 1;
        write_atomic(&self.path, &format!("{next}\n"))?;
        *value = next;
        debug!(path = %self.path.display(), value = next, "Counter incremented");
        Ok(next)
    }
}

fn parse_i64(path: &Path, text: &str) -> Result<i64, PersistError> {
    text.trim().parse().map_err(|_| PersistError::Malformed {
        path: path.to_path_buf(),
        value: text.trim().to_string(),
    })
}

/// Read a `key=value` property file. Blank lines and lines starting with `#`
/// are ignored; a missing file is an empty map.
pub fn load_properties(path: &Path) -> Result<BTreeMap<String, String>, PersistError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(PersistError::io(path, e)),
    };
    let mut properties = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(PersistError::Malformed {
                path: path.to_path_buf(),
                value: line.to_string(),
            });
        };
        properties.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(properties)
}

/// Replace a property file with `properties`.
pub fn save_properties(path: &Path, properties: &BTreeMap<String, String>) -> Result<(), PersistError> {
    let mut text = String::new();
    for (key, value) in properties {
        text.push_str(key);
        text.push('=');
        text.push_str(value);
        text.push('\n');
    }
    write_atomic(path, &text)
}

/// Read one integer property.
pub fn property_i64(
    path: &Path,
    properties: &BTreeMap<String, String>,
    key: &str,
) -> Result<Option<i64>, PersistError> {
    properties.get(key).map(|v| parse_i64(path, v)).transpose()
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), PersistError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| PersistError::io(parent, e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents).map_err(|e| PersistError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| PersistError::io(path, e))
}
