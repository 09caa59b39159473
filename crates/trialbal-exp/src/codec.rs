//! Byte and file codecs for plans and reports.

use std::fs;
use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use trialbal_core::{ErrorInfo, TrialError};

fn codec_error(code: &str, err: impl ToString) -> TrialError {
    TrialError::Serde(ErrorInfo::new(code, err.to_string()))
}

fn file_error(code: &str, path: &Path, err: impl ToString) -> TrialError {
    codec_error(code, err).with_context("path", path.display().to_string())
}

fn sort_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            for (key, mut child) in entries {
                sort_keys(&mut child);
                map.insert(key, child);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(sort_keys),
        _ => {}
    }
}

/// JSON bytes with object keys sorted at every depth.
pub fn to_canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, TrialError> {
    let mut value = serde_json::to_value(value).map_err(|err| codec_error("json-serialize", err))?;
    sort_keys(&mut value);
    serde_json::to_vec(&value).map_err(|err| codec_error("json-write", err))
}

/// Hex SHA-256 of the canonical JSON of `value`.
pub fn stable_hash_string<T: Serialize>(value: &T) -> Result<String, TrialError> {
    Ok(format!("{:x}", Sha256::digest(to_canonical_json_bytes(value)?)))
}

/// Writes canonical JSON to `path`, creating parent directories.
pub fn write_canonical_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrialError> {
    let bytes = to_canonical_json_bytes(value)?;
    ensure_parent(path)?;
    fs::write(path, bytes).map_err(|err| file_error("json-file-write", path, err))
}

pub(crate) fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, TrialError> {
    let bytes = fs::read(path).map_err(|err| file_error("yaml-file-read", path, err))?;
    serde_yaml::from_slice(&bytes).map_err(|err| file_error("yaml-deserialize", path, err))
}

pub(crate) fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), TrialError> {
    let text = serde_yaml::to_string(value).map_err(|err| codec_error("yaml-serialize", err))?;
    ensure_parent(path)?;
    fs::write(path, text).map_err(|err| file_error("yaml-file-write", path, err))
}

fn ensure_parent(path: &Path) -> Result<(), TrialError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|err| file_error("create-dir", parent, err))
        }
        _ => Ok(()),
    }
}
