//! Durable, namespaced key-value persistence for completion records.
//!
//! One JSON file per key inside a namespace directory. Writes go through a
//! temp file renamed into place, so a crash never leaves a half-written
//! record under the real key. A record that fails to parse reads as absent —
//! corruption must never surface as a parse error to settlement callers.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::X402Error;

/// Characters allowed in keys and namespaces. Everything else — separators,
/// traversal dots at the front, unicode — is rejected up front.
fn sanitize(component: &str) -> Result<&str, X402Error> {
    if component.is_empty() {
        return Err(X402Error::Validation("empty store key".to_string()));
    }
    if component.starts_with('.') {
        return Err(X402Error::Validation(format!(
            "store key may not start with '.': {component:?}"
        )));
    }
    if !component
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(X402Error::Validation(format!(
            "store key contains disallowed characters: {component:?}"
        )));
    }
    Ok(component)
}

/// File-backed namespaced key-value store.
pub struct InvoiceStore {
    dir: PathBuf,
}

impl InvoiceStore {
    /// Open (or create) the namespace directory under `root`.
    pub fn open(root: impl AsRef<Path>, namespace: &str) -> Result<Self, X402Error> {
        let dir = root.as_ref().join(sanitize(namespace)?);
        fs::create_dir_all(&dir)
            .map_err(|e| X402Error::Persistence(format!("cannot create store dir: {e}")))?;
        Ok(Self { dir })
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, X402Error> {
        Ok(self.dir.join(format!("{}.json", sanitize(key)?)))
    }

    /// Read a value. Missing, unreadable, and corrupted records all read as
    /// `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.key_path(key).ok()?;
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "corrupted store record treated as absent");
                None
            }
        }
    }

    /// Write a value atomically (temp file + rename in the same directory).
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), X402Error> {
        let path = self.key_path(key)?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(value)?;

        let mut file = fs::File::create(&tmp)
            .map_err(|e| X402Error::Persistence(format!("cannot create temp file: {e}")))?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| X402Error::Persistence(format!("cannot write {key}: {e}")))?;
        drop(file);

        fs::rename(&tmp, &path)
            .map_err(|e| X402Error::Persistence(format!("cannot commit {key}: {e}")))
    }

    /// Write a value only if the key does not exist yet. Returns `true` when
    /// this call created the record — the atomic claim used for in-flight
    /// settlement markers.
    pub fn create_if_absent<T: Serialize>(&self, key: &str, value: &T) -> Result<bool, X402Error> {
        let path = self.key_path(key)?;
        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(X402Error::Persistence(format!(
                    "cannot claim {key}: {e}"
                )))
            }
        };
        let bytes = serde_json::to_vec(value)?;
        file.write_all(&bytes)
            .map_err(|e| X402Error::Persistence(format!("cannot write claim {key}: {e}")))?;
        Ok(true)
    }

    /// Remove a key. Returns `true` if it existed.
    pub fn delete(&self, key: &str) -> bool {
        match self.key_path(key) {
            Ok(path) => fs::remove_file(path).is_ok(),
            Err(_) => false,
        }
    }

    /// List all keys in the namespace.
    pub fn keys(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                name.strip_suffix(".json").map(str::to_string)
            })
            .collect()
    }

    /// Remove every record in the namespace. Returns the number removed.
    pub fn clear(&self) -> usize {
        let keys = self.keys();
        keys.iter().filter(|k| self.delete(k)).count()
    }
}
