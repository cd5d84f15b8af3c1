//! Persisted key-value settings
//!
//! A flat JSON object of string keys to string values. Every access reloads
//! the file, so several engine instances sharing a path observe each other's
//! writes; writes replace the file atomically.

use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{debug, info_span, warn};

use crate::utils::unpoison;

/// Errors of the key-value store
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The file could not be read or written
    #[error("{errmsg} ({path:?})")]
    Io {
        /// What was attempted
        errmsg: &'static str,
        /// Location of the store
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// The file does not hold a JSON object of strings
    #[error("Malformed key-value store {path:?}")]
    Malformed {
        /// Location of the store
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },
}

type Dictionary = BTreeMap<String, String>;

/// File backed string dictionary
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    lock: Mutex<()>,
    span: tracing::Span,
}

impl Store {
    /// Use the file at `path`, which does not need to exist yet
    pub fn new(path: impl Into<PathBuf>) -> Store {
        let path = path.into();
        let span = info_span!("store", path = %path.display());
        Store {
            path,
            lock: Mutex::new(()),
            span,
        }
    }

    /// Location of the store
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value stored under `key`, or `default`
    pub fn get(&self, key: &str, default: &str) -> Result<String, Error> {
        let _lock = unpoison(self.lock.lock());
        let dictionary = self.load()?;
        Ok(dictionary
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_owned()))
    }

    /// Store `value` under `key`
    pub fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let _lock = unpoison(self.lock.lock());
        let mut dictionary = self.load()?;
        dictionary.insert(key.to_owned(), value.to_owned());
        self.save(&dictionary)
    }

    fn load(&self) -> Result<Dictionary, Error> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Dictionary::new()),
            Err(source) => {
                return Err(Error::Io {
                    errmsg: "Failed to read key-value store",
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if content.trim_matches(|c: char| c == '\0' || c.is_whitespace()).is_empty() {
            return Ok(Dictionary::new());
        }
        serde_json::from_str(&content).map_err(|source| {
            let _guard = self.span.enter();
            warn!(?source, "Key-value store is malformed");
            Error::Malformed {
                path: self.path.clone(),
                source,
            }
        })
    }

    fn save(&self, dictionary: &Dictionary) -> Result<(), Error> {
        let io_err = |errmsg| {
            let path = self.path.clone();
            move |source| Error::Io { errmsg, path, source }
        };

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(io_err("Failed to create store directory"))?;

        let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_err("Failed to create temporary file"))?;
        let content = serde_json::to_string_pretty(dictionary).map_err(|source| Error::Malformed {
            path: self.path.clone(),
            source,
        })?;
        file.write_all(content.as_bytes())
            .and_then(|_| file.as_file().sync_all())
            .map_err(io_err("Failed to write key-value store"))?;
        file.persist(&self.path)
            .map_err(|err| err.error)
            .map_err(io_err("Failed to replace key-value store"))?;

        let _guard = self.span.enter();
        debug!(entries = dictionary.len(), "Saved key-value store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("settings.json"));
        assert_eq!(store.get("0", "").unwrap(), "");
        assert_eq!(store.get("0", "fallback").unwrap(), "fallback");
    }

    #[test]
    fn values_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let store = Store::new(&path);
        store.set("0", "3").unwrap();
        store.set("1", "5").unwrap();
        store.set("0", "4").unwrap();

        let reopened = Store::new(&path);
        assert_eq!(reopened.get("0", "").unwrap(), "4");
        assert_eq!(reopened.get("1", "").unwrap(), "5");

        let raw: BTreeMap<String, String> = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw.len(), 2);
    }

    #[test]
    fn empty_file_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, b"\0\0\0").unwrap();
        let store = Store::new(&path);
        assert_eq!(store.get("0", "x").unwrap(), "x");
        store.set("0", "1").unwrap();
        assert_eq!(store.get("0", "x").unwrap(), "1");
    }

    #[test]
    fn malformed_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();
        let store = Store::new(&path);
        assert!(matches!(store.get("0", ""), Err(Error::Malformed { .. })));
        assert!(store.set("0", "1").is_err());
    }
}
