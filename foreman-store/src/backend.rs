//! Persistence backends for the config store.
//!
//! The store treats durability as optional: with no backend, configuration
//! lives for the authority process's lifetime only. [`FileBackend`] persists
//! a JSON document with the same atomic `.tmp` + rename pattern used
//! elsewhere in Foreman, and gates rewrites on a content digest so repeated
//! commits of an unchanged mapping cost nothing on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use foreman_core::types::{ConfigKey, ConfigSnapshot, ConfigValue, ConfigVersion};

use crate::error::{io_err, StoreError};

/// Storage collaborator interface: load the initial mapping, persist
/// committed state. Absence of a backend means process-lifetime-only config.
pub trait ConfigBackend {
    /// Initial version and mapping. A backend with no saved state yet must
    /// return an empty mapping at [`ConfigVersion::ZERO`], not an error.
    fn load_initial(
        &mut self,
    ) -> Result<(ConfigVersion, BTreeMap<ConfigKey, ConfigValue>), StoreError>;

    /// Persist the given snapshot. Called after every committed write.
    fn persist(&mut self, snapshot: &ConfigSnapshot) -> Result<(), StoreError>;
}

/// On-disk config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub version: ConfigVersion,
    #[serde(default)]
    pub entries: BTreeMap<ConfigKey, ConfigValue>,
}

/// JSON file backend with digest-gated atomic writes.
pub struct FileBackend {
    path: PathBuf,
    last_digest: Option<String>,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_digest: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the document at `path` without constructing a backend. Used by
    /// the file watcher to read external edits.
    pub fn read_document(path: &Path) -> Result<ConfigDocument, StoreError> {
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        serde_json::from_str(&contents).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl ConfigBackend for FileBackend {
    fn load_initial(
        &mut self,
    ) -> Result<(ConfigVersion, BTreeMap<ConfigKey, ConfigValue>), StoreError> {
        if !self.path.exists() {
            return Ok((ConfigVersion::ZERO, BTreeMap::new()));
        }
        let document = Self::read_document(&self.path)?;
        self.last_digest = Some(entries_digest(&document.entries)?);
        Ok((document.version, document.entries))
    }

    fn persist(&mut self, snapshot: &ConfigSnapshot) -> Result<(), StoreError> {
        // The digest covers the entries only, so a rewrite is skipped when
        // the mapping is byte-identical even though the version moved.
        let digest = entries_digest(&snapshot.entries)?;
        if self.last_digest.as_deref() == Some(digest.as_str()) {
            return Ok(());
        }

        let Some(dir) = self.path.parent() else {
            return Err(io_err(
                &self.path,
                std::io::Error::other("invalid config document path"),
            ));
        };
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let document = ConfigDocument {
            version: snapshot.version,
            entries: snapshot.entries.clone(),
        };
        let json = serde_json::to_string_pretty(&document)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))?;

        self.last_digest = Some(digest);
        Ok(())
    }
}

/// SHA-256 hex digest over the serialized entries mapping. `BTreeMap`
/// ordering makes the serialization deterministic.
fn entries_digest(entries: &BTreeMap<ConfigKey, ConfigValue>) -> Result<String, StoreError> {
    let bytes = serde_json::to_vec(entries)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn snapshot(version: u64, pairs: &[(&str, ConfigValue)]) -> ConfigSnapshot {
        ConfigSnapshot {
            version: ConfigVersion(version),
            entries: pairs
                .iter()
                .map(|(k, v)| (ConfigKey::from(*k), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn missing_file_loads_empty() {
        let tmp = TempDir::new().expect("tmpdir");
        let mut backend = FileBackend::new(tmp.path().join("config.json"));
        let (version, entries) = backend.load_initial().expect("load");
        assert_eq!(version, ConfigVersion::ZERO);
        assert!(entries.is_empty());
    }

    #[test]
    fn persist_then_load_roundtrip() {
        let tmp = TempDir::new().expect("tmpdir");
        let path = tmp.path().join("config.json");

        let mut backend = FileBackend::new(&path);
        backend
            .persist(&snapshot(4, &[("a", json!(1)), ("b", json!({"x": true}))]))
            .expect("persist");

        let mut reloaded = FileBackend::new(&path);
        let (version, entries) = reloaded.load_initial().expect("load");
        assert_eq!(version, ConfigVersion(4));
        assert_eq!(entries.get(&ConfigKey::from("a")), Some(&json!(1)));
        assert_eq!(entries.get(&ConfigKey::from("b")), Some(&json!({"x": true})));
    }

    #[test]
    fn tmp_file_cleaned_up_after_persist() {
        let tmp = TempDir::new().expect("tmpdir");
        let path = tmp.path().join("config.json");
        let mut backend = FileBackend::new(&path);
        backend.persist(&snapshot(1, &[("a", json!(1))])).expect("persist");
        assert!(
            !path.with_extension("json.tmp").exists(),
            "tmp file should be removed after atomic rename"
        );
    }

    #[test]
    fn unchanged_entries_skip_the_rewrite() {
        let tmp = TempDir::new().expect("tmpdir");
        let path = tmp.path().join("config.json");
        let mut backend = FileBackend::new(&path);

        backend.persist(&snapshot(1, &[("a", json!(1))])).expect("persist");
        let first_mtime = std::fs::metadata(&path).expect("meta").modified().expect("mtime");

        // Same entries at a newer version: digest gate skips the write, so
        // the file still carries version 1.
        backend.persist(&snapshot(2, &[("a", json!(1))])).expect("persist");
        let document = FileBackend::read_document(&path).expect("read");
        assert_eq!(document.version, ConfigVersion(1));
        let second_mtime = std::fs::metadata(&path).expect("meta").modified().expect("mtime");
        assert_eq!(first_mtime, second_mtime, "file must not be rewritten");
    }

    #[test]
    fn changed_entries_are_rewritten() {
        let tmp = TempDir::new().expect("tmpdir");
        let path = tmp.path().join("config.json");
        let mut backend = FileBackend::new(&path);

        backend.persist(&snapshot(1, &[("a", json!(1))])).expect("persist");
        backend.persist(&snapshot(2, &[("a", json!(2))])).expect("persist");

        let document = FileBackend::read_document(&path).expect("read");
        assert_eq!(document.version, ConfigVersion(2));
        assert_eq!(document.entries.get(&ConfigKey::from("a")), Some(&json!(2)));
    }

    #[test]
    fn malformed_document_is_a_parse_error() {
        let tmp = TempDir::new().expect("tmpdir");
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{not json").expect("write");
        let mut backend = FileBackend::new(&path);
        let err = backend.load_initial().expect_err("must fail");
        assert!(matches!(err, StoreError::Parse { .. }));
    }
}
