// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Loading and saving the save file.
//!
//! Every save replaces the whole document: the new content is written to a
//! temporary file next to the target and renamed over it, so a reader never
//! sees a half-written file.

use crate::Store;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Suffix of the copy made when the save file cannot be parsed.
const CORRUPT_SUFFIX: &str = "corrupt";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("save file {path:?} is unreadable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to back up unreadable save file to {path:?}: {source}")]
    Backup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path:?}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Handle on the save file location.
#[derive(Debug, Clone)]
pub struct VolumeStore {
    path: PathBuf,
}

impl VolumeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where an unreadable save file is copied before it gets replaced.
    pub fn corrupt_backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".");
        name.push(CORRUPT_SUFFIX);
        PathBuf::from(name)
    }

    /// Load the store. A missing file yields an empty store.
    pub fn load(&self) -> Result<Store, StoreError> {
        if !self.path.exists() {
            debug!("No save file at {:?}, starting empty", self.path);
            return Ok(Store::default());
        }

        let content = fs::read(&self.path).map_err(|source| StoreError::Read {
            path: self.path.clone(),
            source,
        })?;
        Store::from_json_bytes(&content).map_err(|source| StoreError::Unreadable {
            path: self.path.clone(),
            source,
        })
    }

    /// Load the store, falling back to an empty one if the file is unreadable.
    ///
    /// The unreadable file is copied aside first. Volumes it held for devices
    /// other than the current one will not be in the next save.
    pub fn load_or_recover(&self) -> Result<Store, StoreError> {
        match self.load() {
            Err(StoreError::Unreadable { path, source }) => {
                let backup = self.corrupt_backup_path();
                fs::copy(&path, &backup).map_err(|source| StoreError::Backup {
                    path: backup.clone(),
                    source,
                })?;
                error!(
                    "Save file {:?} is unreadable ({}); copied it to {:?} and continuing with an empty store",
                    path, source, backup
                );
                warn!("Stored volumes for devices other than the current one are dropped on the next save");
                Ok(Store::default())
            }
            other => other,
        }
    }

    /// Replace the save file with `store`.
    pub fn save(&self, store: &Store) -> Result<(), StoreError> {
        let content = store.to_json()?;
        let write_failed = |source: std::io::Error| StoreError::WriteFailed {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(write_failed)?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(write_failed)?;
        tmp.write_all(content.as_bytes()).map_err(write_failed)?;
        tmp.write_all(b"\n").map_err(write_failed)?;
        tmp.as_file().sync_all().map_err(write_failed)?;
        tmp.persist(&self.path).map_err(|e| write_failed(e.error))?;

        debug!("Saved {} applications to {:?}", store.applications.len(), self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint;

    fn sample_store() -> Store {
        let mut store = Store::default();
        store.record_volume(&fingerprint("Firefox", "firefox"), "speakers", 0.8);
        store.record_volume(&fingerprint("Firefox", "firefox"), "headphones", 0.3);
        store.record_volume(&fingerprint("mpv", "mpv"), "speakers", 1.0);
        store.last_default_sink = Some("speakers".to_string());
        store.ignores.devices.insert("hdmi-output".to_string());
        store
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = VolumeStore::new(dir.path().join("save.json"));
        assert_eq!(volumes.load().unwrap(), Store::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = VolumeStore::new(dir.path().join("nested").join("save.json"));
        let store = sample_store();
        volumes.save(&store).unwrap();
        assert_eq!(volumes.load().unwrap(), store);
    }

    #[test]
    fn test_save_of_load_is_byte_stable() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = VolumeStore::new(dir.path().join("save.json"));
        volumes.save(&sample_store()).unwrap();
        let first = fs::read(volumes.path()).unwrap();

        volumes.save(&volumes.load().unwrap()).unwrap();
        let second = fs::read(volumes.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unreadable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = VolumeStore::new(dir.path().join("save.json"));
        fs::write(volumes.path(), "{ not json").unwrap();
        assert!(matches!(volumes.load(), Err(StoreError::Unreadable { .. })));
    }

    #[test]
    fn test_recover_backs_up_unreadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = VolumeStore::new(dir.path().join("save.json"));
        fs::write(volumes.path(), "{ not json").unwrap();

        let store = volumes.load_or_recover().unwrap();
        assert_eq!(store, Store::default());
        assert_eq!(
            fs::read_to_string(volumes.corrupt_backup_path()).unwrap(),
            "{ not json"
        );
    }

    #[test]
    fn test_recover_backs_up_file_that_is_not_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = VolumeStore::new(dir.path().join("save.json"));
        let content = b"{\"applications\": {\"\xff\xfe\": 1}}".to_vec();
        fs::write(volumes.path(), &content).unwrap();

        assert!(matches!(volumes.load(), Err(StoreError::Unreadable { .. })));
        let store = volumes.load_or_recover().unwrap();
        assert_eq!(store, Store::default());
        assert_eq!(fs::read(volumes.corrupt_backup_path()).unwrap(), content);
    }

    #[test]
    fn test_recover_passes_good_file_through() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = VolumeStore::new(dir.path().join("save.json"));
        volumes.save(&sample_store()).unwrap();
        assert_eq!(volumes.load_or_recover().unwrap(), sample_store());
        assert!(!volumes.corrupt_backup_path().exists());
    }

    #[test]
    fn test_backup_path_appends_suffix() {
        let volumes = VolumeStore::new("/tmp/pdav/save.json");
        assert_eq!(
            volumes.corrupt_backup_path(),
            PathBuf::from("/tmp/pdav/save.json.corrupt")
        );
    }
}
