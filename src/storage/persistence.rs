//! Snapshots of the in-memory backing store.
//!
//! A snapshot is the full sorted key-value map written as MessagePack.
//! Saving goes through a temp file in the target directory that is
//! atomically renamed into place.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::core::{Result, StoreError};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvSnapshot {
    pub version: u32,
    pub entries: BTreeMap<String, String>,
}

impl KvSnapshot {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn save(&self, snapshot: &KvSnapshot) -> Result<()> {
        let dir = match self.snapshot_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let serialized = rmp_serde::to_vec(snapshot)?;
        let temp = NamedTempFile::new_in(&dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            writer.write_all(&serialized)?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.snapshot_path)
            .map_err(|e| StoreError::IoError(format!("Failed to persist snapshot: {}", e)))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<KvSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.snapshot_path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let snapshot: KvSnapshot = rmp_serde::from_slice(&data)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::Storage(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(Some(snapshot))
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }

    pub fn delete(&self) -> Result<()> {
        if self.snapshot_path.exists() {
            fs::remove_file(&self.snapshot_path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path().join("store.snapshot"));
        assert!(manager.load().unwrap().is_none());

        let mut entries = BTreeMap::new();
        entries.insert("vom.rc.o+v10/1".to_string(), "2".to_string());
        entries.insert("idCounters".to_string(), "{}".to_string());
        manager.save(&KvSnapshot::new(entries.clone())).unwrap();

        assert!(manager.exists());
        let loaded = manager.load().unwrap().unwrap();
        assert_eq!(loaded.entries, entries);
    }

    #[test]
    fn test_save_overwrites_and_delete_removes() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path().join("nested").join("s.bin"));
        manager.save(&KvSnapshot::new(BTreeMap::new())).unwrap();

        let mut entries = BTreeMap::new();
        entries.insert("k".to_string(), "v".to_string());
        manager.save(&KvSnapshot::new(entries)).unwrap();
        assert_eq!(manager.load().unwrap().unwrap().len(), 1);

        manager.delete().unwrap();
        assert!(!manager.exists());
    }
}
