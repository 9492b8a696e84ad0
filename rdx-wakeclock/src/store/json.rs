use super::{AlarmRow, AlarmStore};
use crate::common::AlarmId;
use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// A whole-file JSON store. Every write rewrites the file through a temporary
/// sibling and an atomic rename, so a crash never leaves half a file behind.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    guard: Mutex<()>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    next_id: i64,
    alarms: Vec<AlarmRow>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<StoreFile, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(StoreFile::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(StoreFile::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, file: &StoreFile) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(file)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), alarms = file.alarms.len(), "store written");
        Ok(())
    }

    fn modify<T>(
        &self,
        change: impl FnOnce(&mut StoreFile) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _held = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.read()?;
        let out = change(&mut file)?;
        self.write(&file)?;
        Ok(out)
    }
}

impl AlarmStore for JsonFileStore {
    fn load_all(&self) -> Result<Vec<AlarmRow>, StoreError> {
        let _held = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read()?.alarms)
    }

    fn insert(&self, row: &AlarmRow) -> Result<AlarmId, StoreError> {
        self.modify(|file| {
            let id = AlarmId(file.next_id);
            file.next_id += 1;
            let mut row = row.clone();
            row.id = id;
            file.alarms.push(row);
            Ok(id)
        })
    }

    fn update(&self, id: AlarmId, row: &AlarmRow) -> Result<(), StoreError> {
        self.modify(|file| {
            let slot = file
                .alarms
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(StoreError::MissingRow(id))?;
            *slot = row.clone();
            Ok(())
        })
    }

    fn delete(&self, id: AlarmId) -> Result<(), StoreError> {
        self.modify(|file| {
            file.alarms.retain(|r| r.id != id);
            Ok(())
        })
    }
}
