use super::{AlarmRow, AlarmStore};
use crate::common::AlarmId;
use crate::error::StoreError;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// An in-process store. Survives registry restarts as long as the value is
/// shared, which makes it the store of choice for recovery tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    failures: AtomicU32,
}

#[derive(Debug, Default)]
struct Inner {
    rows: BTreeMap<AlarmId, AlarmRow>,
    next_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn row(&self, id: AlarmId) -> Option<AlarmRow> {
        self.lock().rows.get(&id).cloned()
    }

    pub fn rows(&self) -> Vec<AlarmRow> {
        self.lock().rows.values().cloned().collect()
    }

    /// Writes a row verbatim, bypassing id assignment. Seeds tests with
    /// hand-crafted persisted state.
    pub fn put(&self, row: AlarmRow) {
        let mut inner = self.lock();
        inner.next_id = inner.next_id.max(row.id.0 + 1);
        inner.rows.insert(row.id, row);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::Unavailable("injected failure".into())),
            Err(_) => Ok(()),
        }
    }
}

impl AlarmStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<AlarmRow>, StoreError> {
        self.check_available()?;
        Ok(self.rows())
    }

    fn insert(&self, row: &AlarmRow) -> Result<AlarmId, StoreError> {
        self.check_available()?;
        let mut inner = self.lock();
        let id = AlarmId(inner.next_id);
        inner.next_id += 1;
        let mut row = row.clone();
        row.id = id;
        inner.rows.insert(id, row);
        Ok(id)
    }

    fn update(&self, id: AlarmId, row: &AlarmRow) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.lock();
        match inner.rows.get_mut(&id) {
            Some(existing) => {
                *existing = row.clone();
                Ok(())
            }
            None => Err(StoreError::MissingRow(id)),
        }
    }

    fn delete(&self, id: AlarmId) -> Result<(), StoreError> {
        self.check_available()?;
        self.lock().rows.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::Alarm;
    use chrono::{TimeZone, Utc};

    fn row() -> AlarmRow {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap();
        AlarmRow::from(&Alarm::new(now, chrono_tz::Tz::UTC))
    }

    #[test]
    fn ids_are_assigned_in_order() {
        let store = MemoryStore::new();
        assert_eq!(store.insert(&row()).unwrap(), AlarmId(0));
        assert_eq!(store.insert(&row()).unwrap(), AlarmId(1));
        assert_eq!(store.rows()[1].id, AlarmId(1));
    }

    #[test]
    fn injected_failures_are_transient_and_counted() {
        let store = MemoryStore::new();
        store.fail_next(1);
        let err = store.load_all().unwrap_err();
        assert!(err.is_transient());
        assert!(store.load_all().is_ok());
    }

    #[test]
    fn updating_a_missing_row_is_an_error() {
        let store = MemoryStore::new();
        assert_eq!(
            store.update(AlarmId(9), &row()),
            Err(StoreError::MissingRow(AlarmId(9)))
        );
    }
}
