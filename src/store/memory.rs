//! In-process store with the same semantics as the SQLite adapter.
//!
//! Faults can be injected per operation so the orchestrator's abort paths are
//! reachable without a real backend going down.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    IntervalCompletion, IntervalRecord, IntervalStatus, StoreConnector, StoreSession, INTERVAL_TABLE,
    PARAMETERS_TABLE,
};
use crate::error::{CdmError, CdmResult};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Faults {
    pub connect: bool,
    pub insert_interval: bool,
    pub complete_interval: bool,
    pub update_parameter: bool,
}

#[derive(Debug, Default)]
struct Inner {
    parameters: BTreeMap<String, String>,
    intervals: Vec<IntervalRecord>,
    faults: Faults,
    connects: u64,
    open_sessions: u64,
    interval_writes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameters<I, K, V>(rows: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        let store = Self::new();
        {
            let mut inner = store.lock();
            for (id, value) in rows {
                inner.parameters.insert(id.into(), value.to_string());
            }
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means a test thread panicked mid-write.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_faults(&self, faults: Faults) {
        self.lock().faults = faults;
    }

    pub fn set_parameter(&self, id: &str, value: impl ToString) {
        self.lock().parameters.insert(id.to_string(), value.to_string());
    }

    pub fn parameter(&self, id: &str) -> Option<String> {
        self.lock().parameters.get(id).cloned()
    }

    pub fn intervals(&self) -> Vec<IntervalRecord> {
        self.lock().intervals.clone()
    }

    /// Inserts plus completions against `cdm_run_interval`.
    pub fn interval_writes(&self) -> u64 {
        self.lock().interval_writes
    }

    pub fn connects(&self) -> u64 {
        self.lock().connects
    }

    pub fn open_sessions(&self) -> u64 {
        self.lock().open_sessions
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    async fn connect(&self) -> CdmResult<Box<dyn StoreSession>> {
        let mut inner = self.lock();
        if inner.faults.connect {
            return Err(CdmError::store_unavailable("memory store refused the connection"));
        }
        inner.connects += 1;
        inner.open_sessions += 1;
        Ok(Box::new(MemorySession { store: self.clone() }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct MemorySession {
    store: MemoryStore,
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn fetch_parameters(&self) -> CdmResult<Vec<(String, String)>> {
        let inner = self.store.lock();
        Ok(inner
            .parameters
            .iter()
            .map(|(id, value)| (id.clone(), value.clone()))
            .collect())
    }

    async fn compare_and_set_parameter(&self, id: &str, expected: &str, value: &str) -> CdmResult<u64> {
        let mut inner = self.store.lock();
        if inner.faults.update_parameter {
            return Err(CdmError::write_failed(PARAMETERS_TABLE, "injected update fault"));
        }
        match inner.parameters.get_mut(id) {
            Some(current) if current.as_str() == expected => {
                *current = value.to_string();
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn seed_parameter(&self, id: &str, value: &str) -> CdmResult<bool> {
        let mut inner = self.store.lock();
        if inner.parameters.contains_key(id) {
            return Ok(false);
        }
        inner.parameters.insert(id.to_string(), value.to_string());
        Ok(true)
    }

    async fn insert_interval(&self, record: &IntervalRecord) -> CdmResult<()> {
        let mut inner = self.store.lock();
        if inner.faults.insert_interval {
            return Err(CdmError::write_failed(INTERVAL_TABLE, "injected insert fault"));
        }
        if inner.intervals.iter().any(|r| r.key() == record.key()) {
            return Err(CdmError::write_failed(
                INTERVAL_TABLE,
                format!("duplicate key ({}, {})", record.run_id, record.start_time),
            ));
        }
        inner.intervals.push(record.clone());
        inner.interval_writes += 1;
        Ok(())
    }

    async fn complete_interval(
        &self,
        run_id: &str,
        start_time: DateTime<Utc>,
        completion: &IntervalCompletion,
    ) -> CdmResult<u64> {
        let mut inner = self.store.lock();
        if inner.faults.complete_interval {
            return Err(CdmError::write_failed(INTERVAL_TABLE, "injected update fault"));
        }
        let Some(record) = inner
            .intervals
            .iter_mut()
            .find(|r| r.run_id == run_id && r.start_time == start_time && r.status == IntervalStatus::Running)
        else {
            return Ok(0);
        };
        record.status = completion.status;
        record.end_time = Some(completion.end_time);
        record.elapsed_time = Some(completion.elapsed_time);
        inner.interval_writes += 1;
        Ok(1)
    }

    async fn list_intervals(&self, run_id: Option<&str>, limit: usize) -> CdmResult<Vec<IntervalRecord>> {
        let inner = self.store.lock();
        let mut rows: Vec<IntervalRecord> = inner
            .intervals
            .iter()
            .filter(|r| run_id.map_or(true, |id| r.run_id == id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn create_schema(&self) -> CdmResult<()> {
        Ok(())
    }

    async fn close(self: Box<Self>) -> CdmResult<()> {
        let mut inner = self.store.lock();
        inner.open_sessions = inner.open_sessions.saturating_sub(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(start_time: DateTime<Utc>) -> IntervalRecord {
        IntervalRecord {
            run_id: "run-1".to_string(),
            start_time,
            start_token: 0,
            end_token: 100,
            token_increment: 100,
            read_rate_limit: 40000,
            write_rate_limit: 40000,
            status: IntervalStatus::Running,
            end_time: None,
            elapsed_time: None,
        }
    }

    #[tokio::test]
    async fn test_compare_and_set_requires_expected_value() {
        let store = MemoryStore::with_parameters([("last_end_token", 0)]);
        let session = store.connect().await.unwrap();
        assert_eq!(session.compare_and_set_parameter("last_end_token", "5", "10").await.unwrap(), 0);
        assert_eq!(session.compare_and_set_parameter("last_end_token", "0", "10").await.unwrap(), 1);
        assert_eq!(session.compare_and_set_parameter("missing", "0", "10").await.unwrap(), 0);
        session.close().await.unwrap();
        assert_eq!(store.parameter("last_end_token").as_deref(), Some("10"));
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_finished_interval_is_not_completed_again() {
        let store = MemoryStore::new();
        let session = store.connect().await.unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap();
        session.insert_interval(&record(at)).await.unwrap();

        let success = IntervalCompletion {
            status: IntervalStatus::Success,
            end_time: at + chrono::Duration::seconds(30),
            elapsed_time: 30,
        };
        let failure = IntervalCompletion { status: IntervalStatus::Failed, ..success.clone() };
        assert_eq!(session.complete_interval("run-1", at, &success).await.unwrap(), 1);
        assert_eq!(session.complete_interval("run-1", at, &failure).await.unwrap(), 0);
        assert_eq!(store.intervals()[0].status, IntervalStatus::Success);
        assert_eq!(store.interval_writes(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_interval_key_rejected() {
        let store = MemoryStore::new();
        let session = store.connect().await.unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap();
        session.insert_interval(&record(at)).await.unwrap();
        let err = session.insert_interval(&record(at)).await.unwrap_err();
        assert!(matches!(err, CdmError::WriteFailed { .. }));
        assert_eq!(store.interval_writes(), 1);
    }

    #[tokio::test]
    async fn test_connect_fault() {
        let store = MemoryStore::new();
        store.set_faults(Faults { connect: true, ..Faults::default() });
        assert!(matches!(store.connect().await, Err(CdmError::StoreUnavailable { .. })));
    }
}
