//! Backing store access.
//!
//! The orchestrator talks to the store only through [`StoreConnector`] and the
//! short-lived [`StoreSession`] it hands out. A session is opened for one access
//! phase (load parameters, record start, record end) and closed explicitly so no
//! connection is held while the external job runs.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CdmError, CdmResult};

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteConnector;

pub const PARAMETERS_TABLE: &str = "cdm_run_parameters";
pub const INTERVAL_TABLE: &str = "cdm_run_interval";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IntervalStatus {
    Running,
    Success,
    Failed,
}

impl IntervalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalStatus::Running => "RUNNING",
            IntervalStatus::Success => "SUCCESS",
            IntervalStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for IntervalStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for IntervalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(IntervalStatus::Running),
            "SUCCESS" => Ok(IntervalStatus::Success),
            "FAILED" => Ok(IntervalStatus::Failed),
            other => Err(format!("unknown interval status '{}'", other)),
        }
    }
}

/// One row of `cdm_run_interval`, keyed by `(run_id, start_time)`.
///
/// Written with status RUNNING before the job starts and completed exactly
/// once afterwards. A row left RUNNING means the process was interrupted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalRecord {
    pub run_id: String,
    pub start_time: DateTime<Utc>,
    pub start_token: i128,
    pub end_token: i128,
    pub token_increment: i128,
    pub read_rate_limit: i64,
    pub write_rate_limit: i64,
    pub status: IntervalStatus,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed_time: Option<i64>,
}

impl IntervalRecord {
    pub fn key(&self) -> (&str, DateTime<Utc>) {
        (&self.run_id, self.start_time)
    }
}

/// The closing update applied to a RUNNING interval record.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalCompletion {
    pub status: IntervalStatus,
    pub end_time: DateTime<Utc>,
    pub elapsed_time: i64,
}

/// An open connection to the backing store.
#[async_trait]
pub trait StoreSession: Send + Sync {
    /// All `(parameter_id, parameter_value)` rows, values in their stored text form.
    async fn fetch_parameters(&self) -> CdmResult<Vec<(String, String)>>;

    /// Set `id` to `value` only while it still holds `expected`. Returns rows affected.
    async fn compare_and_set_parameter(&self, id: &str, expected: &str, value: &str) -> CdmResult<u64>;

    /// Insert `id` unless a row already exists. Returns whether a row was written.
    async fn seed_parameter(&self, id: &str, value: &str) -> CdmResult<bool>;

    async fn insert_interval(&self, record: &IntervalRecord) -> CdmResult<()>;

    /// Close the RUNNING record keyed by `(run_id, start_time)`. Returns rows affected.
    async fn complete_interval(
        &self,
        run_id: &str,
        start_time: DateTime<Utc>,
        completion: &IntervalCompletion,
    ) -> CdmResult<u64>;

    /// Most recent records first, optionally restricted to one run.
    async fn list_intervals(&self, run_id: Option<&str>, limit: usize) -> CdmResult<Vec<IntervalRecord>>;

    async fn create_schema(&self) -> CdmResult<()>;

    async fn close(self: Box<Self>) -> CdmResult<()>;
}

/// Opens sessions against one backing store.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> CdmResult<Box<dyn StoreSession>>;

    /// Human-readable target for log lines.
    fn describe(&self) -> String;
}

pub(crate) fn parse_token(id: &str, raw: &str) -> CdmResult<i128> {
    raw.trim().parse::<i128>().map_err(|_| CdmError::InvalidParameter {
        id: id.to_string(),
        value: raw.to_string(),
    })
}
