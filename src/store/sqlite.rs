//! Embedded SQLite adapter.
//!
//! The connection bundle path is the database file. Parameter values and
//! token columns are TEXT so the cursor may legitimately step past `i64::MAX`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use super::{
    parse_token, IntervalCompletion, IntervalRecord, IntervalStatus, StoreConnector,
    StoreSession, INTERVAL_TABLE, PARAMETERS_TABLE,
};
use crate::config::StoreCredentials;
use crate::error::{CdmError, CdmResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cdm_run_parameters (
    parameter_id    TEXT PRIMARY KEY,
    parameter_value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS cdm_run_interval (
    run_id           TEXT NOT NULL,
    start_time       TEXT NOT NULL,
    start_token      TEXT NOT NULL,
    end_token        TEXT NOT NULL,
    token_increment  TEXT NOT NULL,
    read_rate_limit  INTEGER NOT NULL,
    write_rate_limit INTEGER NOT NULL,
    status           TEXT NOT NULL,
    end_time         TEXT,
    elapsed_time     INTEGER,
    PRIMARY KEY (run_id, start_time)
);
";

#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
    keyspace: String,
    create_if_missing: bool,
    busy_timeout: Duration,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>, keyspace: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            keyspace: keyspace.into(),
            create_if_missing: false,
            busy_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_credentials(credentials: &StoreCredentials) -> Self {
        Self::new(&credentials.bundle_path, &credentials.keyspace)
    }

    /// Allow `connect` to create the database file (used by `init`).
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }
}

impl SqliteConnector {
    fn open(&self) -> CdmResult<Connection> {
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        let conn = Connection::open_with_flags(&self.path, flags).map_err(|e| {
            CdmError::store_unavailable(format!("failed to open {}: {}", self.path.display(), e))
        })?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(|e| CdmError::store_unavailable(format!("failed to set busy timeout: {}", e)))?;
        Ok(conn)
    }
}

#[async_trait]
impl StoreConnector for SqliteConnector {
    async fn connect(&self) -> CdmResult<Box<dyn StoreSession>> {
        if !self.create_if_missing && !self.path.exists() {
            return Err(CdmError::store_unavailable(format!(
                "database file {} does not exist",
                self.path.display()
            )));
        }
        let connector = self.clone();
        let conn = blocking(move || connector.open()).await?;
        debug!("Connected to keyspace {} at {}", self.keyspace, self.path.display());
        Ok(Box::new(SqliteSession {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }

    fn describe(&self) -> String {
        format!("sqlite:{} (keyspace {})", self.path.display(), self.keyspace)
    }
}

/// rusqlite blocks, so every call runs on tokio's blocking pool.
async fn blocking<T, F>(work: F) -> CdmResult<T>
where
    F: FnOnce() -> CdmResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| CdmError::store_unavailable(format!("store task failed: {}", e)))?
}

fn read_failed(table: &str, e: rusqlite::Error) -> CdmError {
    CdmError::store_unavailable(format!("failed to read {}: {}", table, e))
}

struct SqliteSession {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSession {
    async fn with_conn<T, F>(&self, work: F) -> CdmResult<T>
    where
        F: FnOnce(&Connection) -> CdmResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        blocking(move || {
            let conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            work(&conn)
        })
        .await
    }

    fn map_interval(row: &Row<'_>) -> rusqlite::Result<RawInterval> {
        Ok(RawInterval {
            run_id: row.get(0)?,
            start_time: row.get(1)?,
            start_token: row.get(2)?,
            end_token: row.get(3)?,
            token_increment: row.get(4)?,
            read_rate_limit: row.get(5)?,
            write_rate_limit: row.get(6)?,
            status: row.get(7)?,
            end_time: row.get(8)?,
            elapsed_time: row.get(9)?,
        })
    }
}

struct RawInterval {
    run_id: String,
    start_time: DateTime<Utc>,
    start_token: String,
    end_token: String,
    token_increment: String,
    read_rate_limit: i64,
    write_rate_limit: i64,
    status: String,
    end_time: Option<DateTime<Utc>>,
    elapsed_time: Option<i64>,
}

impl RawInterval {
    fn into_record(self) -> CdmResult<IntervalRecord> {
        let status = self.status.parse::<IntervalStatus>().map_err(|e| {
            CdmError::store_unavailable(format!("corrupt {} row: {}", INTERVAL_TABLE, e))
        })?;
        Ok(IntervalRecord {
            start_token: parse_token("start_token", &self.start_token)?,
            end_token: parse_token("end_token", &self.end_token)?,
            token_increment: parse_token("token_increment", &self.token_increment)?,
            run_id: self.run_id,
            start_time: self.start_time,
            read_rate_limit: self.read_rate_limit,
            write_rate_limit: self.write_rate_limit,
            status,
            end_time: self.end_time,
            elapsed_time: self.elapsed_time,
        })
    }
}

#[async_trait]
impl StoreSession for SqliteSession {
    async fn fetch_parameters(&self) -> CdmResult<Vec<(String, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT parameter_id, parameter_value FROM cdm_run_parameters")
                .map_err(|e| read_failed(PARAMETERS_TABLE, e))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
                .map_err(|e| read_failed(PARAMETERS_TABLE, e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| read_failed(PARAMETERS_TABLE, e))
        })
        .await
    }

    async fn compare_and_set_parameter(&self, id: &str, expected: &str, value: &str) -> CdmResult<u64> {
        let (id, expected, value) = (id.to_string(), expected.to_string(), value.to_string());
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE cdm_run_parameters SET parameter_value = ?1
                     WHERE parameter_id = ?2 AND parameter_value = ?3",
                    params![value, id, expected],
                )
                .map_err(|e| CdmError::write_failed(PARAMETERS_TABLE, e.to_string()))?;
            Ok(changed as u64)
        })
        .await
    }

    async fn seed_parameter(&self, id: &str, value: &str) -> CdmResult<bool> {
        let (id, value) = (id.to_string(), value.to_string());
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "INSERT OR IGNORE INTO cdm_run_parameters (parameter_id, parameter_value) VALUES (?1, ?2)",
                    params![id, value],
                )
                .map_err(|e| CdmError::write_failed(PARAMETERS_TABLE, e.to_string()))?;
            Ok(changed > 0)
        })
        .await
    }

    async fn insert_interval(&self, record: &IntervalRecord) -> CdmResult<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO cdm_run_interval (
                    run_id, start_time, start_token, end_token, token_increment,
                    read_rate_limit, write_rate_limit, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.run_id,
                    record.start_time,
                    record.start_token.to_string(),
                    record.end_token.to_string(),
                    record.token_increment.to_string(),
                    record.read_rate_limit,
                    record.write_rate_limit,
                    record.status.as_str(),
                ],
            )
            .map_err(|e| CdmError::write_failed(INTERVAL_TABLE, e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn complete_interval(
        &self,
        run_id: &str,
        start_time: DateTime<Utc>,
        completion: &IntervalCompletion,
    ) -> CdmResult<u64> {
        let (run_id, completion) = (run_id.to_string(), completion.clone());
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE cdm_run_interval SET end_time = ?1, status = ?2, elapsed_time = ?3
                     WHERE run_id = ?4 AND start_time = ?5 AND status = ?6",
                    params![
                        completion.end_time,
                        completion.status.as_str(),
                        completion.elapsed_time,
                        run_id,
                        start_time,
                        IntervalStatus::Running.as_str(),
                    ],
                )
                .map_err(|e| CdmError::write_failed(INTERVAL_TABLE, e.to_string()))?;
            Ok(changed as u64)
        })
        .await
    }

    async fn list_intervals(&self, run_id: Option<&str>, limit: usize) -> CdmResult<Vec<IntervalRecord>> {
        let run_id = run_id.map(str::to_string);
        let raw = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT run_id, start_time, start_token, end_token, token_increment,
                                read_rate_limit, write_rate_limit, status, end_time, elapsed_time
                         FROM cdm_run_interval
                         WHERE ?1 IS NULL OR run_id = ?1
                         ORDER BY start_time DESC
                         LIMIT ?2",
                    )
                    .map_err(|e| read_failed(INTERVAL_TABLE, e))?;
                let rows = stmt
                    .query_map(params![run_id, limit as i64], Self::map_interval)
                    .map_err(|e| read_failed(INTERVAL_TABLE, e))?;
                rows.collect::<Result<Vec<_>, _>>()
                    .map_err(|e| read_failed(INTERVAL_TABLE, e))
            })
            .await?;
        raw.into_iter().map(RawInterval::into_record).collect()
    }

    async fn create_schema(&self) -> CdmResult<()> {
        let tables = self
            .with_conn(|conn| {
                conn.execute_batch(SCHEMA)
                    .map_err(|e| CdmError::write_failed("schema", e.to_string()))?;
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN (?1, ?2)",
                    params![PARAMETERS_TABLE, INTERVAL_TABLE],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
                .map_err(|e| CdmError::store_unavailable(e.to_string()))
            })
            .await?;
        info!("Schema ready ({} tables)", tables.unwrap_or(0));
        Ok(())
    }

    async fn close(self: Box<Self>) -> CdmResult<()> {
        let Ok(conn) = Arc::try_unwrap(self.conn) else {
            warn!("SQLite connection still in use at close; leaving it to drop");
            return Ok(());
        };
        let conn = conn.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        blocking(move || {
            if let Err((_, e)) = conn.close() {
                warn!("SQLite connection did not close cleanly: {}", e);
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    async fn fresh(dir: &TempDir) -> (SqliteConnector, Box<dyn StoreSession>) {
        let connector = SqliteConnector::new(dir.path().join("state.db"), "migration")
            .create_if_missing(true);
        let session = connector.connect().await.unwrap();
        session.create_schema().await.unwrap();
        (connector, session)
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let connector = SqliteConnector::new(dir.path().join("absent.db"), "migration");
        assert!(matches!(connector.connect().await, Err(CdmError::StoreUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_interval_lifecycle_round_trip() {
        let dir = TempDir::new().unwrap();
        let (_connector, session) = fresh(&dir).await;
        let started = Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap();
        let record = IntervalRecord {
            run_id: "run-7".to_string(),
            start_time: started,
            start_token: i64::MAX as i128 - 10,
            end_token: i64::MAX as i128 + 90,
            token_increment: 100,
            read_rate_limit: 75000,
            write_rate_limit: 40000,
            status: IntervalStatus::Running,
            end_time: None,
            elapsed_time: None,
        };
        session.insert_interval(&record).await.unwrap();
        let completion = IntervalCompletion {
            status: IntervalStatus::Success,
            end_time: started + chrono::Duration::seconds(42),
            elapsed_time: 42,
        };
        assert_eq!(session.complete_interval("run-7", started, &completion).await.unwrap(), 1);
        assert_eq!(session.complete_interval("run-8", started, &completion).await.unwrap(), 0);
        let late = IntervalCompletion { status: IntervalStatus::Failed, ..completion.clone() };
        assert_eq!(session.complete_interval("run-7", started, &late).await.unwrap(), 0);

        let rows = session.list_intervals(Some("run-7"), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, IntervalStatus::Success);
        assert_eq!(rows[0].end_token, i64::MAX as i128 + 90);
        assert_eq!(rows[0].elapsed_time, Some(42));
        session.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_session_work_runs_off_the_async_workers() {
        let dir = TempDir::new().unwrap();
        let (connector, session) = fresh(&dir).await;
        session.seed_parameter("last_end_token", "0").await.unwrap();
        let (left, right) = tokio::join!(session.fetch_parameters(), session.fetch_parameters());
        assert_eq!(left.unwrap(), right.unwrap());
        session.close().await.unwrap();

        let reopened = connector.connect().await.unwrap();
        assert_eq!(reopened.fetch_parameters().await.unwrap().len(), 1);
        reopened.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_seed_and_conditional_update() {
        let dir = TempDir::new().unwrap();
        let (_connector, session) = fresh(&dir).await;
        assert!(session.seed_parameter("last_end_token", "0").await.unwrap());
        assert!(!session.seed_parameter("last_end_token", "999").await.unwrap());
        assert_eq!(session.compare_and_set_parameter("last_end_token", "1", "5").await.unwrap(), 0);
        assert_eq!(session.compare_and_set_parameter("last_end_token", "0", "5").await.unwrap(), 1);
        let rows = session.fetch_parameters().await.unwrap();
        assert_eq!(rows, vec![("last_end_token".to_string(), "5".to_string())]);
    }

    #[tokio::test]
    async fn test_duplicate_start_time_fails_write() {
        let dir = TempDir::new().unwrap();
        let (_connector, session) = fresh(&dir).await;
        let record = IntervalRecord {
            run_id: "run-1".to_string(),
            start_time: Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap(),
            start_token: 0,
            end_token: 10,
            token_increment: 10,
            read_rate_limit: 1,
            write_rate_limit: 1,
            status: IntervalStatus::Running,
            end_time: None,
            elapsed_time: None,
        };
        session.insert_interval(&record).await.unwrap();
        let err = session.insert_interval(&record).await.unwrap_err();
        assert!(matches!(err, CdmError::WriteFailed { ref table, .. } if table == INTERVAL_TABLE));
    }
}
