//! The interval control loop.
//!
//! Each iteration walks `LOAD_PARAMS -> CHECK_DONE -> COMPUTE_INTERVAL ->
//! RECORD_START -> EXECUTE -> RECORD_END -> ADVANCE_CURSOR`. A store session is
//! opened for the bookkeeping before execution and a fresh one after it, so no
//! connection is held for the hours a job can take. Any persistence error ends
//! the loop with the cursor at its last durably written value.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::time::Instant;

use crate::clock::{Clock, SystemClock};
use crate::command::{CommandTemplate, JobArgs};
use crate::error::{CdmError, CdmResult};
use crate::params::{Interval, MigrationParams, ParameterStore};
use crate::progress::{self, Estimate, HistoryEstimate};
use crate::rate::RateScheduler;
use crate::store::{
    IntervalCompletion, IntervalRecord, IntervalStatus, StoreConnector, StoreSession, INTERVAL_TABLE,
};
use crate::supervisor::{ProcessSupervisor, SupervisionReport};

/// What one executed interval did.
#[derive(Debug, Clone)]
pub struct IntervalReport {
    pub interval: Interval,
    pub status: IntervalStatus,
    pub read_rate_limit: i64,
    pub write_rate_limit: i64,
    pub elapsed: Duration,
    /// Progress estimate, logged after a successful interval.
    pub estimate: Option<Estimate>,
    /// `None` when the interval was a dry run.
    pub supervision: Option<SupervisionReport>,
}

#[derive(Debug)]
pub enum Step {
    Advanced(IntervalReport),
    Failed(IntervalReport),
    Done,
}

#[derive(Debug)]
pub enum RunOutcome {
    Done { intervals: u64 },
    IntervalFailed { report: IntervalReport, intervals: u64 },
    Aborted { error: CdmError, intervals: u64 },
}

impl RunOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, RunOutcome::Done { .. })
    }

    /// Intervals executed by this run, including a final failed one.
    pub fn intervals(&self) -> u64 {
        match self {
            RunOutcome::Done { intervals }
            | RunOutcome::IntervalFailed { intervals, .. }
            | RunOutcome::Aborted { intervals, .. } => *intervals,
        }
    }
}

/// The next interval as `run` would execute it right now.
#[derive(Debug, Clone, Serialize)]
pub struct Preview {
    pub interval: Interval,
    pub hour_key: String,
    pub read_rate_limit: i64,
    pub command: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub run_id: String,
    pub params: MigrationParams,
    pub done: bool,
    pub cursor_pct: Option<f64>,
    pub recent: Vec<IntervalRecord>,
    pub eta: Option<HistoryEstimate>,
}

/// Bookkeeping carried from RECORD_START to RECORD_END.
struct Started {
    params: MigrationParams,
    interval: Interval,
    record: IntervalRecord,
    command: String,
}

pub struct IntervalOrchestrator {
    connector: Arc<dyn StoreConnector>,
    supervisor: ProcessSupervisor,
    clock: Arc<dyn Clock>,
    run_id: String,
    dry_run: bool,
    template: CommandTemplate,
    rates: RateScheduler,
}

impl IntervalOrchestrator {
    pub fn new(connector: Arc<dyn StoreConnector>, supervisor: ProcessSupervisor, run_id: impl Into<String>) -> Self {
        Self {
            connector,
            supervisor,
            clock: Arc::new(SystemClock),
            run_id: run_id.into(),
            dry_run: false,
            template: CommandTemplate::default(),
            rates: RateScheduler::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_template(mut self, template: CommandTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn with_rates(mut self, rates: RateScheduler) -> Self {
        self.rates = rates;
        self
    }

    /// Record intervals as SUCCESS without launching the job.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Run intervals until the cursor passes `end_token`, an interval fails,
    /// or the store cannot be read or written.
    pub async fn run(&self) -> RunOutcome {
        info!(
            "Starting run '{}' against {}{}",
            self.run_id,
            self.connector.describe(),
            if self.dry_run { " (dry run)" } else { "" }
        );
        let policy = self.supervisor.policy();
        debug!(
            "Polling every {:?}, attempt deadline {:?}, job: {}",
            policy.poll_interval,
            policy.max_attempt_duration,
            self.template.source()
        );
        let mut intervals = 0;
        loop {
            match self.run_next_interval().await {
                Ok(Step::Done) => {
                    info!("Run '{}' done after {} intervals", self.run_id, intervals);
                    return RunOutcome::Done { intervals };
                }
                Ok(Step::Advanced(_)) => intervals += 1,
                Ok(Step::Failed(report)) => {
                    intervals += 1;
                    error!(
                        "Interval {}..{} failed; stopping with the cursor at {}",
                        report.interval.start, report.interval.end, report.interval.start
                    );
                    return RunOutcome::IntervalFailed { report, intervals };
                }
                Err(error) => {
                    error!("Aborting run '{}': {}", self.run_id, error);
                    return RunOutcome::Aborted { error, intervals };
                }
            }
        }
    }

    /// One pass through the loop.
    pub async fn run_next_interval(&self) -> CdmResult<Step> {
        let session = self.connector.connect().await?;
        let begun = self.begin(session.as_ref()).await;
        close(session).await;
        let Some(started) = begun? else {
            return Ok(Step::Done);
        };

        let timer = Instant::now();
        let (status, supervision) = if self.dry_run {
            info!("Dry run, not executing: {}", started.command);
            (IntervalStatus::Success, None)
        } else {
            let report = self.supervisor.supervise(&started.command, &started.interval).await;
            (report.status, Some(report))
        };
        let elapsed = timer.elapsed();
        let end_time = self.clock.now();

        let session = self.connector.connect().await?;
        let finished = self
            .finish(session.as_ref(), &started, status, end_time, elapsed)
            .await;
        close(session).await;
        let estimate = finished?;

        let report = IntervalReport {
            interval: started.interval,
            status,
            read_rate_limit: started.record.read_rate_limit,
            write_rate_limit: started.record.write_rate_limit,
            elapsed,
            estimate,
            supervision,
        };
        Ok(match status {
            IntervalStatus::Success => Step::Advanced(report),
            _ => Step::Failed(report),
        })
    }

    /// LOAD_PARAMS through RECORD_START. `None` means DONE.
    async fn begin(&self, session: &dyn StoreSession) -> CdmResult<Option<Started>> {
        let params = ParameterStore::new(session).load().await?;
        if params.is_exhausted() {
            info!(
                "Cursor {} is past end_token {}; nothing left to migrate",
                params.last_end_token, params.end_token
            );
            return Ok(None);
        }

        let interval = params.next_interval();
        let now = self.clock.now();
        let read_rate_limit = self.rates.effective_read_rate(&now, &params);
        let command = self.template.build(&JobArgs {
            start_token: interval.start,
            end_token: interval.job_end,
            num_partitions: params.num_partitions,
            read_rate_limit,
            write_rate_limit: params.write_rate_limit,
        })?;

        let record = IntervalRecord {
            run_id: self.run_id.clone(),
            start_time: now,
            start_token: interval.start,
            end_token: interval.end,
            token_increment: params.token_increment,
            read_rate_limit,
            write_rate_limit: params.write_rate_limit,
            status: IntervalStatus::Running,
            end_time: None,
            elapsed_time: None,
        };
        session.insert_interval(&record).await?;
        info!(
            "Running interval {}..{} (read {} / write {} per second)",
            interval.start, interval.job_end, read_rate_limit, params.write_rate_limit
        );
        Ok(Some(Started {
            params,
            interval,
            record,
            command,
        }))
    }

    /// RECORD_END and, on success, ADVANCE_CURSOR.
    async fn finish(
        &self,
        session: &dyn StoreSession,
        started: &Started,
        status: IntervalStatus,
        end_time: chrono::DateTime<chrono::Utc>,
        elapsed: Duration,
    ) -> CdmResult<Option<Estimate>> {
        let completion = IntervalCompletion {
            status,
            end_time,
            elapsed_time: i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX),
        };
        let (run_id, start_time) = started.record.key();
        let updated = session.complete_interval(run_id, start_time, &completion).await?;
        if updated == 0 {
            return Err(CdmError::write_failed(
                INTERVAL_TABLE,
                format!("no RUNNING record for run '{}' started at {}", run_id, start_time),
            ));
        }
        info!(
            "Interval {}..{} finished {} in {}s",
            started.interval.start, started.interval.end, status, completion.elapsed_time
        );
        if status != IntervalStatus::Success {
            return Ok(None);
        }

        let params = &started.params;
        let estimate = progress::estimate(
            params.start_token,
            params.end_token,
            started.interval.start,
            started.interval.end,
            elapsed.as_secs_f64(),
        );
        info!("Progress: {}", estimate);
        ParameterStore::new(session)
            .set_last_end_token(started.interval.start, started.interval.end)
            .await?;
        Ok(Some(estimate))
    }

    /// The command the next interval would run, without writing anything.
    pub async fn preview(&self) -> CdmResult<Option<Preview>> {
        let session = self.connector.connect().await?;
        let loaded = ParameterStore::new(session.as_ref()).load().await;
        close(session).await;
        let params = loaded?;
        if params.is_exhausted() {
            return Ok(None);
        }
        let interval = params.next_interval();
        let now = self.clock.now();
        let read_rate_limit = self.rates.effective_read_rate(&now, &params);
        let command = self.template.build(&JobArgs {
            start_token: interval.start,
            end_token: interval.job_end,
            num_partitions: params.num_partitions,
            read_rate_limit,
            write_rate_limit: params.write_rate_limit,
        })?;
        Ok(Some(Preview {
            interval,
            hour_key: self.rates.hour_key(&now),
            read_rate_limit,
            command,
        }))
    }

    /// Parameter snapshot, recent records for this run, and a history-based ETA.
    pub async fn status(&self, limit: usize) -> CdmResult<StatusReport> {
        let session = self.connector.connect().await?;
        let gathered = gather_status(session.as_ref(), &self.run_id, limit).await;
        close(session).await;
        let (params, recent) = gathered?;
        Ok(StatusReport {
            run_id: self.run_id.clone(),
            done: params.is_exhausted(),
            cursor_pct: progress::cursor_pct(&params),
            eta: HistoryEstimate::from_records(&recent, &params),
            recent,
            params,
        })
    }

    /// Create the tables if needed and seed missing default parameters.
    pub async fn initialize(&self) -> CdmResult<Vec<String>> {
        let session = self.connector.connect().await?;
        let seeded = seed(session.as_ref()).await;
        close(session).await;
        let seeded = seeded?;
        if seeded.is_empty() {
            info!("Schema ready; all parameters already present");
        } else {
            info!("Schema ready; seeded {}", seeded.join(", "));
        }
        Ok(seeded)
    }
}

async fn gather_status(
    session: &dyn StoreSession,
    run_id: &str,
    limit: usize,
) -> CdmResult<(MigrationParams, Vec<IntervalRecord>)> {
    let params = ParameterStore::new(session).load().await?;
    let recent = session.list_intervals(Some(run_id), limit).await?;
    Ok((params, recent))
}

async fn seed(session: &dyn StoreSession) -> CdmResult<Vec<String>> {
    session.create_schema().await?;
    ParameterStore::new(session).seed_defaults().await
}

async fn close(session: Box<dyn StoreSession>) {
    if let Err(e) = session.close().await {
        warn!("Failed to close store session: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SteppingClock;
    use crate::store::memory::Faults;
    use crate::store::MemoryStore;
    use crate::supervisor::{RestartPolicy, ShellLauncher};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn orchestrator(store: &MemoryStore, dir: &TempDir) -> IntervalOrchestrator {
        let supervisor = ProcessSupervisor::new(Arc::new(ShellLauncher::default()), RestartPolicy::default(), dir.path());
        let start = chrono::Utc.with_ymd_and_hms(2024, 7, 10, 17, 0, 0).unwrap();
        IntervalOrchestrator::new(Arc::new(store.clone()), supervisor, "test-run")
            .with_clock(Arc::new(SteppingClock::new(start, chrono::Duration::seconds(1))))
            .with_template(CommandTemplate::parse("job <start_token> <end_token> <read_rate_limit>").unwrap())
            .dry_run(true)
    }

    fn small_space() -> MemoryStore {
        MemoryStore::with_parameters([
            ("start_token", "0"),
            ("end_token", "1000"),
            ("token_increment", "300"),
            ("last_end_token", "0"),
        ])
    }

    #[tokio::test]
    async fn test_dry_run_walks_whole_space() {
        let dir = TempDir::new().unwrap();
        let store = small_space();
        let outcome = orchestrator(&store, &dir).run().await;
        assert!(outcome.is_done());
        assert_eq!(outcome.intervals(), 4);
        assert_eq!(store.parameter("last_end_token").as_deref(), Some("1200"));

        let starts: Vec<i128> = store.intervals().iter().map(|r| r.start_token).collect();
        assert_eq!(starts, vec![0, 300, 600, 900]);
        assert!(store.intervals().iter().all(|r| r.status == IntervalStatus::Success));
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_preview_clamps_job_bound() {
        let dir = TempDir::new().unwrap();
        let store = small_space();
        store.set_parameter("last_end_token", 900);
        store.set_parameter("read_rate_limit_1400", 75000);
        let preview = orchestrator(&store, &dir).preview().await.unwrap().unwrap();
        assert_eq!(preview.hour_key, "1400");
        assert_eq!(preview.command, "job 900 1000 75000");
        assert_eq!(preview.interval.end, 1200);
        assert_eq!(store.interval_writes(), 0);
    }

    #[tokio::test]
    async fn test_preview_none_when_done() {
        let dir = TempDir::new().unwrap();
        let store = small_space();
        store.set_parameter("last_end_token", 1001);
        assert!(orchestrator(&store, &dir).preview().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_reports_progress_and_eta() {
        let dir = TempDir::new().unwrap();
        let store = small_space();
        let orch = orchestrator(&store, &dir);
        orch.run_next_interval().await.unwrap();
        let status = orch.status(10).await.unwrap();
        assert!(!status.done);
        assert_eq!(status.recent.len(), 1);
        assert_eq!(status.cursor_pct, Some(30.0));
        let eta = status.eta.unwrap();
        assert_eq!(eta.samples, 1);
        assert_eq!(eta.remaining_intervals, 3);
    }

    #[tokio::test]
    async fn test_initialize_seeds_missing_defaults_only() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::with_parameters([("last_end_token", "42")]);
        let seeded = orchestrator(&store, &dir).initialize().await.unwrap();
        assert_eq!(seeded.len(), 6);
        assert_eq!(store.parameter("last_end_token").as_deref(), Some("42"));
        assert_eq!(store.parameter("num_partitions").as_deref(), Some("5000"));
    }

    #[tokio::test]
    async fn test_connect_failure_aborts_before_any_write() {
        let dir = TempDir::new().unwrap();
        let store = small_space();
        store.set_faults(Faults { connect: true, ..Faults::default() });
        let outcome = orchestrator(&store, &dir).run().await;
        assert!(matches!(outcome, RunOutcome::Aborted { error: CdmError::StoreUnavailable { .. }, intervals: 0 }));
        assert_eq!(store.interval_writes(), 0);
    }
}
