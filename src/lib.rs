//! Resumable, rate-aware driver for a long-running token-range migration job.
//!
//! The signed 64-bit token ring is walked in fixed-width intervals. Each interval
//! is recorded before and after it runs, the external job is supervised with a
//! stall watchdog, and the resume cursor only moves after a confirmed success.

pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod params;
pub mod progress;
pub mod rate;
pub mod store;
pub mod supervisor;

#[cfg(feature = "cli")]
pub mod cli;
#[cfg(feature = "cli")]
pub mod logging;

pub use clock::{Clock, SystemClock};
pub use command::{CommandTemplate, JobArgs};
pub use config::{JobConfig, RunConfig, StoreCredentials};
pub use error::{CdmError, CdmResult};
pub use orchestrator::{IntervalOrchestrator, IntervalReport, RunOutcome, Step};
pub use params::{Interval, MigrationParams, ParameterStore};
pub use progress::{estimate, Estimate, HistoryEstimate};
pub use rate::RateScheduler;
pub use store::{IntervalRecord, IntervalStatus, MemoryStore, StoreConnector, StoreSession};
pub use supervisor::{JobExit, JobHandle, JobLauncher, ProcessSupervisor, RestartPolicy, ShellLauncher};
