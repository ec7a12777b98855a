//! External job supervision.
//!
//! One interval runs as: `Started -> Polling -> (Completed | TimedOut ->
//! Restarted -> Polling) ... -> Finished(status)`. Liveness is polled on a fixed
//! cadence against a per-attempt monotonic deadline; an attempt that outlives
//! the deadline is killed, reaped, and relaunched with the same command.
//!
//! All timing goes through `tokio::time`, so tests drive the whole state
//! machine on a paused clock.

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};

use crate::error::{CdmError, CdmResult};
use crate::params::Interval;
use crate::store::IntervalStatus;

/// How long one attempt may run and what happens when it stalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub poll_interval: Duration,
    pub max_attempt_duration: Duration,
    /// `None` keeps restarting until the job exits on its own.
    pub max_restarts: Option<u32>,
    pub restart_backoff: Duration,
    /// Treat a non-zero exit code as FAILED instead of SUCCESS.
    pub require_zero_exit: bool,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_attempt_duration: Duration::from_secs(3600),
            max_restarts: None,
            restart_backoff: Duration::ZERO,
            require_zero_exit: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobExit {
    pub code: Option<i32>,
}

impl JobExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for JobExit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// A running job attempt.
#[async_trait]
pub trait JobHandle: Send {
    /// Non-blocking liveness check; `Some` once the process has exited.
    fn try_wait(&mut self) -> io::Result<Option<JobExit>>;

    /// Forcibly terminate and wait until the process is reaped.
    async fn kill(&mut self) -> io::Result<()>;

    fn id(&self) -> Option<u32>;
}

/// Starts job attempts with their combined output sent to `output`.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    async fn launch(&self, command: &str, output: &File) -> CdmResult<Box<dyn JobHandle>>;
}

/// Runs the command through `sh -c`, the way an operator would paste it.
#[derive(Debug, Clone)]
pub struct ShellLauncher {
    shell: String,
}

impl Default for ShellLauncher {
    fn default() -> Self {
        Self { shell: "sh".to_string() }
    }
}

impl ShellLauncher {
    pub fn new(shell: impl Into<String>) -> Self {
        Self { shell: shell.into() }
    }
}

#[async_trait]
impl JobLauncher for ShellLauncher {
    async fn launch(&self, command: &str, output: &File) -> CdmResult<Box<dyn JobHandle>> {
        let stdout = output
            .try_clone()
            .map_err(|e| CdmError::launch_failed(format!("cannot share interval log: {}", e)))?;
        let stderr = output
            .try_clone()
            .map_err(|e| CdmError::launch_failed(format!("cannot share interval log: {}", e)))?;
        let mut shell = Command::new(&self.shell);
        shell
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        // Own process group, so a stall kill reaches pipelines and `cd && ...` chains.
        #[cfg(unix)]
        shell.process_group(0);
        let child = shell
            .spawn()
            .map_err(|e| CdmError::launch_failed(format!("{} -c ...: {}", self.shell, e)))?;
        Ok(Box::new(ChildHandle { child }))
    }
}

struct ChildHandle {
    child: Child,
}

#[async_trait]
impl JobHandle for ChildHandle {
    fn try_wait(&mut self) -> io::Result<Option<JobExit>> {
        Ok(self.child.try_wait()?.map(|status| JobExit { code: status.code() }))
    }

    async fn kill(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            kill_process_group(pid)?;
        }
        self.child.kill().await
    }

    fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

/// SIGKILL every process in the group led by `pid`. A group that is already gone is fine.
#[cfg(unix)]
fn kill_process_group(pid: u32) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let pgid = i32::try_from(pid).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::from(e)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Started,
    Polling,
    Completed,
    TimedOut,
    Restarted,
    Finished(IntervalStatus),
}

/// What happened while supervising one interval.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisionReport {
    pub status: IntervalStatus,
    pub launches: u32,
    pub restarts: u32,
    pub exit: Option<JobExit>,
    pub elapsed: Duration,
    pub error: Option<String>,
    pub trace: Vec<SupervisorState>,
    pub log_path: PathBuf,
}

struct Attempts {
    launches: u32,
    restarts: u32,
    trace: Vec<SupervisorState>,
}

impl Attempts {
    fn enter(&mut self, state: SupervisorState) {
        if let Some(previous) = self.trace.last() {
            debug!("Supervisor {:?} -> {:?}", previous, state);
        }
        self.trace.push(state);
    }
}

pub struct ProcessSupervisor {
    launcher: Arc<dyn JobLauncher>,
    policy: RestartPolicy,
    log_dir: PathBuf,
}

impl ProcessSupervisor {
    pub fn new(launcher: Arc<dyn JobLauncher>, policy: RestartPolicy, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            launcher,
            policy,
            log_dir: log_dir.into(),
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    pub fn log_path(&self, interval: &Interval) -> PathBuf {
        self.log_dir
            .join(format!("interval_{}_{}.log", interval.start, interval.end))
    }

    /// Run `command` for `interval` until it exits or the restart budget runs out.
    ///
    /// Never returns an error: launch and supervision failures become a
    /// FAILED report so the caller can record them.
    pub async fn supervise(&self, command: &str, interval: &Interval) -> SupervisionReport {
        let started = Instant::now();
        let log_path = self.log_path(interval);
        let mut attempts = Attempts {
            launches: 0,
            restarts: 0,
            trace: Vec::new(),
        };

        let outcome = match open_interval_log(&log_path) {
            Ok(log) => {
                let outcome = self.run_attempts(command, &log, &mut attempts).await;
                if let Err(e) = log.sync_all() {
                    warn!("Failed to flush {}: {}", log_path.display(), e);
                }
                outcome
            }
            Err(e) => Err(e),
        };

        let (status, exit, error) = match outcome {
            Ok(exit) if self.policy.require_zero_exit && !exit.success() => {
                warn!("Job finished with {}; treating interval as failed", exit);
                (IntervalStatus::Failed, Some(exit), Some(format!("job finished with {}", exit)))
            }
            Ok(exit) => {
                info!("Job finished with {}", exit);
                (IntervalStatus::Success, Some(exit), None)
            }
            Err(e) => {
                error!("Error running job: {}", e);
                (IntervalStatus::Failed, None, Some(e.to_string()))
            }
        };
        attempts.enter(SupervisorState::Finished(status));

        SupervisionReport {
            status,
            launches: attempts.launches,
            restarts: attempts.restarts,
            exit,
            elapsed: started.elapsed(),
            error,
            trace: attempts.trace,
            log_path,
        }
    }

    async fn run_attempts(&self, command: &str, log: &File, attempts: &mut Attempts) -> CdmResult<JobExit> {
        attempts.enter(SupervisorState::Started);
        loop {
            let mut handle = self.launcher.launch(command, log).await?;
            attempts.launches += 1;
            info!(
                "Launched job attempt {} (pid {})",
                attempts.launches,
                handle.id().map_or_else(|| "?".to_string(), |id| id.to_string())
            );
            attempts.enter(SupervisorState::Polling);

            if let Some(exit) = self.poll_until_deadline(handle.as_mut()).await? {
                attempts.enter(SupervisorState::Completed);
                return Ok(exit);
            }

            attempts.enter(SupervisorState::TimedOut);
            warn!(
                "Job attempt {} exceeded {:?}; killing it",
                attempts.launches, self.policy.max_attempt_duration
            );
            handle.kill().await.map_err(|e| CdmError::Supervision {
                message: format!("failed to kill stalled job: {}", e),
            })?;

            if let Some(max) = self.policy.max_restarts {
                if attempts.restarts >= max {
                    return Err(CdmError::RestartsExhausted { restarts: attempts.restarts });
                }
            }
            attempts.restarts += 1;
            if !self.policy.restart_backoff.is_zero() {
                sleep(self.policy.restart_backoff).await;
            }
            attempts.enter(SupervisorState::Restarted);
            info!("Restarting job (restart {})", attempts.restarts);
        }
    }

    /// `Some(exit)` if the attempt ended, `None` once its deadline passed.
    async fn poll_until_deadline(&self, handle: &mut dyn JobHandle) -> CdmResult<Option<JobExit>> {
        let attempt_started = Instant::now();
        let deadline = attempt_started + self.policy.max_attempt_duration;
        loop {
            let exited = handle.try_wait().map_err(|e| CdmError::Supervision {
                message: format!("failed to poll job: {}", e),
            })?;
            if exited.is_some() {
                return Ok(exited);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            info!("Job running - elapsed {}s", now.duration_since(attempt_started).as_secs());
            sleep(self.policy.poll_interval.min(deadline - now)).await;
        }
    }
}

fn open_interval_log(path: &Path) -> CdmResult<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| CdmError::launch_failed(format!("cannot create {}: {}", parent.display(), e)))?;
    }
    File::create(path).map_err(|e| CdmError::launch_failed(format!("cannot open {}: {}", path.display(), e)))
}
