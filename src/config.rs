//! Environment and job-file configuration.
//!
//! Connection credentials and the run identifier come from the environment;
//! the job command template, supervisor policy and rate schedule come from an
//! optional TOML file whose keys all have defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use serde::Deserialize;

use crate::command::{CommandTemplate, DEFAULT_COMMAND_TEMPLATE};
use crate::error::{CdmError, CdmResult};
use crate::rate::{RateScheduler, DEFAULT_READ_RATE, DEFAULT_TIMEZONE};
use crate::supervisor::RestartPolicy;

pub const RUN_ID_VAR: &str = "RUN_ID";
pub const DRY_RUN_VAR: &str = "DRY_RUN";
pub const BUNDLE_PATH_VAR: &str = "CDM_BUNDLE_PATH";
pub const CLIENT_ID_VAR: &str = "CDM_CLIENT_ID";
pub const CLIENT_SECRET_VAR: &str = "CDM_CLIENT_SECRET";
pub const KEYSPACE_VAR: &str = "CDM_KEYSPACE";

pub const CREDENTIAL_VARS: [&str; 4] = [BUNDLE_PATH_VAR, CLIENT_ID_VAR, CLIENT_SECRET_VAR, KEYSPACE_VAR];

/// Connection settings for the backing store.
#[derive(Clone)]
pub struct StoreCredentials {
    pub bundle_path: PathBuf,
    pub client_id: String,
    pub client_secret: String,
    pub keyspace: String,
}

impl std::fmt::Debug for StoreCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCredentials")
            .field("bundle_path", &self.bundle_path)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("keyspace", &self.keyspace)
            .finish()
    }
}

impl StoreCredentials {
    pub fn from_env() -> CdmResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read credentials through `lookup`, reporting every missing variable at once.
    pub fn from_lookup<F>(lookup: F) -> CdmResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let values: Vec<Option<String>> = CREDENTIAL_VARS
            .iter()
            .map(|name| lookup(*name).filter(|v| !v.trim().is_empty()))
            .collect();
        let missing: Vec<&str> = CREDENTIAL_VARS
            .iter()
            .zip(&values)
            .filter(|(_, v)| v.is_none())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(CdmError::missing_env(&missing, &CREDENTIAL_VARS));
        }
        let mut values = values.into_iter().flatten();
        let mut next = || values.next().unwrap_or_default();
        Ok(Self {
            bundle_path: PathBuf::from(next()),
            client_id: next(),
            client_secret: next(),
            keyspace: next(),
        })
    }

    /// Fail unless the connection bundle is present on disk.
    pub fn require_bundle(&self) -> CdmResult<()> {
        if self.bundle_path.exists() {
            Ok(())
        } else {
            Err(CdmError::bundle_not_found(self.bundle_path.clone()))
        }
    }
}

/// Everything the `run` loop needs from the environment.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub run_id: String,
    pub dry_run: bool,
    pub credentials: StoreCredentials,
}

impl RunConfig {
    pub fn from_env() -> CdmResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> CdmResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut required = vec![RUN_ID_VAR];
        required.extend_from_slice(&CREDENTIAL_VARS);
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|name| lookup(*name).map_or(true, |v| v.trim().is_empty()))
            .collect();
        if !missing.is_empty() {
            return Err(CdmError::missing_env(&missing, &required));
        }
        let credentials = StoreCredentials::from_lookup(&lookup)?;
        credentials.require_bundle()?;
        Ok(Self {
            run_id: lookup(RUN_ID_VAR).unwrap_or_default(),
            dry_run: lookup(DRY_RUN_VAR).map_or(false, |v| parse_flag(&v)),
            credentials,
        })
    }
}

pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    pub poll_interval_secs: u64,
    pub max_attempt_secs: u64,
    pub max_restarts: Option<u32>,
    pub restart_backoff_secs: u64,
    pub require_zero_exit: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let policy = RestartPolicy::default();
        Self {
            poll_interval_secs: policy.poll_interval.as_secs(),
            max_attempt_secs: policy.max_attempt_duration.as_secs(),
            max_restarts: policy.max_restarts,
            restart_backoff_secs: policy.restart_backoff.as_secs(),
            require_zero_exit: policy.require_zero_exit,
        }
    }
}

impl SupervisorConfig {
    pub fn to_policy(&self) -> CdmResult<RestartPolicy> {
        if self.poll_interval_secs == 0 || self.max_attempt_secs == 0 {
            return Err(CdmError::config(
                "supervisor poll_interval_secs and max_attempt_secs must be positive",
                "Set both to at least 1 in the [supervisor] table",
            ));
        }
        Ok(RestartPolicy {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_attempt_duration: Duration::from_secs(self.max_attempt_secs),
            max_restarts: self.max_restarts,
            restart_backoff: Duration::from_secs(self.restart_backoff_secs),
            require_zero_exit: self.require_zero_exit,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleConfig {
    pub timezone: String,
    pub default_read_rate: i64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: DEFAULT_TIMEZONE.to_string(),
            default_read_rate: DEFAULT_READ_RATE,
        }
    }
}

impl ScheduleConfig {
    pub fn to_scheduler(&self) -> CdmResult<RateScheduler> {
        let tz: Tz = self.timezone.parse().map_err(|e| {
            CdmError::config(
                format!("unknown timezone '{}': {}", self.timezone, e),
                "Use an IANA zone name such as America/Sao_Paulo",
            )
        })?;
        Ok(RateScheduler::new(tz, self.default_read_rate))
    }
}

/// Contents of the optional `--job-config` TOML file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    pub command: String,
    pub supervisor: SupervisorConfig,
    pub schedule: ScheduleConfig,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_COMMAND_TEMPLATE.to_string(),
            supervisor: SupervisorConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl JobConfig {
    pub fn load(path: Option<&Path>) -> CdmResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|e| {
            CdmError::config(
                format!("failed to read job config {}: {}", path.display(), e),
                "Check the --job-config path",
            )
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> CdmResult<Self> {
        toml::from_str(content).map_err(|e| {
            CdmError::config(
                format!("invalid job config: {}", e),
                "See cdm-job.toml for the accepted keys",
            )
        })
    }

    pub fn template(&self) -> CdmResult<CommandTemplate> {
        CommandTemplate::parse(&self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_missing_variables_all_named() {
        let err = RunConfig::from_lookup(lookup_from(&[("RUN_ID", "r1"), ("CDM_KEYSPACE", "ks")])).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("CDM_BUNDLE_PATH"));
        assert!(text.contains("CDM_CLIENT_ID"));
        assert!(text.contains("CDM_CLIENT_SECRET"));
        assert!(!text.contains("CDM_KEYSPACE,"));
        let hint = err.suggestions().join("\n");
        for name in ["RUN_ID", "CDM_BUNDLE_PATH", "CDM_CLIENT_ID", "CDM_CLIENT_SECRET", "CDM_KEYSPACE"] {
            assert!(hint.contains(name));
        }
    }

    #[test]
    fn test_missing_bundle_is_config_error() {
        let err = RunConfig::from_lookup(lookup_from(&[
            ("RUN_ID", "r1"),
            ("CDM_BUNDLE_PATH", "/definitely/not/here.db"),
            ("CDM_CLIENT_ID", "id"),
            ("CDM_CLIENT_SECRET", "secret"),
            ("CDM_KEYSPACE", "ks"),
        ]))
        .unwrap_err();
        assert!(matches!(err, CdmError::Config { .. }));
        assert!(err.to_string().contains("/definitely/not/here.db"));
    }

    #[test]
    fn test_run_config_reads_dry_run() {
        let bundle = NamedTempFile::new().unwrap();
        let path = bundle.path().to_string_lossy().to_string();
        let config = RunConfig::from_lookup(lookup_from(&[
            ("RUN_ID", "r1"),
            ("DRY_RUN", "1"),
            ("CDM_BUNDLE_PATH", path.as_str()),
            ("CDM_CLIENT_ID", "id"),
            ("CDM_CLIENT_SECRET", "secret"),
            ("CDM_KEYSPACE", "ks"),
        ]))
        .unwrap();
        assert_eq!(config.run_id, "r1");
        assert!(config.dry_run);
        assert_eq!(config.credentials.keyspace, "ks");
        assert!(!format!("{:?}", config.credentials).contains("secret\""));
    }

    #[test]
    fn test_job_config_defaults_and_overrides() {
        let config = JobConfig::parse(
            r#"
command = "run-job --min <start_token> --max <end_token> --parts <num_partitions> --read <read_rate_limit> --write <write_rate_limit>"

[supervisor]
max_restarts = 4
poll_interval_secs = 10

[schedule]
default_read_rate = 25000
"#,
        )
        .unwrap();
        let policy = config.supervisor.to_policy().unwrap();
        assert_eq!(policy.max_restarts, Some(4));
        assert_eq!(policy.poll_interval, Duration::from_secs(10));
        assert_eq!(policy.max_attempt_duration, Duration::from_secs(3600));
        assert_eq!(config.schedule.timezone, "America/Sao_Paulo");
        assert_eq!(config.schedule.default_read_rate, 25000);
        assert!(config.template().is_ok());
    }

    #[test]
    fn test_sample_job_file_matches_defaults() {
        let config = JobConfig::parse(include_str!("../cdm-job.toml")).unwrap();
        assert_eq!(config, JobConfig::default());
    }

    #[test]
    fn test_job_config_rejects_unknown_keys_and_zones() {
        assert!(JobConfig::parse("comand = \"typo\"").is_err());
        let config = JobConfig::parse("[schedule]\ntimezone = \"Mars/Olympus\"").unwrap();
        assert!(matches!(config.schedule.to_scheduler(), Err(CdmError::Config { .. })));
    }
}
