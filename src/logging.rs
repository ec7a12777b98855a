//! Process-wide log stream: stderr plus a size-rotated file in the log directory.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::error::{CdmError, CdmResult};

pub const LOG_FILE_NAME: &str = "cdm-pacer.log";
pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_BACKUPS: u32 = 5;
pub const LEVEL_VAR: &str = "RUST_LOG";

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} {l:<5} {m}{n}";

fn log_error(message: String) -> CdmError {
    CdmError::config(message, "Pass a writable --log-dir")
}

/// Appender writing `path`, rolled to `path.1` .. `path.N` once it grows past `max_bytes`.
pub fn rolling_appender(path: &Path, max_bytes: u64, backups: u32) -> CdmResult<RollingFileAppender> {
    let pattern = format!("{}.{{}}", path.display());
    let roller = FixedWindowRoller::builder()
        .base(1)
        .build(&pattern, backups)
        .map_err(|e| log_error(format!("cannot set up log rotation for {}: {}", path.display(), e)))?;
    let policy = CompoundPolicy::new(Box::new(SizeTrigger::new(max_bytes)), Box::new(roller));
    RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build(path, Box::new(policy))
        .map_err(|e| log_error(format!("cannot open log file {}: {}", path.display(), e)))
}

/// A level named in `RUST_LOG` wins over `fallback`.
pub fn effective_level(env_value: Option<&str>, fallback: LevelFilter) -> LevelFilter {
    env_value
        .and_then(|value| LevelFilter::from_str(value.trim()).ok())
        .unwrap_or(fallback)
}

pub fn build_config(log_dir: &Path, level: LevelFilter) -> CdmResult<Config> {
    fs::create_dir_all(log_dir)
        .map_err(|e| log_error(format!("cannot create log directory {}: {}", log_dir.display(), e)))?;
    let file = rolling_appender(&log_dir.join(LOG_FILE_NAME), DEFAULT_MAX_BYTES, DEFAULT_BACKUPS)?;
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();

    Config::builder()
        .appender(Appender::builder().build("file", Box::new(file)))
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("file").appender("stderr").build(level))
        .map_err(|e| log_error(format!("invalid logging configuration: {}", e)))
}

/// Install the global logger.
pub fn init(log_dir: &Path, level: LevelFilter) -> CdmResult<()> {
    let level = effective_level(std::env::var(LEVEL_VAR).ok().as_deref(), level);
    let config = build_config(log_dir, level)?;
    log4rs::init_config(config)
        .map_err(|e| CdmError::config(format!("logger already installed: {}", e), "Call logging::init once"))?;
    Ok(())
}
