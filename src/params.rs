//! Migration parameters.
//!
//! [`ParameterStore::load`] overlays the stored rows onto the built-in defaults
//! and returns an immutable [`MigrationParams`] snapshot. The orchestrator
//! reloads a fresh snapshot every iteration; nothing is cached between them.

use std::collections::BTreeMap;

use log::{debug, info};
use serde::Serialize;

use crate::error::{CdmError, CdmResult};
use crate::store::{parse_token, StoreSession, PARAMETERS_TABLE};

pub const START_TOKEN: &str = "start_token";
pub const END_TOKEN: &str = "end_token";
pub const TOKEN_INCREMENT: &str = "token_increment";
pub const LAST_END_TOKEN: &str = "last_end_token";
pub const NUM_PARTITIONS: &str = "num_partitions";
pub const READ_RATE_LIMIT: &str = "read_rate_limit";
pub const WRITE_RATE_LIMIT: &str = "write_rate_limit";

/// Built-in values used when the table has no row for a base key.
///
/// The default increment splits the full signed 64-bit ring into 10 000 intervals.
pub const DEFAULTS: [(&str, i128); 7] = [
    (START_TOKEN, i64::MIN as i128),
    (END_TOKEN, i64::MAX as i128),
    (TOKEN_INCREMENT, 1_844_674_407_370_955),
    (LAST_END_TOKEN, i64::MIN as i128),
    (NUM_PARTITIONS, 5000),
    (READ_RATE_LIMIT, 40000),
    (WRITE_RATE_LIMIT, 40000),
];

/// One bounded sub-range of the key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Interval {
    /// The cursor this interval starts from.
    pub start: i128,
    /// `start + token_increment`; becomes the cursor after success.
    pub end: i128,
    /// Upper bound handed to the job, never past `end_token`.
    pub job_end: i128,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationParams {
    pub start_token: i128,
    pub end_token: i128,
    pub token_increment: i128,
    pub last_end_token: i128,
    pub num_partitions: i64,
    pub read_rate_limit: i64,
    pub write_rate_limit: i64,
    values: BTreeMap<String, i128>,
}

impl Default for MigrationParams {
    fn default() -> Self {
        Self {
            start_token: i64::MIN as i128,
            end_token: i64::MAX as i128,
            token_increment: 1_844_674_407_370_955,
            last_end_token: i64::MIN as i128,
            num_partitions: 5000,
            read_rate_limit: 40000,
            write_rate_limit: 40000,
            values: defaults(),
        }
    }
}

fn defaults() -> BTreeMap<String, i128> {
    DEFAULTS.iter().map(|(id, value)| (id.to_string(), *value)).collect()
}

impl MigrationParams {
    /// Overlay stored `(parameter_id, parameter_value)` rows onto the defaults.
    /// Unknown ids, such as per-hour rate overrides, are kept verbatim.
    pub fn from_rows<I>(rows: I) -> CdmResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut values = defaults();
        for (id, raw) in rows {
            let value = parse_token(&id, &raw)?;
            values.insert(id, value);
        }
        Self::from_values(values)
    }

    fn from_values(values: BTreeMap<String, i128>) -> CdmResult<Self> {
        let token = |id: &str| values.get(id).copied().unwrap_or_default();
        let small = |id: &str| -> CdmResult<i64> {
            let value = token(id);
            i64::try_from(value).map_err(|_| CdmError::InvalidParameter {
                id: id.to_string(),
                value: value.to_string(),
            })
        };
        let params = Self {
            start_token: token(START_TOKEN),
            end_token: token(END_TOKEN),
            token_increment: token(TOKEN_INCREMENT),
            last_end_token: token(LAST_END_TOKEN),
            num_partitions: small(NUM_PARTITIONS)?,
            read_rate_limit: small(READ_RATE_LIMIT)?,
            write_rate_limit: small(WRITE_RATE_LIMIT)?,
            values,
        };
        if params.token_increment <= 0 {
            return Err(CdmError::InvalidParameter {
                id: TOKEN_INCREMENT.to_string(),
                value: params.token_increment.to_string(),
            });
        }
        Ok(params)
    }

    pub fn get(&self, id: &str) -> Option<i128> {
        self.values.get(id).copied()
    }

    /// Every key in the snapshot, defaults included.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i128)> {
        self.values.iter().map(|(id, value)| (id.as_str(), *value))
    }

    /// A rate-limit row by full name, if present and within `i64`.
    pub fn rate_override(&self, id: &str) -> Option<i64> {
        self.get(id).and_then(|value| i64::try_from(value).ok())
    }

    /// The cursor has moved past the end of the key space.
    pub fn is_exhausted(&self) -> bool {
        self.last_end_token > self.end_token
    }

    pub fn next_interval(&self) -> Interval {
        let start = self.last_end_token;
        let end = start + self.token_increment;
        Interval {
            start,
            end,
            job_end: end.min(self.end_token),
        }
    }

    /// Intervals the loop will still run before reaching DONE.
    pub fn remaining_intervals(&self) -> u64 {
        if self.is_exhausted() {
            return 0;
        }
        let left = (self.end_token - self.last_end_token) / self.token_increment + 1;
        u64::try_from(left).unwrap_or(u64::MAX)
    }
}

/// Reads and advances the parameter table through one open session.
pub struct ParameterStore<'a> {
    session: &'a dyn StoreSession,
}

impl<'a> ParameterStore<'a> {
    pub fn new(session: &'a dyn StoreSession) -> Self {
        Self { session }
    }

    pub async fn load(&self) -> CdmResult<MigrationParams> {
        let rows = self.session.fetch_parameters().await?;
        debug!("Loaded {} parameter rows", rows.len());
        MigrationParams::from_rows(rows)
    }

    /// Move the cursor from `current` to `value` with a single conditional update.
    ///
    /// The stored row is compared by value, so `"007"` or `"0\n"` still count as
    /// the cursor at 7 or 0. The update itself is conditioned on the exact text
    /// read, and zero affected rows means someone else moved the cursor in
    /// between; either way the caller must stop rather than guess.
    pub async fn set_last_end_token(&self, current: i128, value: i128) -> CdmResult<()> {
        if value < current {
            return Err(CdmError::write_failed(
                PARAMETERS_TABLE,
                format!("refusing to move {} backwards from {} to {}", LAST_END_TOKEN, current, value),
            ));
        }
        let moved = || {
            CdmError::write_failed(
                PARAMETERS_TABLE,
                format!("{} was not {} (row missing or moved concurrently)", LAST_END_TOKEN, current),
            )
        };
        let stored = self
            .session
            .fetch_parameters()
            .await?
            .into_iter()
            .find_map(|(id, raw)| (id == LAST_END_TOKEN).then_some(raw))
            .ok_or_else(moved)?;
        if parse_token(LAST_END_TOKEN, &stored)? != current {
            return Err(moved());
        }
        let changed = self
            .session
            .compare_and_set_parameter(LAST_END_TOKEN, &stored, &value.to_string())
            .await?;
        if changed == 0 {
            return Err(moved());
        }
        info!("Cursor advanced: {} -> {}", current, value);
        Ok(())
    }

    /// Insert any missing base parameter with its default. Returns the ids written.
    pub async fn seed_defaults(&self) -> CdmResult<Vec<String>> {
        let mut seeded = Vec::new();
        for (id, value) in DEFAULTS {
            if self.session.seed_parameter(id, &value.to_string()).await? {
                seeded.push(id.to_string());
            }
        }
        Ok(seeded)
    }
}
