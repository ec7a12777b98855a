//! Hour-of-day read throttling.

use chrono::{DateTime, TimeZone, Timelike};
use chrono_tz::Tz;
use log::debug;

use crate::params::MigrationParams;

pub const DEFAULT_TIMEZONE: &str = "America/Sao_Paulo";
pub const DEFAULT_READ_RATE: i64 = 40000;
pub const READ_RATE_OVERRIDE_PREFIX: &str = "read_rate_limit_";

/// Picks the read-rate limit for the current hour in a fixed time zone.
///
/// Operators throttle peak hours by adding `read_rate_limit_HH00` rows to the
/// parameter table; hours without a row use the fallback rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateScheduler {
    timezone: Tz,
    fallback: i64,
}

impl Default for RateScheduler {
    fn default() -> Self {
        Self::new(chrono_tz::America::Sao_Paulo, DEFAULT_READ_RATE)
    }
}

impl RateScheduler {
    pub fn new(timezone: Tz, fallback: i64) -> Self {
        Self { timezone, fallback }
    }

    /// `HH00` for the hour `now` falls in, in the scheduler's zone.
    pub fn hour_key<Z: TimeZone>(&self, now: &DateTime<Z>) -> String {
        let local = now.with_timezone(&self.timezone);
        format!("{:02}00", local.hour())
    }

    pub fn effective_read_rate<Z: TimeZone>(&self, now: &DateTime<Z>, params: &MigrationParams) -> i64 {
        let hour_key = self.hour_key(now);
        let name = format!("{}{}", READ_RATE_OVERRIDE_PREFIX, hour_key);
        let rate = params.rate_override(&name).unwrap_or(self.fallback);
        debug!("Round hour {} - read rate limit {}", hour_key, rate);
        rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn params_with(rows: &[(&str, i128)]) -> MigrationParams {
        MigrationParams::from_rows(rows.iter().map(|(k, v)| (k.to_string(), v.to_string()))).unwrap()
    }

    #[test]
    fn test_override_for_current_hour() {
        let scheduler = RateScheduler::default();
        let params = params_with(&[("read_rate_limit_1400", 75000)]);
        // 17:30 UTC is 14:30 in Sao Paulo (UTC-3, no DST since 2019).
        let now = Utc.with_ymd_and_hms(2024, 7, 10, 17, 30, 0).unwrap();
        assert_eq!(scheduler.hour_key(&now), "1400");
        assert_eq!(scheduler.effective_read_rate(&now, &params), 75000);
    }

    #[test]
    fn test_fallback_when_no_override() {
        let scheduler = RateScheduler::default();
        let params = params_with(&[("read_rate_limit_1400", 75000)]);
        let now = Utc.with_ymd_and_hms(2024, 7, 10, 3, 5, 0).unwrap();
        assert_eq!(scheduler.hour_key(&now), "0000");
        assert_eq!(scheduler.effective_read_rate(&now, &params), 40000);
    }

    #[test]
    fn test_custom_zone_and_fallback() {
        let scheduler = RateScheduler::new(chrono_tz::UTC, 12000);
        let params = params_with(&[("read_rate_limit_0900", 5000)]);
        let nine = Utc.with_ymd_and_hms(2024, 1, 2, 9, 59, 59).unwrap();
        let ten = Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap();
        assert_eq!(scheduler.effective_read_rate(&nine, &params), 5000);
        assert_eq!(scheduler.effective_read_rate(&ten, &params), 12000);
    }
}
