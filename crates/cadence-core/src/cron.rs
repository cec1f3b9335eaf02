// Cron evaluation
//
// Wraps the cron crate with an IANA timezone so fire times follow the
// schedule's wall clock (DST-correct). The config surface accepts the
// classic 5-field crontab; a 6-field string carries leading seconds.

use std::str::FromStr;

use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// One cron schedule as written in a workflow's `on` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronSchedule {
    /// Crontab string, 5 fields (minute-granularity) or 6 with seconds
    pub cronjob: String,
    /// IANA timezone name; falls back to the configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl CronSchedule {
    pub fn new(cronjob: impl Into<String>) -> Self {
        Self { cronjob: cronjob.into(), timezone: None }
    }

    /// Compile into an evaluator, resolving the timezone.
    pub fn evaluator(&self, default_tz: &str) -> Result<CronEvaluator> {
        let tz_name = self.timezone.as_deref().unwrap_or(default_tz);
        let tz: Tz = tz_name
            .parse()
            .map_err(|_| CoreError::schedule(format!("unknown timezone {tz_name:?}")))?;

        let fields = self.cronjob.split_whitespace().count();
        let normalized = match fields {
            5 => format!("0 {}", self.cronjob.trim()),
            6 => self.cronjob.trim().to_string(),
            n => {
                return Err(CoreError::schedule(format!(
                    "cron {:?} has {n} fields, expected 5 or 6",
                    self.cronjob
                )))
            }
        };
        let schedule = Schedule::from_str(&normalized).map_err(|e| {
            CoreError::schedule(format!("cron {:?} does not parse: {e}", self.cronjob))
        })?;
        Ok(CronEvaluator { schedule, tz })
    }
}

/// A compiled cron schedule bound to a timezone.
#[derive(Debug, Clone)]
pub struct CronEvaluator {
    schedule: Schedule,
    tz: Tz,
}

/// Truncate to the minute boundary; releases operate at minute granularity.
pub fn truncate_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .expect("truncation stays in range")
}

impl CronEvaluator {
    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Next fire time strictly after `t`, as a UTC instant.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = t.with_timezone(&self.tz);
        self.schedule
            .after(&local)
            .next()
            .map(|fire| fire.with_timezone(&Utc))
    }

    /// Previous fire time strictly before `t`.
    ///
    /// The cron crate only iterates forward, so this is a minute-granularity
    /// backward scan bounded at 366 days.
    pub fn prev_before(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut cursor = truncate_minute(t);
        let floor = cursor - Duration::days(366);
        loop {
            cursor -= Duration::minutes(1);
            if cursor < floor {
                return None;
            }
            if self.includes_minute(cursor) {
                return Some(cursor);
            }
        }
    }

    /// Whether the minute containing `t` is a fire time.
    pub fn includes_minute(&self, t: DateTime<Utc>) -> bool {
        let local = truncate_minute(t).with_timezone(&self.tz);
        self.schedule.includes(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn five_field_crontab_parses() {
        let eval = CronSchedule::new("*/5 * * * *").evaluator("UTC").unwrap();
        let next = eval.next_after(utc(2024, 1, 1, 0, 1)).unwrap();
        assert_eq!(next, utc(2024, 1, 1, 0, 5));
    }

    #[test]
    fn six_field_carries_seconds() {
        let eval = CronSchedule::new("30 0 * * * *").evaluator("UTC").unwrap();
        let next = eval.next_after(utc(2024, 1, 1, 0, 0)).unwrap();
        assert_eq!(next.second(), 30);
    }

    #[test]
    fn bad_field_count_and_bad_tz_fail() {
        assert!(CronSchedule::new("* * *").evaluator("UTC").is_err());
        assert!(CronSchedule::new("* * * * *").evaluator("Mars/Olympus").is_err());
    }

    #[test]
    fn next_respects_timezone_wall_clock() {
        // 09:00 every day in New York. On the 2024-03-10 DST transition the
        // wall clock jumps, so consecutive fires are 23h apart in UTC.
        let sched = CronSchedule {
            cronjob: "0 9 * * *".to_string(),
            timezone: Some("America/New_York".to_string()),
        };
        let eval = sched.evaluator("UTC").unwrap();
        let before = utc(2024, 3, 9, 0, 0);
        let first = eval.next_after(before).unwrap();
        let second = eval.next_after(first).unwrap();
        assert_eq!(first, utc(2024, 3, 9, 14, 0)); // EST, UTC-5
        assert_eq!(second, utc(2024, 3, 10, 13, 0)); // EDT, UTC-4
        assert_eq!((second - first).num_hours(), 23);
    }

    #[test]
    fn prev_before_scans_backward() {
        let eval = CronSchedule::new("0 12 * * *").evaluator("UTC").unwrap();
        let prev = eval.prev_before(utc(2024, 1, 2, 3, 0)).unwrap();
        assert_eq!(prev, utc(2024, 1, 1, 12, 0));
        // From just past a fire time, the fire minute itself is returned
        let prev = eval.prev_before(utc(2024, 1, 2, 12, 1)).unwrap();
        assert_eq!(prev, utc(2024, 1, 2, 12, 0));
    }

    #[test]
    fn includes_minute_truncates() {
        let eval = CronSchedule::new("30 8 * * *").evaluator("UTC").unwrap();
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 45).unwrap();
        assert!(eval.includes_minute(t));
        assert!(!eval.includes_minute(utc(2024, 6, 1, 8, 31)));
    }
}
