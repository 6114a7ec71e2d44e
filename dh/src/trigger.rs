//! Cron schedule and timezone helpers
//!
//! The accepted dialect is standard 5-field cron (minute, hour,
//! day-of-month, month, day-of-week) with an optional leading seconds
//! field. Schedules evaluate in the task's declared timezone (default
//! UTC). Invalid expressions are rejected at task create/update.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::SyncError;

/// Normalize to the 6-field (seconds-first) form the schedule parser wants
fn normalize(expr: &str) -> Result<String, SyncError> {
    let trimmed = expr.trim();
    match trimmed.split_whitespace().count() {
        5 => Ok(format!("0 {trimmed}")),
        6 => Ok(trimmed.to_string()),
        n => Err(SyncError::Config(format!(
            "cron expression '{trimmed}' has {n} fields, expected 5 (or 6 with seconds)"
        ))),
    }
}

fn parse_schedule(expr: &str) -> Result<Schedule, SyncError> {
    let normalized = normalize(expr)?;
    Schedule::from_str(&normalized)
        .map_err(|e| SyncError::Config(format!("invalid cron expression '{expr}': {e}")))
}

/// Reject invalid cron expressions
pub fn validate_cron(expr: &str) -> Result<(), SyncError> {
    parse_schedule(expr).map(|_| ())
}

/// Parse an IANA timezone name
pub fn parse_tz(tz: &str) -> Result<Tz, SyncError> {
    tz.parse::<Tz>()
        .map_err(|_| SyncError::Config(format!("unknown timezone '{tz}'")))
}

/// The next fire time strictly after `after`, in the given timezone
pub fn next_cron_after(expr: &str, tz: Tz, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, SyncError> {
    let schedule = parse_schedule(expr)?;
    let local = after.with_timezone(&tz);
    Ok(schedule.after(&local).next().map(|dt| dt.with_timezone(&Utc)))
}

/// The next `n` fire times after `after`, for operator inspection
pub fn upcoming(expr: &str, tz: Tz, after: DateTime<Utc>, n: usize) -> Result<Vec<DateTime<Utc>>, SyncError> {
    let schedule = parse_schedule(expr)?;
    let local = after.with_timezone(&tz);
    Ok(schedule.after(&local).take(n).map(|dt| dt.with_timezone(&Utc)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_five_field_accepted() {
        assert!(validate_cron("*/5 * * * *").is_ok());
        assert!(validate_cron("0 9 * * 1-5").is_ok());
    }

    #[test]
    fn test_six_field_accepted() {
        assert!(validate_cron("30 */5 * * * *").is_ok());
    }

    #[test]
    fn test_bad_expressions_rejected() {
        assert!(validate_cron("").is_err());
        assert!(validate_cron("* * *").is_err());
        assert!(validate_cron("99 * * * *").is_err());
        assert!(validate_cron("* * * * * * * *").is_err());
    }

    #[test]
    fn test_parse_tz() {
        assert!(parse_tz("UTC").is_ok());
        assert!(parse_tz("America/New_York").is_ok());
        assert!(parse_tz("Mars/Olympus").is_err());
    }

    #[test]
    fn test_next_after_five_minute_cadence() {
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 12, 1, 0).unwrap();
        let next = next_cron_after("*/5 * * * *", chrono_tz::UTC, after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 12, 5, 0).unwrap());
    }

    #[test]
    fn test_next_respects_timezone() {
        // 09:00 New York is 13:00 or 14:00 UTC depending on DST; in June it's DST (UTC-4)
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let tz = parse_tz("America/New_York").unwrap();
        let next = next_cron_after("0 9 * * *", tz, after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 13, 0, 0).unwrap());
    }

    #[test]
    fn test_successive_fire_times_monotonic() {
        // next(next(t)) must sit at least one cadence beyond next(t)
        for expr in ["*/5 * * * *", "0 * * * *", "15 3 * * *"] {
            let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 1).unwrap();
            let t1 = next_cron_after(expr, chrono_tz::UTC, t0).unwrap().unwrap();
            let t2 = next_cron_after(expr, chrono_tz::UTC, t1).unwrap().unwrap();
            assert!(t2 > t1, "{expr}: {t2} should be after {t1}");
        }
    }

    #[test]
    fn test_upcoming_count() {
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let times = upcoming("0 * * * *", chrono_tz::UTC, after, 3).unwrap();
        assert_eq!(times.len(), 3);
        assert!(times[0] < times[1] && times[1] < times[2]);
    }
}
