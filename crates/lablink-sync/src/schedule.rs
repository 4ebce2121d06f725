//! # Sync Scheduling
//!
//! Helpers for the cron sync mode. Expressions are the standard 5-field
//! form; the seconds field the `cron` crate expects is prefixed
//! internally.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

/// Parses a 5-field cron expression.
pub fn parse_cron(expr: &str) -> Option<Schedule> {
    Schedule::from_str(&format!("0 {}", expr.trim())).ok()
}

/// Time to sleep until the next cron occurrence after `now`.
pub fn next_cron_wait(schedule: &Schedule, now: DateTime<Utc>) -> Option<Duration> {
    let next = schedule.after(&now).next()?;
    (next - now).to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn hourly_schedule_waits_to_the_top_of_the_hour() {
        let schedule = parse_cron("0 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).unwrap();
        let wait = next_cron_wait(&schedule, now).unwrap();
        assert_eq!(wait, Duration::from_secs(30 * 60));
    }

    #[test]
    fn five_field_form_is_accepted() {
        assert!(parse_cron("*/15 * * * *").is_some());
        assert!(parse_cron("0 2 * * 1-5").is_some());
        assert!(parse_cron("nonsense").is_none());
    }
}
