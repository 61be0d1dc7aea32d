use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronExpr;

use crate::types::Schedule;

/// Pure `(schedule, now) -> next_fire_time?` (§4.8). Never returns a time
/// `<= from`; returns `None` once a schedule is exhausted (a past `AtOnce`,
/// or a `Cron` expression with no future occurrence).
pub fn compute_next_run(schedule: &Schedule, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::AtOnce { at } => (*at > from).then_some(*at),

        Schedule::Every { interval_secs, anchor } => {
            if *interval_secs == 0 {
                return None;
            }
            if *anchor > from {
                return Some(*anchor);
            }
            let elapsed = (from - *anchor).num_seconds().max(0);
            let periods = elapsed / (*interval_secs as i64) + 1;
            Some(*anchor + Duration::seconds(periods * (*interval_secs as i64)))
        }

        Schedule::Cron { expr } => {
            let parsed = CronExpr::from_str(&normalize(expr)).ok()?;
            parsed.after(&from).next()
        }
    }
}

/// The `cron` crate requires a leading seconds field; a bare 5-field
/// expression gets `0` prefixed so plain crontab syntax still works.
fn normalize(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn at_once_fires_only_while_future() {
        let now = t(2026, 1, 1, 0, 0, 0);
        let sched = Schedule::AtOnce { at: t(2026, 1, 1, 1, 0, 0) };
        assert_eq!(compute_next_run(&sched, now), Some(t(2026, 1, 1, 1, 0, 0)));

        let past = Schedule::AtOnce { at: t(2025, 1, 1, 0, 0, 0) };
        assert_eq!(compute_next_run(&past, now), None);
    }

    #[test]
    fn every_advances_past_missed_periods() {
        let anchor = t(2026, 1, 1, 0, 0, 0);
        let sched = Schedule::Every { interval_secs: 60, anchor };
        let now = t(2026, 1, 1, 0, 2, 30);
        assert_eq!(compute_next_run(&sched, now), Some(t(2026, 1, 1, 0, 3, 0)));
    }

    #[test]
    fn every_before_anchor_fires_at_anchor() {
        let anchor = t(2026, 1, 1, 0, 0, 0);
        let sched = Schedule::Every { interval_secs: 3600, anchor };
        let now = t(2025, 12, 31, 23, 0, 0);
        assert_eq!(compute_next_run(&sched, now), Some(anchor));
    }

    #[test]
    fn cron_five_field_gets_seconds_prefixed() {
        let sched = Schedule::Cron { expr: "0 9 * * MON-FRI".to_string() };
        let now = t(2026, 8, 3, 0, 0, 0); // Monday
        let next = compute_next_run(&sched, now).unwrap();
        assert_eq!(next, t(2026, 8, 3, 9, 0, 0));
    }

    #[test]
    fn cron_never_returns_a_time_not_after_from() {
        let sched = Schedule::Cron { expr: "* * * * *".to_string() };
        let now = t(2026, 1, 1, 12, 0, 30);
        let next = compute_next_run(&sched, now).unwrap();
        assert!(next > now);
    }
}
