//! Post-attempt bookkeeping: failure counters and the next planned run.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use fitdash_core::{Frequency, Task, TaskReconciliation};

/// Extraction tasks whose data still ends before today retry this many hours later.
pub const CATCH_UP_RETRY_HOURS: i64 = 2;

/// Linear backoff: each consecutive failure pushes the next attempt one unit further out.
pub fn on_failure(
    task: &Task,
    now: DateTime<Utc>,
    message: &str,
    backoff_unit: Duration,
) -> TaskReconciliation {
    let failures = task.consecutive_failures.saturating_add(1);
    TaskReconciliation {
        consecutive_failures: failures,
        next_planned_execution_utc: now + backoff_unit * failures.min(10_000) as i32,
        last_executed_utc: now,
        last_succeeded_utc: None,
        last_failed_utc: Some(now),
        last_failure_message: Some(message.to_string()),
    }
}

pub fn on_success(
    task: &Task,
    now: DateTime<Utc>,
    reference_tz: Tz,
    value_recency: Option<DateTime<Utc>>,
) -> TaskReconciliation {
    let mut next = next_scheduled(task, now, reference_tz);

    let today = now.with_timezone(&reference_tz).date_naive();
    let behind = value_recency.is_some_and(|r| r.with_timezone(&reference_tz).date_naive() < today);
    if task.runs_extraction() && behind {
        next = now + Duration::hours(CATCH_UP_RETRY_HOURS);
    }

    TaskReconciliation {
        consecutive_failures: 0,
        next_planned_execution_utc: next,
        last_executed_utc: now,
        last_succeeded_utc: Some(now),
        last_failed_utc: None,
        last_failure_message: None,
    }
}

/// Regular cadence, ignoring how fresh the data is.
pub fn next_scheduled(task: &Task, now: DateTime<Utc>, reference_tz: Tz) -> DateTime<Utc> {
    let fallback = now + Duration::hours(24);
    match task.frequency {
        Frequency::Hourly => now + Duration::hours(i64::from(task.interval_hours.max(1))),
        other => match other.offset_days() {
            Some(days) => {
                let today = now.with_timezone(&reference_tz).date_naive();
                (today + Duration::days(days))
                    .and_hms_opt(task.start_hour.min(23), 0, 0)
                    .and_then(|local| resolve_local(reference_tz, local))
                    .unwrap_or(fallback)
            }
            None => fallback,
        },
    }
}

/// Ambiguous times take the earlier instant; times inside a DST gap move forward an hour.
fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(local + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        // 14:30 in New York.
        Utc.with_ymd_and_hms(2026, 6, 10, 18, 30, 0).single().unwrap()
    }

    fn task(frequency: Frequency) -> Task {
        let mut task = Task::new(7, "Sleep score");
        task.frequency = frequency;
        task.start_hour = 6;
        task
    }

    #[test]
    fn failures_back_off_further_each_time() {
        let mut t = task(Frequency::Daily);
        let unit = Duration::minutes(60);
        let mut previous = now();
        for expected in 1..=4u32 {
            let update = on_failure(&t, now(), "timeout", unit);
            assert_eq!(update.consecutive_failures, expected);
            assert!(update.next_planned_execution_utc > previous);
            assert_eq!(update.last_failure_message.as_deref(), Some("timeout"));
            assert_eq!(update.last_succeeded_utc, None);
            previous = update.next_planned_execution_utc;
            t.consecutive_failures = update.consecutive_failures;
        }
        assert_eq!(previous, now() + Duration::hours(4));
    }

    #[test]
    fn success_resets_failures() {
        let mut t = task(Frequency::Hourly);
        t.consecutive_failures = 3;
        let update = on_success(&t, now(), chrono_tz::America::New_York, None);
        assert_eq!(update.consecutive_failures, 0);
        assert_eq!(update.last_succeeded_utc, Some(now()));
        assert_eq!(update.next_planned_execution_utc, now() + Duration::hours(1));
    }

    #[test]
    fn daily_next_run_is_tomorrow_at_start_hour() {
        let tz = chrono_tz::America::New_York;
        let update = on_success(&task(Frequency::Daily), now(), tz, None);
        // 06:00 EDT == 10:00 UTC.
        assert_eq!(
            update.next_planned_execution_utc,
            Utc.with_ymd_and_hms(2026, 6, 11, 10, 0, 0).single().unwrap()
        );

        let weekly = on_success(&task(Frequency::Weekly), now(), tz, None);
        assert_eq!(
            weekly.next_planned_execution_utc,
            Utc.with_ymd_and_hms(2026, 6, 17, 10, 0, 0).single().unwrap()
        );
    }

    #[test]
    fn stale_extraction_retries_soon() {
        let tz = chrono_tz::America::New_York;
        let mut t = task(Frequency::Daily);
        t.stages.extract = true;
        t.api_service_name = Some("Garmin".into());

        let stale = Some(now() - Duration::days(2));
        let update = on_success(&t, now(), tz, stale);
        assert_eq!(update.next_planned_execution_utc, now() + Duration::hours(CATCH_UP_RETRY_HOURS));

        let fresh = Some(now() - Duration::hours(1));
        let update = on_success(&t, now(), tz, fresh);
        assert!(update.next_planned_execution_utc > now() + Duration::hours(CATCH_UP_RETRY_HOURS));
    }

    #[test]
    fn unknown_frequency_and_dst_gap_still_schedule() {
        let tz = chrono_tz::America::New_York;
        let update = on_success(&task(Frequency::Unknown), now(), tz, None);
        assert_eq!(update.next_planned_execution_utc, now() + Duration::hours(24));

        // 02:00 on 2026-03-08 does not exist in New York.
        let mut t = task(Frequency::Daily);
        t.start_hour = 2;
        let before_gap = Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).single().unwrap();
        let next = next_scheduled(&t, before_gap, tz);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 8, 7, 0, 0).single().unwrap());
    }
}
