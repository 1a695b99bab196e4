//! Scheduling gate: decides whether a task is due in the current run.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use fitdash_core::{Frequency, ServiceRateLimit, Task};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    CircuitOpen { failures: u32 },
    Inactive,
    RateLimited { until: Option<DateTime<Utc>> },
    OutsideWindow { hour: u32 },
    BeforeStartHour { hour: u32 },
    NotDue { next: Option<DateTime<Utc>> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunReason {
    CatchUp,
    Scheduled,
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum GateDecision {
    Run(RunReason),
    Skip(SkipReason),
}

impl GateDecision {
    pub fn should_run(&self) -> bool {
        matches!(self, GateDecision::Run(_))
    }
}

/// Inputs the gate needs beyond the task row itself.
#[derive(Debug, Clone, Copy)]
pub struct GateContext<'a> {
    pub now: DateTime<Utc>,
    pub reference_tz: Tz,
    pub max_failures: u32,
    pub rate_limit: Option<&'a ServiceRateLimit>,
    pub value_recency: Option<DateTime<Utc>>,
}

/// Data is behind when it is older than one schedule period.
pub fn requires_catch_up(task: &Task, value_recency: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match (value_recency, task.frequency.period(task.interval_hours)) {
        (Some(recency), Some(period)) => now - recency > period,
        _ => false,
    }
}

fn within_window(hour: u32, start: u32, end: u32) -> bool {
    if start <= end {
        (start..=end).contains(&hour)
    } else {
        hour >= start || hour <= end
    }
}

/// First matching rule decides.
pub fn evaluate(task: &Task, ctx: &GateContext<'_>) -> GateDecision {
    if task.consecutive_failures >= ctx.max_failures {
        return GateDecision::Skip(SkipReason::CircuitOpen {
            failures: task.consecutive_failures,
        });
    }
    if task.frequency == Frequency::Inactive {
        return GateDecision::Skip(SkipReason::Inactive);
    }
    if let Some(limit) = ctx.rate_limit.filter(|l| l.is_active(ctx.now)) {
        return GateDecision::Skip(SkipReason::RateLimited {
            until: limit.cleared_utc,
        });
    }
    if requires_catch_up(task, ctx.value_recency, ctx.now) {
        return GateDecision::Run(RunReason::CatchUp);
    }

    let hour = ctx.now.with_timezone(&ctx.reference_tz).hour();
    if task.frequency == Frequency::Hourly {
        if !within_window(hour, task.start_hour, task.end_hour) {
            return GateDecision::Skip(SkipReason::OutsideWindow { hour });
        }
    } else if hour < task.start_hour {
        return GateDecision::Skip(SkipReason::BeforeStartHour { hour });
    }

    match task.next_planned_execution_utc {
        Some(next) if ctx.now < next => GateDecision::Skip(SkipReason::NotDue { next: Some(next) }),
        _ => GateDecision::Run(RunReason::Scheduled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    // 14:00 in New York.
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 10, 18, 0, 0).single().unwrap()
    }

    fn ctx<'a>(rate_limit: Option<&'a ServiceRateLimit>, recency: Option<DateTime<Utc>>) -> GateContext<'a> {
        GateContext {
            now: now(),
            reference_tz: chrono_tz::America::New_York,
            max_failures: 5,
            rate_limit,
            value_recency: recency,
        }
    }

    fn task(frequency: Frequency) -> Task {
        let mut task = Task::new(1, "Daily sleep");
        task.frequency = frequency;
        task.start_hour = 6;
        task.end_hour = 20;
        task.api_service_name = Some("Garmin".into());
        task.next_planned_execution_utc = Some(now() - Duration::minutes(1));
        task
    }

    #[test]
    fn failing_tasks_are_quarantined_regardless_of_other_fields() {
        for frequency in [Frequency::Hourly, Frequency::Daily, Frequency::Weekly, Frequency::Unknown] {
            let mut t = task(frequency);
            t.consecutive_failures = 5;
            let stale = Some(now() - Duration::days(30));
            assert_eq!(
                evaluate(&t, &ctx(None, stale)),
                GateDecision::Skip(SkipReason::CircuitOpen { failures: 5 })
            );
            t.consecutive_failures = 9;
            assert!(!evaluate(&t, &ctx(None, None)).should_run());
        }
    }

    #[test]
    fn inactive_tasks_never_run() {
        let mut t = task(Frequency::Inactive);
        t.next_planned_execution_utc = None;
        let stale = Some(now() - Duration::days(300));
        assert_eq!(evaluate(&t, &ctx(None, stale)), GateDecision::Skip(SkipReason::Inactive));
    }

    #[test]
    fn active_rate_limit_skips_but_expired_one_does_not() {
        let t = task(Frequency::Daily);
        let active = ServiceRateLimit {
            service: "Garmin".into(),
            detected_utc: Some(now() - Duration::minutes(1)),
            cleared_utc: Some(now() + Duration::minutes(2)),
        };
        assert!(matches!(
            evaluate(&t, &ctx(Some(&active), None)),
            GateDecision::Skip(SkipReason::RateLimited { .. })
        ));
        let expired = ServiceRateLimit {
            cleared_utc: Some(now() - Duration::seconds(1)),
            ..active
        };
        assert!(evaluate(&t, &ctx(Some(&expired), None)).should_run());
    }

    #[test]
    fn catch_up_overrides_future_schedule_and_window() {
        let mut t = task(Frequency::Hourly);
        t.start_hour = 1;
        t.end_hour = 2;
        t.next_planned_execution_utc = Some(now() + Duration::hours(5));
        let stale = Some(now() - Duration::hours(3));
        assert_eq!(evaluate(&t, &ctx(None, stale)), GateDecision::Run(RunReason::CatchUp));

        let fresh = Some(now() - Duration::minutes(10));
        assert_eq!(
            evaluate(&t, &ctx(None, fresh)),
            GateDecision::Skip(SkipReason::OutsideWindow { hour: 14 })
        );
    }

    #[test]
    fn hourly_needs_window_and_due_time() {
        let mut t = task(Frequency::Hourly);
        assert_eq!(evaluate(&t, &ctx(None, None)), GateDecision::Run(RunReason::Scheduled));
        t.next_planned_execution_utc = Some(now() + Duration::minutes(10));
        assert!(matches!(
            evaluate(&t, &ctx(None, None)),
            GateDecision::Skip(SkipReason::NotDue { .. })
        ));
        t.next_planned_execution_utc = None;
        t.start_hour = 22;
        t.end_hour = 3;
        assert!(!evaluate(&t, &ctx(None, None)).should_run());
        t.end_hour = 15;
        assert!(evaluate(&t, &ctx(None, None)).should_run());
    }

    #[test]
    fn daily_waits_for_start_hour_in_reference_timezone() {
        let mut t = task(Frequency::Daily);
        t.start_hour = 15;
        assert_eq!(
            evaluate(&t, &ctx(None, None)),
            GateDecision::Skip(SkipReason::BeforeStartHour { hour: 14 })
        );
        t.start_hour = 14;
        assert!(evaluate(&t, &ctx(None, None)).should_run());
    }

    #[test]
    fn daily_task_with_yesterdays_data_runs_after_start_hour() {
        let t = task(Frequency::Daily);
        let yesterday = Some(now() - Duration::days(1) - Duration::hours(2));
        assert!(evaluate(&t, &ctx(None, yesterday)).should_run());
    }

    #[test]
    fn catch_up_needs_known_recency() {
        let t = task(Frequency::Weekly);
        assert!(!requires_catch_up(&t, None, now()));
        assert!(!requires_catch_up(&t, Some(now() - Duration::days(6)), now()));
        assert!(requires_catch_up(&t, Some(now() - Duration::days(8)), now()));
    }
}
