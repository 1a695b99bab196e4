//! Gap-filling interpolation of irregular series onto a regular bucket grid.
//!
//! Each pass materialises a one-second grid over a bounded window, seeds it
//! with known (and optionally inferred) values, linearly interpolates the
//! rest between the nearest anchors, then writes bucket means. Windows are
//! repeated until the latest source observation is covered.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fitdash_core::{non_placeholder, Task};
use fitdash_storage::{InterpolationSpec, PgStore, SeriesPoint, StorageError};
use tracing::{debug, info, warn};

use crate::config::InterpolationConfig;

const SECONDS_PER_DAY: i64 = 86_400;

/// Read/write access to one series and its interpolated destination.
#[async_trait]
pub trait SeriesSource: Send + Sync {
    async fn bounds(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StorageError>;
    async fn interpolated_max(&self) -> Result<Option<DateTime<Utc>>, StorageError>;
    async fn latest_before(&self, upper: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, StorageError>;
    async fn points(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SeriesPoint>, StorageError>;
    async fn anchor_before(&self, at: DateTime<Utc>) -> Result<Option<SeriesPoint>, StorageError>;
    async fn anchor_after(&self, at: DateTime<Utc>) -> Result<Option<SeriesPoint>, StorageError>;
    async fn time_of_day_means(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<(u32, f64)>, StorageError>;
    async fn write_buckets(&self, buckets: &[SeriesPoint]) -> Result<u64, StorageError>;
}

pub struct PgSeries<'a> {
    pub store: &'a PgStore,
    pub spec: &'a InterpolationSpec,
}

#[async_trait]
impl SeriesSource for PgSeries<'_> {
    async fn bounds(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StorageError> {
        self.store.source_bounds(self.spec).await
    }

    async fn interpolated_max(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.store.interpolated_max(self.spec).await
    }

    async fn latest_before(&self, upper: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.store.latest_source_before(self.spec, upper).await
    }

    async fn points(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SeriesPoint>, StorageError> {
        self.store.series_points(self.spec, start, end).await
    }

    async fn anchor_before(&self, at: DateTime<Utc>) -> Result<Option<SeriesPoint>, StorageError> {
        self.store.anchor_before(self.spec, at).await
    }

    async fn anchor_after(&self, at: DateTime<Utc>) -> Result<Option<SeriesPoint>, StorageError> {
        self.store.anchor_after(self.spec, at).await
    }

    async fn time_of_day_means(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<(u32, f64)>, StorageError> {
        self.store.time_of_day_means(self.spec, since).await
    }

    async fn write_buckets(&self, buckets: &[SeriesPoint]) -> Result<u64, StorageError> {
        self.store.upsert_interpolated(self.spec, buckets).await
    }
}

/// Same-time-of-day averages, most specific tier first (30 days, 90 days, all time).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeOfDayProfile {
    tiers: Vec<HashMap<u32, f64>>,
}

impl TimeOfDayProfile {
    pub fn from_tiers(tiers: Vec<Vec<(u32, f64)>>) -> Self {
        Self {
            tiers: tiers.into_iter().map(|t| t.into_iter().collect()).collect(),
        }
    }

    pub fn value_at(&self, minute_of_day: u32) -> Option<f64> {
        self.tiers
            .iter()
            .find_map(|tier| tier.get(&minute_of_day).copied())
    }

    pub async fn load(source: &dyn SeriesSource, now: DateTime<Utc>) -> Result<Self, StorageError> {
        let mut tiers = Vec::with_capacity(3);
        for since in [Some(now - Duration::days(30)), Some(now - Duration::days(90)), None] {
            tiers.push(source.time_of_day_means(since).await?);
        }
        Ok(Self::from_tiers(tiers))
    }
}

pub fn floor_to_bucket(ts: DateTime<Utc>, bucket: Duration) -> DateTime<Utc> {
    let width = bucket.num_seconds().max(1);
    let secs = ts.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(width), 0).unwrap_or(ts)
}

/// Resume a little before what is already written, or from the first observation.
pub fn plan_window_start(
    interpolated_max: Option<DateTime<Utc>>,
    source_min: DateTime<Utc>,
    cfg: &InterpolationConfig,
) -> DateTime<Utc> {
    let raw = interpolated_max
        .map(|max| max - cfg.lookback)
        .unwrap_or(source_min)
        .max(source_min);
    floor_to_bucket(raw, cfg.bucket)
}

/// The latest observation within the lookahead that moves past `previous_end`,
/// widening the lookahead until one is found or the series end is reached.
pub async fn plan_window_end(
    source: &dyn SeriesSource,
    start: DateTime<Utc>,
    previous_end: Option<DateTime<Utc>>,
    true_max: DateTime<Utc>,
    cfg: &InterpolationConfig,
) -> Result<DateTime<Utc>, StorageError> {
    let progress_floor = previous_end.map_or(start, |p| p.max(start));
    let mut lookahead = cfg.lookahead;
    let candidate = loop {
        let horizon = start + lookahead;
        if horizon >= true_max {
            break true_max;
        }
        match source.latest_before(horizon).await? {
            Some(found) if found > progress_floor => break found,
            _ => lookahead = lookahead + cfg.lookahead,
        }
    };
    Ok(candidate.min(start + cfg.max_window))
}

/// One value per second over `[start, end]`. `before`/`after` are the nearest
/// known points outside the window.
pub fn fill_grid(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    points: &[SeriesPoint],
    before: Option<SeriesPoint>,
    after: Option<SeriesPoint>,
    profile: Option<&TimeOfDayProfile>,
) -> Vec<Option<f64>> {
    let start_s = start.timestamp();
    let end_s = end.timestamp();
    if end_s < start_s {
        return Vec::new();
    }
    let len = (end_s - start_s + 1) as usize;

    let mut grid: Vec<Option<f64>> = vec![None; len];
    for point in points {
        let offset = point.ts.timestamp() - start_s;
        if (0..len as i64).contains(&offset) && point.value.is_finite() {
            grid[offset as usize] = Some(point.value);
        }
    }

    if let Some(profile) = profile {
        for (i, slot) in grid.iter_mut().enumerate().filter(|(_, v)| v.is_none()) {
            let minute = ((start_s + i as i64).rem_euclid(SECONDS_PER_DAY) / 60) as u32;
            *slot = profile.value_at(minute);
        }
    }

    let mut next_anchor: Vec<Option<(i64, f64)>> = vec![None; len];
    let mut next = after.map(|p| (p.ts.timestamp() - start_s, p.value));
    for i in (0..len).rev() {
        match grid[i] {
            Some(v) => next = Some((i as i64, v)),
            None => next_anchor[i] = next,
        }
    }

    let mut prev = before.map(|p| (p.ts.timestamp() - start_s, p.value));
    for i in 0..len {
        match grid[i] {
            Some(v) => prev = Some((i as i64, v)),
            None => {
                if let (Some((t0, v0)), Some((t1, v1))) = (prev, next_anchor[i]) {
                    let fraction = (i as i64 - t0) as f64 / (t1 - t0) as f64;
                    grid[i] = Some(v0 + (v1 - v0) * fraction);
                }
            }
        }
    }
    grid
}

/// Mean of each bucket that holds at least one value.
pub fn bucket_means(start: DateTime<Utc>, grid: &[Option<f64>], bucket: Duration) -> Vec<SeriesPoint> {
    let width = bucket.num_seconds().max(1);
    let start_s = start.timestamp();
    let mut out = Vec::new();
    let mut current: Option<(i64, f64, u32)> = None;

    for (i, value) in grid.iter().enumerate() {
        let secs = start_s + i as i64;
        let key = secs - secs.rem_euclid(width);
        if current.is_some_and(|(k, _, _)| k != key) {
            push_bucket(&mut out, current.take());
        }
        if let Some(v) = value {
            let entry = current.get_or_insert((key, 0.0, 0));
            entry.1 += v;
            entry.2 += 1;
        }
    }
    push_bucket(&mut out, current);
    out
}

fn push_bucket(out: &mut Vec<SeriesPoint>, bucket: Option<(i64, f64, u32)>) {
    if let Some((key, sum, count)) = bucket.filter(|b| b.2 > 0) {
        if let Some(ts) = DateTime::from_timestamp(key, 0) {
            out.push(SeriesPoint {
                ts,
                value: sum / f64::from(count),
            });
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterpolationReport {
    pub windows: usize,
    pub buckets_written: u64,
}

impl std::ops::AddAssign for InterpolationReport {
    fn add_assign(&mut self, other: Self) {
        self.windows += other.windows;
        self.buckets_written += other.buckets_written;
    }
}

/// Interpolates one series window by window until its latest observation is covered.
pub async fn interpolate_series(
    source: &dyn SeriesSource,
    cfg: &InterpolationConfig,
    infer: bool,
    now: DateTime<Utc>,
) -> Result<InterpolationReport, StorageError> {
    let mut report = InterpolationReport::default();
    let Some((source_min, source_max)) = source.bounds().await? else {
        return Ok(report);
    };
    let profile = if infer {
        Some(TimeOfDayProfile::load(source, now).await?)
    } else {
        None
    };

    let mut previous_end = None;
    loop {
        let interpolated_max = source.interpolated_max().await?;
        let start = plan_window_start(interpolated_max, source_min, cfg);
        let end = plan_window_end(source, start, previous_end, source_max, cfg).await?;

        let points = source.points(start, end).await?;
        let before = source.anchor_before(start).await?;
        let after = source.anchor_after(end).await?;
        let grid = fill_grid(start, end, &points, before, after, profile.as_ref());
        let buckets = bucket_means(start, &grid, cfg.bucket);
        report.buckets_written += source.write_buckets(&buckets).await?;
        report.windows += 1;
        debug!(%start, %end, buckets = buckets.len(), "interpolation window written");

        if end >= source_max {
            break;
        }
        if previous_end.is_some_and(|p| end <= p) {
            warn!(%end, "interpolation window did not advance; stopping");
            break;
        }
        previous_end = Some(end);
    }
    Ok(report)
}

/// Runs every `interpolate_values` fact of the task against its mapping's timestamp column.
pub async fn interpolate_task(
    store: &PgStore,
    task: &Task,
    cfg: &InterpolationConfig,
    now: DateTime<Utc>,
) -> Result<InterpolationReport, StorageError> {
    let mut report = InterpolationReport::default();
    for mapping in store.staging_mappings(task.task_id).await? {
        let facts = store.fact_mappings(mapping.staging_id).await?;
        let targets: Vec<_> = facts
            .iter()
            .filter(|f| f.interpolate_values && !f.interpolation_ts)
            .collect();
        if targets.is_empty() {
            continue;
        }
        let ts = facts
            .iter()
            .find(|f| f.interpolation_ts)
            .ok_or_else(|| StorageError::InvalidConfig {
                entity: "staging mapping",
                id: mapping.staging_id,
                message: "interpolated facts need an interpolation timestamp column".to_string(),
            })?;

        for fact in targets {
            let destination = non_placeholder(fact.interpolation_destination_table.as_deref())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}_interpolated", mapping.destination_table));
            let spec = InterpolationSpec::new(
                fact.fact_id,
                &mapping.destination_table,
                &ts.fact_name,
                &fact.fact_name,
                &destination,
            )?;
            store.ensure_interpolation_table(&spec).await?;
            let series = PgSeries {
                store,
                spec: &spec,
            };
            let fact_report = interpolate_series(&series, cfg, fact.infer_values, now).await?;
            info!(
                fact = %fact.fact_name,
                windows = fact_report.windows,
                buckets = fact_report.buckets_written,
                "fact interpolated"
            );
            report += fact_report;
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap()
    }

    fn point(ts: DateTime<Utc>, value: f64) -> SeriesPoint {
        SeriesPoint { ts, value }
    }

    struct MemorySeries {
        points: Vec<SeriesPoint>,
        written: Mutex<BTreeMap<DateTime<Utc>, f64>>,
        profile: Vec<(u32, f64)>,
    }

    impl MemorySeries {
        fn new(mut points: Vec<SeriesPoint>) -> Self {
            points.sort_by_key(|p| p.ts);
            Self {
                points,
                written: Mutex::new(BTreeMap::new()),
                profile: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl SeriesSource for MemorySeries {
        async fn bounds(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StorageError> {
            Ok(self.points.first().map(|f| f.ts).zip(self.points.last().map(|l| l.ts)))
        }

        async fn interpolated_max(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
            Ok(self.written.lock().unwrap().keys().next_back().copied())
        }

        async fn latest_before(&self, upper: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, StorageError> {
            Ok(self.points.iter().rev().find(|p| p.ts <= upper).map(|p| p.ts))
        }

        async fn points(
            &self,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<SeriesPoint>, StorageError> {
            Ok(self
                .points
                .iter()
                .filter(|p| p.ts >= start && p.ts <= end)
                .copied()
                .collect())
        }

        async fn anchor_before(&self, at: DateTime<Utc>) -> Result<Option<SeriesPoint>, StorageError> {
            Ok(self.points.iter().rev().find(|p| p.ts < at).copied())
        }

        async fn anchor_after(&self, at: DateTime<Utc>) -> Result<Option<SeriesPoint>, StorageError> {
            Ok(self.points.iter().find(|p| p.ts > at).copied())
        }

        async fn time_of_day_means(
            &self,
            _since: Option<DateTime<Utc>>,
        ) -> Result<Vec<(u32, f64)>, StorageError> {
            Ok(self.profile.clone())
        }

        async fn write_buckets(&self, buckets: &[SeriesPoint]) -> Result<u64, StorageError> {
            let mut written = self.written.lock().unwrap();
            for bucket in buckets {
                written.insert(bucket.ts, bucket.value);
            }
            Ok(buckets.len() as u64)
        }
    }

    #[test]
    fn midpoint_between_two_anchors_is_linear() {
        let points = [point(t0(), 10.0), point(t0() + Duration::seconds(100), 20.0)];
        let grid = fill_grid(t0(), t0() + Duration::seconds(100), &points, None, None, None);
        assert_eq!(grid.len(), 101);
        assert_eq!(grid[0], Some(10.0));
        assert_eq!(grid[50], Some(15.0));
        assert_eq!(grid[100], Some(20.0));
    }

    #[test]
    fn anchors_outside_the_window_still_interpolate() {
        let before = point(t0() - Duration::seconds(10), 0.0);
        let after = point(t0() + Duration::seconds(10), 20.0);
        let grid = fill_grid(t0(), t0() + Duration::seconds(4), &[], Some(before), Some(after), None);
        assert_eq!(grid[0], Some(10.0));
        assert_eq!(grid[4], Some(14.0));

        let open_ended = fill_grid(t0(), t0() + Duration::seconds(4), &[], Some(before), None, None);
        assert!(open_ended.iter().all(Option::is_none));
    }

    #[test]
    fn inferred_values_fill_before_interpolation() {
        let profile = TimeOfDayProfile::from_tiers(vec![vec![(1, 7.0)], vec![(1, 99.0), (2, 8.0)], vec![]]);
        assert_eq!(profile.value_at(1), Some(7.0));
        assert_eq!(profile.value_at(2), Some(8.0));
        assert_eq!(profile.value_at(3), None);

        let points = [point(t0(), 1.0), point(t0() + Duration::minutes(4), 1.0)];
        let grid = fill_grid(t0(), t0() + Duration::minutes(4), &points, None, None, Some(&profile));
        assert_eq!(grid[60], Some(7.0));
        assert_eq!(grid[150], Some(8.0));
        // Minute 3 has no profile value and sits between 8.0 (end of minute 2) and 1.0.
        let minute_three = grid[200].unwrap();
        assert!(minute_three < 8.0 && minute_three > 1.0);
    }

    #[test]
    fn bucket_means_skip_empty_buckets() {
        let bucket = Duration::minutes(30);
        let mut grid = vec![None; 3600];
        grid[0] = Some(2.0);
        grid[1] = Some(4.0);
        let means = bucket_means(t0(), &grid, bucket);
        assert_eq!(means, vec![point(t0(), 3.0)]);
    }

    #[test]
    fn window_start_resumes_before_written_data() {
        let cfg = InterpolationConfig::default();
        let source_min = t0() + Duration::seconds(17);
        assert_eq!(plan_window_start(None, source_min, &cfg), t0());
        let written = t0() + Duration::hours(10);
        assert_eq!(
            plan_window_start(Some(written), source_min, &cfg),
            t0() + Duration::hours(4)
        );
    }

    #[tokio::test]
    async fn window_end_expands_lookahead_across_gaps() {
        let cfg = InterpolationConfig::default();
        let far = t0() + Duration::days(5);
        let series = MemorySeries::new(vec![point(t0(), 1.0), point(t0() + Duration::hours(1), 2.0), point(far, 3.0)]);

        let first = plan_window_end(&series, t0(), None, far, &cfg).await.unwrap();
        assert_eq!(first, t0() + Duration::hours(1));

        let second = plan_window_end(&series, t0(), Some(first), far, &cfg).await.unwrap();
        assert_eq!(second, far);
    }

    #[tokio::test]
    async fn windowed_catch_up_reaches_the_latest_observation() {
        let cfg = InterpolationConfig::default();
        let mut points: Vec<SeriesPoint> = (0..60)
            .map(|m| point(t0() + Duration::minutes(m), 60.0))
            .collect();
        let last = t0() + Duration::days(10);
        points.push(point(last, 80.0));
        let series = MemorySeries::new(points);

        let report = interpolate_series(&series, &cfg, false, last).await.unwrap();
        assert_eq!(report.windows, 3);

        let written = series.written.lock().unwrap();
        assert_eq!(written.keys().next_back().copied(), Some(last));
        assert_eq!(written.get(&t0()).copied(), Some(60.0));
        let values: Vec<f64> = written.values().copied().collect();
        assert!(values.windows(2).all(|w| w[1] >= w[0] - 1e-9));
    }

    #[tokio::test]
    async fn empty_series_writes_nothing() {
        let series = MemorySeries::new(Vec::new());
        let report = interpolate_series(&series, &InterpolationConfig::default(), true, t0())
            .await
            .unwrap();
        assert_eq!(report, InterpolationReport::default());
    }
}
