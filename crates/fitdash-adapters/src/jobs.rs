//! Locally executed jobs, addressed by name from a task's python function column.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use fitdash_storage::{MaintenanceReport, MaintenanceStats, PgStore, StorageError};
use tracing::{error, info};

use crate::short_name;

/// Database housekeeping a local job may perform.
#[async_trait]
pub trait MaintenanceStore: Send + Sync {
    async fn prune_logs(&self, cutoff: DateTime<Utc>) -> Result<MaintenanceReport, StorageError>;
    async fn vacuum(&self, full: bool) -> Result<(), StorageError>;
    async fn analyze(&self) -> Result<(), StorageError>;
    async fn reindex_database(&self) -> Result<(), StorageError>;
    async fn database_size_mb(&self) -> Result<f64, StorageError>;
    async fn insert_maintenance_stats(&self, stats: &MaintenanceStats) -> Result<(), StorageError>;
    async fn insert_application_event(
        &self,
        category: &str,
        description: &str,
        execution_time_ms: i64,
        error_text: Option<&str>,
    ) -> Result<(), StorageError>;
}

#[async_trait]
impl MaintenanceStore for PgStore {
    async fn prune_logs(&self, cutoff: DateTime<Utc>) -> Result<MaintenanceReport, StorageError> {
        PgStore::prune_logs(self, cutoff).await
    }

    async fn vacuum(&self, full: bool) -> Result<(), StorageError> {
        PgStore::vacuum(self, full).await
    }

    async fn analyze(&self) -> Result<(), StorageError> {
        PgStore::analyze(self).await
    }

    async fn reindex_database(&self) -> Result<(), StorageError> {
        PgStore::reindex_database(self).await
    }

    async fn database_size_mb(&self) -> Result<f64, StorageError> {
        PgStore::database_size_mb(self).await
    }

    async fn insert_maintenance_stats(&self, stats: &MaintenanceStats) -> Result<(), StorageError> {
        PgStore::insert_maintenance_stats(self, stats).await
    }

    async fn insert_application_event(
        &self,
        category: &str,
        description: &str,
        execution_time_ms: i64,
        error_text: Option<&str>,
    ) -> Result<(), StorageError> {
        PgStore::insert_application_event(self, category, description, execution_time_ms, error_text)
            .await
    }
}

#[async_trait]
pub trait LocalJob: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, store: &dyn MaintenanceStore, now: DateTime<Utc>) -> anyhow::Result<()>;
}

pub const MAINTENANCE_EVENT_CATEGORY: &str = "DB Maintenance";

/// How much work a maintenance pass does; the larger kinds include the smaller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MaintenanceKind {
    Daily,
    Weekly,
    Monthly,
}

impl MaintenanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceKind::Daily => "daily",
            MaintenanceKind::Weekly => "weekly",
            MaintenanceKind::Monthly => "monthly",
        }
    }
}

impl fmt::Display for MaintenanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prunes old log rows and vacuums every night. Analyzes once a week; on the
/// first of the month it also reindexes and runs a full vacuum.
#[derive(Debug, Clone, Copy)]
pub struct NightlyMaintenance {
    pub retention: Duration,
    pub analyze_on: Weekday,
}

impl Default for NightlyMaintenance {
    fn default() -> Self {
        Self {
            retention: Duration::days(365),
            analyze_on: Weekday::Sun,
        }
    }
}

impl NightlyMaintenance {
    pub fn analyze_due(&self, now: DateTime<Utc>) -> bool {
        now.weekday() == self.analyze_on
    }

    pub fn rebuild_due(&self, now: DateTime<Utc>) -> bool {
        now.day() == 1
    }

    pub fn kind(&self, now: DateTime<Utc>) -> MaintenanceKind {
        if self.rebuild_due(now) {
            MaintenanceKind::Monthly
        } else if self.analyze_due(now) {
            MaintenanceKind::Weekly
        } else {
            MaintenanceKind::Daily
        }
    }

    async fn maintain(
        &self,
        store: &dyn MaintenanceStore,
        now: DateTime<Utc>,
        started: Instant,
    ) -> anyhow::Result<MaintenanceStats> {
        let report = store
            .prune_logs(now - self.retention)
            .await
            .context("pruning logging tables")?;
        info!(
            task_executions = report.pruned_task_executions,
            api_logins = report.pruned_api_logins,
            application_events = report.pruned_application_events,
            "pruned log rows"
        );

        let size_before_mb = store.database_size_mb().await.context("measuring database size")?;
        store.vacuum(false).await.context("vacuuming database")?;
        if self.analyze_due(now) {
            store.analyze().await.context("analyzing database")?;
        }
        if self.rebuild_due(now) {
            store.reindex_database().await.context("reindexing database")?;
            store.vacuum(true).await.context("running full vacuum")?;
        }
        let size_after_mb = store.database_size_mb().await.context("measuring database size")?;

        Ok(MaintenanceStats {
            maintenance_type: self.kind(now).to_string(),
            size_before_mb,
            size_after_mb,
            execution_time_ms: elapsed_ms(started),
        })
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl LocalJob for NightlyMaintenance {
    fn name(&self) -> &'static str {
        "nightly_maintenance"
    }

    async fn run(&self, store: &dyn MaintenanceStore, now: DateTime<Utc>) -> anyhow::Result<()> {
        let started = Instant::now();
        let stats = match self.maintain(store, now, started).await {
            Ok(stats) => stats,
            Err(err) => {
                let message = format!("{err:#}");
                error!(error = %message, "maintenance failed");
                store
                    .insert_application_event(
                        MAINTENANCE_EVENT_CATEGORY,
                        "Error during maintenance",
                        elapsed_ms(started),
                        Some(&message),
                    )
                    .await
                    .context("recording maintenance failure")?;
                return Err(err);
            }
        };

        let description = format!(
            "{} | Time {:.2}s | Size {:.1} -> {:.1}MB",
            stats.maintenance_type,
            stats.execution_time_ms as f64 / 1000.0,
            stats.size_before_mb,
            stats.size_after_mb
        );
        store
            .insert_application_event(
                MAINTENANCE_EVENT_CATEGORY,
                &description,
                stats.execution_time_ms,
                None,
            )
            .await
            .context("recording maintenance event")?;
        store
            .insert_maintenance_stats(&stats)
            .await
            .context("recording maintenance stats")?;
        info!(kind = %stats.maintenance_type, "maintenance complete");
        Ok(())
    }
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: BTreeMap<String, Arc<dyn LocalJob>>,
}

impl JobRegistry {
    pub fn with_builtin_jobs() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(NightlyMaintenance::default()));
        registry
    }

    pub fn register(&mut self, job: Arc<dyn LocalJob>) {
        self.jobs.insert(job.name().to_string(), job);
    }

    /// Accepts either a bare job name or a dotted `module.function` reference.
    pub fn get(&self, reference: &str) -> Option<Arc<dyn LocalJob>> {
        let reference = reference.trim();
        self.jobs
            .get(reference)
            .or_else(|| self.jobs.get(short_name(reference)))
            .cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[test]
    fn builtin_registry_resolves_dotted_references() {
        let registry = JobRegistry::with_builtin_jobs();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["nightly_maintenance"]);
        assert!(registry
            .get("backend_functions.maintenance.nightly_maintenance")
            .is_some());
        assert!(registry.get("nightly_maintenance").is_some());
        assert!(registry.get("refresh_forecasts").is_none());
    }

    #[test]
    fn analyze_runs_weekly_and_rebuild_monthly() {
        let job = NightlyMaintenance::default();
        let sunday = Utc.with_ymd_and_hms(2026, 10, 18, 3, 0, 0).single().unwrap();
        assert!(job.analyze_due(sunday));
        assert!(!job.analyze_due(sunday + Duration::days(1)));
        assert_eq!(job.kind(sunday), MaintenanceKind::Weekly);
        assert_eq!(job.kind(sunday + Duration::days(1)), MaintenanceKind::Daily);
        // 2026-11-01 is also a Sunday; the monthly pass wins.
        assert_eq!(job.kind(sunday + Duration::days(14)), MaintenanceKind::Monthly);
        assert_eq!(job.retention, Duration::days(365));
    }

    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<String>>,
        stats: Mutex<Vec<MaintenanceStats>>,
        fail_reindex: bool,
    }

    impl RecordingStore {
        fn log(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MaintenanceStore for RecordingStore {
        async fn prune_logs(&self, cutoff: DateTime<Utc>) -> Result<MaintenanceReport, StorageError> {
            self.log(format!("prune<{}", cutoff.date_naive()));
            Ok(MaintenanceReport::default())
        }

        async fn vacuum(&self, full: bool) -> Result<(), StorageError> {
            self.log(if full { "vacuum full" } else { "vacuum" });
            Ok(())
        }

        async fn analyze(&self) -> Result<(), StorageError> {
            self.log("analyze");
            Ok(())
        }

        async fn reindex_database(&self) -> Result<(), StorageError> {
            self.log("reindex");
            if self.fail_reindex {
                return Err(StorageError::Procedure {
                    procedure: "REINDEX".into(),
                    message: "lock timeout".into(),
                });
            }
            Ok(())
        }

        async fn database_size_mb(&self) -> Result<f64, StorageError> {
            Ok(if self.calls().contains(&"vacuum".to_string()) { 90.0 } else { 120.0 })
        }

        async fn insert_maintenance_stats(&self, stats: &MaintenanceStats) -> Result<(), StorageError> {
            self.stats.lock().unwrap().push(stats.clone());
            Ok(())
        }

        async fn insert_application_event(
            &self,
            category: &str,
            description: &str,
            _execution_time_ms: i64,
            error_text: Option<&str>,
        ) -> Result<(), StorageError> {
            self.log(format!("event {category}: {description} [{}]", error_text.unwrap_or("-")));
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_of_month_reindexes_and_records_the_pass() {
        let store = RecordingStore::default();
        let first = Utc.with_ymd_and_hms(2026, 12, 1, 4, 0, 0).single().unwrap();
        NightlyMaintenance::default().run(&store, first).await.unwrap();

        let calls = store.calls();
        assert_eq!(&calls[..4], ["prune<2025-12-01", "vacuum", "reindex", "vacuum full"]);
        assert!(calls[4].starts_with("event DB Maintenance: monthly | Time "));
        assert!(calls[4].ends_with("Size 120.0 -> 90.0MB [-]"));
        let stats = store.stats.lock().unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].maintenance_type, "monthly");
        assert_eq!(stats[0].size_before_mb, 120.0);
    }

    #[tokio::test]
    async fn ordinary_night_only_prunes_and_vacuums() {
        let store = RecordingStore::default();
        let tuesday = Utc.with_ymd_and_hms(2026, 10, 20, 4, 0, 0).single().unwrap();
        NightlyMaintenance::default().run(&store, tuesday).await.unwrap();
        let calls = store.calls();
        assert_eq!(&calls[..2], ["prune<2025-10-20", "vacuum"]);
        assert!(!calls.iter().any(|c| c == "analyze" || c == "reindex"));
        assert_eq!(store.stats.lock().unwrap()[0].maintenance_type, "daily");
    }

    #[tokio::test]
    async fn failed_pass_is_recorded_as_an_event() {
        let store = RecordingStore {
            fail_reindex: true,
            ..Default::default()
        };
        let first = Utc.with_ymd_and_hms(2026, 12, 1, 4, 0, 0).single().unwrap();
        let err = NightlyMaintenance::default().run(&store, first).await.unwrap_err();
        assert!(format!("{err:#}").contains("reindexing database"));
        let calls = store.calls();
        let last = calls.last().unwrap();
        assert!(last.starts_with("event DB Maintenance: Error during maintenance ["));
        assert!(last.contains("lock timeout"));
        assert!(store.stats.lock().unwrap().is_empty());
    }
}
