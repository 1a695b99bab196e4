//! Persistence the run loop depends on. `PgStore` is the production store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fitdash_adapters::LocalJob;
use fitdash_core::{LoginEvent, ServiceRateLimit, Task, TaskExecutionLog, TaskReconciliation};
use fitdash_storage::{PgStore, StorageError, TaskListing};
use serde_json::Value;

use crate::config::InterpolationConfig;
use crate::flatten::{self, FlattenReport};
use crate::interpolate::{self, InterpolationReport};

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn list_tasks(&self) -> Result<TaskListing, StorageError>;

    async fn find_task_by_name(&self, task_name: &str) -> Result<Option<Task>, StorageError>;

    async fn value_recency(&self, task_id: i64) -> Result<Option<DateTime<Utc>>, StorageError>;

    async fn service_rate_limit(&self, service: &str)
        -> Result<Option<ServiceRateLimit>, StorageError>;

    async fn record_rate_limit(&self, limit: &ServiceRateLimit) -> Result<(), StorageError>;

    async fn insert_payloads(&self, task_id: i64, records: &[Value]) -> Result<u64, StorageError>;

    /// Flatten stage: staged payloads into destination tables, then post-load procedures.
    async fn flatten(&self, task: &Task) -> Result<FlattenReport, StorageError>;

    /// Built-in interpolation of the task's flagged facts.
    async fn interpolate(
        &self,
        task: &Task,
        cfg: &InterpolationConfig,
        now: DateTime<Utc>,
    ) -> Result<InterpolationReport, StorageError>;

    async fn call_procedure(&self, procedure: &str) -> Result<(), StorageError>;

    async fn run_job(&self, job: &dyn LocalJob, now: DateTime<Utc>) -> anyhow::Result<()>;

    async fn apply_reconciliation(
        &self,
        task_id: i64,
        update: &TaskReconciliation,
    ) -> Result<(), StorageError>;

    async fn reset_failures(&self, task_id: i64) -> Result<bool, StorageError>;

    async fn insert_task_execution(&self, entry: &TaskExecutionLog) -> Result<(), StorageError>;

    async fn insert_login_event(&self, event: &LoginEvent) -> Result<(), StorageError>;

    async fn insert_application_event(
        &self,
        category: &str,
        description: &str,
        execution_time_ms: i64,
        error_text: Option<&str>,
    ) -> Result<(), StorageError>;
}

#[async_trait]
impl TaskStore for PgStore {
    async fn list_tasks(&self) -> Result<TaskListing, StorageError> {
        PgStore::list_tasks(self).await
    }

    async fn find_task_by_name(&self, task_name: &str) -> Result<Option<Task>, StorageError> {
        PgStore::find_task_by_name(self, task_name).await
    }

    async fn value_recency(&self, task_id: i64) -> Result<Option<DateTime<Utc>>, StorageError> {
        PgStore::value_recency(self, task_id).await
    }

    async fn service_rate_limit(
        &self,
        service: &str,
    ) -> Result<Option<ServiceRateLimit>, StorageError> {
        PgStore::service_rate_limit(self, service).await
    }

    async fn record_rate_limit(&self, limit: &ServiceRateLimit) -> Result<(), StorageError> {
        PgStore::record_rate_limit(self, limit).await
    }

    async fn insert_payloads(&self, task_id: i64, records: &[Value]) -> Result<u64, StorageError> {
        PgStore::insert_payloads(self, task_id, records).await
    }

    async fn flatten(&self, task: &Task) -> Result<FlattenReport, StorageError> {
        flatten::flatten_task(self, task).await
    }

    async fn interpolate(
        &self,
        task: &Task,
        cfg: &InterpolationConfig,
        now: DateTime<Utc>,
    ) -> Result<InterpolationReport, StorageError> {
        interpolate::interpolate_task(self, task, cfg, now).await
    }

    async fn call_procedure(&self, procedure: &str) -> Result<(), StorageError> {
        PgStore::call_procedure(self, procedure).await
    }

    async fn run_job(&self, job: &dyn LocalJob, now: DateTime<Utc>) -> anyhow::Result<()> {
        job.run(self, now).await
    }

    async fn apply_reconciliation(
        &self,
        task_id: i64,
        update: &TaskReconciliation,
    ) -> Result<(), StorageError> {
        PgStore::apply_reconciliation(self, task_id, update).await
    }

    async fn reset_failures(&self, task_id: i64) -> Result<bool, StorageError> {
        PgStore::reset_failures(self, task_id).await
    }

    async fn insert_task_execution(&self, entry: &TaskExecutionLog) -> Result<(), StorageError> {
        PgStore::insert_task_execution(self, entry).await
    }

    async fn insert_login_event(&self, event: &LoginEvent) -> Result<(), StorageError> {
        PgStore::insert_login_event(self, event).await
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
