//! PostgreSQL persistence, SQL synthesis and HTTP fetch utilities for fitdash.

pub mod http;
pub mod sql;

use chrono::{DateTime, Utc};
use fitdash_core::{
    FactMapping, Frequency, LoginEvent, LoopType, ServiceRateLimit, StageFlags, StagingMapping,
    Task, TaskExecutionLog, TaskReconciliation,
};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, QueryBuilder, Row, ValueRef};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use http::{
    BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, RequestAuth, RetryDisposition,
};
pub use sql::{FlattenSpec, Ident, InterpolationSpec, QualifiedName, SqlBuildError, SqlExpr};

pub const CRATE_NAME: &str = "fitdash-storage";

/// Rows per multi-row staging insert.
pub const LOAD_PAGE_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid {entity} {id}: {message}")]
    InvalidConfig {
        entity: &'static str,
        id: i64,
        message: String,
    },
    #[error(transparent)]
    Sql(#[from] SqlBuildError),
    #[error("procedure {procedure} reported failure: {message}")]
    Procedure { procedure: String, message: String },
}

/// One known `(timestamp, value)` observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub ts: DateTime<Utc>,
    pub value: f64,
}

/// A task configuration row that could not be read into a [`Task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedTask {
    pub task_id: i64,
    pub task_name: String,
    pub message: String,
}

/// Readable tasks plus the rows that failed to parse. One bad row never hides the rest.
#[derive(Debug, Clone, Default)]
pub struct TaskListing {
    pub tasks: Vec<Task>,
    pub rejected: Vec<RejectedTask>,
}

impl TaskListing {
    pub fn push(&mut self, task_id: i64, task_name: String, parsed: Result<Task, StorageError>) {
        match parsed {
            Ok(task) => self.tasks.push(task),
            Err(err) => {
                warn!(task_id, task_name = %task_name, error = %err, "skipping unreadable task row");
                self.rejected.push(RejectedTask {
                    task_id,
                    task_name,
                    message: err.to_string(),
                });
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaintenanceReport {
    pub pruned_task_executions: u64,
    pub pruned_api_logins: u64,
    pub pruned_application_events: u64,
}

/// One nightly maintenance pass as stored in `logging.db_stats`.
#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceStats {
    pub maintenance_type: String,
    pub size_before_mb: f64,
    pub size_after_mb: f64,
    pub execution_time_ms: i64,
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

const TASK_COLUMNS: &str = r#"
    task_id, task_name, task_description, display_icon, task_frequency, task_interval,
    task_start_hour, task_end_hour, task_priority, consecutive_failures,
    last_executed_utc, last_succeeded_utc, last_failed_utc, next_planned_execution_utc,
    last_failure_message, extract_values, parse_values, interpolate_values, forecast_values,
    execute_python, api_service_name, api_function_name, api_loop_type, api_parameters,
    login_function, extraction_function, python_function, parse_procedure,
    interpolation_procedure, forecast_procedure, flatten_procedure
"#;

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// All configured tasks, grouped by service so sessions can be reused.
    pub async fn list_tasks(&self) -> Result<TaskListing, StorageError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks.task_configuration \
             ORDER BY api_service_name NULLS LAST, task_priority, task_id"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut listing = TaskListing::default();
        for row in &rows {
            let task_id: i64 = row.try_get("task_id")?;
            let task_name: String = row.try_get("task_name")?;
            listing.push(task_id, task_name, task_from_row(row));
        }
        Ok(listing)
    }

    pub async fn find_task_by_name(&self, task_name: &str) -> Result<Option<Task>, StorageError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks.task_configuration WHERE task_name = $1");
        let row = sqlx::query(&sql)
            .bind(task_name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Oldest recency across the task's timestamp facts.
    pub async fn value_recency(&self, task_id: i64) -> Result<Option<DateTime<Utc>>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT MIN(f.max_ts_utc) AS recency
              FROM tasks.fact_configuration f
              JOIN tasks.staging_configuration s ON s.staging_id = f.staging_id
             WHERE s.task_id = $1
               AND f.max_ts_utc IS NOT NULL
            "#,
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("recency")?)
    }

    pub async fn staging_mappings(&self, task_id: i64) -> Result<Vec<StagingMapping>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT staging_id, task_id, staging_name, source_table, destination_table,
                   cross_join_condition, filter_condition
              FROM tasks.staging_configuration
             WHERE task_id = $1
             ORDER BY staging_id
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<StagingMapping, StorageError> {
                Ok(StagingMapping {
                    staging_id: row.try_get("staging_id")?,
                    task_id: row.try_get("task_id")?,
                    staging_name: row.try_get("staging_name")?,
                    source_table: row.try_get("source_table")?,
                    destination_table: row.try_get("destination_table")?,
                    cross_join_condition: row.try_get("cross_join_condition")?,
                    filter_condition: row.try_get("filter_condition")?,
                })
            })
            .collect()
    }

    pub async fn fact_mappings(&self, staging_id: i64) -> Result<Vec<FactMapping>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT f.fact_id, s.task_id, f.staging_id, f.fact_name, f.extraction_sql, f.data_type,
                   f.is_unique_constraint, f.interpolation_ts, f.interpolate_values,
                   f.infer_values, f.forecast_values, f.interpolation_destination_table,
                   f.max_ts_utc
              FROM tasks.fact_configuration f
              JOIN tasks.staging_configuration s ON s.staging_id = f.staging_id
             WHERE f.staging_id = $1
             ORDER BY f.column_order, f.fact_id
            "#,
        )
        .bind(staging_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<FactMapping, StorageError> {
                let fact_id: i64 = row.try_get("fact_id")?;
                let data_type: String = row.try_get("data_type")?;
                Ok(FactMapping {
                    fact_id,
                    task_id: row.try_get("task_id")?,
                    staging_id: row.try_get("staging_id")?,
                    fact_name: row.try_get("fact_name")?,
                    extraction_sql: row.try_get("extraction_sql")?,
                    data_type: data_type.parse().map_err(|err: fitdash_core::ParseConfigError| {
                        StorageError::InvalidConfig {
                            entity: "fact",
                            id: fact_id,
                            message: err.to_string(),
                        }
                    })?,
                    is_unique_constraint: row.try_get("is_unique_constraint")?,
                    interpolation_ts: row.try_get("interpolation_ts")?,
                    interpolate_values: row.try_get("interpolate_values")?,
                    infer_values: row.try_get("infer_values")?,
                    forecast_values: row.try_get("forecast_values")?,
                    interpolation_destination_table: row
                        .try_get("interpolation_destination_table")?,
                    max_ts_utc: row.try_get("max_ts_utc")?,
                })
            })
            .collect()
    }

    pub async fn service_rate_limit(
        &self,
        service: &str,
    ) -> Result<Option<ServiceRateLimit>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT api_service_name, rate_limit_detected_utc, rate_limit_cleared_utc
              FROM api_services.api_service_list
             WHERE api_service_name = $1
            "#,
        )
        .bind(service)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<ServiceRateLimit, StorageError> {
            Ok(ServiceRateLimit {
                service: row.try_get("api_service_name")?,
                detected_utc: row.try_get("rate_limit_detected_utc")?,
                cleared_utc: row.try_get("rate_limit_cleared_utc")?,
            })
        })
        .transpose()
    }

    pub async fn record_rate_limit(&self, limit: &ServiceRateLimit) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO api_services.api_service_list
                (api_service_name, rate_limit_detected_utc, rate_limit_cleared_utc)
            VALUES ($1, $2, $3)
            ON CONFLICT (api_service_name) DO UPDATE
               SET rate_limit_detected_utc = EXCLUDED.rate_limit_detected_utc,
                   rate_limit_cleared_utc = EXCLUDED.rate_limit_cleared_utc
            "#,
        )
        .bind(&limit.service)
        .bind(limit.detected_utc)
        .bind(limit.cleared_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Appends one staging row per record. Returns the number of rows written.
    pub async fn insert_payloads(&self, task_id: i64, records: &[Value]) -> Result<u64, StorageError> {
        match records {
            [] => Ok(0),
            [single] => {
                let result = sqlx::query(
                    "INSERT INTO staging.api_imports (task_id, payload) VALUES ($1, $2)",
                )
                .bind(task_id)
                .bind(single)
                .execute(&self.pool)
                .await?;
                Ok(result.rows_affected())
            }
            many => {
                let mut written = 0u64;
                for page in many.chunks(LOAD_PAGE_SIZE) {
                    let mut builder =
                        QueryBuilder::new("INSERT INTO staging.api_imports (task_id, payload) ");
                    builder.push_values(page, |mut row, record| {
                        row.push_bind(task_id).push_bind(record);
                    });
                    written += builder.build().execute(&self.pool).await?.rows_affected();
                }
                debug!(task_id, written, "staged payload pages");
                Ok(written)
            }
        }
    }

    /// Runs a statement with no bind parameters (DDL from the SQL builder).
    pub async fn execute_ddl(&self, statement: &str) -> Result<(), StorageError> {
        sqlx::raw_sql(statement).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn run_flatten(&self, spec: &FlattenSpec, task_id: i64) -> Result<u64, StorageError> {
        if let Some(schema) = spec.create_schema_sql() {
            self.execute_ddl(&schema).await?;
        }
        self.execute_ddl(&spec.create_table_sql()).await?;

        let sql = spec.upsert_sql();
        let mut query = sqlx::query(&sql);
        if spec.filters_by_task() {
            query = query.bind(task_id);
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    /// Stores `MAX(ts)` of the destination table as the fact's value recency.
    pub async fn refresh_fact_recency(
        &self,
        spec: &FlattenSpec,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let (Some(column), Some(sql)) = (spec.timestamp_column(), spec.recency_sql()) else {
            return Ok(None);
        };
        let recency: Option<DateTime<Utc>> = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await?
            .try_get("recency")?;
        sqlx::query("UPDATE tasks.fact_configuration SET max_ts_utc = $2 WHERE fact_id = $1")
            .bind(column.fact_id)
            .bind(recency)
            .execute(&self.pool)
            .await?;
        Ok(recency)
    }

    /// `CALL schema.name()`. A non-null value in the first returned column is a failure.
    pub async fn call_procedure(&self, procedure: &str) -> Result<(), StorageError> {
        let name = QualifiedName::parse(procedure)?;
        let sql = sql::call_procedure_sql(&name);
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        let Some(row) = row.filter(|r| !r.is_empty()) else {
            return Ok(());
        };
        if row.try_get_raw(0)?.is_null() {
            return Ok(());
        }
        let message = row
            .try_get::<String, _>(0)
            .unwrap_or_else(|_| "procedure returned a non-null result".to_string());
        Err(StorageError::Procedure {
            procedure: procedure.to_string(),
            message,
        })
    }

    pub async fn apply_reconciliation(
        &self,
        task_id: i64,
        update: &TaskReconciliation,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE tasks.task_configuration
               SET consecutive_failures = $2,
                   next_planned_execution_utc = $3,
                   last_executed_utc = $4,
                   last_succeeded_utc = COALESCE($5, last_succeeded_utc),
                   last_failed_utc = COALESCE($6, last_failed_utc),
                   last_failure_message = COALESCE($7, last_failure_message)
             WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .bind(i32::try_from(update.consecutive_failures).unwrap_or(i32::MAX))
        .bind(update.next_planned_execution_utc)
        .bind(update.last_executed_utc)
        .bind(update.last_succeeded_utc)
        .bind(update.last_failed_utc)
        .bind(update.last_failure_message.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Closes the circuit breaker. Returns false when no task matched.
    pub async fn reset_failures(&self, task_id: i64) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks.task_configuration
               SET consecutive_failures = 0,
                   last_failure_message = NULL,
                   next_planned_execution_utc = NULL
             WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn insert_task_execution(&self, entry: &TaskExecutionLog) -> Result<(), StorageError> {
        let timings = &entry.timings;
        sqlx::query(
            r#"
            INSERT INTO logging.task_executions
                (task_id, task_name, extract_time_ms, load_time_ms, transform_time_ms,
                 interpolation_time_ms, forecast_time_ms, python_time_ms, failure_type, error_text)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.task_id)
        .bind(&entry.task_name)
        .bind(timings.extract_ms)
        .bind(timings.load_ms)
        .bind(timings.transform_ms)
        .bind(timings.interpolation_ms)
        .bind(timings.forecast_ms)
        .bind(timings.python_ms)
        .bind(entry.failure_kind.map(|k| k.as_str()))
        .bind(entry.error_text.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_login_event(&self, event: &LoginEvent) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO logging.api_logins (api_service_name, event_name, token_age_s, error_text)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&event.service)
        .bind(&event.event)
        .bind(event.token_age_secs)
        .bind(event.error_text.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_application_event(
        &self,
        category: &str,
        description: &str,
        execution_time_ms: i64,
        error_text: Option<&str>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO logging.application_events
                (event_category, event_description, execution_time_ms, error_text)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(category)
        .bind(description)
        .bind(execution_time_ms)
        .bind(error_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn ensure_interpolation_table(&self, spec: &InterpolationSpec) -> Result<(), StorageError> {
        if let Some(schema) = spec.create_schema_sql() {
            self.execute_ddl(&schema).await?;
        }
        self.execute_ddl(&spec.create_table_sql()).await
    }

    pub async fn source_bounds(
        &self,
        spec: &InterpolationSpec,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StorageError> {
        let row = sqlx::query(&spec.source_bounds_sql())
            .fetch_one(&self.pool)
            .await?;
        let min: Option<DateTime<Utc>> = row.try_get("min_ts")?;
        let max: Option<DateTime<Utc>> = row.try_get("max_ts")?;
        Ok(min.zip(max))
    }

    pub async fn interpolated_max(
        &self,
        spec: &InterpolationSpec,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let row = sqlx::query(&spec.destination_max_sql())
            .bind(&spec.fact_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("max_ts")?)
    }

    pub async fn latest_source_before(
        &self,
        spec: &InterpolationSpec,
        upper: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let row = sqlx::query(&spec.latest_before_sql())
            .bind(upper)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("max_ts")?)
    }

    pub async fn series_points(
        &self,
        spec: &InterpolationSpec,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SeriesPoint>, StorageError> {
        let rows = sqlx::query(&spec.points_sql())
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(point_from_row).collect()
    }

    pub async fn anchor_before(
        &self,
        spec: &InterpolationSpec,
        at: DateTime<Utc>,
    ) -> Result<Option<SeriesPoint>, StorageError> {
        let row = sqlx::query(&spec.anchor_before_sql())
            .bind(at)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(point_from_row).transpose()
    }

    pub async fn anchor_after(
        &self,
        spec: &InterpolationSpec,
        at: DateTime<Utc>,
    ) -> Result<Option<SeriesPoint>, StorageError> {
        let row = sqlx::query(&spec.anchor_after_sql())
            .bind(at)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(point_from_row).transpose()
    }

    /// `(minute_of_day, mean)` pairs over observations since `since` (all time when `None`).
    pub async fn time_of_day_means(
        &self,
        spec: &InterpolationSpec,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<(u32, f64)>, StorageError> {
        let rows = sqlx::query(&spec.time_of_day_profile_sql())
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<(u32, f64), StorageError> {
                let minute: i32 = row.try_get("minute_of_day")?;
                let mean: f64 = row.try_get("mean_value")?;
                Ok((u32::try_from(minute).unwrap_or(0), mean))
            })
            .collect()
    }

    pub async fn upsert_interpolated(
        &self,
        spec: &InterpolationSpec,
        buckets: &[SeriesPoint],
    ) -> Result<u64, StorageError> {
        if buckets.is_empty() {
            return Ok(0);
        }
        let timestamps: Vec<DateTime<Utc>> = buckets.iter().map(|b| b.ts).collect();
        let values: Vec<f64> = buckets.iter().map(|b| b.value).collect();
        let result = sqlx::query(&spec.upsert_sql())
            .bind(&spec.fact_name)
            .bind(timestamps)
            .bind(values)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Deletes log rows older than `cutoff` from every logging table.
    pub async fn prune_logs(&self, cutoff: DateTime<Utc>) -> Result<MaintenanceReport, StorageError> {
        let mut report = MaintenanceReport::default();
        for (table, slot) in [
            ("logging.task_executions", &mut report.pruned_task_executions),
            ("logging.api_logins", &mut report.pruned_api_logins),
            ("logging.application_events", &mut report.pruned_application_events),
        ] {
            let sql = format!("DELETE FROM {table} WHERE logged_utc < $1");
            *slot = sqlx::query(&sql)
                .bind(cutoff)
                .execute(&self.pool)
                .await?
                .rows_affected();
        }
        Ok(report)
    }

    pub async fn vacuum(&self, full: bool) -> Result<(), StorageError> {
        let statement = if full { "VACUUM FULL" } else { "VACUUM" };
        sqlx::raw_sql(statement).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn analyze(&self) -> Result<(), StorageError> {
        sqlx::raw_sql("ANALYZE").execute(&self.pool).await?;
        Ok(())
    }

    /// Rebuilds every index of the connected database.
    pub async fn reindex_database(&self) -> Result<(), StorageError> {
        let name: String = sqlx::query("SELECT current_database() AS name")
            .fetch_one(&self.pool)
            .await?
            .try_get("name")?;
        let statement = format!("REINDEX DATABASE \"{}\"", name.replace('"', "\"\""));
        sqlx::raw_sql(&statement).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn database_size_mb(&self) -> Result<f64, StorageError> {
        let row = sqlx::query(
            "SELECT pg_database_size(current_database())::DOUBLE PRECISION / 1048576.0 AS size_mb",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("size_mb")?)
    }

    pub async fn insert_maintenance_stats(&self, stats: &MaintenanceStats) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO logging.db_stats
                (maintenance_type, size_before_mb, size_after_mb, execution_time_ms)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&stats.maintenance_type)
        .bind(stats.size_before_mb)
        .bind(stats.size_after_mb)
        .bind(stats.execution_time_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn point_from_row(row: &PgRow) -> Result<SeriesPoint, StorageError> {
    Ok(SeriesPoint {
        ts: row.try_get("ts")?,
        value: row.try_get("value")?,
    })
}

fn task_from_row(row: &PgRow) -> Result<Task, StorageError> {
    let task_id: i64 = row.try_get("task_id")?;
    let invalid = |message: String| StorageError::InvalidConfig {
        entity: "task",
        id: task_id,
        message,
    };
    let frequency: String = row.try_get("task_frequency")?;
    let loop_type: Option<String> = row.try_get("api_loop_type")?;
    let hour = |column: &str| -> Result<u32, StorageError> {
        let value: i32 = row.try_get(column)?;
        u32::try_from(value)
            .ok()
            .filter(|h| *h <= 24)
            .ok_or_else(|| invalid(format!("{column} out of range: {value}")))
    };
    let interval: i32 = row.try_get("task_interval")?;
    let failures: i32 = row.try_get("consecutive_failures")?;

    Ok(Task {
        task_id,
        task_name: row.try_get("task_name")?,
        task_description: row.try_get("task_description")?,
        display_icon: row.try_get("display_icon")?,
        frequency: Frequency::from_config(&frequency),
        interval_hours: u32::try_from(interval).unwrap_or(1).max(1),
        start_hour: hour("task_start_hour")?,
        end_hour: hour("task_end_hour")?,
        priority: row.try_get("task_priority")?,
        consecutive_failures: u32::try_from(failures).unwrap_or(0),
        last_executed_utc: row.try_get("last_executed_utc")?,
        last_succeeded_utc: row.try_get("last_succeeded_utc")?,
        last_failed_utc: row.try_get("last_failed_utc")?,
        next_planned_execution_utc: row.try_get("next_planned_execution_utc")?,
        last_failure_message: row.try_get("last_failure_message")?,
        stages: StageFlags {
            extract: row.try_get("extract_values")?,
            parse: row.try_get("parse_values")?,
            interpolate: row.try_get("interpolate_values")?,
            forecast: row.try_get("forecast_values")?,
            python: row.try_get("execute_python")?,
        },
        api_service_name: row.try_get("api_service_name")?,
        api_function_name: row.try_get("api_function_name")?,
        api_loop_type: LoopType::from_config(loop_type.as_deref())
            .map_err(|err| invalid(err.to_string()))?,
        api_parameters: row.try_get("api_parameters")?,
        login_function: row.try_get("login_function")?,
        extraction_function: row.try_get("extraction_function")?,
        python_function: row.try_get("python_function")?,
        parse_procedure: row.try_get("parse_procedure")?,
        interpolation_procedure: row.try_get("interpolation_procedure")?,
        forecast_procedure: row.try_get("forecast_procedure")?,
        flatten_procedure: row.try_get("flatten_procedure")?,
    })
}
