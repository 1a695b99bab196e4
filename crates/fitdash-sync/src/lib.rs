//! Task execution engine: gate, session, extract, load, flatten, interpolate,
//! forecast, local jobs and reconciliation, driven once per run or on a cron.

pub mod config;
pub mod extract;
pub mod flatten;
pub mod gate;
pub mod interpolate;
pub mod reconcile;
pub mod session;
pub mod store;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fitdash_adapters::{
    ClientError, ConnectorRegistry, CredentialStore, EnvCredentialStore, JobRegistry, ParamTemplate,
    ServicesFile,
};
use fitdash_core::{
    non_placeholder, FailureKind, ServiceRateLimit, StageTimings, Task, TaskExecutionLog,
};
use fitdash_storage::{HttpClientConfig, HttpFetcher, PgStore, RejectedTask, StorageError, TaskListing};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{EngineConfig, ExtractLimits, InterpolationConfig};
pub use extract::{ExtractRequest, Extractor, ExtractorRegistry, Pacer, TokioPacer};
pub use gate::{GateContext, GateDecision, RunReason, SkipReason};
pub use session::{SessionCache, SessionState};
pub use store::TaskStore;

pub const CRATE_NAME: &str = "fitdash-sync";

/// A failure inside one pipeline stage. Ends the task's attempt, never the run.
#[derive(Debug, Clone, Error)]
#[error("{kind} failed: {message}")]
pub struct StageError {
    pub kind: FailureKind,
    pub message: String,
    pub retry_after_secs: Option<u64>,
}

impl StageError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn from_client(kind: FailureKind, err: &ClientError) -> Self {
        Self {
            kind,
            message: err.to_string(),
            retry_after_secs: err.retry_after(),
        }
    }

    /// No connector means there was never a usable client.
    pub fn from_login(err: &ClientError) -> Self {
        let kind = match err {
            ClientError::NoConnector(_) => FailureKind::Connection,
            _ => FailureKind::Login,
        };
        Self::from_client(kind, err)
    }

    fn wrap(kind: FailureKind) -> impl FnOnce(StorageError) -> Self {
        move |err| Self::new(kind, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded { reason: RunReason },
    Failed { kind: FailureKind, message: String },
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskOutcome {
    pub task_id: i64,
    pub task_name: String,
    pub status: TaskStatus,
    pub timings: StageTimings,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub outcomes: Vec<TaskOutcome>,
}

impl RunSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            outcomes: Vec::new(),
        }
    }

    fn record(&mut self, outcome: TaskOutcome) {
        match outcome.status {
            TaskStatus::Succeeded { .. } => {
                self.attempted += 1;
                self.succeeded += 1;
            }
            TaskStatus::Failed { .. } => {
                self.attempted += 1;
                self.failed += 1;
            }
            TaskStatus::Skipped { .. } => self.skipped += 1,
        }
        self.outcomes.push(outcome);
    }

    /// Text stored in `logging.application_events` for the run.
    pub fn event_description(&self) -> String {
        format!(
            "Attempts: E: {} F: {} || Skips: {}",
            self.succeeded, self.failed, self.skipped
        )
    }
}

fn elapsed_ms(started: Instant) -> Option<i64> {
    Some(i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX))
}

pub struct TaskEngine {
    config: EngineConfig,
    store: Arc<dyn TaskStore>,
    connectors: Arc<ConnectorRegistry>,
    credentials: Arc<dyn CredentialStore>,
    jobs: JobRegistry,
    extractors: ExtractorRegistry,
    pacer: Arc<dyn Pacer>,
    run_lock: Mutex<()>,
}

impl TaskEngine {
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        let store = PgStore::connect(&config.database_url)
            .await
            .context("connecting to database")?;
        Self::new(config, Arc::new(store))
    }

    pub fn new(config: EngineConfig, store: Arc<dyn TaskStore>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let connectors = if config.services_file.exists() {
            let services = ServicesFile::load(&config.services_file)?;
            ConnectorRegistry::from_services(&services, &http)
        } else {
            warn!(
                path = %config.services_file.display(),
                "services file not found; extraction tasks will fail to connect"
            );
            ConnectorRegistry::new()
        };

        Ok(Self {
            config,
            store,
            connectors: Arc::new(connectors),
            credentials: Arc::new(EnvCredentialStore::default()),
            jobs: JobRegistry::with_builtin_jobs(),
            extractors: ExtractorRegistry::default(),
            pacer: Arc::new(TokioPacer),
            run_lock: Mutex::new(()),
        })
    }

    pub fn with_connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = Arc::new(connectors);
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_jobs(mut self, jobs: JobRegistry) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_pacer(mut self, pacer: Arc<dyn Pacer>) -> Self {
        self.pacer = pacer;
        self
    }

    /// One pass over every configured task, or only `force_task` with the gate bypassed.
    pub async fn run_once(&self, force_task: Option<&str>) -> Result<RunSummary> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            anyhow::bail!("another run is already in progress");
        };
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let mut summary = RunSummary::new(run_id, Utc::now());

        let listing = match force_task {
            Some(name) => self.forced_listing(name).await?,
            None => self.store.list_tasks().await.context("loading task configuration")?,
        };
        let TaskListing { tasks, rejected } = listing;

        for row in &rejected {
            summary.record(self.reject_task(row).await);
        }

        let mut session = SessionCache::new(Arc::clone(&self.connectors), Arc::clone(&self.credentials));
        for task in &tasks {
            let span = info_span!(
                "task_run",
                %run_id,
                task_id = task.task_id,
                task_name = %task.task_name
            );
            let outcome = self
                .run_task(task, force_task.is_some(), &mut session)
                .instrument(span)
                .await;
            summary.record(outcome);
        }

        summary.finished_at = Utc::now();
        let description = summary.event_description();
        if let Err(err) = self
            .store
            .insert_application_event("Executor", &description, elapsed_ms(started).unwrap_or(0), None)
            .await
        {
            warn!(error = %err, "failed to record run summary");
        }
        info!(
            %run_id,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "executor run complete"
        );
        Ok(summary)
    }

    async fn forced_listing(&self, name: &str) -> Result<TaskListing> {
        let mut listing = TaskListing::default();
        match self.store.find_task_by_name(name).await {
            Ok(Some(task)) => listing.tasks.push(task),
            Ok(None) => anyhow::bail!("no task named {name}"),
            Err(err @ StorageError::InvalidConfig { id, .. }) => {
                listing.push(id, name.to_string(), Err(err));
            }
            Err(err) => return Err(err).context("loading task configuration"),
        }
        Ok(listing)
    }

    /// A row that could not be read fails as a task of its own; the rest of the run goes on.
    async fn reject_task(&self, row: &RejectedTask) -> TaskOutcome {
        error!(task_id = row.task_id, task_name = %row.task_name, error = %row.message, "task configuration unreadable");
        let log = TaskExecutionLog {
            task_id: row.task_id,
            task_name: row.task_name.clone(),
            timings: StageTimings::default(),
            failure_kind: Some(FailureKind::Config),
            error_text: Some(row.message.clone()),
        };
        if let Err(err) = self.store.insert_task_execution(&log).await {
            warn!(error = %err, "failed to record task execution");
        }
        TaskOutcome {
            task_id: row.task_id,
            task_name: row.task_name.clone(),
            status: TaskStatus::Failed {
                kind: FailureKind::Config,
                message: row.message.clone(),
            },
            timings: StageTimings::default(),
        }
    }

    async fn run_task(&self, task: &Task, forced: bool, session: &mut SessionCache) -> TaskOutcome {
        let now = Utc::now();
        let mut outcome = TaskOutcome {
            task_id: task.task_id,
            task_name: task.task_name.clone(),
            status: TaskStatus::Skipped {
                reason: SkipReason::Inactive,
            },
            timings: StageTimings::default(),
        };

        let recency = match self.store.value_recency(task.task_id).await {
            Ok(recency) => recency,
            Err(err) => {
                warn!(error = %err, "could not read value recency");
                None
            }
        };

        let reason = if forced {
            RunReason::Forced
        } else {
            let rate_limit = match task.service() {
                Some(service) => self.store.service_rate_limit(service).await.unwrap_or_else(|err| {
                    warn!(service, error = %err, "could not read rate limit state");
                    None
                }),
                None => None,
            };
            let ctx = GateContext {
                now,
                reference_tz: self.config.reference_tz,
                max_failures: self.config.max_failures,
                rate_limit: rate_limit.as_ref(),
                value_recency: recency,
            };
            match gate::evaluate(task, &ctx) {
                GateDecision::Run(reason) => reason,
                GateDecision::Skip(reason) => {
                    debug!(reason = ?reason, "task skipped");
                    outcome.status = TaskStatus::Skipped { reason };
                    return outcome;
                }
            }
        };

        info!(reason = ?reason, "running task");
        let result = self
            .execute_stages(task, now, recency, session, &mut outcome.timings)
            .await;

        let finished = Utc::now();
        let (update, failure) = match result {
            Ok(()) => {
                let recency = self.store.value_recency(task.task_id).await.unwrap_or_else(|err| {
                    warn!(error = %err, "could not re-read value recency");
                    None
                });
                outcome.status = TaskStatus::Succeeded { reason };
                info!("task succeeded");
                (
                    reconcile::on_success(task, finished, self.config.reference_tz, recency),
                    None,
                )
            }
            Err(err) => {
                error!(kind = %err.kind, error = %err.message, "task failed");
                if let (Some(service), Some(secs)) = (task.service(), err.retry_after_secs) {
                    self.record_rate_limit(service, finished, secs).await;
                }
                outcome.status = TaskStatus::Failed {
                    kind: err.kind,
                    message: err.message.clone(),
                };
                (
                    reconcile::on_failure(task, finished, &err.to_string(), self.config.failure_backoff),
                    Some(err),
                )
            }
        };

        if let Err(err) = self.store.apply_reconciliation(task.task_id, &update).await {
            warn!(error = %err, "failed to reconcile task");
        }
        let log = TaskExecutionLog {
            task_id: task.task_id,
            task_name: task.task_name.clone(),
            timings: outcome.timings,
            failure_kind: failure.as_ref().map(|f| f.kind),
            error_text: failure.map(|f| f.message),
        };
        if let Err(err) = self.store.insert_task_execution(&log).await {
            warn!(error = %err, "failed to record task execution");
        }
        for event in session.drain_events() {
            if let Err(err) = self.store.insert_login_event(&event).await {
                warn!(error = %err, "failed to record login event");
            }
        }
        outcome
    }

    async fn execute_stages(
        &self,
        task: &Task,
        now: DateTime<Utc>,
        recency: Option<DateTime<Utc>>,
        session: &mut SessionCache,
        timings: &mut StageTimings,
    ) -> Result<(), StageError> {
        if let Some(service) = task.service().filter(|_| task.runs_extraction()) {
            let client = session
                .login(service, task.login_function.as_deref(), now)
                .await
                .map_err(|err| StageError::from_login(&err))?;

            let extractor = self.extractors.for_task(task).ok_or_else(|| {
                StageError::new(
                    FailureKind::Extract,
                    format!(
                        "no extraction strategy for {}",
                        task.extraction_function.as_deref().unwrap_or("loop type")
                    ),
                )
            })?;
            let function = non_placeholder(task.api_function_name.as_deref())
                .ok_or_else(|| StageError::new(FailureKind::Extract, "task has no api function"))?;

            let tz = self.config.reference_tz;
            let request = ExtractRequest {
                client: client.as_ref(),
                function,
                template: ParamTemplate::parse(task.api_parameters.as_deref()),
                now,
                today: now.with_timezone(&tz).date_naive(),
                recency: recency.map(|r| r.with_timezone(&tz).date_naive()),
                limits: self.config.extract,
            };

            let started = Instant::now();
            let extracted = extractor.extract(&request, self.pacer.as_ref()).await;
            timings.extract_ms = elapsed_ms(started);
            let records = extracted.map_err(|err| {
                session.invalidate();
                StageError::from_client(FailureKind::Extract, &err)
            })?;
            info!(strategy = extractor.name(), records = records.len(), "extracted records");

            let started = Instant::now();
            if records.is_empty() {
                info!("no records to load");
            } else {
                let rows = self
                    .store
                    .insert_payloads(task.task_id, &records)
                    .await
                    .map_err(StageError::wrap(FailureKind::Load))?;
                debug!(rows, "staged payloads");
            }
            timings.load_ms = elapsed_ms(started);
        }

        if task.stages.parse {
            let started = Instant::now();
            let result = self.store.flatten(task).await;
            timings.transform_ms = elapsed_ms(started);
            result.map_err(StageError::wrap(FailureKind::Flatten))?;
        }

        if task.stages.interpolate {
            let started = Instant::now();
            let result = self.interpolate(task, now).await;
            timings.interpolation_ms = elapsed_ms(started);
            result?;
        }

        if task.stages.forecast {
            let started = Instant::now();
            let result = match non_placeholder(task.forecast_procedure.as_deref()) {
                Some(procedure) => self.store.call_procedure(procedure).await,
                None => {
                    debug!("forecast stage enabled without a procedure");
                    Ok(())
                }
            };
            timings.forecast_ms = elapsed_ms(started);
            result.map_err(StageError::wrap(FailureKind::Forecast))?;
        }

        if let Some(reference) = non_placeholder(task.python_function.as_deref()).filter(|_| task.runs_python()) {
            let job = self.jobs.get(reference).ok_or_else(|| {
                StageError::new(FailureKind::Python, format!("no local job registered as {reference}"))
            })?;
            let started = Instant::now();
            let result = self.store.run_job(job.as_ref(), now).await;
            timings.python_ms = elapsed_ms(started);
            result.map_err(|err| StageError::new(FailureKind::Python, format!("{err:#}")))?;
        }

        Ok(())
    }

    async fn interpolate(&self, task: &Task, now: DateTime<Utc>) -> Result<(), StageError> {
        let report = self
            .store
            .interpolate(task, &self.config.interpolation, now)
            .await
            .map_err(StageError::wrap(FailureKind::Interpolation))?;
        debug!(
            windows = report.windows,
            buckets = report.buckets_written,
            "built-in interpolation complete"
        );
        if let Some(procedure) = non_placeholder(task.interpolation_procedure.as_deref()) {
            self.store
                .call_procedure(procedure)
                .await
                .map_err(StageError::wrap(FailureKind::Interpolation))?;
        }
        Ok(())
    }

    async fn record_rate_limit(&self, service: &str, now: DateTime<Utc>, retry_after_secs: u64) {
        let secs = i64::try_from(retry_after_secs).unwrap_or(i64::MAX).min(86_400 * 7);
        let limit = ServiceRateLimit {
            service: service.to_string(),
            detected_utc: Some(now),
            cleared_utc: Some(now + chrono::Duration::seconds(secs)),
        };
        warn!(service, retry_after_secs, "service rate limited");
        if let Err(err) = self.store.record_rate_limit(&limit).await {
            warn!(service, error = %err, "failed to record rate limit");
        }
    }

    /// Closes the circuit breaker for one task by name.
    pub async fn reset_task(&self, task_name: &str) -> Result<bool> {
        let Some(task) = self.store.find_task_by_name(task_name).await? else {
            return Ok(false);
        };
        let reset = self.store.reset_failures(task.task_id).await?;
        info!(task = task_name, "task failures reset");
        Ok(reset)
    }

    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.schedule_cron.clone();
        let engine = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                match engine.run_once(None).await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled run finished"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_once_from_env(force_task: Option<&str>) -> Result<RunSummary> {
    let engine = TaskEngine::connect(EngineConfig::from_env()).await?;
    engine.run_once(force_task).await
}
