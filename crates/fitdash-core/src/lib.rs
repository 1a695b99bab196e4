//! Core domain model for the fitdash task engine.
//!
//! Everything here is plain data: task configuration rows, staging/fact
//! mappings and the records the engine writes back after each attempt.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "fitdash-core";

/// Default staging table every raw API response lands in.
pub const STAGING_PAYLOAD_TABLE: &str = "staging.api_imports";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognised {kind} value `{value}`")]
pub struct ParseConfigError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseConfigError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Schedule class of a task.
///
/// `Unknown` keeps rows with a frequency the engine does not recognise
/// schedulable; they fall through to the daily-style rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Inactive,
    Unknown,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Hourly => "Hourly",
            Frequency::Daily => "Daily",
            Frequency::Weekly => "Weekly",
            Frequency::Monthly => "Monthly",
            Frequency::Inactive => "Inactive",
            Frequency::Unknown => "Unknown",
        }
    }

    /// Lenient parse used when reading configuration rows. `Retired` is the
    /// legacy spelling of `Inactive`.
    pub fn from_config(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "hourly" => Frequency::Hourly,
            "daily" => Frequency::Daily,
            "weekly" => Frequency::Weekly,
            "monthly" => Frequency::Monthly,
            "inactive" | "retired" => Frequency::Inactive,
            _ => Frequency::Unknown,
        }
    }

    /// Days between runs for the calendar-anchored frequencies.
    pub fn offset_days(&self) -> Option<i64> {
        match self {
            Frequency::Daily => Some(1),
            Frequency::Weekly => Some(7),
            Frequency::Monthly => Some(30),
            _ => None,
        }
    }

    /// How stale data may get before a task is considered behind schedule.
    pub fn period(&self, interval_hours: u32) -> Option<Duration> {
        match self {
            Frequency::Hourly => Some(Duration::hours(i64::from(interval_hours.max(1)))),
            other => other.offset_days().map(Duration::days),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the extraction stage walks an API function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopType {
    NoLoop,
    Next,
    Day,
    Range,
}

impl LoopType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopType::NoLoop => "N/A",
            LoopType::Next => "Next",
            LoopType::Day => "Day",
            LoopType::Range => "Range",
        }
    }

    pub fn from_config(value: Option<&str>) -> Result<Self, ParseConfigError> {
        let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            return Ok(LoopType::NoLoop);
        };
        match raw.to_ascii_lowercase().as_str() {
            "n/a" | "none" => Ok(LoopType::NoLoop),
            "next" => Ok(LoopType::Next),
            "day" | "single_day" => Ok(LoopType::Day),
            "range" | "date_range" => Ok(LoopType::Range),
            _ => Err(ParseConfigError::new("api loop type", raw)),
        }
    }
}

/// Column types a fact mapping may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    Text,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Numeric,
    Boolean,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Interval,
    Json,
    Jsonb,
    Uuid,
}

impl SqlType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::SmallInt => "SMALLINT",
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Real => "REAL",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Numeric => "NUMERIC",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Date => "DATE",
            SqlType::Time => "TIME",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::TimestampTz => "TIMESTAMPTZ",
            SqlType::Interval => "INTERVAL",
            SqlType::Json => "JSON",
            SqlType::Jsonb => "JSONB",
            SqlType::Uuid => "UUID",
        }
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, SqlType::Date | SqlType::Timestamp | SqlType::TimestampTz)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            SqlType::SmallInt
                | SqlType::Integer
                | SqlType::BigInt
                | SqlType::Real
                | SqlType::Double
                | SqlType::Numeric
        )
    }
}

impl FromStr for SqlType {
    type Err = ParseConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_lowercase();
        let ty = match normalized.as_str() {
            "text" | "varchar" | "character varying" | "string" => SqlType::Text,
            "smallint" | "int2" => SqlType::SmallInt,
            "integer" | "int" | "int4" => SqlType::Integer,
            "bigint" | "int8" => SqlType::BigInt,
            "real" | "float4" => SqlType::Real,
            "double precision" | "double" | "float8" | "float" => SqlType::Double,
            "numeric" | "decimal" => SqlType::Numeric,
            "boolean" | "bool" => SqlType::Boolean,
            "date" => SqlType::Date,
            "time" => SqlType::Time,
            "timestamp" | "timestamp without time zone" => SqlType::Timestamp,
            "timestamptz" | "timestamp with time zone" => SqlType::TimestampTz,
            "interval" => SqlType::Interval,
            "json" => SqlType::Json,
            "jsonb" => SqlType::Jsonb,
            "uuid" => SqlType::Uuid,
            _ => return Err(ParseConfigError::new("sql data type", value)),
        };
        Ok(ty)
    }
}

/// Which pipeline stages a task opts into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageFlags {
    pub extract: bool,
    pub parse: bool,
    pub interpolate: bool,
    pub forecast: bool,
    pub python: bool,
}

/// One configured recurring job (`tasks.task_configuration`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: i64,
    pub task_name: String,
    pub task_description: Option<String>,
    pub display_icon: Option<String>,
    pub frequency: Frequency,
    pub interval_hours: u32,
    pub start_hour: u32,
    pub end_hour: u32,
    pub priority: i32,
    pub consecutive_failures: u32,
    pub last_executed_utc: Option<DateTime<Utc>>,
    pub last_succeeded_utc: Option<DateTime<Utc>>,
    pub last_failed_utc: Option<DateTime<Utc>>,
    pub next_planned_execution_utc: Option<DateTime<Utc>>,
    pub last_failure_message: Option<String>,
    pub stages: StageFlags,
    pub api_service_name: Option<String>,
    pub api_function_name: Option<String>,
    pub api_loop_type: LoopType,
    pub api_parameters: Option<String>,
    pub login_function: Option<String>,
    pub extraction_function: Option<String>,
    pub python_function: Option<String>,
    pub parse_procedure: Option<String>,
    pub interpolation_procedure: Option<String>,
    pub forecast_procedure: Option<String>,
    pub flatten_procedure: Option<String>,
}

impl Task {
    /// Placeholder used by the admin surface before a task is filled in.
    pub fn new(task_id: i64, task_name: impl Into<String>) -> Self {
        Self {
            task_id,
            task_name: task_name.into(),
            task_description: None,
            display_icon: None,
            frequency: Frequency::Inactive,
            interval_hours: 1,
            start_hour: 1,
            end_hour: 23,
            priority: 100,
            consecutive_failures: 0,
            last_executed_utc: None,
            last_succeeded_utc: None,
            last_failed_utc: None,
            next_planned_execution_utc: None,
            last_failure_message: None,
            stages: StageFlags::default(),
            api_service_name: None,
            api_function_name: None,
            api_loop_type: LoopType::NoLoop,
            api_parameters: None,
            login_function: None,
            extraction_function: None,
            python_function: None,
            parse_procedure: None,
            interpolation_procedure: None,
            forecast_procedure: None,
            flatten_procedure: None,
        }
    }

    /// The service this task talks to, ignoring the `N/A` placeholder.
    pub fn service(&self) -> Option<&str> {
        non_placeholder(self.api_service_name.as_deref())
    }

    pub fn runs_extraction(&self) -> bool {
        self.stages.extract && self.service().is_some()
    }

    pub fn runs_python(&self) -> bool {
        self.stages.python && non_placeholder(self.python_function.as_deref()).is_some()
    }
}

/// Treats empty strings and the admin UI's `N/A` as absent.
pub fn non_placeholder(value: Option<&str>) -> Option<&str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("n/a"))
}

/// Raw payload → destination table mapping (`tasks.staging_configuration`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingMapping {
    pub staging_id: i64,
    pub task_id: i64,
    pub staging_name: Option<String>,
    pub source_table: Option<String>,
    pub destination_table: String,
    pub cross_join_condition: Option<String>,
    pub filter_condition: Option<String>,
}

impl StagingMapping {
    pub fn source_table(&self) -> &str {
        non_placeholder(self.source_table.as_deref()).unwrap_or(STAGING_PAYLOAD_TABLE)
    }
}

/// One column-level extraction rule (`tasks.fact_configuration`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactMapping {
    pub fact_id: i64,
    pub task_id: i64,
    pub staging_id: i64,
    pub fact_name: String,
    pub extraction_sql: String,
    pub data_type: SqlType,
    pub is_unique_constraint: bool,
    pub interpolation_ts: bool,
    pub interpolate_values: bool,
    pub infer_values: bool,
    pub forecast_values: bool,
    pub interpolation_destination_table: Option<String>,
    pub max_ts_utc: Option<DateTime<Utc>>,
}

/// Stage a task attempt failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The task's configuration row could not be read.
    Config,
    Connection,
    Login,
    Extract,
    Load,
    Flatten,
    Interpolation,
    Forecast,
    Python,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Config => "Config",
            FailureKind::Connection => "Connection",
            FailureKind::Login => "Login",
            FailureKind::Extract => "Extract",
            FailureKind::Load => "Load",
            FailureKind::Flatten => "Flatten",
            FailureKind::Interpolation => "Interpolation",
            FailureKind::Forecast => "Forecast",
            FailureKind::Python => "Python",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Elapsed milliseconds per stage for one attempt; `None` when a stage did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageTimings {
    pub extract_ms: Option<i64>,
    pub load_ms: Option<i64>,
    pub transform_ms: Option<i64>,
    pub interpolation_ms: Option<i64>,
    pub forecast_ms: Option<i64>,
    pub python_ms: Option<i64>,
}

/// Row written to `logging.task_executions` after every attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionLog {
    pub task_id: i64,
    pub task_name: String,
    pub timings: StageTimings,
    pub failure_kind: Option<FailureKind>,
    pub error_text: Option<String>,
}

/// Row written to `logging.api_logins`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginEvent {
    pub service: String,
    pub event: String,
    pub token_age_secs: Option<f64>,
    pub error_text: Option<String>,
}

/// Task row changes produced by reconciliation. `None` leaves a column untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReconciliation {
    pub consecutive_failures: u32,
    pub next_planned_execution_utc: DateTime<Utc>,
    pub last_executed_utc: DateTime<Utc>,
    pub last_succeeded_utc: Option<DateTime<Utc>>,
    pub last_failed_utc: Option<DateTime<Utc>>,
    pub last_failure_message: Option<String>,
}

/// Centrally recorded block on calling one external service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRateLimit {
    pub service: String,
    pub detected_utc: Option<DateTime<Utc>>,
    pub cleared_utc: Option<DateTime<Utc>>,
}

impl ServiceRateLimit {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.cleared_utc.is_some_and(|cleared| now < cleared)
    }
}
