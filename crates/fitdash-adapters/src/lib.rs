//! External collaborator contracts: API clients, service connectors,
//! credential stores and locally executed jobs.

pub mod credentials;
pub mod jobs;
pub mod services;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fitdash_storage::FetchError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use credentials::{CredentialStore, Credentials, EnvCredentialStore};
pub use jobs::{JobRegistry, LocalJob, MaintenanceKind, MaintenanceStore, NightlyMaintenance};
pub use services::{ConnectorRegistry, HttpJsonConnector, ServicesFile};

pub const CRATE_NAME: &str = "fitdash-adapters";

pub const CURRENT_TS_TOKEN: &str = "*CURR_TS*";
pub const DATE_FROM_TOKEN: &str = "*D1*";
pub const DATE_TO_TOKEN: &str = "*D2*";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no connector registered for service {0}")]
    NoConnector(String),
    #[error("missing credential field `{field}` for {service}")]
    MissingCredential { service: String, field: String },
    #[error("unknown api function `{function}` for {service}")]
    UnknownFunction { service: String, function: String },
    #[error("service {service} is rate limited; retry after {retry_after_secs}s")]
    RateLimited {
        service: String,
        retry_after_secs: u64,
    },
    #[error("login to {service} failed: {message}")]
    Login { service: String, message: String },
    #[error("unexpected response from {service}: {message}")]
    Response { service: String, message: String },
    #[error("{service} request failed: {source}")]
    Fetch {
        service: String,
        #[source]
        source: FetchError,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl ClientError {
    /// Lifts fetch failures, keeping 429s distinguishable for rate-limit bookkeeping.
    pub fn from_fetch(service: &str, err: FetchError) -> Self {
        match err {
            FetchError::RateLimited {
                retry_after_secs, ..
            } => ClientError::RateLimited {
                service: service.to_string(),
                retry_after_secs,
            },
            other => ClientError::Fetch {
                service: service.to_string(),
                source: other,
            },
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ClientError::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// Arguments for one API function call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiArgs {
    pub positional: Vec<String>,
    pub named: BTreeMap<String, String>,
}

impl ApiArgs {
    pub fn with_named(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.named.insert(key.into(), value.into());
        self
    }

    pub fn named(&self, key: &str) -> Option<&str> {
        self.named.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplateEntry {
    Positional(String),
    Named(String, String),
}

/// Values substituted into a [`ParamTemplate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateValues {
    pub now: DateTime<Utc>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

impl TemplateValues {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            date_from: None,
            date_to: None,
        }
    }

    pub fn with_dates(mut self, from: impl Into<String>, to: Option<String>) -> Self {
        self.date_from = Some(from.into());
        self.date_to = to;
        self
    }
}

/// Comma-separated `api_parameters`: `key=value` entries are named, the rest positional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamTemplate {
    entries: Vec<TemplateEntry>,
}

impl ParamTemplate {
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = fitdash_core::non_placeholder(raw) else {
            return Self::default();
        };
        let entries = raw
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    TemplateEntry::Named(key.trim().to_string(), value.trim().to_string())
                }
                _ => TemplateEntry::Positional(entry.to_string()),
            })
            .collect();
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn render(&self, values: &TemplateValues) -> ApiArgs {
        let substitute = |text: &str| {
            let mut out = text.replace(CURRENT_TS_TOKEN, &values.now.timestamp_millis().to_string());
            if let Some(from) = &values.date_from {
                out = out.replace(DATE_FROM_TOKEN, from);
            }
            if let Some(to) = &values.date_to {
                out = out.replace(DATE_TO_TOKEN, to);
            }
            out
        };

        let mut args = ApiArgs::default();
        for entry in &self.entries {
            match entry {
                TemplateEntry::Positional(value) => args.positional.push(substitute(value)),
                TemplateEntry::Named(key, value) => {
                    args.named.insert(key.clone(), substitute(value));
                }
            }
        }
        args
    }
}

/// An authenticated handle onto one external service.
#[async_trait]
pub trait ApiClient: Send + Sync {
    fn service(&self) -> &str;

    async fn call(&self, function: &str, args: &ApiArgs) -> Result<JsonValue, ClientError>;

    /// Follows the `next` cursor of a page returned by an earlier call.
    async fn next_page(&self, previous: &JsonValue) -> Result<JsonValue, ClientError>;

    /// Cheap liveness check used before reusing a cached session.
    async fn probe(&self) -> Result<(), ClientError>;
}

pub struct LoginOutcome {
    pub client: Arc<dyn ApiClient>,
    pub token: String,
}

impl std::fmt::Debug for LoginOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginOutcome")
            .field("service", &self.client.service())
            .finish_non_exhaustive()
    }
}

/// Produces authenticated [`ApiClient`]s for one service.
#[async_trait]
pub trait ServiceConnector: Send + Sync {
    fn service(&self) -> &str;

    /// Sessions younger than this are reused without a liveness probe.
    fn probe_after(&self) -> Duration {
        Duration::ZERO
    }

    /// Sessions older than this are replaced by a fresh login.
    fn max_session_age(&self) -> Option<Duration> {
        None
    }

    async fn login(&self, credentials: &Credentials) -> Result<LoginOutcome, ClientError>;
}

/// Last segment of a dotted `module.function` reference.
pub fn short_name(reference: &str) -> &str {
    reference.rsplit('.').next().unwrap_or(reference).trim()
}
