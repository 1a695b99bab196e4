//! Service registry loaded from `services.yaml` and the generic HTTP JSON connector.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use fitdash_storage::{HttpFetcher, RequestAuth};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::credentials::{require, Credentials};
use crate::{short_name, ApiArgs, ApiClient, ClientError, LoginOutcome, ServiceConnector};

#[derive(Debug, Clone, Deserialize)]
pub struct ServicesFile {
    pub services: Vec<ServiceConfig>,
}

impl ServicesFile {
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let parsed: Self = serde_yaml::from_str(yaml).context("parsing services registry")?;
        let mut seen = std::collections::HashSet::new();
        for service in &parsed.services {
            if !seen.insert(service.name.to_ascii_lowercase()) {
                bail!("service {} is declared twice", service.name);
            }
        }
        Ok(parsed)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&yaml)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// Login function references (as written in task rows) served by this service.
    #[serde(default)]
    pub login_functions: Vec<String>,
    pub base_url: String,
    pub auth: AuthConfig,
    #[serde(default)]
    pub probe_path: Option<String>,
    #[serde(default)]
    pub probe_after_secs: u64,
    #[serde(default)]
    pub max_session_age_secs: Option<u64>,
    /// Credential fields that may appear as `{field}` placeholders in paths.
    #[serde(default)]
    pub path_credentials: Vec<String>,
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthConfig {
    /// OAuth refresh-token grant with client id/secret basic auth.
    RefreshToken { token_url: String },
    /// A long-lived token stored as the `token` credential.
    BearerToken,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct FunctionConfig {
    pub path: String,
    /// Names given to positional arguments, in order.
    #[serde(default)]
    pub positional: Vec<String>,
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
}

impl FunctionConfig {
    /// Fills `{name}` path placeholders; leftover parameters become the query string.
    pub fn resolve(
        &self,
        service: &str,
        function: &str,
        args: &ApiArgs,
        context: &BTreeMap<String, String>,
    ) -> Result<(String, Vec<(String, String)>), ClientError> {
        if args.positional.len() > self.positional.len() {
            return Err(ClientError::Response {
                service: service.to_string(),
                message: format!(
                    "{function} takes {} positional arguments, got {}",
                    self.positional.len(),
                    args.positional.len()
                ),
            });
        }

        let mut params = self.defaults.clone();
        for (name, value) in self.positional.iter().zip(&args.positional) {
            params.insert(name.clone(), value.clone());
        }
        for (name, value) in &args.named {
            params.insert(name.clone(), value.clone());
        }

        let mut path = String::with_capacity(self.path.len());
        let mut rest = self.path.as_str();
        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}').map(|i| open + i) else {
                break;
            };
            path.push_str(&rest[..open]);
            let name = &rest[open + 1..close];
            let value = params
                .remove(name)
                .or_else(|| context.get(name).cloned())
                .ok_or_else(|| ClientError::Response {
                    service: service.to_string(),
                    message: format!("{function} needs a value for `{name}`"),
                })?;
            path.push_str(&value);
            rest = &rest[close + 1..];
        }
        path.push_str(rest);

        Ok((path, params.into_iter().collect()))
    }
}

/// Connector for JSON-over-HTTPS services described in `services.yaml`.
#[derive(Debug, Clone)]
pub struct HttpJsonConnector {
    config: Arc<ServiceConfig>,
    http: HttpFetcher,
}

impl HttpJsonConnector {
    pub fn new(config: ServiceConfig, http: HttpFetcher) -> Self {
        Self {
            config: Arc::new(config),
            http,
        }
    }

    async fn access_token(&self, credentials: &Credentials) -> Result<String, ClientError> {
        let service = self.config.name.as_str();
        match &self.config.auth {
            AuthConfig::BearerToken => Ok(require(credentials, service, "token")?.to_string()),
            AuthConfig::RefreshToken { token_url } => {
                let client_id = require(credentials, service, "client_id")?;
                let client_secret = require(credentials, service, "client_secret")?;
                let refresh_token = require(credentials, service, "refresh_token")?;
                let form = vec![
                    ("grant_type".to_string(), "refresh_token".to_string()),
                    ("refresh_token".to_string(), refresh_token.to_string()),
                ];
                let body = self
                    .http
                    .post_form(
                        service,
                        token_url,
                        RequestAuth::Basic {
                            user: client_id,
                            password: client_secret,
                        },
                        &form,
                    )
                    .await
                    .map_err(|err| ClientError::from_fetch(service, err))?;
                body.get("access_token")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| ClientError::Login {
                        service: service.to_string(),
                        message: "token response has no access_token".to_string(),
                    })
            }
        }
    }
}

#[async_trait]
impl ServiceConnector for HttpJsonConnector {
    fn service(&self) -> &str {
        &self.config.name
    }

    fn probe_after(&self) -> Duration {
        Duration::from_secs(self.config.probe_after_secs)
    }

    fn max_session_age(&self) -> Option<Duration> {
        self.config.max_session_age_secs.map(Duration::from_secs)
    }

    async fn login(&self, credentials: &Credentials) -> Result<LoginOutcome, ClientError> {
        let token = self.access_token(credentials).await?;
        let context = self
            .config
            .path_credentials
            .iter()
            .filter_map(|field| credentials.get(field).map(|v| (field.clone(), v.clone())))
            .collect();
        let client = HttpJsonClient {
            config: Arc::clone(&self.config),
            http: self.http.clone(),
            token: token.clone(),
            context,
        };
        Ok(LoginOutcome {
            client: Arc::new(client),
            token,
        })
    }
}

#[derive(Debug)]
struct HttpJsonClient {
    config: Arc<ServiceConfig>,
    http: HttpFetcher,
    token: String,
    context: BTreeMap<String, String>,
}

impl HttpJsonClient {
    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn get(&self, path: &str, query: &[(String, String)]) -> Result<JsonValue, ClientError> {
        let service = self.config.name.as_str();
        self.http
            .get_json(service, &self.url_for(path), RequestAuth::Bearer(&self.token), query)
            .await
            .map_err(|err| ClientError::from_fetch(service, err))
    }
}

#[async_trait]
impl ApiClient for HttpJsonClient {
    fn service(&self) -> &str {
        &self.config.name
    }

    async fn call(&self, function: &str, args: &ApiArgs) -> Result<JsonValue, ClientError> {
        let service = self.config.name.as_str();
        let spec = self
            .config
            .functions
            .get(function)
            .or_else(|| self.config.functions.get(short_name(function)))
            .ok_or_else(|| ClientError::UnknownFunction {
                service: service.to_string(),
                function: function.to_string(),
            })?;
        let (path, query) = spec.resolve(service, function, args, &self.context)?;
        debug!(service, function, path, "calling api function");
        self.get(&path, &query).await
    }

    async fn next_page(&self, previous: &JsonValue) -> Result<JsonValue, ClientError> {
        let next = previous
            .get("next")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| ClientError::Response {
                service: self.config.name.clone(),
                message: "page has no next cursor".to_string(),
            })?;
        self.get(next, &[]).await
    }

    async fn probe(&self) -> Result<(), ClientError> {
        match &self.config.probe_path {
            Some(path) => self.get(path, &[]).await.map(|_| ()),
            None => Ok(()),
        }
    }
}

/// Maps services and login-function references onto connectors.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<String, Arc<dyn ServiceConnector>>,
    aliases: BTreeMap<String, String>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_services(file: &ServicesFile, http: &HttpFetcher) -> Self {
        let mut registry = Self::new();
        for service in &file.services {
            for login in &service.login_functions {
                registry.register_alias(login, &service.name);
            }
            registry.register(Arc::new(HttpJsonConnector::new(service.clone(), http.clone())));
        }
        registry
    }

    pub fn register(&mut self, connector: Arc<dyn ServiceConnector>) {
        self.connectors
            .insert(connector.service().to_ascii_lowercase(), connector);
    }

    pub fn register_alias(&mut self, login_function: &str, service: &str) {
        self.aliases.insert(
            login_function.trim().to_ascii_lowercase(),
            service.to_ascii_lowercase(),
        );
    }

    /// Looks up by login function (full reference, then short name), then by service.
    pub fn resolve(
        &self,
        service: &str,
        login_function: Option<&str>,
    ) -> Option<Arc<dyn ServiceConnector>> {
        let by_alias = fitdash_core::non_placeholder(login_function).and_then(|login| {
            let full = login.to_ascii_lowercase();
            let short = short_name(login).to_ascii_lowercase();
            self.aliases
                .get(&full)
                .or_else(|| self.aliases.get(&short))
                .and_then(|key| self.connectors.get(key))
        });
        by_alias
            .or_else(|| self.connectors.get(&service.to_ascii_lowercase()))
            .cloned()
    }

    pub fn services(&self) -> Vec<&str> {
        self.connectors.values().map(|c| c.service()).collect()
    }
}
