//! Per-run cache of the authenticated client for the service currently in use.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fitdash_adapters::{ApiClient, ClientError, ConnectorRegistry, CredentialStore};
use fitdash_core::LoginEvent;
use tracing::{debug, info, warn};

pub struct ClientSession {
    pub service: String,
    pub client: Arc<dyn ApiClient>,
    pub token: String,
    pub authenticated_at: DateTime<Utc>,
    probe_after: Duration,
    max_age: Option<Duration>,
}

impl ClientSession {
    fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.authenticated_at).to_std().unwrap_or(Duration::ZERO)
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("service", &self.service)
            .field("authenticated_at", &self.authenticated_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub enum SessionState {
    #[default]
    Unauthenticated,
    Authenticated(ClientSession),
    Failed { service: String, error: String },
}

pub struct SessionCache {
    connectors: Arc<ConnectorRegistry>,
    credentials: Arc<dyn CredentialStore>,
    state: SessionState,
    events: Vec<LoginEvent>,
}

impl SessionCache {
    pub fn new(connectors: Arc<ConnectorRegistry>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            connectors,
            credentials,
            state: SessionState::Unauthenticated,
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Returns a client for `service`, reusing the held session when it is for
    /// the same service and still alive.
    pub async fn login(
        &mut self,
        service: &str,
        login_function: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Arc<dyn ApiClient>, ClientError> {
        if let SessionState::Authenticated(session) = &self.state {
            if session.service.eq_ignore_ascii_case(service) {
                let age = session.age(now);
                let expired = session.max_age.is_some_and(|max| age >= max);
                if !expired && age < session.probe_after {
                    debug!(service, age_secs = age.as_secs(), "reusing recent session");
                    return Ok(Arc::clone(&session.client));
                }
                if !expired {
                    match session.client.probe().await {
                        Ok(()) => {
                            debug!(service, "session probe ok");
                            return Ok(Arc::clone(&session.client));
                        }
                        Err(err) => {
                            warn!(service, error = %err, "session probe failed; logging in again");
                            self.record(service, "probe_failed", Some(age), Some(err.to_string()));
                        }
                    }
                } else {
                    self.record(service, "session_expired", Some(age), None);
                }
            }
        }

        self.fresh_login(service, login_function, now).await
    }

    async fn fresh_login(
        &mut self,
        service: &str,
        login_function: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Arc<dyn ApiClient>, ClientError> {
        self.state = SessionState::Unauthenticated;
        let result = async {
            let connector = self
                .connectors
                .resolve(service, login_function)
                .ok_or_else(|| ClientError::NoConnector(service.to_string()))?;
            let credentials = self.credentials.decrypt(connector.service())?;
            let outcome = connector.login(&credentials).await?;
            Ok::<_, ClientError>((connector, outcome))
        }
        .await;

        match result {
            Ok((connector, outcome)) => {
                info!(service, "logged in");
                self.record(service, "login", Some(Duration::ZERO), None);
                let client = Arc::clone(&outcome.client);
                self.state = SessionState::Authenticated(ClientSession {
                    service: service.to_string(),
                    client: outcome.client,
                    token: outcome.token,
                    authenticated_at: now,
                    probe_after: connector.probe_after(),
                    max_age: connector.max_session_age(),
                });
                Ok(client)
            }
            Err(err) => {
                warn!(service, error = %err, "login failed");
                self.record(service, "login_failed", None, Some(err.to_string()));
                self.state = SessionState::Failed {
                    service: service.to_string(),
                    error: err.to_string(),
                };
                Err(err)
            }
        }
    }

    /// Drops the held session after a call against it raised.
    pub fn invalidate(&mut self) {
        if let SessionState::Authenticated(session) = &self.state {
            debug!(service = %session.service, "invalidating session");
        }
        self.state = SessionState::Unauthenticated;
    }

    /// Login events recorded since the last drain, oldest first.
    pub fn drain_events(&mut self) -> Vec<LoginEvent> {
        std::mem::take(&mut self.events)
    }

    fn record(&mut self, service: &str, event: &str, age: Option<Duration>, error: Option<String>) {
        self.events.push(LoginEvent {
            service: service.to_string(),
            event: event.to_string(),
            token_age_secs: age.map(|a| a.as_secs_f64()),
            error_text: error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use fitdash_adapters::{ApiArgs, Credentials, LoginOutcome, ServiceConnector};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockClient {
        service: String,
        alive: Arc<AtomicBool>,
        probes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ApiClient for MockClient {
        fn service(&self) -> &str {
            &self.service
        }

        async fn call(&self, _function: &str, _args: &ApiArgs) -> Result<Value, ClientError> {
            Ok(json!({}))
        }

        async fn next_page(&self, _previous: &Value) -> Result<Value, ClientError> {
            Ok(Value::Null)
        }

        async fn probe(&self) -> Result<(), ClientError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.alive.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ClientError::Anyhow(anyhow::anyhow!("token revoked")))
            }
        }
    }

    struct MockConnector {
        service: &'static str,
        logins: Arc<AtomicUsize>,
        alive: Arc<AtomicBool>,
        probes: Arc<AtomicUsize>,
        probe_after: Duration,
        max_age: Option<Duration>,
    }

    impl MockConnector {
        fn new(service: &'static str) -> Self {
            Self {
                service,
                logins: Arc::default(),
                alive: Arc::new(AtomicBool::new(true)),
                probes: Arc::default(),
                probe_after: Duration::ZERO,
                max_age: None,
            }
        }
    }

    #[async_trait]
    impl ServiceConnector for MockConnector {
        fn service(&self) -> &str {
            self.service
        }

        fn probe_after(&self) -> Duration {
            self.probe_after
        }

        fn max_session_age(&self) -> Option<Duration> {
            self.max_age
        }

        async fn login(&self, credentials: &Credentials) -> Result<LoginOutcome, ClientError> {
            if credentials.get("token").is_none() {
                return Err(ClientError::Login {
                    service: self.service.to_string(),
                    message: "no token".into(),
                });
            }
            let n = self.logins.fetch_add(1, Ordering::SeqCst);
            Ok(LoginOutcome {
                client: Arc::new(MockClient {
                    service: self.service.to_string(),
                    alive: Arc::clone(&self.alive),
                    probes: Arc::clone(&self.probes),
                }),
                token: format!("token-{n}"),
            })
        }
    }

    struct FixedCredentials(BTreeMap<String, Credentials>);

    impl CredentialStore for FixedCredentials {
        fn decrypt(&self, service: &str) -> Result<Credentials, ClientError> {
            Ok(self.0.get(service).cloned().unwrap_or_default())
        }
    }

    fn credentials() -> Arc<dyn CredentialStore> {
        let token = Credentials::from([("token".to_string(), "t".to_string())]);
        Arc::new(FixedCredentials(BTreeMap::from([
            ("Spotify".to_string(), token.clone()),
            ("Garmin".to_string(), token),
        ])))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).single().unwrap()
    }

    fn cache_with(connectors: Vec<MockConnector>) -> SessionCache {
        let mut registry = ConnectorRegistry::new();
        for connector in connectors {
            registry.register(Arc::new(connector));
        }
        SessionCache::new(Arc::new(registry), credentials())
    }

    #[tokio::test]
    async fn same_service_reuses_live_session() {
        let spotify = MockConnector::new("Spotify");
        let logins = Arc::clone(&spotify.logins);
        let probes = Arc::clone(&spotify.probes);
        let mut cache = cache_with(vec![spotify]);

        cache.login("Spotify", None, t0()).await.unwrap();
        cache.login("spotify", None, t0() + chrono::Duration::minutes(1)).await.unwrap();

        assert_eq!(logins.load(Ordering::SeqCst), 1);
        assert_eq!(probes.load(Ordering::SeqCst), 1);
        let events = cache.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "login");
        assert!(cache.drain_events().is_empty());
    }

    #[tokio::test]
    async fn service_change_or_dead_probe_forces_fresh_login() {
        let spotify = MockConnector::new("Spotify");
        let spotify_logins = Arc::clone(&spotify.logins);
        let spotify_alive = Arc::clone(&spotify.alive);
        let garmin = MockConnector::new("Garmin");
        let garmin_logins = Arc::clone(&garmin.logins);
        let mut cache = cache_with(vec![spotify, garmin]);

        cache.login("Spotify", None, t0()).await.unwrap();
        cache.login("Garmin", None, t0()).await.unwrap();
        assert_eq!(garmin_logins.load(Ordering::SeqCst), 1);

        cache.login("Spotify", None, t0()).await.unwrap();
        spotify_alive.store(false, Ordering::SeqCst);
        cache.login("Spotify", None, t0()).await.unwrap();
        assert_eq!(spotify_logins.load(Ordering::SeqCst), 3);

        let events: Vec<String> = cache.drain_events().into_iter().map(|e| e.event).collect();
        assert_eq!(events, vec!["login", "login", "login", "probe_failed", "login"]);
    }

    #[tokio::test]
    async fn young_sessions_skip_probe_and_old_ones_expire() {
        let mut garmin = MockConnector::new("Garmin");
        garmin.probe_after = Duration::from_secs(300);
        garmin.max_age = Some(Duration::from_secs(1800));
        let probes = Arc::clone(&garmin.probes);
        let logins = Arc::clone(&garmin.logins);
        let mut cache = cache_with(vec![garmin]);

        cache.login("Garmin", None, t0()).await.unwrap();
        cache.login("Garmin", None, t0() + chrono::Duration::seconds(60)).await.unwrap();
        assert_eq!(probes.load(Ordering::SeqCst), 0);

        cache.login("Garmin", None, t0() + chrono::Duration::seconds(600)).await.unwrap();
        assert_eq!(probes.load(Ordering::SeqCst), 1);
        assert_eq!(logins.load(Ordering::SeqCst), 1);

        cache.login("Garmin", None, t0() + chrono::Duration::seconds(1800)).await.unwrap();
        assert_eq!(logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_recorded_and_leave_failed_state() {
        let mut cache = cache_with(vec![MockConnector::new("Spotify")]);
        let err = cache.login("Strava", None, t0()).await.err().unwrap();
        assert!(matches!(err, ClientError::NoConnector(_)));
        assert!(matches!(cache.state(), SessionState::Failed { .. }));

        let events = cache.drain_events();
        assert_eq!(events[0].event, "login_failed");
        assert!(events[0].error_text.is_some());

        cache.login("Spotify", None, t0()).await.unwrap();
        assert!(matches!(cache.state(), SessionState::Authenticated(_)));
        cache.invalidate();
        assert!(matches!(cache.state(), SessionState::Unauthenticated));
    }
}
