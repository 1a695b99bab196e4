//! Retrying JSON HTTP client shared by every service connector.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

/// Retry-After fallback when a 429 carries no usable header.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
    RateLimited,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited
    } else if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Reads a delta-seconds `Retry-After` value. HTTP-date values are not honoured.
pub fn parse_retry_after(value: Option<&str>) -> u64 {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RequestAuth<'a> {
    Anonymous,
    Bearer(&'a str),
    Basic { user: &'a str, password: &'a str },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after retries: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("rate limited by {url}; retry after {retry_after_secs}s")]
    RateLimited { url: String, retry_after_secs: u64 },
    #[error("response from {url} is not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get_json(
        &self,
        service: &str,
        url: &str,
        auth: RequestAuth<'_>,
        query: &[(String, String)],
    ) -> Result<Value, FetchError> {
        let span = info_span!("http_fetch", service, method = "GET", url);
        self.send_with_retry(url, || with_auth(self.client.get(url).query(query), auth))
            .instrument(span)
            .await
    }

    pub async fn post_form(
        &self,
        service: &str,
        url: &str,
        auth: RequestAuth<'_>,
        form: &[(String, String)],
    ) -> Result<Value, FetchError> {
        let span = info_span!("http_fetch", service, method = "POST", url);
        self.send_with_retry(url, || with_auth(self.client.post(url).form(form), auth))
            .instrument(span)
            .await
    }

    async fn send_with_retry<F>(&self, url: &str, build: F) -> Result<Value, FetchError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await.map_err(|source| FetchError::Request {
                            url: final_url.clone(),
                            source,
                        })?;
                        debug!(bytes = body.len(), "response received");
                        if body.is_empty() {
                            return Ok(Value::Null);
                        }
                        return serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                            url: final_url,
                            source,
                        });
                    }

                    match classify_status(status) {
                        RetryDisposition::RateLimited => {
                            let retry_after_secs = parse_retry_after(
                                resp.headers()
                                    .get(RETRY_AFTER)
                                    .and_then(|v| v.to_str().ok()),
                            );
                            warn!(retry_after_secs, "service reported rate limit");
                            return Err(FetchError::RateLimited {
                                url: final_url,
                                retry_after_secs,
                            });
                        }
                        RetryDisposition::Retryable if attempt < self.backoff.max_retries => {
                            debug!(url, status = status.as_u16(), attempt, "retrying request");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        _ => {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                            })
                        }
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(url, error = %err, attempt, "retrying request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request {
                        url: url.to_string(),
                        source: err,
                    });
                }
            }
        }
    }
}

fn with_auth(builder: RequestBuilder, auth: RequestAuth<'_>) -> RequestBuilder {
    match auth {
        RequestAuth::Anonymous => builder,
        RequestAuth::Bearer(token) => builder.bearer_auth(token),
        RequestAuth::Basic { user, password } => builder.basic_auth(user, Some(password)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn too_many_requests_is_not_retried() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn exhausted_retries_name_the_requested_url() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            user_agent: None,
            backoff: BackoffPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        })
        .unwrap();

        let url = format!("http://127.0.0.1:{port}/me");
        let err = fetcher
            .get_json("Spotify", &url, RequestAuth::Anonymous, &[])
            .await
            .unwrap_err();
        assert!(matches!(&err, FetchError::Request { url: failed, .. } if *failed == url));
        assert!(err.to_string().contains("/me"));
    }

    #[test]
    fn retry_after_defaults_when_missing_or_dated() {
        assert_eq!(parse_retry_after(Some(" 30 ")), 30);
        assert_eq!(parse_retry_after(None), DEFAULT_RETRY_AFTER_SECS);
        assert_eq!(
            parse_retry_after(Some("Wed, 21 Oct 2026 07:28:00 GMT")),
            DEFAULT_RETRY_AFTER_SECS
        );
    }
}
