use std::collections::BTreeMap;

use crate::ClientError;

/// Decrypted credential fields for one service (`client_id`, `refresh_token`, ...).
pub type Credentials = BTreeMap<String, String>;

/// Source of plaintext credentials. The engine never persists what it receives.
pub trait CredentialStore: Send + Sync {
    fn decrypt(&self, service: &str) -> Result<Credentials, ClientError>;
}

/// Reads `<PREFIX>_<SERVICE>_<FIELD>` environment variables, e.g.
/// `FITDASH_CRED_SPOTIFY_REFRESH_TOKEN`. Field names are lower-cased.
#[derive(Debug, Clone)]
pub struct EnvCredentialStore {
    prefix: String,
}

impl Default for EnvCredentialStore {
    fn default() -> Self {
        Self::new("FITDASH_CRED")
    }
}

impl EnvCredentialStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn service_prefix(&self, service: &str) -> String {
        let service: String = service
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{}_{}_", self.prefix, service)
    }

    /// Collects matching fields from an arbitrary variable list.
    pub fn collect<I>(&self, service: &str, vars: I) -> Credentials
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let prefix = self.service_prefix(service);
        vars.into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&prefix)
                    .filter(|field| !field.is_empty())
                    .map(|field| (field.to_ascii_lowercase(), value))
            })
            .collect()
    }
}

impl CredentialStore for EnvCredentialStore {
    fn decrypt(&self, service: &str) -> Result<Credentials, ClientError> {
        Ok(self.collect(service, std::env::vars()))
    }
}

/// Fetches a required field or reports which one is missing.
pub fn require<'a>(
    credentials: &'a Credentials,
    service: &str,
    field: &str,
) -> Result<&'a str, ClientError> {
    credentials
        .get(field)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ClientError::MissingCredential {
            service: service.to_string(),
            field: field.to_string(),
        })
}
