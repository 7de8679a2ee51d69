//! API key handling.
//!
//! The key is an opaque value: it is never persisted by the core and its `Debug` output is
//! redacted so it cannot leak through logs.

use crate::config::{ConfigError, CredentialsConfig};
use std::fmt;

#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(****)")
    }
}

/// Supplies the API key on demand.
pub trait CredentialSource: Send + Sync {
    fn api_key(&self) -> Result<ApiKey, ConfigError>;
}

/// Reads the key from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    var: String,
}

impl EnvCredentials {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    pub fn from_config(config: &CredentialsConfig) -> Self {
        Self::new(config.env_var.clone())
    }
}

impl CredentialSource for EnvCredentials {
    fn api_key(&self) -> Result<ApiKey, ConfigError> {
        match std::env::var(&self.var) {
            Ok(key) if !key.trim().is_empty() => Ok(ApiKey::new(key.trim())),
            _ => Err(ConfigError::MissingCredential(self.var.clone())),
        }
    }
}

/// A key supplied directly by the host application.
#[derive(Debug, Clone)]
pub struct StaticCredentials(ApiKey);

impl StaticCredentials {
    pub fn new(key: ApiKey) -> Self {
        Self(key)
    }
}

impl CredentialSource for StaticCredentials {
    fn api_key(&self) -> Result<ApiKey, ConfigError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let key = ApiKey::new("sk-secret-value");
        let printed = format!("{:?}", StaticCredentials::new(key.clone()));
        assert!(!printed.contains("sk-secret-value"));
        assert_eq!(key.expose(), "sk-secret-value");
    }

    #[test]
    fn test_missing_env_var() {
        let source = EnvCredentials::new("RAGDESK_TEST_KEY_THAT_IS_NEVER_SET");
        assert!(matches!(
            source.api_key(),
            Err(ConfigError::MissingCredential(var)) if var == "RAGDESK_TEST_KEY_THAT_IS_NEVER_SET"
        ));
    }
}
