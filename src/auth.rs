//! Mailbox credentials.
//!
//! The pipeline never acquires tokens itself. It asks an injected
//! `CredentialProvider`, so a token can come from the environment, from a
//! cache file written by an external sign-in tool, or from a test fake.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use serde::Deserialize;
use tracing::debug;

use crate::error::AuthError;

/// Source of bearer tokens for the mailbox API.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// A currently valid access token.
    async fn access_token(&self) -> Result<SecretString, AuthError>;
}

/// A fixed token, typically from `GRAPH_ACCESS_TOKEN`.
pub struct StaticTokenProvider {
    token: SecretString,
}

impl StaticTokenProvider {
    pub fn new(token: SecretString) -> Self {
        Self { token }
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<SecretString, AuthError> {
        Ok(self.token.clone())
    }
}

#[derive(Deserialize)]
struct CachedToken {
    access_token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// Reads `{ "access_token": ..., "expires_at": ... }` from a cache file on
/// every call, so an external refresher can rotate it between runs.
pub struct TokenFileProvider {
    path: PathBuf,
    /// Tokens expiring within this margin are treated as expired.
    skew: Duration,
}

impl TokenFileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            skew: Duration::seconds(60),
        }
    }
}

#[async_trait]
impl CredentialProvider for TokenFileProvider {
    async fn access_token(&self) -> Result<SecretString, AuthError> {
        let cache_error = |reason: String| AuthError::TokenCache {
            path: self.path.display().to_string(),
            reason,
        };

        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| cache_error(e.to_string()))?;
        let cached: CachedToken =
            serde_json::from_str(&raw).map_err(|e| cache_error(e.to_string()))?;

        if cached.access_token.trim().is_empty() {
            return Err(AuthError::Missing(format!(
                "{} has no access_token",
                self.path.display()
            )));
        }
        if let Some(expires_at) = cached.expires_at
            && expires_at - self.skew <= Utc::now()
        {
            return Err(AuthError::Expired {
                expired_at: expires_at,
            });
        }

        debug!(path = %self.path.display(), "Loaded cached access token");
        Ok(SecretString::from(cached.access_token))
    }
}
