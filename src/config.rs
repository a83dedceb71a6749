//! Configuration types.
//!
//! Everything is read from the environment once at startup and passed down
//! explicitly; nothing below `main` consults the environment again.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use secrecy::SecretString;

use crate::auth::{CredentialProvider, StaticTokenProvider, TokenFileProvider};
use crate::crm::ResolverConfig;
use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};
use crate::run_state::RunStateConfig;

/// Where mailbox bearer tokens come from.
#[derive(Debug, Clone)]
pub enum MailboxCredentials {
    /// Fixed token from `GRAPH_ACCESS_TOKEN`.
    Static(SecretString),
    /// Token cache file from `GRAPH_TOKEN_FILE`, re-read on every fetch.
    TokenFile(PathBuf),
}

impl MailboxCredentials {
    pub fn provider(&self) -> Arc<dyn CredentialProvider> {
        match self {
            Self::Static(token) => Arc::new(StaticTokenProvider::new(token.clone())),
            Self::TokenFile(path) => Arc::new(TokenFileProvider::new(path.clone())),
        }
    }
}

/// Mailbox settings.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub credentials: MailboxCredentials,
    pub folder: String,
}

/// Full pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub llm: LlmConfig,
    pub mailbox: MailboxConfig,
    pub db_path: PathBuf,
    pub state_path: PathBuf,
    pub lock_path: PathBuf,
    pub run_state: RunStateConfig,
    pub resolver: ResolverConfig,
    /// Own domains; mail from these is screened out.
    pub internal_domains: Vec<String>,
    /// Cron expression for scheduled mode. `None` runs once.
    pub schedule: Option<cron::Schedule>,
    /// Directory for the rolling log file, if file logging is on.
    pub log_dir: Option<PathBuf>,
}

impl PipelineConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        // ── LLM ─────────────────────────────────────────────────────────
        let backend = match get("LEADS_LLM_BACKEND") {
            Some(raw) => raw.parse::<LlmBackend>().map_err(|message| ConfigError::InvalidValue {
                key: "LEADS_LLM_BACKEND".into(),
                message,
            })?,
            None => LlmBackend::Anthropic,
        };
        let key_var = backend.api_key_var();
        let api_key = get(key_var).ok_or_else(|| ConfigError::MissingEnvVar(key_var.into()))?;
        let model = get("LEADS_LLM_MODEL").unwrap_or_else(|| backend.default_model().to_string());
        let llm = LlmConfig {
            backend,
            api_key: SecretString::from(api_key),
            model,
        };

        // ── Mailbox ─────────────────────────────────────────────────────
        let credentials = match (get("GRAPH_TOKEN_FILE"), get("GRAPH_ACCESS_TOKEN")) {
            (Some(path), _) => MailboxCredentials::TokenFile(PathBuf::from(path)),
            (None, Some(token)) => MailboxCredentials::Static(SecretString::from(token)),
            (None, None) => {
                return Err(ConfigError::MissingRequired {
                    key: "GRAPH_TOKEN_FILE or GRAPH_ACCESS_TOKEN".into(),
                    hint: "Provide a Microsoft Graph token or a token cache file.".into(),
                });
            }
        };
        let mailbox = MailboxConfig {
            credentials,
            folder: get("GRAPH_MAIL_FOLDER").unwrap_or_else(|| "inbox".to_string()),
        };

        // ── Storage ─────────────────────────────────────────────────────
        let db_path = PathBuf::from(
            get("LEADS_DB_PATH").unwrap_or_else(|| "./data/lead-ledger.db".to_string()),
        );
        let state_path = PathBuf::from(
            get("LEADS_STATE_PATH").unwrap_or_else(|| "./data/run_state.json".to_string()),
        );
        let lock_path = get("LEADS_LOCK_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| state_path.with_extension("lock"));

        // ── Run window ──────────────────────────────────────────────────
        let defaults = RunStateConfig::default();
        let run_state = RunStateConfig {
            initial_lookback: parse_or(
                &get,
                "LEADS_INITIAL_LOOKBACK_HOURS",
                defaults.initial_lookback,
                chrono::Duration::hours,
            )?,
            overlap: parse_or(
                &get,
                "LEADS_OVERLAP_MINUTES",
                defaults.overlap,
                chrono::Duration::minutes,
            )?,
            retention: parse_or(
                &get,
                "LEADS_RETENTION_DAYS",
                defaults.retention,
                chrono::Duration::days,
            )?,
        };

        // ── Matching & screening ────────────────────────────────────────
        let internal_domains = split_list(get("LEADS_INTERNAL_DOMAINS"));
        let resolver = match get("LEADS_FREEMAIL_DOMAINS") {
            Some(raw) => ResolverConfig {
                freemail_domains: split_list(Some(raw)),
            },
            None => ResolverConfig::default(),
        };

        let schedule = get("LEADS_SCHEDULE")
            .map(|expr| {
                cron::Schedule::from_str(&expr).map_err(|e| ConfigError::InvalidValue {
                    key: "LEADS_SCHEDULE".into(),
                    message: e.to_string(),
                })
            })
            .transpose()?;

        Ok(Self {
            llm,
            mailbox,
            db_path,
            state_path,
            lock_path,
            run_state,
            resolver,
            internal_domains,
            schedule,
            log_dir: get("LEADS_LOG_DIR").map(PathBuf::from),
        })
    }
}

/// Parse a non-negative integer setting into a duration, or use the default.
fn parse_or<G>(
    get: &G,
    key: &str,
    default: chrono::Duration,
    unit: fn(i64) -> chrono::Duration,
) -> Result<chrono::Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<u32>()
            .map(|n| unit(i64::from(n)))
            .map_err(|e| ConfigError::InvalidValue {
                key: key.into(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<PipelineConfig, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|key| env.get(key).cloned())
    }

    const MINIMAL: [(&str, &str); 2] = [
        ("ANTHROPIC_API_KEY", "sk-ant-test"),
        ("GRAPH_ACCESS_TOKEN", "graph-token"),
    ];

    #[test]
    fn minimal_env_uses_defaults() {
        let config = load(&MINIMAL).unwrap();
        assert_eq!(config.llm.backend, LlmBackend::Anthropic);
        assert_eq!(config.llm.model, "claude-3-5-haiku-latest");
        assert_eq!(config.mailbox.folder, "inbox");
        assert!(matches!(config.mailbox.credentials, MailboxCredentials::Static(_)));
        assert_eq!(config.db_path, PathBuf::from("./data/lead-ledger.db"));
        assert_eq!(config.lock_path, PathBuf::from("./data/run_state.lock"));
        assert_eq!(config.run_state.overlap, chrono::Duration::minutes(60));
        assert_eq!(config.run_state.retention, chrono::Duration::days(14));
        assert!(config.schedule.is_none());
        assert!(config.log_dir.is_none());
        assert!(!config.resolver.freemail_domains.is_empty());
    }

    #[test]
    fn missing_api_key_is_reported_by_name() {
        let err = load(&[("GRAPH_ACCESS_TOKEN", "t"), ("LEADS_LLM_BACKEND", "openai")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref v) if v == "OPENAI_API_KEY"));
    }

    #[test]
    fn missing_mailbox_credentials_fail() {
        let err = load(&[("ANTHROPIC_API_KEY", "k")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }

    #[test]
    fn token_file_wins_over_static_token() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("GRAPH_TOKEN_FILE", "/tmp/graph-token.json"));
        let config = load(&pairs).unwrap();
        assert!(matches!(
            config.mailbox.credentials,
            MailboxCredentials::TokenFile(ref p) if p == &PathBuf::from("/tmp/graph-token.json")
        ));
    }

    #[test]
    fn overrides_and_lists_are_parsed() {
        let mut pairs = MINIMAL.to_vec();
        pairs.extend([
            ("LEADS_OVERLAP_MINUTES", "15"),
            ("LEADS_INITIAL_LOOKBACK_HOURS", "72"),
            ("LEADS_INTERNAL_DOMAINS", "Acme.com, acme.co.uk ,"),
            ("LEADS_FREEMAIL_DOMAINS", "gmail.com"),
            ("LEADS_SCHEDULE", "0 */15 * * * *"),
            ("LEADS_LOG_DIR", "/var/log/leads"),
        ]);
        let config = load(&pairs).unwrap();
        assert_eq!(config.run_state.overlap, chrono::Duration::minutes(15));
        assert_eq!(config.run_state.initial_lookback, chrono::Duration::hours(72));
        assert_eq!(config.internal_domains, vec!["acme.com", "acme.co.uk"]);
        assert_eq!(config.resolver.freemail_domains, vec!["gmail.com"]);
        assert!(config.schedule.is_some());
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/leads")));
    }

    #[test]
    fn bad_numbers_and_schedules_are_rejected() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("LEADS_RETENTION_DAYS", "two weeks"));
        assert!(matches!(
            load(&pairs).unwrap_err(),
            ConfigError::InvalidValue { ref key, .. } if key == "LEADS_RETENTION_DAYS"
        ));

        let mut pairs = MINIMAL.to_vec();
        pairs.push(("LEADS_SCHEDULE", "every tuesday"));
        assert!(matches!(
            load(&pairs).unwrap_err(),
            ConfigError::InvalidValue { ref key, .. } if key == "LEADS_SCHEDULE"
        ));
    }
}
