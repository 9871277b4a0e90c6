//! Dispatcher settings and the environment bootstrap.
//!
//! Read once at startup. Binaries call `dotenvy::dotenv().ok()` before
//! [`DispatcherConfig::from_env`] in local development.

use std::time::Duration;

use crate::error::ConfigError;
use crate::types::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "Soroban-Ajo-Webhook/1.0";

const URLS_VAR: &str = "WEBHOOK_URLS";
const SECRETS_VAR: &str = "WEBHOOK_SECRETS";
const TIMEOUT_VAR: &str = "WEBHOOK_REQUEST_TIMEOUT_MS";
const USER_AGENT_VAR: &str = "WEBHOOK_USER_AGENT";

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Per-request timeout for outbound deliveries.
    pub request_timeout: Duration,
    pub user_agent: String,
    /// Buffer size of the delivery report broadcast channel.
    pub report_capacity: usize,
    /// Applied to endpoints registered without a retry policy.
    pub default_retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            report_capacity: 1_024,
            default_retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    /// Defaults overridden by `WEBHOOK_REQUEST_TIMEOUT_MS` and `WEBHOOK_USER_AGENT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var(TIMEOUT_VAR) {
            let millis = raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|ms| *ms > 0)
                .ok_or(ConfigError::InvalidValue { name: TIMEOUT_VAR, value: raw.clone() })?;
            config.request_timeout = Duration::from_millis(millis);
        }

        if let Ok(agent) = std::env::var(USER_AGENT_VAR) {
            if !agent.trim().is_empty() {
                config.user_agent = agent.trim().to_string();
            }
        }

        Ok(config)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }
}

/// Endpoints declared through configuration: parallel comma-separated lists
/// of URLs and secrets, aligned by index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapEndpoints {
    urls: Vec<String>,
    secrets: Vec<String>,
}

impl BootstrapEndpoints {
    pub fn parse(urls: &str, secrets: &str) -> Self {
        Self {
            urls: split_list(urls),
            secrets: split_list(secrets),
        }
    }

    /// Reads `WEBHOOK_URLS` and `WEBHOOK_SECRETS`; unset means empty.
    pub fn from_env() -> Self {
        let urls = std::env::var(URLS_VAR).unwrap_or_default();
        let secrets = std::env::var(SECRETS_VAR).unwrap_or_default();
        Self::parse(&urls, &secrets)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs().next().is_none()
    }

    /// Non-blank URLs with the secret at the same index, if any.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.urls.iter().enumerate().filter(|(_, url)| !url.is_empty()).map(|(index, url)| {
            let secret = self.secrets.get(index).map(String::as_str).filter(|s| !s.is_empty());
            (url.as_str(), secret)
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    raw.split(',').map(|item| item.trim().to_string()).collect()
}
