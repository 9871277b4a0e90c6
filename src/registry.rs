use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Url;
use tokio::sync::RwLock;

use crate::config::BootstrapEndpoints;
use crate::error::RegistrationError;
use crate::types::{Endpoint, EndpointId, EndpointUpdate, NewEndpoint, RetryPolicy, WebhookEventType};

/// Generate a signing secret: 32 random bytes from the OS CSPRNG, hex-encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// In-memory store of endpoint configurations.
///
/// Entries are swapped whole behind `Arc`, so a reader holding a snapshot
/// never observes a half-applied update.
pub struct EndpointRegistry {
    endpoints: RwLock<HashMap<EndpointId, Arc<Endpoint>>>,
    default_retry: RetryPolicy,
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl EndpointRegistry {
    pub fn new(default_retry: RetryPolicy) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            default_retry,
        }
    }

    /// Validate and store a new endpoint, returning its server-assigned id.
    pub async fn register(&self, new: NewEndpoint) -> Result<EndpointId, RegistrationError> {
        let url = validate_url(&new.url)?;
        if new.events.is_empty() {
            return Err(RegistrationError::NoEvents);
        }
        let retry_policy = new.retry_policy.unwrap_or(self.default_retry);
        validate_retry_policy(&retry_policy)?;
        validate_headers(&new.headers)?;

        let secret = match new.secret {
            Some(secret) if !secret.is_empty() => secret,
            _ => generate_secret(),
        };

        let mut guard = self.endpoints.write().await;
        let mut id = EndpointId::generate();
        while guard.contains_key(&id) {
            id = EndpointId::generate();
        }

        let endpoint = Endpoint {
            id: id.clone(),
            url,
            secret,
            events: new.events.into_iter().collect(),
            enabled: new.enabled.unwrap_or(true),
            retry_policy,
            headers: new.headers,
        };

        tracing::info!(
            target: "webhook_delivery",
            endpoint_id = %id,
            url = %endpoint.url,
            events = endpoint.events.len(),
            "Webhook endpoint registered"
        );

        guard.insert(id.clone(), Arc::new(endpoint));
        Ok(id)
    }

    /// Merge `update` into an existing endpoint.
    ///
    /// Returns `Ok(false)` when the id is unknown. The merged config is
    /// validated before it replaces the old one.
    pub async fn update(&self, id: &EndpointId, update: EndpointUpdate) -> Result<bool, RegistrationError> {
        let mut guard = self.endpoints.write().await;
        let Some(current) = guard.get(id) else {
            return Ok(false);
        };

        let mut next = Endpoint::clone(current);
        if let Some(url) = update.url {
            next.url = validate_url(&url)?;
        }
        if let Some(secret) = update.secret {
            if !secret.is_empty() {
                next.secret = secret;
            }
        }
        if let Some(events) = update.events {
            if events.is_empty() {
                return Err(RegistrationError::NoEvents);
            }
            next.events = events.into_iter().collect();
        }
        if let Some(enabled) = update.enabled {
            next.enabled = enabled;
        }
        if let Some(policy) = update.retry_policy {
            validate_retry_policy(&policy)?;
            next.retry_policy = policy;
        }
        if let Some(headers) = update.headers {
            validate_headers(&headers)?;
            next.headers = headers;
        }

        tracing::info!(
            target: "webhook_delivery",
            endpoint_id = %id,
            enabled = next.enabled,
            "Webhook endpoint updated"
        );

        guard.insert(id.clone(), Arc::new(next));
        Ok(true)
    }

    /// Remove an endpoint. Returns `false` when the id is unknown.
    pub async fn unregister(&self, id: &EndpointId) -> bool {
        let removed = self.endpoints.write().await.remove(id).is_some();
        if removed {
            tracing::info!(target: "webhook_delivery", endpoint_id = %id, "Webhook endpoint unregistered");
        }
        removed
    }

    pub async fn get(&self, id: &EndpointId) -> Option<Arc<Endpoint>> {
        self.endpoints.read().await.get(id).cloned()
    }

    /// Snapshot of every registered endpoint, in no particular order.
    pub async fn list(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.read().await.values().cloned().collect()
    }

    /// Enabled endpoints subscribed to `event_type`, taken as one snapshot.
    pub async fn subscribers(&self, event_type: WebhookEventType) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .read()
            .await
            .values()
            .filter(|endpoint| endpoint.is_subscribed(event_type))
            .cloned()
            .collect()
    }

    /// `(total, enabled)` endpoint counts.
    pub async fn counts(&self) -> (usize, usize) {
        let guard = self.endpoints.read().await;
        let active = guard.values().filter(|endpoint| endpoint.enabled).count();
        (guard.len(), active)
    }

    /// Register one subscribe-to-all endpoint per bootstrap URL.
    ///
    /// Invalid URLs are logged and skipped; startup is not aborted.
    pub async fn load_bootstrap(&self, bootstrap: &BootstrapEndpoints) -> Vec<EndpointId> {
        let mut ids = Vec::new();

        for (url, secret) in bootstrap.pairs() {
            let mut new = NewEndpoint::new(url, WebhookEventType::ALL);
            if let Some(secret) = secret {
                new = new.with_secret(secret);
            }

            match self.register(new).await {
                Ok(id) => ids.push(id),
                Err(e) => {
                    tracing::warn!(
                        target: "webhook_delivery",
                        url = %url,
                        error = %e,
                        "Skipping configured webhook endpoint"
                    );
                }
            }
        }

        ids
    }
}

fn validate_url(raw: &str) -> Result<String, RegistrationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RegistrationError::MissingUrl);
    }

    let url = Url::parse(trimmed).map_err(|e| RegistrationError::InvalidUrl(format!("{trimmed}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(trimmed.to_string()),
        other => Err(RegistrationError::UnsupportedScheme(other.to_string())),
    }
}

fn validate_retry_policy(policy: &RetryPolicy) -> Result<(), RegistrationError> {
    if policy.retry_delay_ms == 0 {
        return Err(RegistrationError::InvalidRetryDelay);
    }
    Ok(())
}

fn validate_headers(headers: &BTreeMap<String, String>) -> Result<(), RegistrationError> {
    for (name, value) in headers {
        HeaderName::from_bytes(name.as_bytes()).map_err(|_| RegistrationError::InvalidHeader(name.clone()))?;
        HeaderValue::from_str(value).map_err(|_| RegistrationError::InvalidHeader(name.clone()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn group_hook() -> NewEndpoint {
        NewEndpoint::new("https://example.com/hook", [WebhookEventType::GroupCreated])
    }

    #[tokio::test]
    async fn register_assigns_id_secret_and_default_retry() {
        let registry = EndpointRegistry::default();
        let id = registry.register(group_hook()).await.unwrap();
        assert!(!id.as_str().is_empty());

        let endpoint = registry.get(&id).await.unwrap();
        assert_eq!(endpoint.secret.len(), 64);
        assert!(endpoint.secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(endpoint.retry_policy, RetryPolicy::new(3, 1_000));
        assert!(endpoint.enabled);
    }

    #[tokio::test]
    async fn explicit_secret_is_kept() {
        let registry = EndpointRegistry::default();
        let id = registry.register(group_hook().with_secret("whsec_1")).await.unwrap();
        assert_eq!(registry.get(&id).await.unwrap().secret, "whsec_1");
    }

    #[tokio::test]
    async fn generated_secrets_differ() {
        assert_ne!(generate_secret(), generate_secret());
    }

    #[tokio::test]
    async fn register_rejects_bad_input() {
        let registry = EndpointRegistry::default();

        let missing = registry.register(NewEndpoint::new("  ", [WebhookEventType::GroupCreated])).await;
        assert_eq!(missing.unwrap_err(), RegistrationError::MissingUrl);

        let invalid = registry.register(NewEndpoint::new("not a url", [WebhookEventType::GroupCreated])).await;
        assert!(matches!(invalid.unwrap_err(), RegistrationError::InvalidUrl(_)));

        let scheme = registry.register(NewEndpoint::new("ftp://example.com", [WebhookEventType::GroupCreated])).await;
        assert_eq!(scheme.unwrap_err(), RegistrationError::UnsupportedScheme("ftp".into()));

        let no_events = registry.register(NewEndpoint::new("https://example.com/hook", Vec::<WebhookEventType>::new())).await;
        assert_eq!(no_events.unwrap_err(), RegistrationError::NoEvents);

        let zero_delay = registry
            .register(group_hook().with_retry_policy(RetryPolicy::new(3, 0)))
            .await;
        assert_eq!(zero_delay.unwrap_err(), RegistrationError::InvalidRetryDelay);

        let header = registry.register(group_hook().with_header("bad header", "x")).await;
        assert!(matches!(header.unwrap_err(), RegistrationError::InvalidHeader(_)));

        assert_eq!(registry.counts().await, (0, 0));
    }

    #[tokio::test]
    async fn update_merges_partial_fields() {
        let registry = EndpointRegistry::default();
        let id = registry.register(group_hook().with_secret("keep-me")).await.unwrap();

        let update = EndpointUpdate {
            enabled: Some(false),
            events: Some(vec![WebhookEventType::PayoutCompleted, WebhookEventType::PayoutFailed]),
            ..Default::default()
        };
        assert_eq!(registry.update(&id, update).await, Ok(true));

        let endpoint = registry.get(&id).await.unwrap();
        assert!(!endpoint.enabled);
        assert_eq!(endpoint.secret, "keep-me");
        assert_eq!(endpoint.url, "https://example.com/hook");
        assert!(endpoint.events.contains(&WebhookEventType::PayoutFailed));
        assert!(!endpoint.events.contains(&WebhookEventType::GroupCreated));
    }

    #[tokio::test]
    async fn invalid_update_leaves_entry_untouched() {
        let registry = EndpointRegistry::default();
        let id = registry.register(group_hook()).await.unwrap();

        let update = EndpointUpdate {
            url: Some("mailto:ops@example.com".into()),
            enabled: Some(false),
            ..Default::default()
        };
        assert!(registry.update(&id, update).await.is_err());
        assert!(registry.get(&id).await.unwrap().enabled);
    }

    #[tokio::test]
    async fn unknown_ids_report_absence() {
        let registry = EndpointRegistry::default();
        let ghost = EndpointId("missing".into());
        assert_eq!(registry.update(&ghost, EndpointUpdate::enabled(false)).await, Ok(false));
        assert!(!registry.unregister(&ghost).await);
        assert!(registry.get(&ghost).await.is_none());
    }

    #[tokio::test]
    async fn list_contains_exactly_the_registered_set() {
        let registry = EndpointRegistry::default();
        let a = registry.register(group_hook()).await.unwrap();
        let b = registry.register(group_hook()).await.unwrap();
        let c = registry.register(group_hook()).await.unwrap();
        assert!(registry.unregister(&b).await);

        let listed: HashSet<_> = registry.list().await.iter().map(|e| e.id.clone()).collect();
        assert_eq!(listed, HashSet::from([a, c]));
    }

    #[tokio::test]
    async fn subscribers_skip_disabled_and_unsubscribed() {
        let registry = EndpointRegistry::default();
        let a = registry.register(group_hook()).await.unwrap();
        let b = registry.register(group_hook()).await.unwrap();
        registry
            .register(NewEndpoint::new("https://example.com/payouts", [WebhookEventType::PayoutCompleted]))
            .await
            .unwrap();
        registry.update(&b, EndpointUpdate::enabled(false)).await.unwrap();

        let subs = registry.subscribers(WebhookEventType::GroupCreated).await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, a);
        assert_eq!(registry.counts().await, (3, 2));
    }

    #[tokio::test]
    async fn bootstrap_registers_subscribe_all_endpoints() {
        let registry = EndpointRegistry::default();
        let bootstrap = BootstrapEndpoints::parse(
            "https://a.example.com/hook, ,https://b.example.com/hook,not-a-url",
            "sec-a",
        );

        let ids = registry.load_bootstrap(&bootstrap).await;
        assert_eq!(ids.len(), 2);

        let first = registry.get(&ids[0]).await.unwrap();
        assert_eq!(first.secret, "sec-a");
        assert_eq!(first.events.len(), WebhookEventType::ALL.len());

        let second = registry.get(&ids[1]).await.unwrap();
        assert_eq!(second.secret.len(), 64);
    }
}
