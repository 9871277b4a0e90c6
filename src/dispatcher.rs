use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::config::{BootstrapEndpoints, DispatcherConfig};
use crate::error::{ConfigError, DispatchError, RegistrationError};
use crate::registry::EndpointRegistry;
use crate::signing::{parse_signature_headers, verify_signature, VerificationError};
use crate::types::{
    Endpoint, EndpointId, EndpointSummary, EndpointUpdate, EventData, EventEnvelope, EventId, EventMetadata,
    NewEndpoint, WebhookEventType,
};
use crate::worker::{worker_loop, DeliveryCounters, DeliveryQueue, DeliveryReport, QueuedEnvelope, WorkerContext, WorkerStats};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Operational counters, computed on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherStats {
    pub total_endpoints: usize,
    pub active_endpoints: usize,
    pub queued_envelopes: usize,
    /// Endpoint deliveries that succeeded.
    pub delivered: u64,
    /// Endpoint deliveries abandoned after exhausting retries.
    pub failed: u64,
    /// Envelopes discarded because nothing was subscribed.
    pub dropped_envelopes: u64,
}

/// Webhook dispatch service.
///
/// Construct once per process and share it (e.g. behind an `Arc`). Owns the
/// endpoint registry, the pending envelope queue and the single drain worker.
/// Must be created inside a Tokio runtime.
pub struct Dispatcher {
    ctx: Arc<WorkerContext>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Result<Self, ConfigError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        let (reports, _) = broadcast::channel(config.report_capacity.max(1));

        let ctx = Arc::new(WorkerContext {
            registry: Arc::new(EndpointRegistry::new(config.default_retry)),
            queue: DeliveryQueue::new(),
            http_client,
            user_agent: config.user_agent,
            reports,
            counters: DeliveryCounters::default(),
        });

        let worker_handle = tokio::spawn(worker_loop(ctx.clone()));

        Ok(Self {
            ctx,
            worker_handle: Mutex::new(Some(worker_handle)),
        })
    }

    /// Build from environment settings and register the configured endpoints.
    pub async fn from_env() -> Result<Self, ConfigError> {
        let dispatcher = Self::new(DispatcherConfig::from_env()?)?;
        dispatcher.load_from_environment().await;
        Ok(dispatcher)
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.ctx.registry
    }

    /// Announce a domain event.
    ///
    /// Returns as soon as the envelope is queued; delivery happens on the
    /// worker and its outcome is never reported back here.
    pub async fn trigger(
        &self,
        event_type: WebhookEventType,
        data: EventData,
        metadata: Option<EventMetadata>,
    ) -> Result<EventId, DispatchError> {
        let envelope = EventEnvelope::new(event_type, data, metadata);
        self.enqueue(envelope, None).await
    }

    async fn enqueue(&self, envelope: EventEnvelope, target: Option<EndpointId>) -> Result<EventId, DispatchError> {
        let event_id = envelope.id.clone();
        let event_type = envelope.event_type;

        if !self.ctx.queue.push(QueuedEnvelope { envelope, target }).await {
            tracing::warn!(
                target: "webhook_delivery",
                event_id = %event_id,
                event_type = %event_type,
                "Dropping webhook event, dispatcher is shut down"
            );
            return Err(DispatchError::Shutdown);
        }

        tracing::info!(
            target: "webhook_delivery",
            event_id = %event_id,
            event_type = %event_type,
            "Webhook event queued"
        );
        metric_inc("webhook.trigger.enqueued");
        Ok(event_id)
    }

    pub async fn register_endpoint(&self, endpoint: NewEndpoint) -> Result<EndpointId, RegistrationError> {
        self.ctx.registry.register(endpoint).await
    }

    /// `Ok(false)` when the id is unknown.
    pub async fn update_endpoint(&self, id: &EndpointId, update: EndpointUpdate) -> Result<bool, RegistrationError> {
        self.ctx.registry.update(id, update).await
    }

    pub async fn delete_endpoint(&self, id: &EndpointId) -> bool {
        self.ctx.registry.unregister(id).await
    }

    pub async fn get_endpoint(&self, id: &EndpointId) -> Option<Arc<Endpoint>> {
        self.ctx.registry.get(id).await
    }

    /// Registered endpoints without their secrets.
    pub async fn list_endpoints(&self) -> Vec<EndpointSummary> {
        self.ctx
            .registry
            .list()
            .await
            .iter()
            .map(|endpoint| EndpointSummary::from(endpoint.as_ref()))
            .collect()
    }

    /// Queue a synthetic `group.created` envelope for endpoint `id` only.
    ///
    /// The probe bypasses subscription and enabled filters. `Ok(None)` when
    /// the id is unknown.
    pub async fn send_test_event(&self, id: &EndpointId) -> Result<Option<EventId>, DispatchError> {
        if self.ctx.registry.get(id).await.is_none() {
            return Ok(None);
        }

        let envelope = EventEnvelope::new(WebhookEventType::GroupCreated, EventData::new(), None);
        let data = json!({
            "test": true,
            "message": "This is a test webhook",
            "timestamp": envelope.timestamp_string(),
        });
        let envelope = EventEnvelope {
            data: data.as_object().cloned().unwrap_or_default(),
            metadata: Some(EventMetadata::default().with_network("testnet")),
            ..envelope
        };

        self.enqueue(envelope, Some(id.clone())).await.map(Some)
    }

    pub async fn stats(&self) -> DispatcherStats {
        let (total_endpoints, active_endpoints) = self.ctx.registry.counts().await;
        let counters = &self.ctx.counters;

        DispatcherStats {
            total_endpoints,
            active_endpoints,
            queued_envelopes: self.ctx.queue.len().await,
            delivered: counters.delivered.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            dropped_envelopes: counters.dropped_envelopes.load(Ordering::Relaxed),
        }
    }

    pub fn worker_stats(&self) -> WorkerStats {
        self.ctx.worker_stats()
    }

    /// Receive a [`DeliveryReport`] for every settled endpoint delivery.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<DeliveryReport> {
        self.ctx.reports.subscribe()
    }

    /// Resolve once the pending list is empty and the worker is Idle.
    pub async fn wait_idle(&self) {
        self.ctx.queue.wait_idle().await
    }

    /// Register endpoints from `WEBHOOK_URLS` / `WEBHOOK_SECRETS`.
    pub async fn load_from_environment(&self) -> Vec<EndpointId> {
        self.load_bootstrap(&BootstrapEndpoints::from_env()).await
    }

    pub async fn load_bootstrap(&self, bootstrap: &BootstrapEndpoints) -> Vec<EndpointId> {
        let ids = self.ctx.registry.load_bootstrap(bootstrap).await;
        if !ids.is_empty() {
            tracing::info!(target: "webhook_delivery", count = ids.len(), "Webhook endpoints loaded from configuration");
        }
        ids
    }

    /// Authenticate an inbound webhook request.
    ///
    /// `X-Webhook-Id` names the endpoint whose secret signed `body`; the
    /// signature in `X-Webhook-Signature` is checked over the raw body.
    pub async fn verify_inbound<'a, I>(&self, headers: I, body: &[u8]) -> Result<EndpointId, VerificationError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let parsed = parse_signature_headers(headers);
        let signature = parsed.signature.ok_or(VerificationError::MissingSignature)?;
        let webhook_id = parsed.webhook_id.ok_or(VerificationError::MissingWebhookId)?;

        let endpoint = self
            .ctx
            .registry
            .get(&EndpointId(webhook_id))
            .await
            .ok_or(VerificationError::UnknownEndpoint)?;

        if verify_signature(endpoint.secret.as_bytes(), body, &signature) {
            Ok(endpoint.id.clone())
        } else {
            tracing::warn!(
                target: "webhook_delivery",
                endpoint_id = %endpoint.id,
                "Rejected inbound webhook with invalid signature"
            );
            Err(VerificationError::InvalidSignature)
        }
    }

    pub fn is_running(&self) -> bool {
        self.ctx.queue.is_accepting()
    }

    /// Stop accepting events, drain what is already queued, then join the worker.
    pub async fn shutdown(&self) {
        self.ctx.queue.close().await;

        if let Some(handle) = self.worker_handle.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(target: "webhook_delivery", error = %e, "Webhook worker terminated abnormally");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // The worker finishes the backlog on its own and then exits.
        self.ctx.queue.close_now();
    }
}
