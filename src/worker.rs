use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::error::{DeliveryOutcome, FailureReason};
use crate::registry::EndpointRegistry;
use crate::signing::{canonical_payload, compute_signature, EVENT_HEADER, ID_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::types::{Endpoint, EndpointId, EventEnvelope, EventId, WebhookEventType};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// An envelope waiting in the pending list.
///
/// `target` pins delivery to a single endpoint (connectivity tests); otherwise
/// the envelope fans out to every enabled subscriber.
#[derive(Debug, Clone)]
pub(crate) struct QueuedEnvelope {
    pub envelope: EventEnvelope,
    pub target: Option<EndpointId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerState {
    Idle,
    Draining,
}

enum Next {
    Envelope(QueuedEnvelope),
    Idle,
    Closed,
}

/// FIFO of pending envelopes plus the worker's state.
///
/// The pending list, the accepting flag transitions and the Idle/Draining
/// state all change under the same lock.
pub(crate) struct DeliveryQueue {
    pending: Mutex<VecDeque<QueuedEnvelope>>,
    accepting: AtomicBool,
    notify: Notify,
    state: watch::Sender<WorkerState>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            pending: Mutex::new(VecDeque::new()),
            accepting: AtomicBool::new(true),
            notify: Notify::new(),
            state,
        }
    }

    /// Append to the pending list and wake the worker.
    /// Returns `false` once the queue is closed.
    pub async fn push(&self, item: QueuedEnvelope) -> bool {
        {
            let mut pending = self.pending.lock().await;
            if !self.accepting.load(Ordering::SeqCst) {
                return false;
            }
            pending.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    async fn next(&self) -> Next {
        let mut pending = self.pending.lock().await;
        match pending.pop_front() {
            Some(item) => {
                self.state.send_if_modified(|state| {
                    let changed = *state != WorkerState::Draining;
                    *state = WorkerState::Draining;
                    changed
                });
                Next::Envelope(item)
            }
            None => {
                self.state.send_replace(WorkerState::Idle);
                if self.accepting.load(Ordering::SeqCst) {
                    Next::Idle
                } else {
                    Next::Closed
                }
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Stop accepting envelopes. Already queued ones are still drained.
    pub async fn close(&self) {
        {
            let _pending = self.pending.lock().await;
            self.accepting.store(false, Ordering::SeqCst);
        }
        self.notify.notify_one();
    }

    /// Lock-free variant of [`close`](Self::close) for use from `Drop`.
    pub fn close_now(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Resolve once nothing is pending and the worker is Idle.
    pub async fn wait_idle(&self) {
        let mut rx = self.state.subscribe();
        loop {
            {
                let pending = self.pending.lock().await;
                if pending.is_empty() && *rx.borrow_and_update() == WorkerState::Idle {
                    return;
                }
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Result of delivering one envelope to one endpoint, after all retries.
///
/// Ephemeral: broadcast to report subscribers, folded into counters, dropped.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub event_id: EventId,
    pub event_type: WebhookEventType,
    pub endpoint_id: EndpointId,
    pub outcome: DeliveryOutcome,
    /// Status of the last response, when one was received.
    pub status_code: Option<u16>,
    /// Attempts made, 1-based.
    pub attempts: u32,
    pub settled_at: DateTime<Utc>,
}

impl DeliveryReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, DeliveryOutcome::Delivered)
    }

    pub fn error(&self) -> Option<&FailureReason> {
        match &self.outcome {
            DeliveryOutcome::Delivered => None,
            DeliveryOutcome::Failed(reason) => Some(reason),
        }
    }
}

/// Snapshot of the drain worker, used to check the single-drain invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub state: WorkerState,
    /// Fan-out groups currently in flight.
    pub active_fan_outs: usize,
    /// Highest number of simultaneous fan-out groups ever observed.
    pub peak_fan_outs: usize,
}

#[derive(Default)]
pub(crate) struct DeliveryCounters {
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
    pub dropped_envelopes: AtomicU64,
    pub active_fan_outs: AtomicUsize,
    pub peak_fan_outs: AtomicUsize,
}

/// Shared context for the drain worker.
pub(crate) struct WorkerContext {
    pub registry: Arc<EndpointRegistry>,
    pub queue: DeliveryQueue,
    pub http_client: reqwest::Client,
    pub user_agent: String,
    pub reports: broadcast::Sender<DeliveryReport>,
    pub counters: DeliveryCounters,
}

impl WorkerContext {
    pub fn worker_stats(&self) -> WorkerStats {
        WorkerStats {
            state: self.queue.state(),
            active_fan_outs: self.counters.active_fan_outs.load(Ordering::SeqCst),
            peak_fan_outs: self.counters.peak_fan_outs.load(Ordering::SeqCst),
        }
    }

    fn record(&self, report: DeliveryReport) {
        if report.is_success() {
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        // No subscribers is fine; reports are best-effort.
        let _ = self.reports.send(report);
    }
}

/// The single drain loop.
///
/// Envelopes are taken strictly FIFO; the next one is not dequeued until
/// every delivery of the current one has settled.
pub(crate) async fn worker_loop(ctx: Arc<WorkerContext>) {
    loop {
        match ctx.queue.next().await {
            Next::Envelope(item) => fan_out(&ctx, item).await,
            Next::Idle => ctx.queue.notify.notified().await,
            Next::Closed => break,
        }
    }

    tracing::debug!(target: "webhook_delivery", "Webhook worker stopped");
}

async fn fan_out(ctx: &Arc<WorkerContext>, item: QueuedEnvelope) {
    let QueuedEnvelope { envelope, target } = item;

    let endpoints: Vec<Arc<Endpoint>> = match &target {
        Some(id) => ctx.registry.get(id).await.into_iter().collect(),
        None => ctx.registry.subscribers(envelope.event_type).await,
    };

    if endpoints.is_empty() {
        tracing::debug!(
            target: "webhook_delivery",
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            "No endpoints subscribed to event"
        );
        ctx.counters.dropped_envelopes.fetch_add(1, Ordering::Relaxed);
        metric_inc("webhook.envelope.no_subscribers");
        return;
    }

    let body = match canonical_payload(&envelope) {
        Ok(body) => Arc::new(body),
        Err(e) => {
            tracing::error!(
                target: "webhook_delivery",
                event_id = %envelope.id,
                error = %e,
                "Failed to serialize webhook envelope"
            );
            for endpoint in endpoints {
                ctx.record(DeliveryReport {
                    event_id: envelope.id.clone(),
                    event_type: envelope.event_type,
                    endpoint_id: endpoint.id.clone(),
                    outcome: DeliveryOutcome::Failed(FailureReason::Serialization(e.to_string())),
                    status_code: None,
                    attempts: 0,
                    settled_at: Utc::now(),
                });
            }
            return;
        }
    };

    let active = ctx.counters.active_fan_outs.fetch_add(1, Ordering::SeqCst) + 1;
    ctx.counters.peak_fan_outs.fetch_max(active, Ordering::SeqCst);

    let envelope = Arc::new(envelope);
    let mut deliveries = JoinSet::new();
    for endpoint in endpoints {
        let job = DeliveryJob {
            client: ctx.http_client.clone(),
            user_agent: ctx.user_agent.clone(),
            endpoint,
            envelope: envelope.clone(),
            body: body.clone(),
        };
        deliveries.spawn(job.run());
    }

    // Settle all: one endpoint failing never cancels the others.
    while let Some(joined) = deliveries.join_next().await {
        match joined {
            Ok(report) => ctx.record(report),
            Err(e) => {
                tracing::error!(
                    target: "webhook_delivery",
                    event_id = %envelope.id,
                    error = %e,
                    "Webhook delivery task aborted"
                );
            }
        }
    }

    ctx.counters.active_fan_outs.fetch_sub(1, Ordering::SeqCst);
}

/// Delivery of one envelope to one endpoint, retries included.
struct DeliveryJob {
    client: reqwest::Client,
    user_agent: String,
    endpoint: Arc<Endpoint>,
    envelope: Arc<EventEnvelope>,
    body: Arc<Vec<u8>>,
}

impl DeliveryJob {
    async fn run(self) -> DeliveryReport {
        let policy = self.endpoint.retry_policy;
        let max_attempts = policy.max_retries.max(1);
        let mut attempt = 1u32;

        loop {
            match self.attempt().await {
                Ok(status) => {
                    tracing::info!(
                        target: "webhook_delivery",
                        event_id = %self.envelope.id,
                        event_type = %self.envelope.event_type,
                        endpoint_id = %self.endpoint.id,
                        status,
                        attempt,
                        "Webhook delivered"
                    );
                    metric_inc("webhook.delivery.success");
                    return self.report(DeliveryOutcome::Delivered, Some(status), attempt);
                }
                Err(reason) => {
                    tracing::warn!(
                        target: "webhook_delivery",
                        event_id = %self.envelope.id,
                        endpoint_id = %self.endpoint.id,
                        attempt,
                        max_attempts,
                        error = %reason,
                        "Webhook delivery attempt failed"
                    );

                    if attempt < max_attempts {
                        metric_inc("webhook.delivery.retry_scheduled");
                        sleep(policy.delay_after(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::warn!(
                        target: "webhook_delivery",
                        event_id = %self.envelope.id,
                        endpoint_id = %self.endpoint.id,
                        attempts = attempt,
                        "Webhook delivery abandoned after max attempts"
                    );
                    metric_inc("webhook.delivery.failed");
                    let status_code = match &reason {
                        FailureReason::Status(code) => Some(*code),
                        _ => None,
                    };
                    return self.report(DeliveryOutcome::Failed(reason), status_code, attempt);
                }
            }
        }
    }

    /// One signed POST. `Ok` carries a 2xx status.
    async fn attempt(&self) -> Result<u16, FailureReason> {
        let signature = compute_signature(self.endpoint.secret.as_bytes(), &self.body);

        let response = self
            .client
            .post(&self.endpoint.url)
            .headers(self.headers(&signature))
            .body(self.body.as_ref().clone())
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    Ok(status.as_u16())
                } else {
                    Err(FailureReason::Status(status.as_u16()))
                }
            }
            Err(err) if err.is_timeout() => Err(FailureReason::Timeout),
            Err(err) => Err(FailureReason::Network(err.to_string())),
        }
    }

    fn headers(&self, signature: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let defaults = [
            (SIGNATURE_HEADER, signature.to_string()),
            (EVENT_HEADER, self.envelope.event_type.to_string()),
            (ID_HEADER, self.envelope.id.to_string()),
            (TIMESTAMP_HEADER, self.envelope.timestamp_string()),
            (USER_AGENT.as_str(), self.user_agent.clone()),
        ];
        for (name, value) in defaults {
            if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
                headers.insert(name, value);
            }
        }

        // Endpoint headers override the defaults on collision.
        for (name, value) in &self.endpoint.headers {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => {
                    tracing::warn!(
                        target: "webhook_delivery",
                        endpoint_id = %self.endpoint.id,
                        header = %name,
                        "Skipping invalid endpoint header"
                    );
                }
            }
        }

        headers
    }

    fn report(&self, outcome: DeliveryOutcome, status_code: Option<u16>, attempts: u32) -> DeliveryReport {
        DeliveryReport {
            event_id: self.envelope.id.clone(),
            event_type: self.envelope.event_type,
            endpoint_id: self.endpoint.id.clone(),
            outcome,
            status_code,
            attempts,
            settled_at: Utc::now(),
        }
    }
}
