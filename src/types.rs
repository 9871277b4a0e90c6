use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RegistrationError;

/// Unique identifier for an endpoint.
///
/// Assigned by the registry at registration time, never supplied by callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(pub String);

impl EndpointId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for an event envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Domain events that can be announced to webhook endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WebhookEventType {
    #[serde(rename = "group.created")]
    GroupCreated,
    #[serde(rename = "group.updated")]
    GroupUpdated,
    #[serde(rename = "group.completed")]
    GroupCompleted,
    #[serde(rename = "member.joined")]
    MemberJoined,
    #[serde(rename = "member.left")]
    MemberLeft,
    #[serde(rename = "contribution.made")]
    ContributionMade,
    #[serde(rename = "contribution.failed")]
    ContributionFailed,
    #[serde(rename = "payout.completed")]
    PayoutCompleted,
    #[serde(rename = "payout.failed")]
    PayoutFailed,
    #[serde(rename = "cycle.started")]
    CycleStarted,
    #[serde(rename = "cycle.ended")]
    CycleEnded,
}

impl WebhookEventType {
    pub const ALL: [WebhookEventType; 11] = [
        WebhookEventType::GroupCreated,
        WebhookEventType::GroupUpdated,
        WebhookEventType::GroupCompleted,
        WebhookEventType::MemberJoined,
        WebhookEventType::MemberLeft,
        WebhookEventType::ContributionMade,
        WebhookEventType::ContributionFailed,
        WebhookEventType::PayoutCompleted,
        WebhookEventType::PayoutFailed,
        WebhookEventType::CycleStarted,
        WebhookEventType::CycleEnded,
    ];

    /// Dotted wire name, as sent in the `X-Webhook-Event` header.
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventType::GroupCreated => "group.created",
            WebhookEventType::GroupUpdated => "group.updated",
            WebhookEventType::GroupCompleted => "group.completed",
            WebhookEventType::MemberJoined => "member.joined",
            WebhookEventType::MemberLeft => "member.left",
            WebhookEventType::ContributionMade => "contribution.made",
            WebhookEventType::ContributionFailed => "contribution.failed",
            WebhookEventType::PayoutCompleted => "payout.completed",
            WebhookEventType::PayoutFailed => "payout.failed",
            WebhookEventType::CycleStarted => "cycle.started",
            WebhookEventType::CycleEnded => "cycle.ended",
        }
    }
}

impl fmt::Display for WebhookEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookEventType {
    type Err = RegistrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WebhookEventType::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| RegistrationError::UnknownEventType(s.to_string()))
    }
}

/// Event-specific fields carried in an envelope.
pub type EventData = serde_json::Map<String, serde_json::Value>;

/// Well-known optional keys attached to an envelope for filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

impl EventMetadata {
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_transaction_hash(mut self, hash: impl Into<String>) -> Self {
        self.transaction_hash = Some(hash.into());
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }
}

/// The signed unit of webhook data for one domain event occurrence.
///
/// Built once at trigger time and never mutated afterwards. The serialized
/// form is both the HTTP body and the signature input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: EventId,

    #[serde(rename = "event")]
    pub event_type: WebhookEventType,

    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,

    pub data: EventData,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
}

impl EventEnvelope {
    /// Create an envelope with a fresh id and the current time.
    ///
    /// The timestamp is truncated to milliseconds so the envelope survives a
    /// serialize/deserialize cycle unchanged.
    pub fn new(event_type: WebhookEventType, data: EventData, metadata: Option<EventMetadata>) -> Self {
        Self {
            id: EventId::generate(),
            event_type,
            timestamp: Utc::now().trunc_subsecs(3),
            data,
            metadata,
        }
    }

    /// ISO-8601 timestamp exactly as it appears in the body.
    pub fn timestamp_string(&self) -> String {
        iso_millis::format(&self.timestamp)
    }
}

mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Retry behaviour for one endpoint.
///
/// `max_retries` is the total number of attempts; a delivery is always
/// attempted at least once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay_ms: u64) -> Self {
        Self { max_retries, retry_delay_ms }
    }

    /// Backoff before the attempt following `attempt` (1-based).
    /// Linear: `retry_delay_ms * attempt`.
    pub fn delay_after(&self, attempt: u32) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Registered webhook destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: EndpointId,

    /// Target URL for webhook delivery.
    pub url: String,

    /// Shared HMAC signing secret.
    pub secret: String,

    /// Event types this endpoint subscribes to.
    pub events: BTreeSet<WebhookEventType>,

    /// Disabled endpoints stay registered but are skipped during fan-out.
    pub enabled: bool,

    pub retry_policy: RetryPolicy,

    /// Additional headers; these win over the default delivery headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Endpoint {
    pub fn is_subscribed(&self, event_type: WebhookEventType) -> bool {
        self.enabled && self.events.contains(&event_type)
    }
}

/// Registration request: an endpoint configuration without an id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEndpoint {
    pub url: String,
    pub events: Vec<WebhookEventType>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl NewEndpoint {
    pub fn new(url: impl Into<String>, events: impl IntoIterator<Item = WebhookEventType>) -> Self {
        Self {
            url: url.into(),
            events: events.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointUpdate {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub events: Option<Vec<WebhookEventType>>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
}

impl EndpointUpdate {
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Default::default()
        }
    }
}

/// Endpoint listing entry with the secret left out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSummary {
    pub id: EndpointId,
    pub url: String,
    pub events: BTreeSet<WebhookEventType>,
    pub enabled: bool,
}

impl From<&Endpoint> for EndpointSummary {
    fn from(endpoint: &Endpoint) -> Self {
        Self {
            id: endpoint.id.clone(),
            url: endpoint.url.clone(),
            events: endpoint.events.clone(),
            enabled: endpoint.enabled,
        }
    }
}
