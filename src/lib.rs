//! In-process webhook event dispatch.
//!
//! Application code announces domain events through [`Dispatcher::trigger`].
//! Each event becomes an immutable [`EventEnvelope`] on a FIFO queue drained by
//! a single background worker. For every envelope the worker fans out
//! concurrently to all enabled, subscribed endpoints, signing each request with
//! the endpoint's HMAC-SHA256 secret and retrying failures with linear backoff.
//!
//! ## Guarantees
//! - Envelopes are processed FIFO; one fan-out group in flight at a time
//! - Per-endpoint isolation within a fan-out
//! - Best-effort, at-least-once delivery per endpoint
//! - Triggering never waits on, or fails because of, delivery
//!
//! ## Non-Guarantees
//! - Durability across restarts
//! - Exactly-once delivery
//! - Ordering between endpoints of the same envelope
//! - Dead-letter storage (failures are only counted)

mod config;
mod dispatcher;
mod error;
mod registry;
mod signing;
mod types;
mod worker;

pub use config::{BootstrapEndpoints, DispatcherConfig, DEFAULT_USER_AGENT};
pub use dispatcher::{Dispatcher, DispatcherStats};
pub use error::{ConfigError, DeliveryOutcome, DispatchError, FailureReason, RegistrationError};
pub use registry::{generate_secret, EndpointRegistry};
pub use signing::{
    canonical_payload, compute_signature, parse_signature_headers, sign, verify, verify_signature,
    verify_webhook_request, ParsedSignature, VerificationError, EVENT_HEADER, ID_HEADER, SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};
pub use types::{
    Endpoint, EndpointId, EndpointSummary, EndpointUpdate, EventData, EventEnvelope, EventId, EventMetadata,
    NewEndpoint, RetryPolicy, WebhookEventType,
};
pub use worker::{DeliveryReport, WorkerState, WorkerStats};
