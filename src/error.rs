use thiserror::Error;

/// Errors returned by `trigger` before an envelope is queued.
///
/// Delivery problems never show up here; they stay inside the worker.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Dispatcher has been shut down.
    #[error("dispatcher is shut down")]
    Shutdown,
}

/// Caller mistakes rejected synchronously at register/update time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("endpoint url is required")]
    MissingUrl,

    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),

    #[error("unsupported url scheme: {0} (expected http or https)")]
    UnsupportedScheme(String),

    #[error("endpoint must subscribe to at least one event type")]
    NoEvents,

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("retry delay must be greater than zero")]
    InvalidRetryDelay,

    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

/// Final outcome of delivering one envelope to one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(FailureReason),
}

/// Reasons why a single HTTP delivery attempt failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FailureReason {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("payload serialization failed: {0}")]
    Serialization(String),
}

/// Errors raised while reading configuration from the environment.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}
