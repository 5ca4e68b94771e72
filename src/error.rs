use std::fmt;

/// Errors returned by the dispatcher API itself.
///
/// Credential and send failures never surface here; they are reported
/// per record through [`DeliveryOutcome`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Dispatcher is shutting down or stopped.
    Shutdown,

    /// `start` was called more than once.
    AlreadyStarted,

    /// The delivery library never became available.
    Failed,

    /// Configuration rejected at construction.
    InvalidConfig {
        reason: String,
    },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Shutdown =>
                write!(f, "dispatcher is shut down"),
            DispatchError::AlreadyStarted =>
                write!(f, "dispatcher already started"),
            DispatchError::Failed =>
                write!(f, "dispatcher failed to load its delivery library"),
            DispatchError::InvalidConfig { reason } =>
                write!(f, "invalid dispatcher configuration: {}", reason),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Final outcome of a single outbound record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Dropped(DropReason),
    Failed(FailureReason),
}

/// Reasons a record was dropped without a send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Dispatcher shut down before it became ready.
    Shutdown,

    /// Delivery library failed to load.
    LoadFailure,
}

/// Reasons a record failed terminally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Credentials could not be refreshed within the retry budget.
    CredentialUnavailable,

    /// Ingestion endpoint rejected the record (non-retryable).
    Rejected,

    MaxRetriesExceeded,

    /// Record body could not be serialized.
    Unencodable,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::CredentialUnavailable =>
                write!(f, "credentials unavailable"),
            FailureReason::Rejected =>
                write!(f, "record rejected (non-retryable)"),
            FailureReason::MaxRetriesExceeded =>
                write!(f, "maximum retries exceeded"),
            FailureReason::Unencodable =>
                write!(f, "record could not be encoded"),
        }
    }
}

/// Failure obtaining delivery credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// Network or service hiccup.
    Transient(String),

    /// Credential server refused the request.
    Rejected(String),

    /// Response could not be turned into a credential.
    Malformed(String),

    /// The caller driving the in-flight refresh went away before completing.
    Abandoned,
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialError::Transient(msg) =>
                write!(f, "transient credential fetch failure: {}", msg),
            CredentialError::Rejected(msg) =>
                write!(f, "credential request rejected: {}", msg),
            CredentialError::Malformed(msg) =>
                write!(f, "malformed credential document: {}", msg),
            CredentialError::Abandoned =>
                write!(f, "credential refresh abandoned"),
        }
    }
}

impl std::error::Error for CredentialError {}

/// Failure returned by a [`RecordSender`](crate::RecordSender).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    Transient(String),
    Permanent(String),
}

impl SendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::Transient(_))
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Transient(msg) =>
                write!(f, "transient send failure: {}", msg),
            SendError::Permanent(msg) =>
                write!(f, "permanent send failure: {}", msg),
        }
    }
}

impl std::error::Error for SendError {}

/// The delivery library could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError(pub String);

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delivery library failed to load: {}", self.0)
    }
}

impl std::error::Error for LoadError {}
