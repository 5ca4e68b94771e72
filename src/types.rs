use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CredentialError, DeliveryOutcome};

/// Short-lived delivery credential set.
///
/// Never mutated in place: a refresh swaps in a new `Arc<Credential>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub role_arn: String,
    pub identity_token: String,
    pub region: String,
    pub stream_name: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Build a credential from a raw document.
    ///
    /// `expires_at` comes from the document when present, otherwise from
    /// `now + lease`. Region and stream name fall back to the configured
    /// values; a document that leaves either unresolved is malformed, and
    /// so is one that is already expired at `now`.
    pub fn from_document(
        doc: CredentialDocument,
        now: DateTime<Utc>,
        lease: Duration,
        fallback_region: Option<&str>,
        fallback_stream: Option<&str>,
    ) -> Result<Self, CredentialError> {
        if doc.token.is_empty() {
            return Err(CredentialError::Malformed("empty identity token".into()));
        }

        let region = doc
            .region
            .or_else(|| fallback_region.map(str::to_string))
            .ok_or_else(|| CredentialError::Malformed("missing region".into()))?;
        let stream_name = doc
            .stream_name
            .or_else(|| fallback_stream.map(str::to_string))
            .ok_or_else(|| CredentialError::Malformed("missing stream name".into()))?;

        let expires_at = match doc.expiration {
            Some(at) => at,
            None => {
                let lease = chrono::Duration::from_std(lease)
                    .map_err(|e| CredentialError::Malformed(format!("lease duration: {e}")))?;
                now + lease
            }
        };
        if now >= expires_at {
            return Err(CredentialError::Malformed("credential already expired".into()));
        }

        Ok(Self {
            role_arn: doc.role_arn,
            identity_token: doc.token,
            region,
            stream_name,
            expires_at,
        })
    }

    /// Boundary-inclusive: a credential is already expired at `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Raw credential document as returned by the credential server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialDocument {
    pub role_arn: String,
    pub token: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub stream_name: Option<String>,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
}

impl CredentialDocument {
    pub fn new(role_arn: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            role_arn: role_arn.into(),
            token: token.into(),
            region: None,
            stream_name: None,
            expiration: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_stream_name(mut self, stream_name: impl Into<String>) -> Self {
        self.stream_name = Some(stream_name.into());
        self
    }

    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = Some(expiration);
        self
    }
}

/// Grouping key handed to the ingestion endpoint.
///
/// Always the application identifier for records built by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey(pub String);

impl PartitionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A fully-formed record waiting for delivery.
///
/// The payload is opaque to the dispatcher once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    /// Submission order within one dispatcher.
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub partition_key: PartitionKey,
    pub enqueued_at: DateTime<Utc>,
}

/// Lifecycle of a dispatcher instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DispatcherState {
    Created,
    Loading,
    Authenticating,
    Ready,
    ShuttingDown,
    Stopped,
    /// Delivery library failed to load; terminal.
    Failed,
}

impl DispatcherState {
    /// States in which submissions are held in the pending buffer.
    pub fn is_buffering(&self) -> bool {
        matches!(
            self,
            DispatcherState::Created | DispatcherState::Loading | DispatcherState::Authenticating
        )
    }
}

/// Terminal result for one record, published to report subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sequence: u64,
    pub partition_key: PartitionKey,
    pub outcome: DeliveryOutcome,
    /// Number of send attempts made.
    pub attempts: u32,
}

/// Counters snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
    pub retries: u64,
    pub refreshes: u64,
}
