use async_trait::async_trait;

use crate::error::SendError;
use crate::types::Credential;

/// One put-record call against the streaming endpoint.
#[derive(Debug, Clone, Copy)]
pub struct PutRecord<'a> {
    pub data: &'a [u8],
    pub partition_key: &'a str,
    pub stream_name: &'a str,
    pub region: &'a str,
    pub credential: &'a Credential,
}

/// Sends a single record to the ingestion endpoint.
///
/// The worker never calls this concurrently. Implementations classify
/// failures as transient (retried) or permanent (dropped at once).
#[async_trait]
pub trait RecordSender: Send + Sync {
    async fn send(&self, record: PutRecord<'_>) -> Result<(), SendError>;
}
