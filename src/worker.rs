use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::credentials::CredentialStore;
use crate::error::{CredentialError, DeliveryOutcome, FailureReason};
use crate::retry::RetryPolicy;
use crate::sender::{PutRecord, RecordSender};
use crate::types::{Credential, DeliveryReport, DeliveryStats, OutboundRecord};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Publishes terminal record outcomes and keeps counters.
pub(crate) struct Reporter {
    tx: broadcast::Sender<DeliveryReport>,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    retries: AtomicU64,
}

impl Reporter {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DeliveryReport> {
        self.tx.subscribe()
    }

    pub(crate) fn report(&self, report: DeliveryReport) {
        match &report.outcome {
            DeliveryOutcome::Delivered => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                metric_inc("stream.delivery.success");
                debug!(
                    sequence = report.sequence,
                    attempts = report.attempts,
                    "Record delivered"
                );
            }
            DeliveryOutcome::Failed(reason) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                metric_inc("stream.delivery.failure");
                error!(
                    sequence = report.sequence,
                    attempts = report.attempts,
                    reason = %reason,
                    "Record delivery failed, dropping"
                );
            }
            DeliveryOutcome::Dropped(reason) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metric_inc("stream.delivery.dropped");
                warn!(
                    sequence = report.sequence,
                    reason = ?reason,
                    "Record dropped"
                );
            }
        }

        // No subscribers is fine.
        let _ = self.tx.send(report);
    }

    fn retried(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        metric_inc("stream.delivery.retry");
    }

    pub(crate) fn snapshot(&self, refreshes: u64) -> DeliveryStats {
        DeliveryStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            refreshes,
        }
    }
}

/// Shared context for the delivery worker.
pub(crate) struct WorkerContext {
    pub credentials: Arc<CredentialStore>,
    pub sender: Arc<dyn RecordSender>,
    pub retry: RetryPolicy,
    pub reporter: Arc<Reporter>,
}

/// Single-concurrency consumer of the post-ready queue.
pub(crate) struct DeliveryWorker {
    tx: mpsc::UnboundedSender<OutboundRecord>,
    handle: JoinHandle<()>,
}

impl DeliveryWorker {
    pub(crate) fn spawn(ctx: Arc<WorkerContext>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(worker_loop(rx, ctx));
        Self { tx, handle }
    }

    /// Non-blocking append. Hands the record back if the worker is gone.
    pub(crate) fn enqueue(&self, record: OutboundRecord) -> Result<(), OutboundRecord> {
        self.tx.send(record).map_err(|e| e.0)
    }

    /// Close the queue and wait until every queued record is processed.
    pub(crate) async fn finish(self) {
        let Self { tx, handle } = self;
        drop(tx);
        if let Err(err) = handle.await {
            error!(error = %err, "Delivery worker terminated abnormally");
        }
    }
}

/// Main worker loop.
///
/// One record at a time: the next record is not dequeued until the current
/// one reached a terminal outcome, including any credential refresh and
/// retries it needed.
async fn worker_loop(mut rx: mpsc::UnboundedReceiver<OutboundRecord>, ctx: Arc<WorkerContext>) {
    info!("Delivery worker started");
    while let Some(record) = rx.recv().await {
        let report = process_record(record, &ctx).await;
        ctx.reporter.report(report);
    }
    info!("Delivery worker stopped");
}

async fn process_record(record: OutboundRecord, ctx: &WorkerContext) -> DeliveryReport {
    let mut attempts = 0;

    loop {
        // Fresh read on every attempt; never reuse a credential across sends.
        let credential = match current_credential(ctx).await {
            Ok(credential) => credential,
            Err(err) => {
                warn!(
                    sequence = record.sequence,
                    error = %err,
                    "No credentials for record"
                );
                return finish(&record, DeliveryOutcome::Failed(FailureReason::CredentialUnavailable), attempts);
            }
        };

        attempts += 1;
        let result = ctx
            .sender
            .send(PutRecord {
                data: &record.payload,
                partition_key: record.partition_key.as_str(),
                stream_name: &credential.stream_name,
                region: &credential.region,
                credential: &credential,
            })
            .await;

        match result {
            Ok(()) => return finish(&record, DeliveryOutcome::Delivered, attempts),
            Err(err) if !err.is_transient() => {
                warn!(sequence = record.sequence, error = %err, "Record rejected");
                return finish(&record, DeliveryOutcome::Failed(FailureReason::Rejected), attempts);
            }
            Err(err) => {
                if !ctx.retry.allows_retry(attempts) {
                    return finish(
                        &record,
                        DeliveryOutcome::Failed(FailureReason::MaxRetriesExceeded),
                        attempts,
                    );
                }
                let delay = ctx.retry.delay_for_attempt(attempts);
                warn!(
                    sequence = record.sequence,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Send failed, retrying"
                );
                ctx.reporter.retried();
                sleep(delay).await;
            }
        }
    }
}

/// Valid credential, refreshing first if the stored one is expired.
///
/// While this awaits the worker takes nothing else off its queue.
async fn current_credential(ctx: &WorkerContext) -> Result<Arc<Credential>, CredentialError> {
    if let Some(credential) = ctx.credentials.valid() {
        return Ok(credential);
    }
    debug!("Credentials expired, pausing delivery for refresh");
    let credential = ctx.credentials.refresh_with_retry(&ctx.retry).await?;
    debug!("Credentials refreshed, resuming delivery");
    Ok(credential)
}

fn finish(record: &OutboundRecord, outcome: DeliveryOutcome, attempts: u32) -> DeliveryReport {
    DeliveryReport {
        sequence: record.sequence,
        partition_key: record.partition_key.clone(),
        outcome,
        attempts,
    }
}
