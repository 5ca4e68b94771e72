use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::buffer::PendingBuffer;
use crate::clock::{Clock, SystemClock};
use crate::credentials::{CredentialFetcher, CredentialStore};
use crate::error::{DeliveryOutcome, DispatchError, DropReason, FailureReason};
use crate::event::AppEvent;
use crate::loader::{LibraryLoader, NoopLoader};
use crate::mapping::{map_event, PageTracking, Session};
use crate::retry::RetryPolicy;
use crate::sender::RecordSender;
use crate::types::{DeliveryReport, DeliveryStats, DispatcherState, OutboundRecord, PartitionKey};
use crate::worker::{DeliveryWorker, Reporter, WorkerContext};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Dispatcher options, loaded once and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatcherConfig {
    /// Application identifier; also the partition key of every record.
    pub app_id: String,

    /// Base address of the credential server.
    pub credential_server: String,

    /// Credential lifetime assumed when a document carries no expiration.
    pub lease_duration_secs: u64,

    /// Fallback stream name for documents that omit it.
    pub stream_name: Option<String>,

    /// Fallback region for documents that omit it.
    pub region: Option<String>,

    pub track_all_pages: bool,
    pub track_named_pages: bool,
    pub track_categorized_pages: bool,

    /// Budget and backoff for credential refreshes and sends.
    pub retry: RetryPolicy,

    /// Buffered reports per subscriber before slow subscribers lag.
    pub report_capacity: usize,

    /// How long `shutdown` waits for an initial credential refresh that is
    /// already in flight.
    pub shutdown_grace_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            credential_server: String::new(),
            lease_duration_secs: 900,
            stream_name: None,
            region: None,
            track_all_pages: false,
            track_named_pages: true,
            track_categorized_pages: true,
            retry: RetryPolicy::default(),
            report_capacity: 1_024,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl DispatcherConfig {
    pub fn new(app_id: impl Into<String>, credential_server: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            credential_server: credential_server.into(),
            ..Self::default()
        }
    }

    /// Parse an options document (camelCase keys, every field optional).
    pub fn from_json(json: &str) -> Result<Self, DispatchError> {
        let config: Self = serde_json::from_str(json).map_err(|e| DispatchError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.app_id.trim().is_empty() {
            return Err(DispatchError::InvalidConfig {
                reason: "appId must not be empty".into(),
            });
        }
        if self.credential_server.trim().is_empty() {
            return Err(DispatchError::InvalidConfig {
                reason: "credentialServer must not be empty".into(),
            });
        }
        if self.lease_duration_secs == 0 {
            return Err(DispatchError::InvalidConfig {
                reason: "leaseDurationSecs must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn page_tracking(&self) -> PageTracking {
        PageTracking {
            all: self.track_all_pages,
            named: self.track_named_pages,
            categorized: self.track_categorized_pages,
        }
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration_secs = lease.as_secs();
        self
    }

    pub fn with_stream_name(mut self, stream_name: impl Into<String>) -> Self {
        self.stream_name = Some(stream_name.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_page_tracking(mut self, all: bool, named: bool, categorized: bool) -> Self {
        self.track_all_pages = all;
        self.track_named_pages = named;
        self.track_categorized_pages = categorized;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }
}

type ReadyHook = Box<dyn FnOnce() + Send + 'static>;

/// Assembles a [`Dispatcher`] from its configuration and collaborators.
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    fetcher: Option<Arc<dyn CredentialFetcher>>,
    sender: Option<Arc<dyn RecordSender>>,
    loader: Arc<dyn LibraryLoader>,
    clock: Arc<dyn Clock>,
    ready_hook: Option<ReadyHook>,
}

impl DispatcherBuilder {
    pub fn credential_fetcher(mut self, fetcher: Arc<dyn CredentialFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn record_sender(mut self, sender: Arc<dyn RecordSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Defaults to [`NoopLoader`].
    pub fn loader(mut self, loader: Arc<dyn LibraryLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs once, when the dispatcher becomes ready.
    pub fn on_ready<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.ready_hook = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Result<Dispatcher, DispatchError> {
        self.config.validate()?;
        let fetcher = self.fetcher.ok_or_else(|| DispatchError::InvalidConfig {
            reason: "a credential fetcher is required".into(),
        })?;
        let sender = self.sender.ok_or_else(|| DispatchError::InvalidConfig {
            reason: "a record sender is required".into(),
        })?;

        let credentials = Arc::new(
            CredentialStore::new(self.config.app_id.clone(), fetcher)
                .with_clock(self.clock.clone())
                .with_lease(self.config.lease_duration())
                .with_fallbacks(self.config.region.clone(), self.config.stream_name.clone()),
        );
        let (state_tx, _) = watch::channel(DispatcherState::Created);
        let reporter = Arc::new(Reporter::new(self.config.report_capacity));

        let shared = Arc::new(Shared {
            partition_key: PartitionKey(self.config.app_id.clone()),
            config: self.config,
            credentials,
            reporter,
            clock: self.clock,
            state_tx,
            inner: Mutex::new(Inner {
                state: DispatcherState::Created,
                pending: PendingBuffer::new(),
                session: Session::default(),
                next_sequence: 0,
                worker: None,
            }),
        });

        Ok(Dispatcher {
            shared,
            loader: self.loader,
            sender,
            ready_hook: Mutex::new(self.ready_hook),
            bootstrap: Mutex::new(None),
        })
    }
}

/// Buffers events until credentials are in place, then feeds them one at a
/// time to the streaming endpoint.
///
/// Lifecycle: `Created → Loading → Authenticating → Ready → ShuttingDown →
/// Stopped`, or `Failed` if the delivery library cannot be loaded.
pub struct Dispatcher {
    shared: Arc<Shared>,
    loader: Arc<dyn LibraryLoader>,
    sender: Arc<dyn RecordSender>,
    ready_hook: Mutex<Option<ReadyHook>>,
    bootstrap: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    config: DispatcherConfig,
    partition_key: PartitionKey,
    credentials: Arc<CredentialStore>,
    reporter: Arc<Reporter>,
    clock: Arc<dyn Clock>,
    state_tx: watch::Sender<DispatcherState>,
    inner: Mutex<Inner>,
}

struct Inner {
    state: DispatcherState,
    pending: PendingBuffer,
    session: Session,
    next_sequence: u64,
    worker: Option<DeliveryWorker>,
}

impl Dispatcher {
    pub fn builder(config: DispatcherConfig) -> DispatcherBuilder {
        DispatcherBuilder {
            config,
            fetcher: None,
            sender: None,
            loader: Arc::new(NoopLoader),
            clock: Arc::new(SystemClock),
            ready_hook: None,
        }
    }

    /// Dispatcher with the default loader and system clock.
    pub fn new(
        config: DispatcherConfig,
        fetcher: Arc<dyn CredentialFetcher>,
        sender: Arc<dyn RecordSender>,
    ) -> Result<Self, DispatchError> {
        Self::builder(config)
            .credential_fetcher(fetcher)
            .record_sender(sender)
            .build()
    }

    /// Spawn the delivery worker and begin loading and authenticating in
    /// the background. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<(), DispatchError> {
        {
            let mut inner = self.shared.lock();
            match inner.state {
                DispatcherState::Created => {}
                DispatcherState::ShuttingDown | DispatcherState::Stopped => {
                    return Err(DispatchError::Shutdown)
                }
                DispatcherState::Failed => return Err(DispatchError::Failed),
                _ => return Err(DispatchError::AlreadyStarted),
            }

            let ctx = Arc::new(WorkerContext {
                credentials: self.shared.credentials.clone(),
                sender: self.sender.clone(),
                retry: self.shared.config.retry.clone(),
                reporter: self.shared.reporter.clone(),
            });
            inner.worker = Some(DeliveryWorker::spawn(ctx));
            self.shared.set_state(&mut inner, DispatcherState::Loading);
        }

        let hook = lock(&self.ready_hook).take();
        let handle = tokio::spawn(bootstrap(self.shared.clone(), self.loader.clone(), hook));
        *lock(&self.bootstrap) = Some(handle);

        info!(app_id = %self.shared.config.app_id, "Dispatcher starting");
        Ok(())
    }

    /// Accept an application event.
    ///
    /// Never blocks and never fails because of credential or send problems;
    /// only a stopped or failed dispatcher refuses events.
    pub fn submit(&self, event: impl Into<AppEvent>) -> Result<(), DispatchError> {
        let event = event.into();
        let mut refused = Vec::new();
        let mut unencodable = Vec::new();

        {
            let mut guard = self.shared.lock();
            let inner = &mut *guard;
            match inner.state {
                DispatcherState::ShuttingDown | DispatcherState::Stopped => {
                    metric_inc("stream.dispatch.shutdown");
                    return Err(DispatchError::Shutdown);
                }
                DispatcherState::Failed => return Err(DispatchError::Failed),
                _ => {}
            }

            inner.session.apply(&event);
            let bodies = map_event(&event, &inner.session, self.shared.config.page_tracking());
            let enqueued_at = self.shared.clock.now();

            for body in bodies {
                let record = match self.shared.stamp(inner, body.encode(), enqueued_at) {
                    Ok(record) => record,
                    Err(report) => {
                        unencodable.push(report);
                        continue;
                    }
                };

                match (&inner.state, &inner.worker) {
                    (DispatcherState::Ready, Some(worker)) => {
                        if let Err(record) = worker.enqueue(record) {
                            refused.push(record);
                        } else {
                            metric_inc("stream.dispatch.enqueued");
                        }
                    }
                    _ => {
                        inner.pending.append(record);
                        metric_inc("stream.dispatch.buffered");
                    }
                }
            }
        }

        for report in unencodable {
            error!(kind = event.kind(), sequence = report.sequence, "Failed to encode record");
            self.shared.reporter.report(report);
        }
        self.shared.report_dropped(refused, DropReason::Shutdown);
        Ok(())
    }

    /// Stop accepting events and let the worker finish everything already
    /// queued.
    ///
    /// An initial credential refresh already in flight gets up to
    /// `shutdown_grace` to finish, so a dispatcher about to become ready
    /// still replays its backlog. Records still buffered after that are
    /// reported as dropped.
    pub async fn shutdown(&self) {
        if self.state() == DispatcherState::Authenticating {
            self.await_initial_refresh().await;
        }

        let taken = {
            let mut inner = self.shared.lock();
            if matches!(
                inner.state,
                DispatcherState::ShuttingDown | DispatcherState::Stopped
            ) {
                None
            } else {
                self.shared.set_state(&mut inner, DispatcherState::ShuttingDown);
                Some((inner.worker.take(), inner.pending.take_all()))
            }
        };
        let Some((worker, unsent)) = taken else {
            // Another caller is already shutting down.
            self.wait_for_state(DispatcherState::Stopped).await;
            return;
        };

        if let Some(handle) = lock(&self.bootstrap).take() {
            handle.abort();
        }

        if !unsent.is_empty() {
            warn!(count = unsent.len(), "Shutting down before ready, dropping buffered records");
        }
        self.shared.report_dropped(unsent, DropReason::Shutdown);

        if let Some(worker) = worker {
            worker.finish().await;
        }

        let mut inner = self.shared.lock();
        self.shared.set_state(&mut inner, DispatcherState::Stopped);
        info!(app_id = %self.shared.config.app_id, "Dispatcher stopped");
    }

    /// Resolves once the dispatcher is ready; errors if it stops or fails
    /// first.
    pub async fn ready(&self) -> Result<(), DispatchError> {
        let mut rx = self.shared.state_tx.subscribe();
        let state = *rx
            .wait_for(|s| !s.is_buffering())
            .await
            .map_err(|_| DispatchError::Shutdown)?;
        match state {
            DispatcherState::Ready => Ok(()),
            DispatcherState::Failed => Err(DispatchError::Failed),
            _ => Err(DispatchError::Shutdown),
        }
    }

    pub fn state(&self) -> DispatcherState {
        self.shared.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == DispatcherState::Ready
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DispatcherState> {
        self.shared.state_tx.subscribe()
    }

    /// Stream of terminal outcomes for every record.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<DeliveryReport> {
        self.shared.reporter.subscribe()
    }

    pub fn stats(&self) -> DeliveryStats {
        self.shared
            .reporter
            .snapshot(self.shared.credentials.fetch_count())
    }

    /// Records waiting for readiness.
    pub fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn credentials(&self) -> Arc<CredentialStore> {
        self.shared.credentials.clone()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    async fn await_initial_refresh(&self) {
        let grace = self.shared.config.shutdown_grace();
        let settle = async {
            if let Some(Ok(_)) = self.shared.credentials.settled().await {
                // The bootstrap flips to Ready right after a successful refresh.
                let mut rx = self.shared.state_tx.subscribe();
                let _ = rx
                    .wait_for(|s| *s != DispatcherState::Authenticating)
                    .await;
            }
        };
        if timeout(grace, settle).await.is_err() {
            warn!(
                app_id = %self.shared.config.app_id,
                grace_ms = grace.as_millis() as u64,
                "Initial authentication still pending at shutdown"
            );
        }
    }

    async fn wait_for_state(&self, target: DispatcherState) {
        let mut rx = self.shared.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s == target).await;
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.bootstrap).take() {
            handle.abort();
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    /// Assign the next sequence number to an encoded body. A body that
    /// failed to encode still consumes a sequence and comes back as its
    /// terminal report.
    fn stamp(
        &self,
        inner: &mut Inner,
        payload: Result<Vec<u8>, serde_json::Error>,
        enqueued_at: DateTime<Utc>,
    ) -> Result<OutboundRecord, DeliveryReport> {
        inner.next_sequence += 1;
        match payload {
            Ok(payload) => Ok(OutboundRecord {
                sequence: inner.next_sequence,
                payload,
                partition_key: self.partition_key.clone(),
                enqueued_at,
            }),
            Err(_) => Err(DeliveryReport {
                sequence: inner.next_sequence,
                partition_key: self.partition_key.clone(),
                outcome: DeliveryOutcome::Failed(FailureReason::Unencodable),
                attempts: 0,
            }),
        }
    }

    fn set_state(&self, inner: &mut Inner, state: DispatcherState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Move from `from` to `to` unless something else (shutdown) moved the
    /// state first.
    fn transition(&self, from: DispatcherState, to: DispatcherState) -> bool {
        let mut inner = self.lock();
        if inner.state != from {
            return false;
        }
        self.set_state(&mut inner, to);
        true
    }

    /// Drain the backlog into the worker and flip to `Ready`, atomically
    /// with respect to `submit`.
    fn become_ready(&self) -> bool {
        let refused = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if inner.state != DispatcherState::Authenticating {
                return false;
            }

            let backlog = inner.pending.len();
            let refused = match &inner.worker {
                Some(worker) => inner.pending.drain_into(|record| worker.enqueue(record)),
                None => inner.pending.take_all(),
            };
            self.set_state(inner, DispatcherState::Ready);
            info!(
                app_id = %self.config.app_id,
                backlog = backlog,
                "Dispatcher ready, replaying buffered records"
            );
            refused
        };

        self.report_dropped(refused, DropReason::Shutdown);
        true
    }

    fn fail(&self) {
        let (unsent, worker) = {
            let mut inner = self.lock();
            if inner.state != DispatcherState::Loading {
                return;
            }
            self.set_state(&mut inner, DispatcherState::Failed);
            (inner.pending.take_all(), inner.worker.take())
        };
        // Nothing was ever queued on the worker; dropping it ends its task.
        drop(worker);
        self.report_dropped(unsent, DropReason::LoadFailure);
    }

    fn report_dropped(&self, records: Vec<OutboundRecord>, reason: DropReason) {
        for record in records {
            self.reporter.report(DeliveryReport {
                sequence: record.sequence,
                partition_key: record.partition_key,
                outcome: DeliveryOutcome::Dropped(reason.clone()),
                attempts: 0,
            });
        }
    }
}

/// Load the library, authenticate, then go ready.
///
/// Authentication is retried in rounds of the retry budget until it
/// succeeds or the dispatcher shuts down; events keep buffering meanwhile.
async fn bootstrap(shared: Arc<Shared>, loader: Arc<dyn LibraryLoader>, ready_hook: Option<ReadyHook>) {
    if let Err(err) = loader.load().await {
        error!(app_id = %shared.config.app_id, error = %err, "Delivery library failed to load");
        metric_inc("stream.dispatch.load_failure");
        shared.fail();
        return;
    }

    if !shared.transition(DispatcherState::Loading, DispatcherState::Authenticating) {
        return;
    }

    let mut round = 0u32;
    loop {
        round += 1;
        match shared.credentials.refresh_with_retry(&shared.config.retry).await {
            Ok(_) => break,
            Err(err) => {
                let delay = shared.config.retry.round_delay();
                warn!(
                    app_id = %shared.config.app_id,
                    round = round,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Initial authentication failed, still buffering"
                );
                sleep(delay).await;
            }
        }
    }

    if shared.become_ready() {
        if let Some(hook) = ready_hook {
            hook();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
