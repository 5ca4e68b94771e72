#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use stream_dispatcher::{
    Clock, CredentialDocument, CredentialError, CredentialFetcher, DeliveryReport, Dispatcher,
    DispatcherConfig, LibraryLoader, LoadError, ManualClock, PutRecord, RecordSender,
    RetryPolicy, SendError,
};
use tokio::sync::{broadcast, Semaphore};

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()))
}

pub fn config() -> DispatcherConfig {
    DispatcherConfig::new("app-1", "https://auth.example.com")
        .with_retry_policy(RetryPolicy::immediate(3))
}

/// Hands out `token-N` documents expiring 900s after the clock's now.
pub struct TestFetcher {
    pub clock: Arc<ManualClock>,
    pub calls: AtomicUsize,
    failures: Mutex<VecDeque<CredentialError>>,
    stale: AtomicUsize,
    held: AtomicBool,
    gate: Semaphore,
}

impl TestFetcher {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            calls: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            stale: AtomicUsize::new(0),
            held: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }

    /// Every fetch blocks until `release` is called.
    pub fn gated(clock: Arc<ManualClock>) -> Self {
        let fetcher = Self::new(clock);
        fetcher.hold();
        fetcher
    }

    /// From now on every fetch blocks until `release` is called.
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// The next `n` documents expired one second before the clock's now.
    pub fn stale_next(&self, n: usize) {
        self.stale.fetch_add(n, Ordering::SeqCst);
    }

    /// The next `n` fetches fail with a transient error.
    pub fn fail_next(&self, n: usize) {
        let mut failures = self.failures.lock().unwrap();
        for i in 0..n {
            failures.push_back(CredentialError::Transient(format!("outage {i}")));
        }
    }

    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialFetcher for TestFetcher {
    async fn fetch_credentials(&self, app_id: &str) -> Result<CredentialDocument, CredentialError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.held.load(Ordering::SeqCst) {
            self.gate
                .acquire()
                .await
                .map_err(|_| CredentialError::Abandoned)?
                .forget();
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let stale = self
            .stale
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let lifetime = if stale {
            chrono::Duration::seconds(-1)
        } else {
            chrono::Duration::seconds(900)
        };
        Ok(CredentialDocument::new(format!("arn:aws:iam::1:role/{app_id}"), format!("token-{n}"))
            .with_region("us-east-1")
            .with_stream_name("events")
            .with_expiration(self.clock.now() + lifetime))
    }
}

#[derive(Debug, Clone)]
pub struct Sent {
    pub payload: serde_json::Value,
    pub token: String,
    pub partition_key: String,
    pub stream_name: String,
    pub region: String,
}

impl Sent {
    pub fn event(&self) -> &str {
        self.payload["event"].as_str().unwrap_or_default()
    }
}

type SendHook = Box<dyn Fn(usize) + Send + Sync>;

/// Records every send; results come from a script, defaulting to success.
pub struct RecordingSender {
    pub sent: Mutex<Vec<Sent>>,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    script: Mutex<VecDeque<Result<(), SendError>>>,
    after_send: Option<SendHook>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
            after_send: None,
        }
    }

    /// Run `hook(n)` after the n-th send call (1-based) completes.
    pub fn with_after_send<F>(mut self, hook: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.after_send = Some(Box::new(hook));
        self
    }

    pub fn script(&self, results: Vec<Result<(), SendError>>) {
        self.script.lock().unwrap().extend(results);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSender for RecordingSender {
    async fn send(&self, record: PutRecord<'_>) -> Result<(), SendError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(1)).await;

        let result = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.sent.lock().unwrap().push(Sent {
                payload: serde_json::from_slice(record.data).unwrap(),
                token: record.credential.identity_token.clone(),
                partition_key: record.partition_key.to_string(),
                stream_name: record.stream_name.to_string(),
                region: record.region.to_string(),
            });
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(hook) = &self.after_send {
            hook(n);
        }
        result
    }
}

/// Loader that completes only when released, or fails immediately.
pub struct TestLoader {
    gate: Semaphore,
    fail: bool,
}

impl TestLoader {
    pub fn gated() -> Self {
        Self {
            gate: Semaphore::new(0),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            gate: Semaphore::new(1),
            fail: true,
        }
    }

    pub fn release(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl LibraryLoader for TestLoader {
    async fn load(&self) -> Result<(), LoadError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| LoadError("gate closed".into()))?;
        if self.fail {
            return Err(LoadError("script blocked".into()));
        }
        Ok(())
    }
}

pub struct Harness {
    pub dispatcher: Dispatcher,
    pub clock: Arc<ManualClock>,
    pub fetcher: Arc<TestFetcher>,
    pub sender: Arc<RecordingSender>,
}

impl Harness {
    pub fn clock_now(&self) -> chrono::DateTime<Utc> {
        self.clock.now()
    }
}

pub fn harness(sender: RecordingSender) -> Harness {
    harness_with(config(), sender, None)
}

pub fn harness_on_clock(clock: Arc<ManualClock>, sender: RecordingSender) -> Harness {
    build_harness(clock, config(), sender, None)
}

pub fn harness_with(
    config: DispatcherConfig,
    sender: RecordingSender,
    loader: Option<Arc<dyn LibraryLoader>>,
) -> Harness {
    build_harness(clock(), config, sender, loader)
}

/// Harness around a caller-built fetcher, on the fetcher's clock.
pub fn harness_with_fetcher(
    fetcher: TestFetcher,
    config: DispatcherConfig,
    sender: RecordingSender,
) -> Harness {
    assemble(Arc::new(fetcher), config, sender, None)
}

fn build_harness(
    clock: Arc<ManualClock>,
    config: DispatcherConfig,
    sender: RecordingSender,
    loader: Option<Arc<dyn LibraryLoader>>,
) -> Harness {
    assemble(Arc::new(TestFetcher::new(clock)), config, sender, loader)
}

fn assemble(
    fetcher: Arc<TestFetcher>,
    config: DispatcherConfig,
    sender: RecordingSender,
    loader: Option<Arc<dyn LibraryLoader>>,
) -> Harness {
    let clock = fetcher.clock.clone();
    let sender = Arc::new(sender);
    let mut builder = Dispatcher::builder(config)
        .credential_fetcher(fetcher.clone())
        .record_sender(sender.clone())
        .clock(clock.clone());
    if let Some(loader) = loader {
        builder = builder.loader(loader);
    }
    Harness {
        dispatcher: builder.build().unwrap(),
        clock,
        fetcher,
        sender,
    }
}

/// Wait for `n` reports, failing the test after a few seconds.
pub async fn collect_reports(
    rx: &mut broadcast::Receiver<DeliveryReport>,
    n: usize,
) -> Vec<DeliveryReport> {
    let mut reports = Vec::with_capacity(n);
    while reports.len() < n {
        let report = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for delivery reports")
            .expect("report channel closed");
        reports.push(report);
    }
    reports
}
