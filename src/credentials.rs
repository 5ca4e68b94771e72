use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::CredentialError;
use crate::retry::RetryPolicy;
use crate::types::{Credential, CredentialDocument};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Remote authority handing out delivery credentials for an application.
#[async_trait]
pub trait CredentialFetcher: Send + Sync {
    async fn fetch_credentials(&self, app_id: &str) -> Result<CredentialDocument, CredentialError>;
}

type RefreshResult = Result<Arc<Credential>, CredentialError>;

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<RefreshResult>>,
}

/// Current credential plus single-flight refresh.
///
/// At most one `fetch_credentials` call is outstanding at any time. Callers
/// arriving while a refresh runs wait for that refresh and receive its
/// result, success or error.
pub struct CredentialStore {
    app_id: String,
    fetcher: Arc<dyn CredentialFetcher>,
    clock: Arc<dyn Clock>,
    lease: Duration,
    fallback_region: Option<String>,
    fallback_stream: Option<String>,
    current: RwLock<Option<Arc<Credential>>>,
    refresh: Mutex<RefreshState>,
    fetches: AtomicU64,
}

impl CredentialStore {
    /// Create an empty store. Defaults to the system clock and a 900s lease.
    pub fn new(app_id: impl Into<String>, fetcher: Arc<dyn CredentialFetcher>) -> Self {
        Self {
            app_id: app_id.into(),
            fetcher,
            clock: Arc::new(SystemClock),
            lease: Duration::from_secs(900),
            fallback_region: None,
            fallback_stream: None,
            current: RwLock::new(None),
            refresh: Mutex::new(RefreshState::default()),
            fetches: AtomicU64::new(0),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Lifetime assumed for documents that carry no expiration.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Region and stream name used when a document omits them.
    pub fn with_fallbacks(mut self, region: Option<String>, stream_name: Option<String>) -> Self {
        self.fallback_region = region;
        self.fallback_stream = stream_name;
        self
    }

    /// Current credential snapshot, expired or not.
    pub fn get(&self) -> Option<Arc<Credential>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Current credential if it is still valid.
    pub fn valid(&self) -> Option<Arc<Credential>> {
        let now = self.clock.now();
        self.get().filter(|cred| !cred.is_expired_at(now))
    }

    /// True if there is no credential yet or `now >= expires_at`.
    pub fn is_expired(&self) -> bool {
        self.valid().is_none()
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock_refresh().in_flight
    }

    /// Number of calls made to the credential fetcher so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Refresh credentials, joining an in-flight refresh if there is one.
    pub async fn refresh(&self) -> RefreshResult {
        let waiter = {
            let mut state = self.lock_refresh();
            if state.in_flight {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                Some(rx)
            } else {
                state.in_flight = true;
                None
            }
        };

        if let Some(rx) = waiter {
            debug!(app_id = %self.app_id, "Joining in-flight credential refresh");
            return rx.await.unwrap_or(Err(CredentialError::Abandoned));
        }

        let mut flight = InFlight {
            store: self,
            settled: false,
        };
        let result = self.fetch().await;
        flight.settle(result.clone());
        result
    }

    /// Wait for the in-flight refresh, if any, without starting one.
    pub async fn settled(&self) -> Option<RefreshResult> {
        let rx = {
            let mut state = self.lock_refresh();
            if !state.in_flight {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            rx
        };
        Some(rx.await.unwrap_or(Err(CredentialError::Abandoned)))
    }

    /// Refresh with the policy's attempt budget and backoff.
    pub async fn refresh_with_retry(&self, policy: &RetryPolicy) -> RefreshResult {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.refresh().await {
                Ok(cred) => return Ok(cred),
                Err(err) => {
                    if !policy.allows_retry(attempt) {
                        warn!(
                            app_id = %self.app_id,
                            attempt = attempt,
                            error = %err,
                            "Credential refresh budget exhausted"
                        );
                        return Err(err);
                    }
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        app_id = %self.app_id,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Credential refresh failed, retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn fetch(&self) -> RefreshResult {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        metric_inc("stream.credentials.refresh");

        let doc = self.fetcher.fetch_credentials(&self.app_id).await?;
        let cred = Credential::from_document(
            doc,
            self.clock.now(),
            self.lease,
            self.fallback_region.as_deref(),
            self.fallback_stream.as_deref(),
        )?;
        info!(
            app_id = %self.app_id,
            region = %cred.region,
            stream = %cred.stream_name,
            expires_at = %cred.expires_at,
            "Credentials refreshed"
        );
        Ok(Arc::new(cred))
    }

    fn lock_refresh(&self) -> MutexGuard<'_, RefreshState> {
        self.refresh.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Clears the in-flight marker and resolves waiters, even if the leading
/// caller is dropped mid-fetch.
struct InFlight<'a> {
    store: &'a CredentialStore,
    settled: bool,
}

impl InFlight<'_> {
    fn settle(&mut self, result: RefreshResult) {
        self.settled = true;
        let waiters = {
            let mut state = self.store.lock_refresh();
            match &result {
                Ok(cred) => {
                    let mut current = self.store.current.write().unwrap_or_else(|e| e.into_inner());
                    *current = Some(cred.clone());
                }
                Err(_) => metric_inc("stream.credentials.failure"),
            }
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.settle(Err(CredentialError::Abandoned));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    struct GatedFetcher {
        gate: Semaphore,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialFetcher for GatedFetcher {
        async fn fetch_credentials(&self, _app_id: &str) -> Result<CredentialDocument, CredentialError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let _permit = self.gate.acquire().await.map_err(|_| CredentialError::Abandoned)?;
            Ok(CredentialDocument::new("arn:role", format!("token-{n}"))
                .with_region("us-east-1")
                .with_stream_name("events"))
        }
    }

    fn gated() -> Arc<GatedFetcher> {
        Arc::new(GatedFetcher {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn empty_store_is_expired() {
        let store = CredentialStore::new("app", gated());
        assert!(store.get().is_none());
        assert!(store.is_expired());
        assert!(!store.is_refreshing());
    }

    #[tokio::test]
    async fn expiry_follows_clock() {
        let fetcher = gated();
        fetcher.gate.add_permits(1);
        let clock = Arc::new(ManualClock::default());
        let store = CredentialStore::new("app", fetcher)
            .with_clock(clock.clone())
            .with_lease(Duration::from_secs(900));

        store.refresh().await.unwrap();
        assert!(!store.is_expired());

        clock.advance(chrono::Duration::seconds(899));
        assert!(!store.is_expired());

        clock.advance(chrono::Duration::seconds(1));
        assert!(store.is_expired());
        assert!(store.get().is_some());
    }

    #[tokio::test]
    async fn dropped_leader_releases_waiters() {
        let fetcher = gated();
        let store = Arc::new(CredentialStore::new("app", fetcher.clone()));

        let leader = {
            let store = store.clone();
            tokio::spawn(async move { store.refresh().await })
        };
        while fetcher.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let follower = {
            let store = store.clone();
            tokio::spawn(async move { store.refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        leader.abort();
        let _ = leader.await;

        assert_eq!(follower.await.unwrap(), Err(CredentialError::Abandoned));
        assert!(!store.is_refreshing());

        fetcher.gate.add_permits(1);
        let cred = store.refresh().await.unwrap();
        assert_eq!(cred.identity_token, "token-2");
    }

    #[tokio::test]
    async fn settled_waits_without_fetching() {
        let fetcher = gated();
        let store = Arc::new(CredentialStore::new("app", fetcher.clone()));
        assert!(store.settled().await.is_none());

        let leader = {
            let store = store.clone();
            tokio::spawn(async move { store.refresh().await })
        };
        while fetcher.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let watcher = {
            let store = store.clone();
            tokio::spawn(async move { store.settled().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        fetcher.gate.add_permits(1);

        let seen = watcher.await.unwrap().unwrap().unwrap();
        assert_eq!(seen.identity_token, "token-1");
        leader.await.unwrap().unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(store.settled().await.is_none());
    }
}
