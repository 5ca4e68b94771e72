mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{clock, TestFetcher};
use stream_dispatcher::{Clock, CredentialError, CredentialStore, RetryPolicy};

const CALLERS: usize = 8;

fn store(fetcher: Arc<TestFetcher>) -> Arc<CredentialStore> {
    let clock = fetcher.clock.clone();
    Arc::new(CredentialStore::new("app-1", fetcher).with_clock(clock))
}

#[tokio::test]
async fn test_concurrent_refreshes_share_one_fetch() {
    let fetcher = Arc::new(TestFetcher::gated(clock()));
    let store = store(fetcher.clone());

    let mut handles = Vec::new();
    for _ in 0..CALLERS {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            assert!(store.is_expired());
            store.refresh().await
        }));
    }

    // Let every caller reach the store before the fetch completes.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.is_refreshing());
    fetcher.release(1);

    let mut tokens = Vec::new();
    for handle in handles {
        let cred = handle.await.unwrap().unwrap();
        tokens.push(cred.identity_token.clone());
    }

    assert_eq!(fetcher.calls(), 1);
    assert!(tokens.iter().all(|t| t == "token-1"));
    assert!(!store.is_refreshing());
    assert!(!store.is_expired());
}

#[tokio::test]
async fn test_concurrent_refreshes_share_one_error() {
    let fetcher = Arc::new(TestFetcher::gated(clock()));
    fetcher.fail_next(1);
    let store = store(fetcher.clone());

    let mut handles = Vec::new();
    for _ in 0..CALLERS {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.refresh().await }));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    fetcher.release(1);

    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err, CredentialError::Transient("outage 0".into()));
    }
    assert_eq!(fetcher.calls(), 1);
    assert!(store.get().is_none());
    assert!(!store.is_refreshing());
}

#[tokio::test]
async fn test_failed_refresh_keeps_previous_credential() {
    let fetcher = Arc::new(TestFetcher::new(clock()));
    let store = store(fetcher.clone());

    let first = store.refresh().await.unwrap();
    fetcher.fail_next(1);
    assert!(store.refresh().await.is_err());

    let current = store.get().unwrap();
    assert!(Arc::ptr_eq(&first, &current));
}

#[tokio::test]
async fn test_expiry_boundary() {
    let fetcher = Arc::new(TestFetcher::new(clock()));
    let clock = fetcher.clock.clone();
    let store = store(fetcher);

    let cred = store.refresh().await.unwrap();
    let expires_at = cred.expires_at;

    clock.set(expires_at - chrono::Duration::milliseconds(1));
    assert!(!store.is_expired());
    assert!(store.valid().is_some());

    clock.set(expires_at);
    assert!(store.is_expired());
    assert!(store.valid().is_none());

    clock.set(expires_at + chrono::Duration::seconds(30));
    assert!(store.is_expired());
    assert_eq!(clock.now(), expires_at + chrono::Duration::seconds(30));
}

#[tokio::test]
async fn test_refresh_with_retry_counts_attempts() {
    let fetcher = Arc::new(TestFetcher::new(clock()));
    let store = store(fetcher.clone());

    fetcher.fail_next(2);
    let cred = store.refresh_with_retry(&RetryPolicy::immediate(3)).await.unwrap();
    assert_eq!(cred.identity_token, "token-3");
    assert_eq!(fetcher.calls(), 3);

    fetcher.fail_next(3);
    assert!(store.refresh_with_retry(&RetryPolicy::immediate(3)).await.is_err());
    assert_eq!(fetcher.calls(), 6);
}
