use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stream_dispatcher::{
    CredentialDocument, CredentialError, CredentialFetcher, Dispatcher, DispatcherConfig,
    IdentifyEvent, PageEvent, PutRecord, RecordSender, SendError, TrackEvent,
};
use tracing_subscriber::EnvFilter;

/// Hands out a fixed short-lived credential.
struct StaticFetcher;

#[async_trait]
impl CredentialFetcher for StaticFetcher {
    async fn fetch_credentials(&self, app_id: &str) -> Result<CredentialDocument, CredentialError> {
        Ok(CredentialDocument::new(format!("arn:aws:iam::123456789012:role/{app_id}"), "demo-token")
            .with_region("us-east-1"))
    }
}

/// Prints records instead of sending them.
struct StdoutSender;

#[async_trait]
impl RecordSender for StdoutSender {
    async fn send(&self, record: PutRecord<'_>) -> Result<(), SendError> {
        println!(
            "{}/{} [{}] {}",
            record.region,
            record.stream_name,
            record.partition_key,
            String::from_utf8_lossy(record.data)
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = DispatcherConfig::new("demo-app", "https://auth.example.com/credentials")
        .with_stream_name("clickstream")
        .with_lease_duration(Duration::from_secs(900));

    let dispatcher = Dispatcher::new(config, Arc::new(StaticFetcher), Arc::new(StdoutSender))
        .expect("valid config");

    // Accepted before the dispatcher is ready; replayed once it is.
    let _ = dispatcher.submit(IdentifyEvent::new("user-42").with_trait("plan", "pro"));
    let _ = dispatcher.submit(PageEvent::named("Pricing").with_category("Marketing"));

    dispatcher.start().expect("start");
    dispatcher.ready().await.expect("ready");

    let _ = dispatcher.submit(TrackEvent::new("Signed Up").property("source", "demo"));

    dispatcher.shutdown().await;
    println!("{:?}", dispatcher.stats());
}
