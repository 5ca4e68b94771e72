//! A client-side event dispatcher for streaming ingestion endpoints.
//!
//! Application events are mapped to opaque records, held until the
//! dispatcher has loaded its delivery library and obtained short-lived
//! credentials, then delivered **one at a time** in submission order.
//!
//! ## Guarantees
//! - No event is lost because the dispatcher was not ready yet
//! - FIFO delivery: buffered backlog first, then later submissions
//! - Single-flight credential refresh, checked lazily before every send
//! - Bounded per-record retries; failures are reported, never fatal
//!
//! ## Non-Guarantees
//! - Durability across restarts
//! - Batching of records
//! - Ordering across partition keys
//!
//! Loading the delivery library, fetching credentials and sending a record
//! are external capabilities supplied through [`LibraryLoader`],
//! [`CredentialFetcher`] and [`RecordSender`].

mod buffer;
mod clock;
mod credentials;
mod dispatcher;
mod error;
mod event;
mod loader;
mod mapping;
mod retry;
mod sender;
mod types;
mod worker;

#[cfg(feature = "http")]
mod http;

pub use buffer::PendingBuffer;
pub use clock::{Clock, ManualClock, SystemClock};
pub use credentials::{CredentialFetcher, CredentialStore};
pub use dispatcher::{Dispatcher, DispatcherBuilder, DispatcherConfig};
pub use error::{
    CredentialError,
    DeliveryOutcome,
    DispatchError,
    DropReason,
    FailureReason,
    LoadError,
    SendError,
};
pub use event::{AppEvent, GroupEvent, IdentifyEvent, PageEvent, Properties, TrackEvent};
pub use loader::{LibraryLoader, NoopLoader};
pub use mapping::{map_event, PageTracking, RecordBody, Session};
pub use retry::RetryPolicy;
pub use sender::{PutRecord, RecordSender};
pub use types::{
    Credential,
    CredentialDocument,
    DeliveryReport,
    DeliveryStats,
    DispatcherState,
    OutboundRecord,
    PartitionKey,
};

#[cfg(feature = "http")]
pub use http::HttpCredentialFetcher;
