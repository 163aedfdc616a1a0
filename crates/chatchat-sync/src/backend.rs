//! Contracts of the external collaborators the sync core depends on.
//!
//! The core never talks to a concrete backend. A session is built from three
//! handles: a change feed to subscribe to, a record store to write to, and a
//! content store to fetch media from. [`crate::memory::MemoryBackend`]
//! implements all three for tests and local runs.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use chatchat_shared::protocol::{FeedEvent, FeedEventKind};
use chatchat_shared::BackendError;

/// Identifies one live subscription so it can be released later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// What to listen to.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedQuery {
    pub path: String,
    /// Only the most recent `n` children (by key order) are delivered.
    pub limit_to_last: Option<usize>,
    /// Only children whose value equals this are delivered.
    pub equal_to: Option<Value>,
}

impl FeedQuery {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            limit_to_last: None,
            equal_to: None,
        }
    }

    pub fn limit_to_last(mut self, n: usize) -> Self {
        self.limit_to_last = Some(n);
        self
    }

    pub fn equal_to(mut self, value: Value) -> Self {
        self.equal_to = Some(value);
        self
    }

    /// Whether a child value passes the `equal_to` filter.
    pub fn accepts(&self, value: &Value) -> bool {
        self.equal_to.as_ref().map_or(true, |expected| expected == value)
    }
}

/// A live subscription: events arrive on `events` in backend arrival order.
#[derive(Debug)]
pub struct FeedSubscription {
    pub handle: SubscriptionHandle,
    pub events: mpsc::UnboundedReceiver<FeedEvent>,
}

/// Push source of channel, message and presence events.
pub trait ChangeFeed: Send + Sync + 'static {
    fn subscribe(
        &self,
        query: FeedQuery,
        kind: FeedEventKind,
    ) -> Result<FeedSubscription, BackendError>;

    /// Release a subscription. Unknown or already released handles are ignored.
    fn unsubscribe(&self, handle: SubscriptionHandle);
}

/// Record writes. Completion is reported by the returned future.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Allocate a fresh child key under `parent` without writing anything.
    fn reserve_key(&self, parent: &str) -> String;

    /// Replace the value at `path`.
    async fn write(&self, path: &str, value: Value) -> Result<(), BackendError>;

    /// Merge `fields` into the record at `path`.
    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), BackendError>;

    async fn remove(&self, path: &str) -> Result<(), BackendError>;
}

/// Metadata of an object in the content store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentMetadata {
    pub content_type: String,
    pub size: u64,
}

/// Blob storage for media attachments.
#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    async fn fetch(&self, reference: &str) -> Result<Bytes, BackendError>;

    async fn fetch_metadata(&self, reference: &str) -> Result<ContentMetadata, BackendError>;

    /// Store `data` under `path` and return the reference to put in `photoURL`.
    async fn upload(
        &self,
        path: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<String, BackendError>;
}
