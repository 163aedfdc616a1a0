//! In-process backend implementing every collaborator trait.
//!
//! Records live in a single JSON tree addressed by `/`-separated paths.
//! After each mutation every live subscription diffs its path before and
//! after, and emits `added` / `removed` / `changed` / `value` events the way
//! a hosted real-time database would. Keys handed out by `reserve_key` sort
//! in allocation order, so "last N" queries return the newest records.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use chatchat_shared::protocol::{FeedEvent, FeedEventKind};
use chatchat_shared::BackendError;

use crate::backend::{
    ChangeFeed, ContentMetadata, ContentStore, FeedQuery, FeedSubscription, RecordStore,
    SubscriptionHandle,
};

struct Subscription {
    query: FeedQuery,
    kind: FeedEventKind,
    tx: mpsc::UnboundedSender<FeedEvent>,
}

struct StoredContent {
    data: Bytes,
    content_type: String,
}

#[derive(Default)]
struct Inner {
    root: Value,
    next_key: u64,
    next_handle: u64,
    subscriptions: HashMap<u64, Subscription>,
    content: HashMap<String, StoredContent>,
    offline: bool,
}

#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value at `path`, if any.
    pub fn read(&self, path: &str) -> Option<Value> {
        lookup(&self.lock().root, path).cloned()
    }

    /// Make every write, update, remove, upload and fetch fail.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Seed the content store.
    pub fn put_content(&self, reference: &str, data: Bytes, content_type: &str) {
        self.lock().content.insert(
            reference.to_string(),
            StoredContent {
                data,
                content_type: content_type.to_string(),
            },
        );
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mutate(&self, path: &str, f: impl FnOnce(&mut Value)) -> Result<(), BackendError> {
        let mut inner = self.lock();
        if inner.offline {
            return Err(BackendError::Unavailable("offline".into()));
        }

        let before: Vec<(u64, Option<Value>)> = inner
            .subscriptions
            .iter()
            .map(|(id, sub)| (*id, lookup(&inner.root, &sub.query.path).cloned()))
            .collect();

        f(&mut inner.root);
        prune_empty(&mut inner.root);
        debug!(path = %path, "Record mutated");

        let Inner {
            root,
            subscriptions,
            ..
        } = &mut *inner;
        for (id, old) in before {
            let Some(sub) = subscriptions.get(&id) else {
                continue;
            };
            let new = lookup(root, &sub.query.path);
            if !notify(sub, old.as_ref(), new) {
                subscriptions.remove(&id);
            }
        }
        Ok(())
    }
}

impl ChangeFeed for MemoryBackend {
    fn subscribe(
        &self,
        query: FeedQuery,
        kind: FeedEventKind,
    ) -> Result<FeedSubscription, BackendError> {
        let (tx, events) = mpsc::unbounded_channel();
        let mut inner = self.lock();

        let current = lookup(&inner.root, &query.path);
        match kind {
            FeedEventKind::Added => {
                let children = filtered_children(&query, current);
                let skip = query
                    .limit_to_last
                    .map_or(0, |n| children.len().saturating_sub(n));
                for (key, value) in children.into_iter().skip(skip) {
                    let _ = tx.send(FeedEvent::new(FeedEventKind::Added, key, value));
                }
            }
            FeedEventKind::Value => {
                let _ = tx.send(value_event(&query, current));
            }
            FeedEventKind::Removed | FeedEventKind::Changed => {}
        }

        inner.next_handle += 1;
        let handle = inner.next_handle;
        debug!(path = %query.path, kind = ?kind, handle, "Subscribed");
        inner
            .subscriptions
            .insert(handle, Subscription { query, kind, tx });

        Ok(FeedSubscription {
            handle: SubscriptionHandle(handle),
            events,
        })
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        if self.lock().subscriptions.remove(&handle.0).is_some() {
            debug!(handle = handle.0, "Unsubscribed");
        }
    }
}

#[async_trait]
impl RecordStore for MemoryBackend {
    fn reserve_key(&self, _parent: &str) -> String {
        let mut inner = self.lock();
        inner.next_key += 1;
        let suffix = Uuid::new_v4().simple().to_string();
        format!("-{:012}{}", inner.next_key, &suffix[..8])
    }

    async fn write(&self, path: &str, value: Value) -> Result<(), BackendError> {
        self.mutate(path, |root| {
            if value.is_null() {
                remove_at(root, path);
            } else {
                *entry_at(root, path) = value;
            }
        })
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), BackendError> {
        self.mutate(path, |root| {
            let slot = entry_at(root, path);
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(record) = slot {
                record.extend(fields);
            }
        })
    }

    async fn remove(&self, path: &str) -> Result<(), BackendError> {
        self.mutate(path, |root| remove_at(root, path))
    }
}

#[async_trait]
impl ContentStore for MemoryBackend {
    async fn fetch(&self, reference: &str) -> Result<Bytes, BackendError> {
        let inner = self.lock();
        if inner.offline {
            return Err(BackendError::Unavailable("offline".into()));
        }
        inner
            .content
            .get(reference)
            .map(|c| c.data.clone())
            .ok_or_else(|| BackendError::NotFound(reference.to_string()))
    }

    async fn fetch_metadata(&self, reference: &str) -> Result<ContentMetadata, BackendError> {
        let inner = self.lock();
        if inner.offline {
            return Err(BackendError::Unavailable("offline".into()));
        }
        inner
            .content
            .get(reference)
            .map(|c| ContentMetadata {
                content_type: c.content_type.clone(),
                size: c.data.len() as u64,
            })
            .ok_or_else(|| BackendError::NotFound(reference.to_string()))
    }

    async fn upload(
        &self,
        path: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<String, BackendError> {
        let mut inner = self.lock();
        if inner.offline {
            return Err(BackendError::Unavailable("offline".into()));
        }
        if data.is_empty() {
            return Err(BackendError::Rejected("empty upload".into()));
        }
        let reference = format!("mem://{path}");
        inner.content.insert(
            reference.clone(),
            StoredContent {
                data,
                content_type: content_type.to_string(),
            },
        );
        Ok(reference)
    }
}

// ---------------------------------------------------------------------------
// Tree helpers
// ---------------------------------------------------------------------------

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    segments(path).try_fold(root, |node, seg| node.get(seg))
}

fn entry_at<'a>(root: &'a mut Value, path: &str) -> &'a mut Value {
    segments(path).fold(root, |node, seg| {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        match node {
            Value::Object(map) => map.entry(seg).or_insert(Value::Null),
            _ => unreachable!("node was just made an object"),
        }
    })
}

fn remove_at(root: &mut Value, path: &str) {
    let segs: Vec<&str> = segments(path).collect();
    let Some((last, parents)) = segs.split_last() else {
        *root = Value::Null;
        return;
    };
    let parent = parents
        .iter()
        .try_fold(&mut *root, |node, seg| node.get_mut(*seg));
    if let Some(Value::Object(map)) = parent {
        map.remove(*last);
    }
}

/// Drop objects that became empty (and nulls), like a hosted tree does.
fn prune_empty(node: &mut Value) {
    if let Value::Object(map) = node {
        for child in map.values_mut() {
            prune_empty(child);
        }
        map.retain(|_, v| match v {
            Value::Null => false,
            Value::Object(m) => !m.is_empty(),
            _ => true,
        });
    }
}

fn filtered_children(query: &FeedQuery, node: Option<&Value>) -> Vec<(String, Value)> {
    match node {
        Some(Value::Object(map)) => map
            .iter()
            .filter(|(_, v)| query.accepts(v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

fn value_event(query: &FeedQuery, node: Option<&Value>) -> FeedEvent {
    let children = filtered_children(query, node);
    let value = if children.is_empty() {
        Value::Null
    } else {
        Value::Object(children.into_iter().collect())
    };
    let key = segments(&query.path).last().unwrap_or_default().to_string();
    FeedEvent::new(FeedEventKind::Value, key, value)
}

/// Emit the events `sub` should see for a change of its path from `old`
/// to `new`. Returns `false` when the receiver is gone.
fn notify(sub: &Subscription, old: Option<&Value>, new: Option<&Value>) -> bool {
    if old == new {
        return true;
    }

    let events: Vec<FeedEvent> = match sub.kind {
        FeedEventKind::Value => {
            let before = value_event(&sub.query, old);
            let after = value_event(&sub.query, new);
            if before == after {
                Vec::new()
            } else {
                vec![after]
            }
        }
        kind => {
            let before: HashMap<String, Value> =
                filtered_children(&sub.query, old).into_iter().collect();
            let after = filtered_children(&sub.query, new);
            let mut events = Vec::new();

            match kind {
                FeedEventKind::Added => {
                    for (key, value) in after {
                        if !before.contains_key(&key) {
                            events.push(FeedEvent::new(kind, key, value));
                        }
                    }
                }
                FeedEventKind::Changed => {
                    for (key, value) in after {
                        if before.get(&key).is_some_and(|prev| prev != &value) {
                            events.push(FeedEvent::new(kind, key, value));
                        }
                    }
                }
                FeedEventKind::Removed => {
                    let remaining: HashMap<String, Value> = after.into_iter().collect();
                    let mut gone: Vec<_> = before
                        .into_iter()
                        .filter(|(key, _)| !remaining.contains_key(key))
                        .collect();
                    gone.sort_by(|a, b| a.0.cmp(&b.0));
                    for (key, value) in gone {
                        events.push(FeedEvent::new(kind, key, value));
                    }
                }
                FeedEventKind::Value => {}
            }
            events
        }
    };

    events.into_iter().all(|event| sub.tx.send(event).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn drain(sub: &mut FeedSubscription) -> Vec<FeedEvent> {
        let mut out = Vec::new();
        while let Ok(event) = sub.events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let backend = MemoryBackend::new();
        backend.write("channels/c1", json!({"name": "general"})).await.unwrap();
        assert_eq!(backend.read("channels/c1/name"), Some(json!("general")));

        backend.remove("channels/c1").await.unwrap();
        assert_eq!(backend.read("channels/c1"), None);
        assert_eq!(backend.read("channels"), None);
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let backend = MemoryBackend::new();
        backend
            .write("m/1", json!({"senderId": "u1", "photoURL": "NOTSET"}))
            .await
            .unwrap();
        let mut fields = Map::new();
        fields.insert("photoURL".into(), json!("gs://x"));
        backend.update("m/1", fields).await.unwrap();
        assert_eq!(
            backend.read("m/1"),
            Some(json!({"senderId": "u1", "photoURL": "gs://x"}))
        );
    }

    #[tokio::test]
    async fn test_reserved_keys_sort_in_allocation_order() {
        let backend = MemoryBackend::new();
        let keys: Vec<String> = (0..20).map(|_| backend.reserve_key("m")).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[tokio::test]
    async fn test_child_events() {
        let backend = MemoryBackend::new();
        let mut added = backend
            .subscribe(FeedQuery::new("channels"), FeedEventKind::Added)
            .unwrap();
        let mut removed = backend
            .subscribe(FeedQuery::new("channels"), FeedEventKind::Removed)
            .unwrap();
        let mut changed = backend
            .subscribe(FeedQuery::new("channels"), FeedEventKind::Changed)
            .unwrap();

        backend.write("channels/c1", json!({"name": "a"})).await.unwrap();
        backend.write("channels/c1/name", json!("b")).await.unwrap();
        backend.remove("channels/c1").await.unwrap();

        assert_eq!(
            drain(&mut added).await,
            vec![FeedEvent::new(FeedEventKind::Added, "c1", json!({"name": "a"}))]
        );
        assert_eq!(
            drain(&mut changed).await,
            vec![FeedEvent::new(FeedEventKind::Changed, "c1", json!({"name": "b"}))]
        );
        assert_eq!(
            drain(&mut removed).await,
            vec![FeedEvent::new(FeedEventKind::Removed, "c1", json!({"name": "b"}))]
        );
    }

    #[tokio::test]
    async fn test_initial_replay_respects_limit() {
        let backend = MemoryBackend::new();
        for i in 0..5 {
            let key = backend.reserve_key("m");
            backend.write(&format!("m/{key}"), json!({"n": i})).await.unwrap();
        }

        let mut sub = backend
            .subscribe(FeedQuery::new("m").limit_to_last(2), FeedEventKind::Added)
            .unwrap();
        let replayed: Vec<Value> = drain(&mut sub).await.into_iter().map(|e| e.value).collect();
        assert_eq!(replayed, vec![json!({"n": 3}), json!({"n": 4})]);
    }

    #[tokio::test]
    async fn test_value_subscription_filters() {
        let backend = MemoryBackend::new();
        let mut sub = backend
            .subscribe(
                FeedQuery::new("t").equal_to(Value::Bool(true)),
                FeedEventKind::Value,
            )
            .unwrap();

        backend.write("t/u1", json!(true)).await.unwrap();
        backend.write("t/u2", json!(false)).await.unwrap();
        backend.write("t/u1", json!(false)).await.unwrap();

        let values: Vec<Value> = drain(&mut sub).await.into_iter().map(|e| e.value).collect();
        assert_eq!(values, vec![Value::Null, json!({"u1": true}), Value::Null]);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_offline() {
        let backend = MemoryBackend::new();
        let sub = backend
            .subscribe(FeedQuery::new("x"), FeedEventKind::Added)
            .unwrap();
        assert_eq!(backend.subscription_count(), 1);
        backend.unsubscribe(sub.handle);
        backend.unsubscribe(sub.handle);
        assert_eq!(backend.subscription_count(), 0);

        backend.set_offline(true);
        assert!(backend.write("x/1", json!(1)).await.is_err());
        assert!(backend.fetch("anything").await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_receivers_are_pruned() {
        let backend = MemoryBackend::new();
        let sub = backend
            .subscribe(FeedQuery::new("x"), FeedEventKind::Added)
            .unwrap();
        drop(sub);
        backend.write("x/1", json!(1)).await.unwrap();
        assert_eq!(backend.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_content_round_trip() {
        let backend = MemoryBackend::new();
        let reference = backend
            .upload("u1/1.jpg", Bytes::from_static(b"jpeg"), "image/jpeg")
            .await
            .unwrap();
        assert_eq!(reference, "mem://u1/1.jpg");
        let meta = backend.fetch_metadata(&reference).await.unwrap();
        assert_eq!(meta.content_type, "image/jpeg");
        assert_eq!(meta.size, 4);
        assert_eq!(backend.fetch(&reference).await.unwrap(), Bytes::from_static(b"jpeg"));
    }
}
