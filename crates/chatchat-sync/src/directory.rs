//! The de-duplicated, arrival-ordered set of known channels.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use chatchat_shared::protocol::{self, paths, FeedEvent, FeedEventKind};
use chatchat_shared::{Channel, ChannelId, Result, SyncError};

use crate::backend::RecordStore;
use crate::completion::{submit, Completion};
use crate::events::SyncEvent;

/// Local view of `channels/`.
///
/// Channels are keyed by id; `order` keeps feed-arrival order for
/// snapshots. Local state only changes through feed events.
pub struct ChannelDirectory {
    store: Arc<dyn RecordStore>,
    channels: HashMap<ChannelId, Channel>,
    order: Vec<ChannelId>,
}

impl ChannelDirectory {
    /// Empty directory; create and delete requests go to `store`.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            channels: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Record a channel announced by the feed. Returns `false` when the id
    /// was already known.
    pub fn apply_added(&mut self, id: ChannelId, name: &str) -> Result<bool> {
        validate_name(name)?;
        if self.channels.contains_key(&id) {
            debug!(channel = %id, "Duplicate channel add ignored");
            return Ok(false);
        }

        self.order.push(id.clone());
        self.channels.insert(
            id.clone(),
            Channel {
                id,
                name: name.to_string(),
            },
        );
        Ok(true)
    }

    /// Forget a channel the feed reported as removed. Returns `false` when
    /// the id was not known.
    pub fn apply_removed(&mut self, id: &ChannelId, name: &str) -> Result<bool> {
        validate_name(name)?;
        if self.channels.remove(id).is_none() {
            return Ok(false);
        }
        if let Some(pos) = self.order.iter().position(|c| c == id) {
            self.order.remove(pos);
        }
        Ok(true)
    }

    /// Decode and apply one feed event. Malformed events are logged and
    /// dropped so the rest of the feed keeps flowing.
    pub fn apply_feed_event(&mut self, event: &FeedEvent) -> Option<SyncEvent> {
        let channel = match protocol::decode_channel(&event.key, &event.value) {
            Ok(c) => c,
            Err(e) => {
                warn!(key = %event.key, error = %e, "Could not decode channel data");
                return None;
            }
        };

        let applied = match event.kind {
            FeedEventKind::Added => self
                .apply_added(channel.id.clone(), &channel.name)
                .map(|added| added.then(|| SyncEvent::ChannelAdded { channel: channel.clone() })),
            FeedEventKind::Removed => self
                .apply_removed(&channel.id, &channel.name)
                .map(|removed| {
                    removed.then(|| SyncEvent::ChannelRemoved {
                        channel_id: channel.id.clone(),
                    })
                }),
            other => {
                debug!(kind = ?other, key = %event.key, "Ignoring channel event");
                Ok(None)
            }
        };

        applied.unwrap_or_else(|e| {
            warn!(key = %event.key, error = %e, "Could not decode channel data");
            None
        })
    }

    /// Current channels in arrival order.
    pub fn snapshot(&self) -> Vec<Channel> {
        self.order
            .iter()
            .filter_map(|id| self.channels.get(id))
            .cloned()
            .collect()
    }

    /// Look up a known channel by id.
    pub fn get(&self, id: &ChannelId) -> Option<&Channel> {
        self.channels.get(id)
    }

    /// Number of known channels.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Ask the backend to create a channel. It shows up locally once the
    /// feed echoes the add.
    pub fn create_channel(&self, name: &str) -> Result<(ChannelId, Completion<()>)> {
        validate_name(name)?;

        let id = ChannelId::from(self.store.reserve_key(&paths::channels()));
        let path = paths::channel(&id);
        let value = protocol::encode_channel(name);
        let store = self.store.clone();

        info!(channel = %id, name = %name, "Creating channel");
        let done = submit("create_channel", async move { store.write(&path, value).await });
        Ok((id, done))
    }

    /// Ask the backend to delete a channel. Local state is untouched until
    /// the matching `removed` event arrives.
    pub fn delete_channel(&self, id: &ChannelId) -> Completion<()> {
        let path = paths::channel(id);
        let store = self.store.clone();

        info!(channel = %id, "Deleting channel");
        submit("delete_channel", async move { store.remove(&path).await })
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SyncError::InvalidData("channel name is empty".into()));
    }
    Ok(())
}
