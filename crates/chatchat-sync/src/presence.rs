//! "Someone is typing" aggregation for one channel.
//!
//! Each participant publishes a boolean under
//! `channels/{id}/typingIndicator/{participant}`; the session subscribes to
//! the entries equal to `true` and feeds every snapshot here. The backend is
//! trusted to drop a participant's entry when they disconnect.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::debug;

use chatchat_shared::protocol::{self, paths, FeedEvent, FeedEventKind};
use chatchat_shared::{ChannelId, ParticipantId};

use crate::backend::RecordStore;
use crate::completion::{submit, Completion};
use crate::events::SyncEvent;

/// Tracks who is typing in a channel and publishes the local participant's
/// own typing flag.
pub struct PresenceAggregator {
    channel_id: ChannelId,
    local: ParticipantId,
    store: Arc<dyn RecordStore>,
    local_typing: bool,
    /// Last value handed to the backend, `None` after a failed write.
    published: Arc<Mutex<Option<bool>>>,
    active: HashSet<ParticipantId>,
    show_indicator: bool,
}

impl PresenceAggregator {
    /// Nobody is typing until the first snapshot arrives.
    pub fn new(channel_id: ChannelId, local: ParticipantId, store: Arc<dyn RecordStore>) -> Self {
        Self {
            channel_id,
            local,
            store,
            local_typing: false,
            published: Arc::new(Mutex::new(Some(false))),
            active: HashSet::new(),
            show_indicator: false,
        }
    }

    /// Publish the local typing state. Repeating the last published state
    /// does not hit the backend; a failed write is retried on the next call.
    pub fn set_local_typing(&mut self, active: bool) -> Completion<()> {
        self.local_typing = active;
        {
            let mut published = lock(&self.published);
            if *published == Some(active) {
                return Completion::ready(Ok(()));
            }
            *published = Some(active);
        }

        let path = paths::typing_entry(&self.channel_id, &self.local);
        let store = self.store.clone();
        let published = self.published.clone();
        debug!(channel = %self.channel_id, typing = active, "Publishing local typing state");
        submit("set_typing", async move {
            let written = store.write(&path, Value::Bool(active)).await;
            if written.is_err() {
                let mut published = lock(&published);
                // a newer call may already have replaced it
                if *published == Some(active) {
                    *published = None;
                }
            }
            written
        })
    }

    /// Replace the active set and recompute the indicator.
    ///
    /// A lone active participant who is the local user does not count.
    pub fn apply_presence_snapshot(&mut self, active: HashSet<ParticipantId>) -> bool {
        let only_self = active.len() == 1 && active.contains(&self.local);
        self.show_indicator = !active.is_empty() && !only_self;
        self.active = active;
        self.show_indicator
    }

    /// Apply a `value` event from the typing query. Emits a notification only
    /// when the indicator flips.
    pub fn apply_feed_event(&mut self, event: &FeedEvent) -> Option<SyncEvent> {
        if event.kind != FeedEventKind::Value {
            debug!(kind = ?event.kind, "Ignoring presence event");
            return None;
        }
        let before = self.show_indicator;
        let visible = self.apply_presence_snapshot(protocol::decode_active_participants(&event.value));
        (visible != before).then_some(SyncEvent::TypingIndicator { visible })
    }

    /// Whether anyone other than the local participant is typing.
    pub fn should_show_indicator(&self) -> bool {
        self.show_indicator
    }

    /// The state most recently requested through `set_local_typing`.
    pub fn is_local_typing(&self) -> bool {
        self.local_typing
    }

    pub fn local_participant(&self) -> &ParticipantId {
        &self.local
    }

    /// Everyone currently marked active, the local user included.
    pub fn active_participants(&self) -> &HashSet<ParticipantId> {
        &self.active
    }
}

fn lock(published: &Mutex<Option<bool>>) -> MutexGuard<'_, Option<bool>> {
    published.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use serde_json::json;

    fn aggregator() -> (PresenceAggregator, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let agg = PresenceAggregator::new(
            ChannelId::from("c1"),
            ParticipantId::from("me"),
            backend.clone(),
        );
        (agg, backend)
    }

    fn set(ids: &[&str]) -> HashSet<ParticipantId> {
        ids.iter().map(|id| ParticipantId::from(*id)).collect()
    }

    #[test]
    fn test_self_echo_is_suppressed() {
        let (mut agg, _) = aggregator();
        assert!(!agg.apply_presence_snapshot(set(&["me"])));
        assert!(agg.apply_presence_snapshot(set(&["me", "other"])));
        assert!(!agg.apply_presence_snapshot(set(&[])));
        assert!(agg.apply_presence_snapshot(set(&["other"])));
    }

    #[test]
    fn test_feed_event_only_reports_flips() {
        let (mut agg, _) = aggregator();
        let snapshot = |v| FeedEvent::new(FeedEventKind::Value, "typingIndicator", v);

        assert_eq!(agg.apply_feed_event(&snapshot(json!({"me": true}))), None);
        assert_eq!(
            agg.apply_feed_event(&snapshot(json!({"me": true, "bob": true}))),
            Some(SyncEvent::TypingIndicator { visible: true })
        );
        assert_eq!(agg.apply_feed_event(&snapshot(json!({"bob": true}))), None);
        assert_eq!(
            agg.apply_feed_event(&snapshot(Value::Null)),
            Some(SyncEvent::TypingIndicator { visible: false })
        );
        assert!(agg.active_participants().is_empty());
    }

    #[tokio::test]
    async fn test_local_typing_is_published() {
        let (mut agg, backend) = aggregator();
        let path = paths::typing_entry(&ChannelId::from("c1"), &ParticipantId::from("me"));

        agg.set_local_typing(true).wait().await.unwrap();
        assert!(agg.is_local_typing());
        assert_eq!(backend.read(&path), Some(json!(true)));

        agg.set_local_typing(false).wait().await.unwrap();
        assert_eq!(backend.read(&path), Some(json!(false)));
    }

    #[tokio::test]
    async fn test_repeated_state_skips_backend() {
        let (mut agg, backend) = aggregator();
        backend.set_offline(true);
        // unchanged state never reaches the offline backend
        agg.set_local_typing(false).wait().await.unwrap();
        assert!(agg.set_local_typing(true).wait().await.is_err());
    }

    #[tokio::test]
    async fn test_failed_publish_is_retried() {
        let (mut agg, backend) = aggregator();
        let path = paths::typing_entry(&ChannelId::from("c1"), &ParticipantId::from("me"));

        backend.set_offline(true);
        assert!(agg.set_local_typing(true).wait().await.is_err());
        assert!(agg.is_local_typing());

        backend.set_offline(false);
        agg.set_local_typing(true).wait().await.unwrap();
        assert_eq!(backend.read(&path), Some(json!(true)));

        // now acknowledged, so a repeat stays local
        backend.set_offline(true);
        agg.set_local_typing(true).wait().await.unwrap();
    }
}
