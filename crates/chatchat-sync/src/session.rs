//! Sessions wire the components to live feed subscriptions.
//!
//! A session owns its component state plus the receivers of its
//! subscriptions, and applies one input at a time from
//! [`DirectorySession::next_event`] / [`ChannelSession::next_event`]. All
//! mutation therefore happens on whichever task drives the session; the
//! backend and attachment fetches only ever talk to it through channels.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chatchat_shared::protocol::{paths, FeedEvent, FeedEventKind};
use chatchat_shared::{Channel, ChannelId, Message, MessageId, ParticipantId, Result, SyncError};

use crate::attachments::{AttachmentResolver, Completed, ResolutionOutcome};
use crate::backend::{ChangeFeed, ContentStore, FeedQuery, RecordStore, SubscriptionHandle};
use crate::completion::Completion;
use crate::config::SyncConfig;
use crate::directory::ChannelDirectory;
use crate::events::SyncEvent;
use crate::presence::PresenceAggregator;
use crate::timeline::MessageTimeline;

/// Entry point: the three collaborator handles plus configuration.
#[derive(Clone)]
pub struct SyncClient {
    feed: Arc<dyn ChangeFeed>,
    records: Arc<dyn RecordStore>,
    content: Arc<dyn ContentStore>,
    config: SyncConfig,
}

impl SyncClient {
    /// Wire the core to a backend. The three handles may be the same object.
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        records: Arc<dyn RecordStore>,
        content: Arc<dyn ContentStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            feed,
            records,
            content,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Subscribe to the channel list.
    pub fn open_directory(&self) -> Result<DirectorySession> {
        let mut subscriptions = Subscriptions::new(self.feed.clone());
        let added = subscriptions.subscribe(FeedQuery::new(paths::channels()), FeedEventKind::Added)?;
        let removed =
            subscriptions.subscribe(FeedQuery::new(paths::channels()), FeedEventKind::Removed)?;

        info!("Channel directory opened");
        Ok(DirectorySession {
            directory: ChannelDirectory::new(self.records.clone()),
            added,
            removed,
            subscriptions,
        })
    }

    /// Subscribe to one channel's messages and typing indicators as `local`.
    pub fn open_channel(
        &self,
        channel_id: ChannelId,
        local: ParticipantId,
        display_name: impl Into<String>,
    ) -> Result<ChannelSession> {
        let display_name = display_name.into();
        if display_name.is_empty() {
            return Err(SyncError::InvalidData("display name is empty".into()));
        }

        let mut subscriptions = Subscriptions::new(self.feed.clone());
        let added = subscriptions.subscribe(
            FeedQuery::new(paths::messages(&channel_id)).limit_to_last(self.config.message_window),
            FeedEventKind::Added,
        )?;
        let changed = subscriptions.subscribe(
            FeedQuery::new(paths::messages(&channel_id)),
            FeedEventKind::Changed,
        )?;
        let typing = subscriptions.subscribe(
            FeedQuery::new(paths::typing(&channel_id)).equal_to(Value::Bool(true)),
            FeedEventKind::Value,
        )?;

        let (resolver, outcomes) = AttachmentResolver::new(self.content.clone(), &self.config);

        info!(channel = %channel_id, participant = %local, "Channel session opened");
        Ok(ChannelSession {
            timeline: MessageTimeline::new(
                channel_id.clone(),
                self.records.clone(),
                self.config.unset_reference.clone(),
            ),
            presence: PresenceAggregator::new(
                channel_id.clone(),
                local.clone(),
                self.records.clone(),
            ),
            resolver,
            channel_id,
            local,
            display_name,
            content: self.content.clone(),
            config: self.config.clone(),
            added,
            changed,
            typing,
            outcomes,
            open_feeds: [true; 3],
            subscriptions,
        })
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Handles held by a session; all of them are released on close or drop.
struct Subscriptions {
    feed: Arc<dyn ChangeFeed>,
    handles: Vec<SubscriptionHandle>,
    closed: bool,
}

impl Subscriptions {
    fn new(feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            feed,
            handles: Vec::new(),
            closed: false,
        }
    }

    fn subscribe(
        &mut self,
        query: FeedQuery,
        kind: FeedEventKind,
    ) -> Result<mpsc::UnboundedReceiver<FeedEvent>> {
        let subscription = self.feed.subscribe(query, kind)?;
        self.handles.push(subscription.handle);
        Ok(subscription.events)
    }

    fn release(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        for handle in self.handles.drain(..) {
            self.feed.unsubscribe(handle);
        }
        true
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// Live view of the channel list.
pub struct DirectorySession {
    directory: ChannelDirectory,
    added: mpsc::UnboundedReceiver<FeedEvent>,
    removed: mpsc::UnboundedReceiver<FeedEvent>,
    subscriptions: Subscriptions,
}

impl DirectorySession {
    /// Apply feed input until it produces a notification. Returns `None`
    /// once the session is closed or the feed has ended.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        loop {
            if self.subscriptions.closed {
                return None;
            }
            let event = tokio::select! {
                biased;
                Some(event) = self.added.recv() => event,
                Some(event) = self.removed.recv() => event,
                else => return None,
            };
            if let Some(notification) = self.directory.apply_feed_event(&event) {
                return Some(notification);
            }
        }
    }

    /// The directory as applied so far.
    pub fn directory(&self) -> &ChannelDirectory {
        &self.directory
    }

    pub fn snapshot(&self) -> Vec<Channel> {
        self.directory.snapshot()
    }

    pub fn create_channel(&self, name: &str) -> Result<(ChannelId, Completion<()>)> {
        self.directory.create_channel(name)
    }

    pub fn delete_channel(&self, id: &ChannelId) -> Completion<()> {
        self.directory.delete_channel(id)
    }

    /// Stop listening. Calling it again does nothing.
    pub fn close(&mut self) {
        if self.subscriptions.release() {
            info!("Channel directory closed");
        }
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// One open channel as seen by the local participant: its timeline,
/// attachment fetches and typing indicator.
pub struct ChannelSession {
    channel_id: ChannelId,
    local: ParticipantId,
    display_name: String,
    timeline: MessageTimeline,
    resolver: AttachmentResolver,
    presence: PresenceAggregator,
    content: Arc<dyn ContentStore>,
    config: SyncConfig,
    added: mpsc::UnboundedReceiver<FeedEvent>,
    changed: mpsc::UnboundedReceiver<FeedEvent>,
    typing: mpsc::UnboundedReceiver<FeedEvent>,
    outcomes: mpsc::UnboundedReceiver<ResolutionOutcome>,
    /// Added, changed and typing feeds still delivering.
    open_feeds: [bool; 3],
    subscriptions: Subscriptions,
}

const ADDED_FEED: usize = 0;
const CHANGED_FEED: usize = 1;
const TYPING_FEED: usize = 2;

enum Input {
    Message(FeedEvent),
    Presence(FeedEvent),
    Resolved(ResolutionOutcome),
    FeedEnded(usize),
}

impl ChannelSession {
    /// Apply inputs one at a time until one produces a notification.
    /// Returns `None` once the session is closed or every source has ended.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        loop {
            if self.subscriptions.closed {
                return None;
            }
            // in-flight fetches still report after the feeds have gone quiet
            if self.open_feeds.iter().all(|open| !open) && self.timeline.pending_count() == 0 {
                return None;
            }
            let [added_open, changed_open, typing_open] = self.open_feeds;
            let input = tokio::select! {
                biased;
                event = self.added.recv(), if added_open => {
                    event.map_or(Input::FeedEnded(ADDED_FEED), Input::Message)
                }
                event = self.changed.recv(), if changed_open => {
                    event.map_or(Input::FeedEnded(CHANGED_FEED), Input::Message)
                }
                event = self.typing.recv(), if typing_open => {
                    event.map_or(Input::FeedEnded(TYPING_FEED), Input::Presence)
                }
                Some(outcome) = self.outcomes.recv() => Input::Resolved(outcome),
                else => return None,
            };
            if let Input::FeedEnded(feed) = input {
                self.open_feeds[feed] = false;
                debug!(channel = %self.channel_id, feed, "Feed ended");
                continue;
            }
            if let Some(notification) = self.apply(input) {
                return Some(notification);
            }
        }
    }

    fn apply(&mut self, input: Input) -> Option<SyncEvent> {
        match input {
            Input::Message(event) => {
                let notification = self.timeline.apply_feed_event(&event);
                self.resolve_if_needed(&MessageId::from(event.key.as_str()));
                notification
            }
            Input::Presence(event) => self.presence.apply_feed_event(&event),
            Input::Resolved(outcome) => {
                let id = outcome.message_id.clone();
                match self.resolver.complete(&mut self.timeline, outcome) {
                    Completed::Superseded => {
                        self.resolve_if_needed(&id);
                        None
                    }
                    completed => completed.into_event(),
                }
            }
            Input::FeedEnded(_) => None,
        }
    }

    fn resolve_if_needed(&mut self, id: &MessageId) {
        let Some(reference) = self.timeline.needs_resolution(id) else {
            return;
        };
        if let Err(e) = self
            .resolver
            .begin_resolution(&mut self.timeline, id, &reference)
        {
            warn!(channel = %self.channel_id, msg_id = %id, error = %e, "Could not start attachment fetch");
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Channel this session was opened on.
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Who this session sends and types as.
    pub fn local_participant(&self) -> &ParticipantId {
        &self.local
    }

    pub fn timeline(&self) -> &MessageTimeline {
        &self.timeline
    }

    pub fn presence(&self) -> &PresenceAggregator {
        &self.presence
    }

    /// Messages in delivery order.
    pub fn snapshot(&self) -> Vec<Message> {
        self.timeline.snapshot()
    }

    /// Whether anyone other than the local participant is typing.
    pub fn should_show_typing_indicator(&self) -> bool {
        self.presence.should_show_indicator()
    }

    // ------------------------------------------------------------------
    // Outgoing
    // ------------------------------------------------------------------

    /// Send a text message as the local participant. Also clears the local
    /// typing flag.
    pub fn send_text(&mut self, text: &str) -> Result<Completion<MessageId>> {
        let done = self
            .timeline
            .append_outgoing_text(&self.local, &self.display_name, text)?;
        let _ = self.presence.set_local_typing(false);
        Ok(done)
    }

    /// Write a media message with the unset reference. Use
    /// [`resolve_media_url`](Self::resolve_media_url) once the content is
    /// stored.
    pub fn send_media_placeholder(&self) -> (MessageId, Completion<()>) {
        self.timeline.append_outgoing_media_placeholder(&self.local)
    }

    /// Point a placeholder at stored content. Rejects an empty URL and the
    /// unset reference itself.
    pub fn resolve_media_url(&self, id: &MessageId, url: &str) -> Result<Completion<()>> {
        self.timeline.resolve_media_url(id, url)
    }

    /// Full photo send: placeholder, upload, then point the message at the
    /// uploaded content. If the upload fails the placeholder stays unset.
    pub fn send_media(
        &self,
        data: Bytes,
        content_type: &str,
        file_name: &str,
    ) -> Result<Completion<MessageId>> {
        if data.is_empty() {
            return Err(SyncError::InvalidData("attachment is empty".into()));
        }
        if data.len() > self.config.max_attachment_bytes {
            return Err(SyncError::InvalidData(format!(
                "attachment is {} bytes (max {})",
                data.len(),
                self.config.max_attachment_bytes
            )));
        }
        if file_name.is_empty() || file_name.contains('/') {
            return Err(SyncError::InvalidData(format!(
                "invalid file name {file_name:?}"
            )));
        }

        let upload_path = paths::upload(&self.local, Utc::now().timestamp_millis(), file_name);
        let (_, done) = self.timeline.append_outgoing_media(
            &self.local,
            self.content.clone(),
            upload_path,
            data,
            content_type,
        );
        Ok(done)
    }

    /// Publish whether the local participant is typing.
    pub fn set_typing(&mut self, active: bool) -> Completion<()> {
        self.presence.set_local_typing(active)
    }

    /// Release every subscription. Calling it again does nothing.
    pub fn close(&mut self) {
        if self.subscriptions.release() {
            let abandoned = self.timeline.pending_count();
            info!(channel = %self.channel_id, abandoned, "Channel session closed");
        }
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl Drop for DirectorySession {
    fn drop(&mut self) {
        self.close();
    }
}
