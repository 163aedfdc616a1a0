//! Ordered message history of one channel.
//!
//! The timeline only ever appends in feed-delivery order. Windowing is the
//! feed's job (the subscription asks for the last `message_window` records),
//! so nothing is evicted here. Messages are never deleted.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, warn};

use chatchat_shared::protocol::{self, paths, FeedEvent, FeedEventKind, MessagePayload};
use chatchat_shared::{
    ChannelId, MediaContent, MediaReference, Message, MessageBody, MessageId, ParticipantId,
    Result, SyncError,
};

use crate::backend::{ContentStore, RecordStore};
use crate::completion::{submit, Completion};
use crate::events::SyncEvent;

/// A field-level change to an existing message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageUpdate {
    /// New raw `photoURL` from a `changed` feed event.
    MediaReference(String),
    /// Decoded content produced by the attachment resolver.
    ResolvedContent(MediaContent),
}

/// An attachment fetch in flight for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingFetch {
    reference: String,
    attempt: u64,
}

/// Append-only message history of one channel, plus the attachment fetches
/// currently in flight for its media messages.
pub struct MessageTimeline {
    channel_id: ChannelId,
    store: Arc<dyn RecordStore>,
    unset_reference: String,
    messages: HashMap<MessageId, Message>,
    order: Vec<MessageId>,
    pending: HashMap<MessageId, PendingFetch>,
    next_attempt: u64,
}

impl MessageTimeline {
    /// Empty timeline for `channel_id`. `unset_reference` is the `photoURL`
    /// placeholder meaning "upload not finished".
    pub fn new(
        channel_id: ChannelId,
        store: Arc<dyn RecordStore>,
        unset_reference: impl Into<String>,
    ) -> Self {
        Self {
            channel_id,
            store,
            unset_reference: unset_reference.into(),
            messages: HashMap::new(),
            order: Vec::new(),
            pending: HashMap::new(),
            next_attempt: 0,
        }
    }

    /// The channel this timeline mirrors.
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    // ------------------------------------------------------------------
    // Feed input
    // ------------------------------------------------------------------

    /// Append a message announced by the feed. Returns `false` for an id
    /// that is already present.
    pub fn apply_added(
        &mut self,
        id: MessageId,
        sender_id: ParticipantId,
        sender_display_name: &str,
        payload: MessagePayload,
    ) -> Result<bool> {
        let body = match payload {
            MessagePayload::Text(text) if !text.is_empty() => MessageBody::Text { text },
            MessagePayload::Media(reference) if !reference.is_empty() => MessageBody::Media {
                reference: MediaReference::parse(&reference, &self.unset_reference),
                resolved: None,
            },
            MessagePayload::Text(_) => {
                return Err(SyncError::InvalidData(format!("message {id} has empty text")))
            }
            MessagePayload::Media(_) => {
                return Err(SyncError::InvalidData(format!(
                    "message {id} has empty media reference"
                )))
            }
        };

        if self.messages.contains_key(&id) {
            debug!(channel = %self.channel_id, msg_id = %id, "Duplicate message add ignored");
            return Ok(false);
        }

        self.order.push(id.clone());
        self.messages.insert(
            id.clone(),
            Message {
                id,
                sender_id,
                sender_display_name: sender_display_name.to_string(),
                body,
                received_at: Utc::now(),
            },
        );
        Ok(true)
    }

    /// Apply a field update to an existing message.
    ///
    /// Unknown ids are a benign race (the change beat the add, or the add is
    /// outside the window) and are ignored. Media updates on text messages
    /// are ignored as well. Returns whether anything changed.
    pub fn apply_changed(&mut self, id: &MessageId, update: MessageUpdate) -> bool {
        let Some(message) = self.messages.get_mut(id) else {
            debug!(channel = %self.channel_id, msg_id = %id, "Change for unknown message ignored");
            return false;
        };

        let MessageBody::Media {
            reference,
            resolved,
        } = &mut message.body
        else {
            debug!(channel = %self.channel_id, msg_id = %id, "Media change on text message ignored");
            return false;
        };

        match update {
            MessageUpdate::MediaReference(raw) => {
                if raw.is_empty() {
                    warn!(channel = %self.channel_id, msg_id = %id, "Empty photoURL in change");
                    return false;
                }
                let new_reference = MediaReference::parse(&raw, &self.unset_reference);
                if *reference == new_reference {
                    return false;
                }
                *reference = new_reference;
                *resolved = None;
                true
            }
            MessageUpdate::ResolvedContent(content) => {
                *resolved = Some(content);
                self.pending.remove(id);
                true
            }
        }
    }

    /// Decode and apply one event from the message feed.
    pub fn apply_feed_event(&mut self, event: &FeedEvent) -> Option<SyncEvent> {
        match event.kind {
            FeedEventKind::Added => {
                let applied = protocol::decode_message(&event.key, &event.value).and_then(|f| {
                    self.apply_added(f.id, f.sender_id, &f.sender_display_name, f.payload)
                });
                match applied {
                    Ok(true) => Some(SyncEvent::MessageAdded {
                        message_id: MessageId::from(event.key.as_str()),
                    }),
                    Ok(false) => None,
                    Err(e) => {
                        warn!(
                            channel = %self.channel_id,
                            key = %event.key,
                            error = %e,
                            "Could not decode message data"
                        );
                        None
                    }
                }
            }
            FeedEventKind::Changed => {
                let id = MessageId::from(event.key.as_str());
                let raw = protocol::changed_photo_url(&event.value)?;
                self.apply_changed(&id, MessageUpdate::MediaReference(raw.to_string()))
                    .then_some(SyncEvent::MessageUpdated { message_id: id })
            }
            other => {
                debug!(kind = ?other, key = %event.key, "Ignoring message event");
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Pending attachments
    // ------------------------------------------------------------------

    /// Record an in-flight resolution. At most one per message. Returns the
    /// attempt number that identifies this fetch's completion.
    pub fn mark_pending(&mut self, id: &MessageId, reference: &str) -> Result<u64> {
        if self.pending.contains_key(id) {
            return Err(SyncError::AlreadyPending(id.clone()));
        }
        self.next_attempt += 1;
        self.pending.insert(
            id.clone(),
            PendingFetch {
                reference: reference.to_string(),
                attempt: self.next_attempt,
            },
        );
        Ok(self.next_attempt)
    }

    /// Drop the pending entry for `id`, returning the reference it held.
    pub fn clear_pending(&mut self, id: &MessageId) -> Option<String> {
        self.pending.remove(id).map(|p| p.reference)
    }

    pub fn pending_reference(&self, id: &MessageId) -> Option<&str> {
        self.pending.get(id).map(|p| p.reference.as_str())
    }

    pub fn pending_attempt(&self, id: &MessageId) -> Option<u64> {
        self.pending.get(id).map(|p| p.attempt)
    }

    pub fn is_pending(&self, id: &MessageId) -> bool {
        self.pending.contains_key(id)
    }

    /// Fetches still in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The reference to fetch for `id`, if it is a media message with a
    /// real reference, no content yet and no fetch in flight.
    pub fn needs_resolution(&self, id: &MessageId) -> Option<String> {
        if self.is_pending(id) {
            return None;
        }
        match &self.messages.get(id)?.body {
            MessageBody::Media {
                reference: MediaReference::Remote(r),
                resolved: None,
            } => Some(r.clone()),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Messages in feed-delivery order.
    pub fn snapshot(&self) -> Vec<Message> {
        self.order
            .iter()
            .filter_map(|id| self.messages.get(id))
            .cloned()
            .collect()
    }

    /// Look up a message by id.
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.get(id)
    }

    /// Number of messages received so far.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    // ------------------------------------------------------------------
    // Outgoing
    // ------------------------------------------------------------------

    /// Submit a text message. It is appended locally only when the feed
    /// echoes it back.
    pub fn append_outgoing_text(
        &self,
        sender_id: &ParticipantId,
        sender_display_name: &str,
        text: &str,
    ) -> Result<Completion<MessageId>> {
        if text.is_empty() {
            return Err(SyncError::InvalidData("message text is empty".into()));
        }

        let id = self.reserve_message_id();
        let path = paths::message(&self.channel_id, &id);
        let value = protocol::encode_text_message(sender_id, sender_display_name, text);
        let store = self.store.clone();

        debug!(channel = %self.channel_id, msg_id = %id, "Sending text message");
        Ok(submit("send_text", async move {
            store.write(&path, value).await.map(|_| id)
        }))
    }

    /// Submit a media message whose reference is not known yet. The id is
    /// available right away so the caller can later call
    /// [`resolve_media_url`](Self::resolve_media_url).
    pub fn append_outgoing_media_placeholder(
        &self,
        sender_id: &ParticipantId,
    ) -> (MessageId, Completion<()>) {
        let id = self.reserve_message_id();
        let path = paths::message(&self.channel_id, &id);
        let value = protocol::encode_media_placeholder(sender_id, &self.unset_reference);
        let store = self.store.clone();

        debug!(channel = %self.channel_id, msg_id = %id, "Sending media placeholder");
        let done = submit("send_media_placeholder", async move {
            store.write(&path, value).await
        });
        (id, done)
    }

    /// Point a media message at its uploaded content.
    pub fn resolve_media_url(&self, id: &MessageId, url: &str) -> Result<Completion<()>> {
        self.media_url_writer().resolve(id, url)
    }

    /// Placeholder, then upload to `upload_path`, then
    /// [`resolve_media_url`](Self::resolve_media_url) with the reference the
    /// content store returned. Any failure leaves the placeholder unset.
    pub fn append_outgoing_media(
        &self,
        sender_id: &ParticipantId,
        content: Arc<dyn ContentStore>,
        upload_path: String,
        data: Bytes,
        content_type: &str,
    ) -> (MessageId, Completion<MessageId>) {
        let (id, placeholder) = self.append_outgoing_media_placeholder(sender_id);
        let writer = self.media_url_writer();
        let content_type = content_type.to_string();
        let message_id = id.clone();

        debug!(channel = %self.channel_id, msg_id = %id, path = %upload_path, "Uploading media");
        let done = submit("send_media", async move {
            placeholder.wait().await?;
            let reference = content.upload(&upload_path, data, &content_type).await?;
            writer.resolve(&message_id, &reference)?.wait().await?;
            Ok::<_, SyncError>(message_id)
        });
        (id, done)
    }

    fn media_url_writer(&self) -> MediaUrlWriter {
        MediaUrlWriter {
            channel_id: self.channel_id.clone(),
            store: self.store.clone(),
            unset_reference: self.unset_reference.clone(),
        }
    }

    fn reserve_message_id(&self) -> MessageId {
        MessageId::from(self.store.reserve_key(&paths::messages(&self.channel_id)))
    }
}

/// The `photoURL` update, detached from the timeline so an upload task can
/// run it once the content is stored.
struct MediaUrlWriter {
    channel_id: ChannelId,
    store: Arc<dyn RecordStore>,
    unset_reference: String,
}

impl MediaUrlWriter {
    fn resolve(&self, id: &MessageId, url: &str) -> Result<Completion<()>> {
        if url.is_empty() || url == self.unset_reference {
            return Err(SyncError::InvalidData(format!(
                "cannot resolve message {id} to {url:?}"
            )));
        }

        let path = paths::message(&self.channel_id, id);
        let fields = protocol::encode_photo_url(url);
        let store = self.store.clone();

        info!(channel = %self.channel_id, msg_id = %id, url = %url, "Setting media URL");
        Ok(submit("resolve_media_url", async move {
            store.update(&path, fields).await
        }))
    }
}
