//! Change-feed vocabulary and the persisted record layout.
//!
//! ```text
//! channels/{channelId}/name
//! channels/{channelId}/messages/{messageId}/{senderId, senderName, text | photoURL}
//! channels/{channelId}/typingIndicator/{participantId} = bool
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::constants::*;
use crate::error::{Result, SyncError};
use crate::models::Channel;
use crate::types::{ChannelId, MessageId, ParticipantId};

// ---------------------------------------------------------------------------
// Feed events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeedEventKind {
    /// A child appeared under the subscribed path.
    Added,
    /// A child disappeared; `value` carries its last contents.
    Removed,
    /// Fields of an existing child changed; `value` carries the merged record.
    Changed,
    /// The whole (filtered) child set; `key` is the subscribed path's last segment.
    Value,
}

/// One event delivered by a change-feed subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedEvent {
    pub kind: FeedEventKind,
    pub key: String,
    pub value: Value,
}

impl FeedEvent {
    pub fn new(kind: FeedEventKind, key: impl Into<String>, value: Value) -> Self {
        Self {
            kind,
            key: key.into(),
            value,
        }
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

pub mod paths {
    use super::*;

    pub fn channels() -> String {
        CHANNELS_ROOT.to_string()
    }

    pub fn channel(channel: &ChannelId) -> String {
        format!("{CHANNELS_ROOT}/{channel}")
    }

    pub fn messages(channel: &ChannelId) -> String {
        format!("{CHANNELS_ROOT}/{channel}/{MESSAGES_SEGMENT}")
    }

    pub fn message(channel: &ChannelId, message: &MessageId) -> String {
        format!("{CHANNELS_ROOT}/{channel}/{MESSAGES_SEGMENT}/{message}")
    }

    pub fn typing(channel: &ChannelId) -> String {
        format!("{CHANNELS_ROOT}/{channel}/{TYPING_SEGMENT}")
    }

    pub fn typing_entry(channel: &ChannelId, participant: &ParticipantId) -> String {
        format!("{CHANNELS_ROOT}/{channel}/{TYPING_SEGMENT}/{participant}")
    }

    /// Content-store location of an upload: `{sender}/{millis}/{file}`.
    pub fn upload(sender: &ParticipantId, millis: i64, file_name: &str) -> String {
        format!("{sender}/{millis}/{file_name}")
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChannelRecord {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRecord {
    #[serde(rename = "senderId")]
    sender_id: Option<String>,
    #[serde(rename = "senderName")]
    sender_name: Option<String>,
    text: Option<String>,
    #[serde(rename = "photoURL")]
    photo_url: Option<String>,
}

/// Payload of a message as it arrives on the feed, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    Text(String),
    /// Raw `photoURL`, possibly the unset placeholder.
    Media(String),
}

/// A message record that has the right shape for a timeline insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecordFields {
    pub id: MessageId,
    pub sender_id: ParticipantId,
    pub sender_display_name: String,
    pub payload: MessagePayload,
}

fn invalid(what: &str, key: &str, e: impl std::fmt::Display) -> SyncError {
    SyncError::InvalidData(format!("{what} record {key}: {e}"))
}

/// Decode a `channels/{key}` record. The name is not validated here.
pub fn decode_channel(key: &str, value: &Value) -> Result<Channel> {
    let record: ChannelRecord =
        serde_json::from_value(value.clone()).map_err(|e| invalid("channel", key, e))?;
    Ok(Channel {
        id: ChannelId::from(key),
        name: record.name.unwrap_or_default(),
    })
}

/// Decode a message record.
///
/// A non-empty `text` wins; otherwise a `photoURL` makes it a media
/// message. Anything else is rejected.
pub fn decode_message(key: &str, value: &Value) -> Result<MessageRecordFields> {
    let record: MessageRecord =
        serde_json::from_value(value.clone()).map_err(|e| invalid("message", key, e))?;

    let sender_id = record
        .sender_id
        .ok_or_else(|| invalid("message", key, "missing senderId"))?;

    let payload = match (record.text, record.photo_url) {
        (Some(text), _) if !text.is_empty() => {
            if record.sender_name.is_none() {
                return Err(invalid("message", key, "text message without senderName"));
            }
            MessagePayload::Text(text)
        }
        (_, Some(photo_url)) => MessagePayload::Media(photo_url),
        _ => return Err(invalid("message", key, "neither text nor photoURL")),
    };

    Ok(MessageRecordFields {
        id: MessageId::from(key),
        sender_id: ParticipantId::from(sender_id),
        sender_display_name: record.sender_name.unwrap_or_default(),
        payload,
    })
}

/// Pull the updated `photoURL` out of a changed message record, if any.
pub fn changed_photo_url(value: &Value) -> Option<&str> {
    value.get(FIELD_PHOTO_URL).and_then(Value::as_str)
}

/// Participants whose typing entry is `true` in a `value` snapshot.
pub fn decode_active_participants(value: &Value) -> HashSet<ParticipantId> {
    match value {
        Value::Object(entries) => entries
            .iter()
            .filter(|(_, v)| v.as_bool() == Some(true))
            .map(|(k, _)| ParticipantId::from(k.as_str()))
            .collect(),
        _ => HashSet::new(),
    }
}

pub fn encode_channel(name: &str) -> Value {
    json!({ FIELD_NAME: name })
}

pub fn encode_text_message(sender: &ParticipantId, sender_name: &str, text: &str) -> Value {
    json!({
        FIELD_SENDER_ID: sender.as_str(),
        FIELD_SENDER_NAME: sender_name,
        FIELD_TEXT: text,
    })
}

pub fn encode_media_placeholder(sender: &ParticipantId, unset_sentinel: &str) -> Value {
    json!({
        FIELD_PHOTO_URL: unset_sentinel,
        FIELD_SENDER_ID: sender.as_str(),
    })
}

pub fn encode_photo_url(reference: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(FIELD_PHOTO_URL.to_string(), Value::from(reference));
    fields
}
