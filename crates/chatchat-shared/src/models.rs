//! Domain model handed to the presentation layer.
//!
//! Every struct derives `Serialize` so snapshots can be passed over IPC or
//! dumped for diagnostics without a separate DTO layer.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChannelId, MessageId, ParticipantId};

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A conversation channel. Immutable once created by the feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    /// Backend-assigned key.
    pub id: ChannelId,
    /// Display name, never empty.
    pub name: String,
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

/// Where the bytes of a media message live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", content = "reference", rename_all = "snake_case")]
pub enum MediaReference {
    /// The sender has not finished uploading yet.
    Unset,
    /// A content-store reference such as `gs://bucket/uid/123.jpg`.
    Remote(String),
}

impl MediaReference {
    /// Interpret a raw `photoURL` value, mapping the placeholder to `Unset`.
    pub fn parse(raw: &str, unset_sentinel: &str) -> Self {
        if raw == unset_sentinel {
            Self::Unset
        } else {
            Self::Remote(raw.to_string())
        }
    }

    pub fn as_remote(&self) -> Option<&str> {
        match self {
            Self::Remote(r) => Some(r),
            Self::Unset => None,
        }
    }
}

/// How decoded media should be rendered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Still,
    Animated,
}

/// One decoded RGBA8 frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    /// Display time of this frame; zero for still images.
    pub delay_ms: u32,
    pub rgba: Bytes,
}

/// Renderable content produced by attachment resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaContent {
    /// Content type declared by the content store.
    pub content_type: String,
    pub kind: MediaKind,
    /// A single frame for stills, every frame in order for animations.
    pub frames: Vec<DecodedFrame>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// The two mutually exclusive payload shapes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        text: String,
    },
    Media {
        reference: MediaReference,
        resolved: Option<MediaContent>,
    },
}

/// A single chat message as seen by this client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: ParticipantId,
    /// Empty for media messages that were written without a name.
    pub sender_display_name: String,
    pub body: MessageBody,
    /// Local arrival time. Informational only, never used for ordering.
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// Whether `participant` sent this message (outgoing bubble).
    pub fn is_from(&self, participant: &ParticipantId) -> bool {
        &self.sender_id == participant
    }

    pub fn text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text { text } => Some(text),
            MessageBody::Media { .. } => None,
        }
    }

    pub fn media_reference(&self) -> Option<&MediaReference> {
        match &self.body {
            MessageBody::Media { reference, .. } => Some(reference),
            MessageBody::Text { .. } => None,
        }
    }

    pub fn resolved_media(&self) -> Option<&MediaContent> {
        match &self.body {
            MessageBody::Media { resolved, .. } => resolved.as_ref(),
            MessageBody::Text { .. } => None,
        }
    }
}
