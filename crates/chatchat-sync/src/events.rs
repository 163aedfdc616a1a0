use serde::Serialize;

use chatchat_shared::{Channel, ChannelId, MessageId};

pub const EVENT_CHANNEL_ADDED: &str = "channel-added";
pub const EVENT_CHANNEL_REMOVED: &str = "channel-removed";
pub const EVENT_MESSAGE_ADDED: &str = "message-added";
pub const EVENT_MESSAGE_UPDATED: &str = "message-updated";
pub const EVENT_ATTACHMENT_RESOLVED: &str = "attachment-resolved";
pub const EVENT_ATTACHMENT_FAILED: &str = "attachment-failed";
pub const EVENT_TYPING_INDICATOR: &str = "typing-indicator";

/// Change notification produced each time a session applies an input.
///
/// Notifications carry ids only; the presentation layer re-reads the
/// relevant snapshot.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SyncEvent {
    ChannelAdded { channel: Channel },
    ChannelRemoved { channel_id: ChannelId },
    MessageAdded { message_id: MessageId },
    MessageUpdated { message_id: MessageId },
    AttachmentResolved { message_id: MessageId },
    AttachmentFailed { message_id: MessageId, error: String },
    TypingIndicator { visible: bool },
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChannelAdded { .. } => EVENT_CHANNEL_ADDED,
            Self::ChannelRemoved { .. } => EVENT_CHANNEL_REMOVED,
            Self::MessageAdded { .. } => EVENT_MESSAGE_ADDED,
            Self::MessageUpdated { .. } => EVENT_MESSAGE_UPDATED,
            Self::AttachmentResolved { .. } => EVENT_ATTACHMENT_RESOLVED,
            Self::AttachmentFailed { .. } => EVENT_ATTACHMENT_FAILED,
            Self::TypingIndicator { .. } => EVENT_TYPING_INDICATOR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_tag_matches_name() {
        let event = SyncEvent::TypingIndicator { visible: true };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.name());
        assert_eq!(json["visible"], true);
    }
}
