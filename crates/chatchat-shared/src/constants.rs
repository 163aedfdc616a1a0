/// Number of most recent messages a channel subscription asks the feed for.
pub const DEFAULT_MESSAGE_WINDOW: usize = 25;

/// Placeholder written into `photoURL` before the upload finishes.
pub const UNSET_MEDIA_REFERENCE: &str = "NOTSET";

/// Maximum attachment size accepted for decoding (50 MiB)
pub const MAX_ATTACHMENT_SIZE: usize = 50 * 1024 * 1024;

/// Declared content type that must go through the animated decoder.
pub const CONTENT_TYPE_GIF: &str = "image/gif";

/// Content type used when uploading camera captures.
pub const CONTENT_TYPE_JPEG: &str = "image/jpeg";

/// Persisted path segments
pub const CHANNELS_ROOT: &str = "channels";
pub const MESSAGES_SEGMENT: &str = "messages";
pub const TYPING_SEGMENT: &str = "typingIndicator";

/// Record field names
pub const FIELD_NAME: &str = "name";
pub const FIELD_SENDER_ID: &str = "senderId";
pub const FIELD_SENDER_NAME: &str = "senderName";
pub const FIELD_TEXT: &str = "text";
pub const FIELD_PHOTO_URL: &str = "photoURL";
