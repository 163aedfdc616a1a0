//! Asynchronous media attachment resolution.
//!
//! A media message first arrives with a reference into the content store
//! (or the unset placeholder). The resolver fetches the metadata to learn
//! the declared content type, fetches the bytes, decodes them and hands the
//! result back to the owning session through a channel. The session then
//! calls [`AttachmentResolver::complete`] to write the content into the
//! timeline. Pending bookkeeping lives in the timeline, so a completion for
//! an entry that is gone is simply dropped.

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, ImageError, ImageFormat};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chatchat_shared::constants::CONTENT_TYPE_GIF;
use chatchat_shared::{
    DecodedFrame, MediaContent, MediaKind, MediaReference, MessageBody, MessageId, Result,
    SyncError,
};

use crate::backend::ContentStore;
use crate::config::SyncConfig;
use crate::events::SyncEvent;
use crate::timeline::{MessageTimeline, MessageUpdate};

/// Result of one background fetch, delivered back to the session.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionOutcome {
    pub message_id: MessageId,
    pub reference: String,
    /// Attempt number handed out by [`MessageTimeline::mark_pending`].
    pub attempt: u64,
    pub result: Result<MediaContent>,
}

/// What [`AttachmentResolver::complete`] did with an outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Completed {
    /// The outcome was written to the timeline (content or failure).
    Applied(SyncEvent),
    /// The message moved to another reference while this one was in flight.
    /// The result was dropped and the message needs a fresh fetch.
    Superseded,
    /// No matching in-flight attempt; the outcome was dropped.
    Ignored,
}

impl Completed {
    /// The notification to surface, if any.
    pub fn into_event(self) -> Option<SyncEvent> {
        match self {
            Self::Applied(event) => Some(event),
            Self::Superseded | Self::Ignored => None,
        }
    }
}

/// Fetches and decodes media attachments off the session task. Failures are
/// reported once and never retried automatically.
pub struct AttachmentResolver {
    content: Arc<dyn ContentStore>,
    unset_reference: String,
    max_bytes: usize,
    outcomes_tx: mpsc::UnboundedSender<ResolutionOutcome>,
}

impl AttachmentResolver {
    /// Build a resolver and the receiver its outcomes arrive on.
    pub fn new(
        content: Arc<dyn ContentStore>,
        config: &SyncConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ResolutionOutcome>) {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let resolver = Self {
            content,
            unset_reference: config.unset_reference.clone(),
            max_bytes: config.max_attachment_bytes,
            outcomes_tx,
        };
        (resolver, outcomes_rx)
    }

    /// Start fetching `reference` for message `id`.
    ///
    /// Returns `Ok(false)` without fetching when the reference is the unset
    /// placeholder or the message already holds content for it.
    pub fn begin_resolution(
        &self,
        timeline: &mut MessageTimeline,
        id: &MessageId,
        reference: &str,
    ) -> Result<bool> {
        if reference.is_empty() || reference == self.unset_reference {
            debug!(msg_id = %id, "No media reference yet, not fetching");
            return Ok(false);
        }
        if timeline.is_pending(id) {
            return Err(SyncError::AlreadyPending(id.clone()));
        }

        let message = timeline
            .get(id)
            .ok_or_else(|| SyncError::NotFound(format!("message {id}")))?;
        match &message.body {
            MessageBody::Media {
                reference: MediaReference::Remote(current),
                resolved: Some(_),
            } if current == reference => {
                debug!(msg_id = %id, "Attachment already resolved");
                return Ok(false);
            }
            MessageBody::Media { .. } => {}
            MessageBody::Text { .. } => {
                return Err(SyncError::InvalidData(format!(
                    "message {id} is not a media message"
                )))
            }
        }

        let attempt = timeline.mark_pending(id, reference)?;

        let content = self.content.clone();
        let outcomes_tx = self.outcomes_tx.clone();
        let message_id = id.clone();
        let reference = reference.to_string();
        let max_bytes = self.max_bytes;

        debug!(msg_id = %message_id, reference = %reference, "Fetching attachment");
        tokio::spawn(async move {
            let result = fetch_and_decode(content.as_ref(), &reference, max_bytes).await;
            // The session may be gone; nothing to do then.
            let _ = outcomes_tx.send(ResolutionOutcome {
                message_id,
                reference,
                attempt,
                result,
            });
        });

        Ok(true)
    }

    /// Apply a finished fetch to the timeline.
    ///
    /// Outcomes of an attempt that is no longer pending are ignored. An
    /// outcome whose reference no longer matches the message is superseded.
    pub fn complete(&self, timeline: &mut MessageTimeline, outcome: ResolutionOutcome) -> Completed {
        let id = outcome.message_id;

        if timeline.pending_attempt(&id) != Some(outcome.attempt) {
            debug!(msg_id = %id, attempt = outcome.attempt, "Late attachment completion ignored");
            return Completed::Ignored;
        }

        let current = timeline
            .get(&id)
            .and_then(|m| m.media_reference())
            .and_then(MediaReference::as_remote);
        if current != Some(outcome.reference.as_str()) {
            debug!(msg_id = %id, "Attachment reference changed during fetch");
            timeline.clear_pending(&id);
            return Completed::Superseded;
        }

        match outcome.result {
            Ok(content) => {
                let frames = content.frames.len();
                if timeline.apply_changed(&id, MessageUpdate::ResolvedContent(content)) {
                    info!(msg_id = %id, frames, "Attachment resolved");
                    Completed::Applied(SyncEvent::AttachmentResolved { message_id: id })
                } else {
                    timeline.clear_pending(&id);
                    Completed::Ignored
                }
            }
            Err(e) => {
                warn!(msg_id = %id, reference = %outcome.reference, error = %e, "Error downloading attachment");
                timeline.clear_pending(&id);
                Completed::Applied(SyncEvent::AttachmentFailed {
                    message_id: id,
                    error: e.to_string(),
                })
            }
        }
    }

    /// Give up on an in-flight resolution. A late completion is ignored.
    pub fn abandon(&self, timeline: &mut MessageTimeline, id: &MessageId) -> bool {
        timeline.clear_pending(id).is_some()
    }
}

async fn fetch_and_decode(
    content: &dyn ContentStore,
    reference: &str,
    max_bytes: usize,
) -> Result<MediaContent> {
    let metadata = content.fetch_metadata(reference).await?;
    if metadata.size > max_bytes as u64 {
        return Err(SyncError::InvalidData(format!(
            "attachment is {} bytes (max {max_bytes})",
            metadata.size
        )));
    }

    let data = content.fetch(reference).await?;
    let content_type = metadata.content_type;

    tokio::task::spawn_blocking(move || decode_media(&content_type, data))
        .await
        .map_err(|e| SyncError::InvalidData(format!("decoder task failed: {e}")))?
}

/// Decode `data` according to its declared content type. GIFs go through
/// the animation decoder, every other image type is decoded as a still.
pub fn decode_media(content_type: &str, data: Bytes) -> Result<MediaContent> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let format = ImageFormat::from_mime_type(&essence).ok_or_else(|| {
        SyncError::InvalidData(format!("unsupported content type {content_type:?}"))
    })?;

    let (kind, frames) = if essence == CONTENT_TYPE_GIF {
        (MediaKind::Animated, decode_animation(&data)?)
    } else {
        (MediaKind::Still, vec![decode_still(&data, format)?])
    };

    Ok(MediaContent {
        content_type: essence,
        kind,
        frames,
    })
}

fn decode_still(data: &[u8], format: ImageFormat) -> Result<DecodedFrame> {
    let image = image::load_from_memory_with_format(data, format)
        .map_err(undecodable)?
        .to_rgba8();
    Ok(DecodedFrame {
        width: image.width(),
        height: image.height(),
        delay_ms: 0,
        rgba: Bytes::from(image.into_raw()),
    })
}

fn decode_animation(data: &[u8]) -> Result<Vec<DecodedFrame>> {
    let decoder = GifDecoder::new(Cursor::new(data)).map_err(undecodable)?;
    let frames = decoder.into_frames().collect_frames().map_err(undecodable)?;
    if frames.is_empty() {
        return Err(SyncError::InvalidData("animation has no frames".into()));
    }

    Ok(frames
        .into_iter()
        .map(|frame| {
            let (numer, denom) = frame.delay().numer_denom_ms();
            let buffer = frame.into_buffer();
            DecodedFrame {
                width: buffer.width(),
                height: buffer.height(),
                delay_ms: if denom == 0 { 0 } else { numer / denom },
                rgba: Bytes::from(buffer.into_raw()),
            }
        })
        .collect())
}

fn undecodable(e: ImageError) -> SyncError {
    SyncError::InvalidData(format!("undecodable media: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use chatchat_shared::protocol::MessagePayload;
    use chatchat_shared::{ChannelId, ParticipantId};
    use image::codecs::gif::GifEncoder;
    use image::{Delay, Frame, Rgba, RgbaImage};

    fn png_bytes() -> Bytes {
        let img = RgbaImage::from_pixel(3, 2, Rgba([255, 0, 0, 255]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        Bytes::from(buf.into_inner())
    }

    fn gif_bytes() -> Bytes {
        let mut buf = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut buf);
            let frames = [[255, 0, 0, 255], [0, 0, 255, 255]].map(|px| {
                Frame::from_parts(
                    RgbaImage::from_pixel(2, 2, Rgba(px)),
                    0,
                    0,
                    Delay::from_numer_denom_ms(100, 1),
                )
            });
            encoder.encode_frames(frames).unwrap();
        }
        Bytes::from(buf)
    }

    struct Fixture {
        backend: Arc<MemoryBackend>,
        timeline: MessageTimeline,
        resolver: AttachmentResolver,
        outcomes: mpsc::UnboundedReceiver<ResolutionOutcome>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let timeline = MessageTimeline::new(ChannelId::from("c1"), backend.clone(), "NOTSET");
        let (resolver, outcomes) = AttachmentResolver::new(backend.clone(), &SyncConfig::default());
        Fixture {
            backend,
            timeline,
            resolver,
            outcomes,
        }
    }

    fn add_media(tl: &mut MessageTimeline, id: &str, reference: &str) {
        tl.apply_added(
            MessageId::from(id),
            ParticipantId::from("u1"),
            "",
            MessagePayload::Media(reference.into()),
        )
        .unwrap();
    }

    #[test]
    fn test_decode_still_and_animation() {
        let still = decode_media("image/png", png_bytes()).unwrap();
        assert_eq!(still.kind, MediaKind::Still);
        assert_eq!((still.frames[0].width, still.frames[0].height), (3, 2));
        assert_eq!(still.frames[0].rgba.len(), 3 * 2 * 4);

        let anim = decode_media("image/gif", gif_bytes()).unwrap();
        assert_eq!(anim.kind, MediaKind::Animated);
        assert_eq!(anim.frames.len(), 2);
        assert_eq!(anim.frames[0].delay_ms, 100);
    }

    #[test]
    fn test_decode_dispatches_on_declared_type() {
        // a GIF declared as PNG must not be decoded
        assert!(matches!(
            decode_media("image/png", gif_bytes()),
            Err(SyncError::InvalidData(_))
        ));
        assert!(matches!(
            decode_media("application/octet-stream", png_bytes()),
            Err(SyncError::InvalidData(_))
        ));
        assert!(decode_media("IMAGE/PNG; q=1", png_bytes()).is_ok());
    }

    #[tokio::test]
    async fn test_resolution_lifecycle() {
        let mut fx = fixture();
        let id = MessageId::from("m1");
        fx.backend
            .put_content("gs://b/1.png", png_bytes(), "image/png");
        add_media(&mut fx.timeline, "m1", "gs://b/1.png");

        assert!(fx
            .resolver
            .begin_resolution(&mut fx.timeline, &id, "gs://b/1.png")
            .unwrap());
        assert_eq!(
            fx.resolver
                .begin_resolution(&mut fx.timeline, &id, "gs://b/1.png"),
            Err(SyncError::AlreadyPending(id.clone()))
        );

        let outcome = fx.outcomes.recv().await.unwrap();
        assert_eq!(
            fx.resolver.complete(&mut fx.timeline, outcome.clone()),
            Completed::Applied(SyncEvent::AttachmentResolved { message_id: id.clone() })
        );
        assert!(!fx.timeline.is_pending(&id));
        assert!(fx.timeline.get(&id).unwrap().resolved_media().is_some());

        // late duplicate completion
        assert_eq!(fx.resolver.complete(&mut fx.timeline, outcome), Completed::Ignored);

        // already resolved: nothing to do
        assert!(!fx
            .resolver
            .begin_resolution(&mut fx.timeline, &id, "gs://b/1.png")
            .unwrap());
    }

    #[tokio::test]
    async fn test_sentinel_is_declined() {
        let mut fx = fixture();
        let id = MessageId::from("m2");
        add_media(&mut fx.timeline, "m2", "NOTSET");

        assert!(!fx
            .resolver
            .begin_resolution(&mut fx.timeline, &id, "NOTSET")
            .unwrap());
        assert!(!fx.timeline.is_pending(&id));
    }

    #[tokio::test]
    async fn test_failure_clears_pending() {
        let mut fx = fixture();
        let id = MessageId::from("m1");
        add_media(&mut fx.timeline, "m1", "gs://b/missing.png");

        fx.resolver
            .begin_resolution(&mut fx.timeline, &id, "gs://b/missing.png")
            .unwrap();
        let outcome = fx.outcomes.recv().await.unwrap();
        assert!(matches!(
            outcome.result,
            Err(SyncError::TransportFailure(_))
        ));

        let event = fx.resolver.complete(&mut fx.timeline, outcome);
        assert!(matches!(event, Completed::Applied(SyncEvent::AttachmentFailed { .. })));
        assert!(!fx.timeline.is_pending(&id));
        assert!(fx.timeline.get(&id).unwrap().resolved_media().is_none());

        // not permanently blocked
        fx.backend
            .put_content("gs://b/missing.png", png_bytes(), "image/png");
        assert!(fx
            .resolver
            .begin_resolution(&mut fx.timeline, &id, "gs://b/missing.png")
            .unwrap());
    }

    #[tokio::test]
    async fn test_oversized_attachment_is_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let mut timeline = MessageTimeline::new(ChannelId::from("c1"), backend.clone(), "NOTSET");
        let config = SyncConfig {
            max_attachment_bytes: 8,
            ..SyncConfig::default()
        };
        let (resolver, mut outcomes) = AttachmentResolver::new(backend.clone(), &config);
        backend.put_content("gs://b/big.png", png_bytes(), "image/png");
        add_media(&mut timeline, "m1", "gs://b/big.png");

        resolver
            .begin_resolution(&mut timeline, &MessageId::from("m1"), "gs://b/big.png")
            .unwrap();
        let outcome = outcomes.recv().await.unwrap();
        assert!(matches!(outcome.result, Err(SyncError::InvalidData(_))));
    }

    #[tokio::test]
    async fn test_abandoned_resolution_ignores_completion() {
        let mut fx = fixture();
        let id = MessageId::from("m1");
        fx.backend
            .put_content("gs://b/1.gif", gif_bytes(), "image/gif");
        add_media(&mut fx.timeline, "m1", "gs://b/1.gif");

        fx.resolver
            .begin_resolution(&mut fx.timeline, &id, "gs://b/1.gif")
            .unwrap();
        assert!(fx.resolver.abandon(&mut fx.timeline, &id));
        assert!(!fx.resolver.abandon(&mut fx.timeline, &id));

        let outcome = fx.outcomes.recv().await.unwrap();
        assert_eq!(fx.resolver.complete(&mut fx.timeline, outcome), Completed::Ignored);
        assert!(fx.timeline.get(&id).unwrap().resolved_media().is_none());
    }

    #[tokio::test]
    async fn test_stale_failure_does_not_hit_new_attempt() {
        let mut fx = fixture();
        let id = MessageId::from("m1");
        add_media(&mut fx.timeline, "m1", "gs://b/late.png");

        // first attempt fails and is abandoned before its outcome is seen
        fx.resolver
            .begin_resolution(&mut fx.timeline, &id, "gs://b/late.png")
            .unwrap();
        fx.resolver.abandon(&mut fx.timeline, &id);
        let stale = fx.outcomes.recv().await.unwrap();
        assert!(stale.result.is_err());

        fx.backend
            .put_content("gs://b/late.png", png_bytes(), "image/png");
        fx.resolver
            .begin_resolution(&mut fx.timeline, &id, "gs://b/late.png")
            .unwrap();

        assert_eq!(fx.resolver.complete(&mut fx.timeline, stale), Completed::Ignored);
        assert!(fx.timeline.is_pending(&id));

        let fresh = fx.outcomes.recv().await.unwrap();
        assert_eq!(
            fx.resolver.complete(&mut fx.timeline, fresh),
            Completed::Applied(SyncEvent::AttachmentResolved { message_id: id.clone() })
        );
    }

    #[tokio::test]
    async fn test_reference_change_supersedes_fetch() {
        let mut fx = fixture();
        let id = MessageId::from("m1");
        fx.backend.put_content("gs://b/old.png", png_bytes(), "image/png");
        add_media(&mut fx.timeline, "m1", "gs://b/old.png");

        fx.resolver
            .begin_resolution(&mut fx.timeline, &id, "gs://b/old.png")
            .unwrap();
        fx.timeline
            .apply_changed(&id, MessageUpdate::MediaReference("gs://b/new.png".into()));

        let outcome = fx.outcomes.recv().await.unwrap();
        assert_eq!(fx.resolver.complete(&mut fx.timeline, outcome), Completed::Superseded);
        assert!(!fx.timeline.is_pending(&id));
        assert!(fx.timeline.get(&id).unwrap().resolved_media().is_none());
        assert_eq!(fx.timeline.needs_resolution(&id).as_deref(), Some("gs://b/new.png"));
    }

    #[tokio::test]
    async fn test_unknown_and_text_messages() {
        let mut fx = fixture();
        assert!(matches!(
            fx.resolver
                .begin_resolution(&mut fx.timeline, &MessageId::from("ghost"), "gs://x"),
            Err(SyncError::NotFound(_))
        ));

        fx.timeline
            .apply_added(
                MessageId::from("t1"),
                ParticipantId::from("u1"),
                "Alice",
                MessagePayload::Text("hi".into()),
            )
            .unwrap();
        assert!(matches!(
            fx.resolver
                .begin_resolution(&mut fx.timeline, &MessageId::from("t1"), "gs://x"),
            Err(SyncError::InvalidData(_))
        ));
        assert_eq!(fx.timeline.pending_count(), 0);
    }
}
