//! # chatchat-cli
//!
//! Runs a scripted two-person conversation through the sync core against
//! the in-memory backend and logs every notification and the resulting
//! snapshots. Useful to watch the core end to end with `RUST_LOG=debug`.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use bytes::Bytes;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chatchat_shared::constants::CONTENT_TYPE_JPEG;
use chatchat_shared::{Message, MessageBody, ParticipantId};
use chatchat_sync::{ChannelSession, MemoryBackend, SyncClient, SyncConfig, SyncEvent};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("chatchat_sync=debug,chatchat_shared=info,warn")
        }))
        .with_target(true)
        .init();

    info!("Starting ChatChat sync demo v{}", env!("CARGO_PKG_VERSION"));

    let config = SyncConfig::from_env();
    info!(?config, "Loaded configuration");

    let backend = Arc::new(MemoryBackend::new());
    let client = SyncClient::new(backend.clone(), backend.clone(), backend, config);

    // -----------------------------------------------------------------------
    // 1. Create a channel and wait for the directory to see it
    // -----------------------------------------------------------------------
    let mut directory = client.open_directory()?;
    let (channel_id, created) = directory.create_channel("general")?;
    created.wait().await?;

    let event = tokio::time::timeout(EVENT_TIMEOUT, directory.next_event())
        .await
        .context("directory did not report the new channel")?
        .ok_or_else(|| anyhow!("directory feed ended"))?;
    log_event("directory", &event)?;
    info!(channels = ?directory.snapshot(), "Directory snapshot");

    // -----------------------------------------------------------------------
    // 2. Two participants join
    // -----------------------------------------------------------------------
    let mut alice = client.open_channel(channel_id.clone(), ParticipantId::from("alice"), "Alice")?;
    let mut bob = client.open_channel(channel_id, ParticipantId::from("bob"), "Bob")?;

    // -----------------------------------------------------------------------
    // 3. Bob types, then sends a message
    // -----------------------------------------------------------------------
    bob.set_typing(true).wait().await?;
    wait_for(&mut alice, "alice", |e| matches!(e, SyncEvent::TypingIndicator { visible: true }))
        .await?;

    let sent = bob.send_text("hi Alice")?.wait().await?;
    wait_for(&mut alice, "alice", |e| {
        matches!(e, SyncEvent::MessageAdded { message_id } if *message_id == sent)
    })
    .await?;

    // -----------------------------------------------------------------------
    // 4. Alice answers with a photo
    // -----------------------------------------------------------------------
    let photo = alice
        .send_media(sample_photo()?, CONTENT_TYPE_JPEG, "sunset.jpg")?
        .wait()
        .await?;
    wait_for(&mut bob, "bob", |e| {
        matches!(e, SyncEvent::AttachmentResolved { message_id } if *message_id == photo)
    })
    .await?;

    for message in bob.snapshot() {
        info!(message = %summarize(&message, bob.local_participant()), "Bob's timeline");
    }
    info!(
        typing = bob.should_show_typing_indicator(),
        "Bob's typing indicator"
    );

    alice.close();
    bob.close();
    directory.close();
    info!("Demo finished");
    Ok(())
}

/// Pump `session` until `pred` matches, logging everything on the way.
async fn wait_for(
    session: &mut ChannelSession,
    who: &str,
    pred: impl Fn(&SyncEvent) -> bool,
) -> anyhow::Result<SyncEvent> {
    loop {
        let event = tokio::time::timeout(EVENT_TIMEOUT, session.next_event())
            .await
            .with_context(|| format!("{who}: timed out waiting for event"))?
            .ok_or_else(|| anyhow!("{who}: session ended"))?;
        log_event(who, &event)?;
        if pred(&event) {
            return Ok(event);
        }
    }
}

fn log_event(who: &str, event: &SyncEvent) -> anyhow::Result<()> {
    info!(session = who, event = %serde_json::to_string(event)?, "{}", event.name());
    Ok(())
}

fn summarize(message: &Message, viewer: &ParticipantId) -> serde_json::Value {
    let body = match &message.body {
        MessageBody::Text { text } => json!({ "text": text }),
        MessageBody::Media { resolved, .. } => json!({
            "media": resolved.as_ref().map(|m| json!({
                "contentType": m.content_type,
                "frames": m.frames.len(),
                "size": m.frames.first().map(|f| [f.width, f.height]),
            })),
        }),
    };
    json!({
        "id": message.id,
        "from": message.sender_display_name,
        "outgoing": message.is_from(viewer),
        "body": body,
    })
}

fn sample_photo() -> anyhow::Result<Bytes> {
    let img = RgbImage::from_fn(32, 24, |x, y| Rgb([(x * 8) as u8, (y * 10) as u8, 96]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Jpeg)?;
    Ok(Bytes::from(buf.into_inner()))
}
