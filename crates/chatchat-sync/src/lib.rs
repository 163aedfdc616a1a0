//! # chatchat-sync
//!
//! Client-side synchronization core for ChatChat. Keeps a local view of the
//! channel list, each open channel's recent messages, their media
//! attachments and the "someone is typing" indicator consistent with a
//! remote change feed.
//!
//! The core talks to the backend only through the traits in [`backend`];
//! [`memory::MemoryBackend`] provides an in-process implementation.

pub mod attachments;
pub mod backend;
pub mod completion;
pub mod config;
pub mod directory;
pub mod events;
pub mod memory;
pub mod presence;
pub mod session;
pub mod timeline;

pub use attachments::{decode_media, AttachmentResolver, Completed, ResolutionOutcome};
pub use backend::{
    ChangeFeed, ContentMetadata, ContentStore, FeedQuery, FeedSubscription, RecordStore,
    SubscriptionHandle,
};
pub use completion::Completion;
pub use config::SyncConfig;
pub use directory::ChannelDirectory;
pub use events::SyncEvent;
pub use memory::MemoryBackend;
pub use presence::PresenceAggregator;
pub use session::{ChannelSession, DirectorySession, SyncClient};
pub use timeline::{MessageTimeline, MessageUpdate};
