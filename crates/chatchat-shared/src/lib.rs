//! # chatchat-shared
//!
//! Backend-agnostic vocabulary shared by the ChatChat sync core: identifier
//! newtypes, the channel/message data model, the error taxonomy and the
//! record layout used on the change feed.

pub mod constants;
pub mod error;
pub mod models;
pub mod protocol;
pub mod types;

pub use error::{BackendError, Result, SyncError};
pub use models::*;
pub use types::{ChannelId, MessageId, ParticipantId};
