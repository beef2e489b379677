//! Session stream management
//!
//! # Module Structure
//!
//! - `queue` - FIFO of inbound prompts and its consumer handle
//! - `connection` - outbound client connection seam
//! - `stream` - `SessionStreamManager` registry and idle reaper

mod connection;
mod queue;
mod stream;

pub use connection::{ChannelConnection, Connection};
pub use queue::{InboundMessages, MessageQueue};
pub use stream::{CleanupReason, SessionStreamManager, StreamHandle};
