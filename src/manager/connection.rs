//! Outbound client connection seam

use tokio::sync::mpsc;

use crate::error::{ClaudeError, Result};

/// A client connection that receives serialized protocol events
///
/// The stream manager holds connections weakly; a dropped connection is the
/// same as a closed one.
pub trait Connection: Send + Sync {
    /// Whether the connection can still accept frames
    fn is_open(&self) -> bool;

    /// Deliver one serialized frame
    ///
    /// # Errors
    /// Returns error if the frame could not be handed to the connection
    fn send(&self, frame: &str) -> Result<()>;
}

/// Connection backed by an unbounded channel
///
/// The receiver side is owned by whatever writes frames to the real socket or
/// stream; dropping it closes the connection.
pub struct ChannelConnection {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelConnection {
    /// Create a connection and the receiver its frames arrive on
    #[must_use]
    pub fn new() -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (std::sync::Arc::new(Self { tx }), rx)
    }
}

impl Connection for ChannelConnection {
    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    fn send(&self, frame: &str) -> Result<()> {
        self.tx
            .send(frame.to_string())
            .map_err(|_| ClaudeError::connection("client connection closed"))
    }
}
