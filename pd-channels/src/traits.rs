use crate::types::{InboundEvent, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier, e.g. "telegram".
    fn channel_id(&self) -> &str;

    /// Start receiving updates. Push to tx for each inbound event.
    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()>;

    /// Send a message (text, keyboard and/or document) to a chat.
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()>;

    fn supports_documents(&self) -> bool {
        true
    }
}

/// Lazily downloadable file content attached to an inbound event.
///
/// Fetching happens off the event path, inside a bounded job slot.
#[async_trait]
pub trait ByteSource: Send + Sync + std::fmt::Debug {
    /// Write the content to `dest`, failing with
    /// [`SizeLimitExceeded`](crate::SizeLimitExceeded) as soon as more than
    /// `max_bytes` have been received. Returns the number of bytes written.
    async fn fetch_to(&self, dest: &Path, max_bytes: u64) -> Result<u64>;
}
