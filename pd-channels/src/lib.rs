//! Chat transport adapters for pdfdesk.
//!
//! Adapters are pure I/O: they convert platform updates into `InboundEvent`s
//! and render `OutboundMessage`s. File content is never downloaded here
//! eagerly; events carry a `ByteSource` that the job executor drains inside a
//! bounded slot.

mod source;
mod telegram;
mod traits;
mod types;

pub use source::{MemorySource, SizeLimitExceeded, stream_to_file};
pub use telegram::{TelegramAdapter, TelegramDelivery, TelegramFileSource};
pub use traits::{ByteSource, ChannelAdapter};
pub use types::{
    Attachment, Button, ChannelId, ChatId, ControlSignal, FileMetadata, InboundEvent,
    InboundEventKind, MessageId, OutboundMessage,
};
