use crate::traits::ByteSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(ChannelId);
id_newtype!(ChatId);

const CALLBACK_SELECT_PREFIX: &str = "op:";
const CALLBACK_FINISH: &str = "finish";
const CALLBACK_BACK: &str = "back";

/// User intent that is not free text: a menu selection, the end of a
/// multi-file collection, or a request to abandon the current flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", content = "value", rename_all = "snake_case")]
pub enum ControlSignal {
    /// Raw selection id as received; validated against the operation registry
    /// by the consumer.
    Select(String),
    Finish,
    Back,
}

impl ControlSignal {
    /// Decodes inline-button callback data. Anything that is not a known
    /// keyword is treated as a selection so the registry can reject it.
    pub fn from_callback_data(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed {
            CALLBACK_FINISH => Self::Finish,
            CALLBACK_BACK => Self::Back,
            other => Self::Select(
                other
                    .strip_prefix(CALLBACK_SELECT_PREFIX)
                    .unwrap_or(other)
                    .to_string(),
            ),
        }
    }

    pub fn to_callback_data(&self) -> String {
        match self {
            Self::Select(id) => format!("{CALLBACK_SELECT_PREFIX}{id}"),
            Self::Finish => CALLBACK_FINISH.to_string(),
            Self::Back => CALLBACK_BACK.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Size as declared by the platform; the download itself is capped
    /// independently because this may be missing or wrong.
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum InboundEventKind {
    FileReceived {
        metadata: FileMetadata,
        source: Arc<dyn ByteSource>,
    },
    TextReceived(String),
    Control(ControlSignal),
}

impl InboundEventKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::FileReceived { .. } => "file",
            Self::TextReceived(_) => "text",
            Self::Control(_) => "control",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub chat_id: ChatId,
    pub kind: InboundEventKind,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    pub callback_data: String,
}

impl Button {
    pub fn new(label: impl Into<String>, signal: &ControlSignal) -> Self {
        Self {
            label: label.into(),
            callback_data: signal.to_callback_data(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub content: String,
    #[serde(default)]
    pub reply_to_message_id: Option<MessageId>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Inline keyboard rows.
    #[serde(default)]
    pub keyboard: Vec<Vec<Button>>,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}
