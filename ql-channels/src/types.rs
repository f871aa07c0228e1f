use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

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
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
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

id_newtype!(ChatId);
id_newtype!(ChannelId);

/// Webhook body posted by Wazzup. `messages` is optional so a missing key can be
/// told apart from an empty batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WazzupWebhook {
    #[serde(default)]
    pub messages: Option<Vec<WazzupMessage>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WazzupMessage {
    pub chat_id: ChatId,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    /// Set only on messages written by an operator or the bot itself.
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub content_uri: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

impl WazzupMessage {
    pub fn is_from_operator(&self) -> bool {
        self.author_name.is_some()
    }

    pub fn is_text(&self) -> bool {
        self.kind == "text"
    }

    pub fn into_inbound(self) -> InboundMessage {
        let kind = if self.is_text() {
            InboundMessageKind::Text
        } else {
            InboundMessageKind::Media
        };
        InboundMessage {
            kind,
            chat_id: self.chat_id,
            channel_id: self.channel_id,
            content: self.text.unwrap_or_default(),
            media_uri: self.content_uri,
            metadata: serde_json::json!({
                "provider": "wazzup",
                "message_id": self.message_id,
                "type": self.kind,
            }),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundMessageKind {
    Text,
    /// Images, voice notes, documents and anything else without plain text.
    Media,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub kind: InboundMessageKind,
    pub chat_id: ChatId,
    pub channel_id: Option<ChannelId>,
    pub content: String,
    #[serde(default)]
    pub media_uri: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub content: String,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}
