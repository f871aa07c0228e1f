use async_trait::async_trait;
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

id_newtype!(UserId);
id_newtype!(JobId);

/// Payload carried by a deferred job. `text` is replaced by the merged burst
/// before it reaches the reply pipeline; `context` is opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplySeed {
    pub user: UserId,
    pub text: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

impl ReplySeed {
    pub fn new(user: impl Into<UserId>, text: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            text: text.into(),
            context: serde_json::Value::Null,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedBurst {
    pub seed: ReplySeed,
    pub fragments: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyAck {
    pub reply: String,
}

/// Downstream consumer of a completed burst: generates and delivers the reply.
#[async_trait]
pub trait ReplyPipeline: Send + Sync {
    async fn deliver(&self, burst: MergedBurst) -> anyhow::Result<ReplyAck>;
}
