//! Messaging channel adapters for Quietline.
//!
//! Adapters are pure I/O: they parse provider webhooks into `InboundMessage`
//! and deliver `OutboundMessage` through the provider's send API.

mod traits;
mod types;
mod wazzup;

pub use traits::ChannelAdapter;
pub use types::{
    ChannelId, ChatId, InboundMessage, InboundMessageKind, OutboundMessage, WazzupMessage,
    WazzupWebhook,
};
pub use wazzup::{WAZZUP_API_URL, WazzupAdapter};
