//! Webhook classification: decides what happens to one inbound provider event.

use crate::escalation::{Escalation, EscalationReason};
use crate::threads::ThreadStore;
use anyhow::Result;
use ql_channels::{InboundMessageKind, WazzupWebhook};
use ql_core::{Coordinator, JobId, ReplySeed};
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;

const INSTAGRAM_LINK: &str = r"https?://(www\.)?instagram\.com/\S+";

/// Outcome label returned to the provider. Every variant is a 200 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookStatus {
    InvalidData,
    NoMessages,
    BotMessageIgnored,
    WrongChannel,
    ConversationClosed,
    MediaForwardedToManager,
    InstagramLinkForwarded,
    MessageQueued { task_id: JobId },
}

pub struct WebhookGateway {
    channel_id: String,
    threads: ThreadStore,
    coordinator: Arc<Coordinator>,
    escalation: Arc<Escalation>,
    instagram: Regex,
}

impl WebhookGateway {
    pub fn new(
        channel_id: &str,
        threads: ThreadStore,
        coordinator: Arc<Coordinator>,
        escalation: Arc<Escalation>,
    ) -> Result<Self> {
        Ok(Self {
            channel_id: channel_id.to_string(),
            threads,
            coordinator,
            escalation,
            instagram: Regex::new(INSTAGRAM_LINK)?,
        })
    }

    pub fn contains_instagram_link(&self, text: &str) -> bool {
        self.instagram.is_match(text)
    }

    /// Classifies the raw webhook body. Only the first message of a batch is
    /// handled. Errors mean the coordination layer failed.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn handle(&self, body: &[u8]) -> Result<WebhookStatus> {
        let Ok(payload) = serde_json::from_slice::<WazzupWebhook>(body) else {
            tracing::info!("webhook body is not a messages payload");
            return Ok(WebhookStatus::InvalidData);
        };
        let Some(messages) = payload.messages else {
            tracing::info!("webhook payload has no messages key");
            return Ok(WebhookStatus::InvalidData);
        };
        let Some(first) = messages.into_iter().next() else {
            tracing::info!("webhook payload has an empty messages list");
            return Ok(WebhookStatus::NoMessages);
        };

        if first.is_from_operator() {
            tracing::info!("ignoring message written by an operator");
            return Ok(WebhookStatus::BotMessageIgnored);
        }
        if first.channel_id.as_deref() != Some(self.channel_id.as_str()) {
            tracing::info!(channel_id = ?first.channel_id, "ignoring message from another channel");
            return Ok(WebhookStatus::WrongChannel);
        }

        let inbound = first.into_inbound();
        let user = inbound.chat_id.as_str();
        if !self.threads.is_open(user).await {
            tracing::info!(user, "conversation is closed");
            return Ok(WebhookStatus::ConversationClosed);
        }

        if inbound.kind == InboundMessageKind::Media {
            let outcome = self
                .escalation
                .forward(&inbound, EscalationReason::Media)
                .await?;
            tracing::info!(user, ?outcome, "media forwarded to manager");
            return Ok(WebhookStatus::MediaForwardedToManager);
        }
        if self.contains_instagram_link(&inbound.content) {
            let outcome = self
                .escalation
                .forward(&inbound, EscalationReason::Unanswerable)
                .await?;
            tracing::info!(user, ?outcome, "instagram link forwarded to manager");
            return Ok(WebhookStatus::InstagramLinkForwarded);
        }

        let seed = ReplySeed::new(user, inbound.content.as_str()).with_context(serde_json::json!({
            "chat_id": inbound.chat_id,
            "channel_id": inbound.channel_id,
        }));
        let receipt = self.coordinator.submit(seed).await?;
        tracing::info!(
            user,
            job_id = %receipt.job_id,
            buffered = receipt.buffered,
            superseded = receipt.superseded.is_some(),
            "message queued"
        );
        Ok(WebhookStatus::MessageQueued {
            task_id: receipt.job_id,
        })
    }
}
