//! Operator hand-off. Runs under the user's distributed lock so concurrent
//! webhooks for the same user forward at most once.

use crate::threads::ThreadStore;
use anyhow::Result;
use ql_channels::{ChannelAdapter, InboundMessage, OutboundMessage};
use ql_core::{Coordinator, LockOutcome, UserId};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationReason {
    /// Media the bot cannot read.
    Media,
    /// A question the bot should not answer, e.g. an Instagram link.
    Unanswerable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationOutcome {
    Forwarded,
    AlreadyClosed,
    /// Another worker holds the user's lock.
    Busy,
}

pub struct Escalation {
    coordinator: Arc<Coordinator>,
    threads: ThreadStore,
    channel: Arc<dyn ChannelAdapter>,
    handoff_text: String,
    admin_phone: String,
    bot_url: String,
}

impl Escalation {
    pub fn new(
        coordinator: Arc<Coordinator>,
        threads: ThreadStore,
        channel: Arc<dyn ChannelAdapter>,
        handoff_text: &str,
        admin_phone: &str,
        bot_url: &str,
    ) -> Self {
        Self {
            coordinator,
            threads,
            channel,
            handoff_text: handoff_text.to_string(),
            admin_phone: admin_phone.to_string(),
            bot_url: bot_url.to_string(),
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(user = %message.chat_id, ?reason))]
    pub async fn forward(
        &self,
        message: &InboundMessage,
        reason: EscalationReason,
    ) -> Result<EscalationOutcome> {
        let user = UserId::new(message.chat_id.as_str());
        let outcome = self
            .coordinator
            .escalate(&user, || self.hand_off(message, reason))
            .await?;
        match outcome {
            LockOutcome::Acquired(result) => result,
            LockOutcome::NotAcquired => {
                tracing::warn!("escalation skipped; user lock is held elsewhere");
                Ok(EscalationOutcome::Busy)
            }
        }
    }

    async fn hand_off(
        &self,
        message: &InboundMessage,
        reason: EscalationReason,
    ) -> Result<EscalationOutcome> {
        let user = message.chat_id.as_str();
        if !self.threads.is_open(user).await {
            return Ok(EscalationOutcome::AlreadyClosed);
        }
        self.channel
            .send(user, OutboundMessage::text(self.handoff_text.clone()))
            .await?;
        self.threads.close(user).await?;
        self.channel
            .send(
                &self.admin_phone,
                OutboundMessage::text(self.summary(message, reason)),
            )
            .await?;
        tracing::info!("conversation handed to operator");
        Ok(EscalationOutcome::Forwarded)
    }

    fn summary(&self, message: &InboundMessage, reason: EscalationReason) -> String {
        let user = message.chat_id.as_str();
        let history = format!("{}history?userid={user}", self.bot_url);
        match reason {
            EscalationReason::Media => format!(
                "Please check the media file: {}\nConversation: {history}\nClient phone: +{user}",
                message.media_uri.as_deref().unwrap_or("(no link)")
            ),
            EscalationReason::Unanswerable => format!(
                "The bot cannot answer this one.\nConversation: {history}\nClient phone: +{user}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::testing::RecordingChannel;
    use chrono::Utc;
    use ql_channels::{ChatId, InboundMessageKind};
    use ql_core::{
        CoordinationStore, CoordinatorConfig, KeySpace, LocalJobQueue, MemoryStore, MergedBurst,
        QueueConfig, ReplyAck, ReplyPipeline,
    };
    use std::time::Duration;

    struct NoReply;

    #[async_trait::async_trait]
    impl ReplyPipeline for NoReply {
        async fn deliver(&self, _burst: MergedBurst) -> anyhow::Result<ReplyAck> {
            anyhow::bail!("unused")
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        threads: ThreadStore,
        channel: Arc<RecordingChannel>,
        escalation: Arc<Escalation>,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let threads = ThreadStore::open(dir.path().join("t.db")).await.expect("open");
        let store = Arc::new(MemoryStore::new());
        let coordinator = Arc::new(
            Coordinator::new(
                store.clone(),
                Arc::new(LocalJobQueue::new(QueueConfig::default())),
                KeySpace::new("user_bot"),
                Arc::new(NoReply),
                CoordinatorConfig::default(),
            )
            .expect("coordinator"),
        );
        let channel = Arc::new(RecordingChannel::default());
        let escalation = Arc::new(Escalation::new(
            coordinator,
            threads.clone(),
            channel.clone(),
            "A manager will reply shortly.",
            "70000000000",
            "https://bot.example.com/",
        ));
        Harness {
            _dir: dir,
            store,
            threads,
            channel,
            escalation,
        }
    }

    fn media(user: &str) -> InboundMessage {
        InboundMessage {
            kind: InboundMessageKind::Media,
            chat_id: ChatId::new(user),
            channel_id: None,
            content: String::new(),
            media_uri: Some("https://cdn/x.jpg".to_string()),
            metadata: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn forwards_once_then_reports_closed() {
        let h = harness().await;
        let msg = media("42");
        let first = h
            .escalation
            .forward(&msg, EscalationReason::Media)
            .await
            .expect("forward");
        assert_eq!(first, EscalationOutcome::Forwarded);
        assert!(!h.threads.is_open("42").await);

        let sent = h.channel.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], ("42".to_string(), "A manager will reply shortly.".to_string()));
        assert_eq!(sent[1].0, "70000000000");
        assert!(sent[1].1.contains("https://cdn/x.jpg"));
        assert!(sent[1].1.contains("https://bot.example.com/history?userid=42"));
        assert!(sent[1].1.contains("+42"));

        let second = h
            .escalation
            .forward(&msg, EscalationReason::Media)
            .await
            .expect("forward");
        assert_eq!(second, EscalationOutcome::AlreadyClosed);
        assert_eq!(h.channel.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn held_lock_means_busy() {
        let h = harness().await;
        h.store
            .set_ex("user_bot_42_lock", "locked", Duration::from_secs(10))
            .await
            .expect("hold lock");
        let outcome = h
            .escalation
            .forward(&media("42"), EscalationReason::Unanswerable)
            .await
            .expect("forward");
        assert_eq!(outcome, EscalationOutcome::Busy);
        assert!(h.channel.sent().is_empty());
        assert!(h.threads.is_open("42").await);
    }

    #[tokio::test]
    async fn concurrent_escalations_forward_once() {
        let h = harness().await;
        let msg = media("42");
        let (a, b) = tokio::join!(
            h.escalation.forward(&msg, EscalationReason::Media),
            h.escalation.forward(&msg, EscalationReason::Media),
        );
        let outcomes = [a.expect("a"), b.expect("b")];
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == EscalationOutcome::Forwarded)
                .count(),
            1
        );
        assert_eq!(h.channel.sent().len(), 2);
    }
}
