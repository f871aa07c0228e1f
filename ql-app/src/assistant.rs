//! Reply pipeline: merged burst → assistant thread → channel.

use crate::threads::ThreadStore;
use anyhow::Result;
use async_trait::async_trait;
use ql_channels::{ChannelAdapter, OutboundMessage};
use ql_core::{MergedBurst, ReplyAck, ReplyPipeline};
use ql_llm::{AssistantsClient, ThreadSeed, TranscriptEntry};
use std::sync::Arc;

/// The assistant operations the app needs. Implemented by the OpenAI client and
/// by fakes in tests.
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    async fn create_thread(&self) -> Result<String>;

    async fn reply(&self, thread_id: &str, text: &str) -> Result<String>;

    async fn transcript(&self, thread_id: &str) -> Result<Vec<TranscriptEntry>>;
}

pub struct OpenAiAssistant {
    client: AssistantsClient,
    seed: ThreadSeed,
}

impl OpenAiAssistant {
    pub fn new(client: AssistantsClient, seed: ThreadSeed) -> Self {
        Self { client, seed }
    }
}

#[async_trait]
impl AssistantBackend for OpenAiAssistant {
    async fn create_thread(&self) -> Result<String> {
        Ok(self.client.create_thread(Some(&self.seed)).await?)
    }

    async fn reply(&self, thread_id: &str, text: &str) -> Result<String> {
        Ok(self.client.reply(thread_id, text).await?)
    }

    async fn transcript(&self, thread_id: &str) -> Result<Vec<TranscriptEntry>> {
        Ok(self.client.transcript(thread_id).await?)
    }
}

pub struct AssistantPipeline {
    assistant: Arc<dyn AssistantBackend>,
    threads: ThreadStore,
    channel: Arc<dyn ChannelAdapter>,
}

impl AssistantPipeline {
    pub fn new(
        assistant: Arc<dyn AssistantBackend>,
        threads: ThreadStore,
        channel: Arc<dyn ChannelAdapter>,
    ) -> Self {
        Self {
            assistant,
            threads,
            channel,
        }
    }

    async fn thread_for(&self, user: &str) -> Result<String> {
        if let Some(thread_id) = self.threads.get(user).await? {
            return Ok(thread_id);
        }
        let thread_id = self.assistant.create_thread().await?;
        self.threads.save(user, &thread_id).await?;
        tracing::info!(user, thread_id = %thread_id, "assistant thread bound to user");
        Ok(thread_id)
    }
}

#[async_trait]
impl ReplyPipeline for AssistantPipeline {
    #[tracing::instrument(level = "info", skip_all, fields(user = %burst.seed.user, fragments = burst.fragments))]
    async fn deliver(&self, burst: MergedBurst) -> Result<ReplyAck> {
        let user = burst.seed.user.as_str();
        let thread_id = self.thread_for(user).await?;
        let reply = self.assistant.reply(&thread_id, &burst.seed.text).await?;
        self.channel
            .send(user, OutboundMessage::text(reply.clone()))
            .await?;
        tracing::info!(reply_chars = reply.chars().count(), "assistant reply sent");
        Ok(ReplyAck { reply })
    }
}
