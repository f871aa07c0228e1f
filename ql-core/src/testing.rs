use crate::types::{MergedBurst, ReplyAck, ReplyPipeline};
use async_trait::async_trait;
use std::sync::Mutex;

/// Pipeline double that records every burst it receives.
#[derive(Default)]
pub(crate) struct RecordingPipeline {
    calls: Mutex<Vec<MergedBurst>>,
}

impl RecordingPipeline {
    pub(crate) fn calls(&self) -> Vec<MergedBurst> {
        self.calls.lock().expect("recording pipeline mutex").clone()
    }

    pub(crate) fn texts(&self) -> Vec<String> {
        self.calls().into_iter().map(|burst| burst.seed.text).collect()
    }
}

#[async_trait]
impl ReplyPipeline for RecordingPipeline {
    async fn deliver(&self, burst: MergedBurst) -> anyhow::Result<ReplyAck> {
        let reply = format!("echo: {}", burst.seed.text);
        self.calls
            .lock()
            .expect("recording pipeline mutex")
            .push(burst);
        Ok(ReplyAck { reply })
    }
}

pub(crate) struct FailingPipeline;

#[async_trait]
impl ReplyPipeline for FailingPipeline {
    async fn deliver(&self, _burst: MergedBurst) -> anyhow::Result<ReplyAck> {
        anyhow::bail!("assistant unavailable")
    }
}
