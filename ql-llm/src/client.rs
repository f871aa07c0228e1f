use crate::error::{LlmError, Result};
use crate::types::{CreatedObject, MessageList, Run, ThreadMessage, TranscriptEntry, latest_assistant_text};
use serde_json::json;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const ASSISTANTS_BETA_HEADER: (&str, &str) = ("OpenAI-Beta", "assistants=v2");

/// First message of a freshly created thread: a priming prompt plus a file the
/// assistant can search.
#[derive(Debug, Clone, Default)]
pub struct ThreadSeed {
    pub prompt: String,
    pub file_id: Option<String>,
}

#[derive(Clone)]
pub struct AssistantsClient {
    http: reqwest::Client,
    api_key: String,
    assistant_id: String,
    base_url: String,
    poll_interval: Duration,
    max_polls: u32,
}

impl AssistantsClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, assistant_id: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            http,
            api_key: api_key.to_string(),
            assistant_id: assistant_id.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            poll_interval: Duration::from_millis(500),
            max_polls: 120,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_polling(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls.max(1);
        self
    }

    pub fn assistant_id(&self) -> &str {
        &self.assistant_id
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn create_thread(&self, seed: Option<&ThreadSeed>) -> Result<String> {
        let body = match seed {
            Some(seed) => {
                let attachments: Vec<_> = seed
                    .file_id
                    .iter()
                    .map(|file_id| json!({"file_id": file_id, "tools": [{"type": "file_search"}]}))
                    .collect();
                json!({
                    "messages": [{
                        "role": "user",
                        "content": seed.prompt,
                        "attachments": attachments,
                    }]
                })
            }
            None => json!({}),
        };
        let created: CreatedObject = self.post("/threads", &body).await?;
        tracing::info!(thread_id = %created.id, "assistant thread created");
        Ok(created.id)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(thread_id = %thread_id))]
    pub async fn add_user_message(&self, thread_id: &str, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(LlmError::InvalidInput("message text is empty".to_string()));
        }
        let _: CreatedObject = self
            .post(
                &format!("/threads/{thread_id}/messages"),
                &json!({"role": "user", "content": text}),
            )
            .await?;
        Ok(())
    }

    pub async fn create_run(&self, thread_id: &str) -> Result<Run> {
        self.post(
            &format!("/threads/{thread_id}/runs"),
            &json!({"assistant_id": self.assistant_id}),
        )
        .await
    }

    pub async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run> {
        self.get(&format!("/threads/{thread_id}/runs/{run_id}")).await
    }

    /// Starts a run and polls until it reaches a terminal status or the poll
    /// budget runs out.
    #[tracing::instrument(level = "info", skip_all, fields(thread_id = %thread_id))]
    pub async fn run_to_completion(&self, thread_id: &str) -> Result<Run> {
        let mut run = self.create_run(thread_id).await?;
        let mut polls = 0;
        while !run.status.is_terminal() {
            if polls >= self.max_polls {
                return Err(LlmError::PollExhausted {
                    run_id: run.id,
                    polls,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
            run = self.get_run(thread_id, &run.id).await?;
            polls += 1;
        }
        tracing::debug!(run_id = %run.id, status = %run.status, polls, "run reached terminal status");
        Ok(run)
    }

    /// Messages newest first.
    pub async fn list_messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>> {
        let list: MessageList = self
            .get(&format!("/threads/{thread_id}/messages?order=desc"))
            .await?;
        Ok(list.data)
    }

    pub async fn transcript(&self, thread_id: &str) -> Result<Vec<TranscriptEntry>> {
        let messages = self.list_messages(thread_id).await?;
        Ok(messages.iter().map(TranscriptEntry::from).collect())
    }

    /// Posts `text` to the thread, runs the assistant and returns its newest reply.
    #[tracing::instrument(level = "info", skip_all, fields(thread_id = %thread_id))]
    pub async fn reply(&self, thread_id: &str, text: &str) -> Result<String> {
        self.add_user_message(thread_id, text).await?;
        let run = self.run_to_completion(thread_id).await?;
        if run.status != crate::types::RunStatus::Completed {
            return Err(LlmError::RunNotCompleted {
                run_id: run.id,
                status: run.status.to_string(),
            });
        }
        let messages = self.list_messages(thread_id).await?;
        latest_assistant_text(&messages).ok_or_else(|| LlmError::NoReply(thread_id.to_string()))
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .header(ASSISTANTS_BETA_HEADER.0, ASSISTANTS_BETA_HEADER.1)
            .json(body)
            .send()
            .await?;
        Self::parse(path, response).await
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .header(ASSISTANTS_BETA_HEADER.0, ASSISTANTS_BETA_HEADER.1)
            .send()
            .await?;
        Self::parse(path, response).await
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        path: &str,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "openai {path} status={status} body={body}"
            )));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Fake {
        run_polls: AtomicU32,
        final_status: &'static str,
        seeded_with: std::sync::Mutex<Option<serde_json::Value>>,
    }

    async fn create_thread(
        State(fake): State<Arc<Fake>>,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        *fake.seeded_with.lock().expect("mutex") = Some(body);
        Json(json!({"id": "thread_1", "object": "thread"}))
    }

    async fn add_message(Path(thread): Path<String>) -> Json<serde_json::Value> {
        Json(json!({"id": format!("msg_for_{thread}")}))
    }

    async fn create_run() -> Json<serde_json::Value> {
        Json(json!({"id": "run_1", "status": "queued"}))
    }

    async fn get_run(State(fake): State<Arc<Fake>>) -> Json<serde_json::Value> {
        let n = fake.run_polls.fetch_add(1, Ordering::SeqCst);
        let status = if n < 2 { "in_progress" } else { fake.final_status };
        Json(json!({"id": "run_1", "status": status}))
    }

    async fn list_messages() -> Json<serde_json::Value> {
        Json(json!({
            "data": [
                {"id": "m2", "role": "assistant", "content": [{"type": "text", "text": {"value": "Yes, 9 to 18."}}]},
                {"id": "m1", "role": "user", "content": [{"type": "text", "text": {"value": "open?"}}]}
            ]
        }))
    }

    async fn serve(final_status: &'static str) -> (AssistantsClient, Arc<Fake>) {
        let fake = Arc::new(Fake {
            final_status,
            ..Fake::default()
        });
        let app = Router::new()
            .route("/v1/threads", post(create_thread))
            .route("/v1/threads/{thread}/messages", post(add_message).get(list_messages))
            .route("/v1/threads/{thread}/runs", post(create_run))
            .route("/v1/threads/{thread}/runs/{run}", get(get_run))
            .with_state(fake.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        let client = AssistantsClient::new("sk-test", "asst_1")
            .with_base_url(&format!("http://{addr}/v1"))
            .with_polling(Duration::from_millis(1), 10);
        (client, fake)
    }

    #[tokio::test]
    async fn thread_seed_carries_file_search_attachment() {
        let (client, fake) = serve("completed").await;
        let id = client
            .create_thread(Some(&ThreadSeed {
                prompt: "Price list".to_string(),
                file_id: Some("file_9".to_string()),
            }))
            .await
            .expect("create");
        assert_eq!(id, "thread_1");
        let body = fake.seeded_with.lock().expect("mutex").clone().expect("body");
        let message = &body["messages"][0];
        assert_eq!(message["content"], "Price list");
        assert_eq!(message["attachments"][0]["file_id"], "file_9");
        assert_eq!(message["attachments"][0]["tools"][0]["type"], "file_search");
    }

    #[tokio::test]
    async fn reply_polls_until_completed() {
        let (client, fake) = serve("completed").await;
        let reply = client.reply("thread_1", "open?").await.expect("reply");
        assert_eq!(reply, "Yes, 9 to 18.");
        assert_eq!(fake.run_polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_run_is_an_error() {
        let (client, _fake) = serve("failed").await;
        let err = client.reply("thread_1", "open?").await.expect_err("failed run");
        assert!(matches!(err, LlmError::RunNotCompleted { ref status, .. } if status == "failed"));
    }

    #[tokio::test]
    async fn empty_message_is_rejected_locally() {
        let (client, fake) = serve("completed").await;
        let err = client.reply("thread_1", "  ").await.expect_err("empty");
        assert!(matches!(err, LlmError::InvalidInput(_)));
        assert_eq!(fake.run_polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transcript_maps_roles_and_text() {
        let (client, _fake) = serve("completed").await;
        let transcript = client.transcript("thread_1").await.expect("transcript");
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].role, "assistant");
        assert_eq!(transcript[1].content, "open?");
    }
}
