use crate::traits::ChannelAdapter;
use crate::types::{ChannelId, OutboundMessage};
use anyhow::{Result, anyhow};

pub const WAZZUP_API_URL: &str = "https://api.wazzup24.com/v3/message";

/// Outbound adapter for the Wazzup WhatsApp gateway. Inbound traffic arrives
/// through the webhook route in ql-app.
#[derive(Clone)]
pub struct WazzupAdapter {
    http: reqwest::Client,
    api_key: String,
    channel: ChannelId,
    endpoint: String,
}

impl WazzupAdapter {
    pub fn new(api_key: &str, channel: &str) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(anyhow!("wazzup api key is required"));
        }
        let channel = channel.trim();
        if channel.is_empty() {
            return Err(anyhow!("wazzup channel id is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            channel: ChannelId::new(channel),
            endpoint: WAZZUP_API_URL.to_string(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for WazzupAdapter {
    fn channel_id(&self) -> &str {
        "wazzup"
    }

    #[tracing::instrument(level = "info", skip_all, fields(chat_id = %recipient_id))]
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let chat_id = recipient_id.trim();
        if chat_id.is_empty() {
            return Err(anyhow!("recipient chat id is required"));
        }
        if message.content.trim().is_empty() {
            return Err(anyhow!("message content is empty"));
        }

        let payload = serde_json::json!({
            "channelId": self.channel,
            "chatId": chat_id,
            "chatType": "whatsapp",
            "text": message.content,
        });
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!("wazzup send failed: status={status} body={body}"));
        }
        tracing::debug!(%status, "wazzup message accepted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>;

    async fn fake_wazzup(status: StatusCode) -> (WazzupAdapter, Seen) {
        let seen: Seen = Arc::default();
        let sink = seen.clone();
        let app = Router::new().route(
            "/v3/message",
            post(move |headers: HeaderMap, Json(body): Json<serde_json::Value>| {
                let sink = sink.clone();
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    sink.lock().expect("mutex").push((auth, body));
                    (status, Json(serde_json::json!({"messageId": "out-1"})))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        let adapter = WazzupAdapter::new("wz-key", "ch-1")
            .expect("adapter")
            .with_endpoint(&format!("http://{addr}/v3/message"));
        (adapter, seen)
    }

    #[tokio::test]
    async fn posts_whatsapp_text_with_bearer_auth() {
        let (adapter, seen) = fake_wazzup(StatusCode::CREATED).await;
        adapter
            .send("79001234567", OutboundMessage::text("We are open"))
            .await
            .expect("send");
        let seen = seen.lock().expect("mutex").clone();
        assert_eq!(seen.len(), 1);
        let (auth, body) = &seen[0];
        assert_eq!(auth.as_deref(), Some("Bearer wz-key"));
        assert_eq!(body["channelId"], "ch-1");
        assert_eq!(body["chatId"], "79001234567");
        assert_eq!(body["chatType"], "whatsapp");
        assert_eq!(body["text"], "We are open");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (adapter, _seen) = fake_wazzup(StatusCode::BAD_REQUEST).await;
        let err = adapter
            .send("1", OutboundMessage::text("x"))
            .await
            .expect_err("400");
        assert!(err.to_string().contains("status=400"));
    }

    #[tokio::test]
    async fn rejects_blank_input_without_calling_provider() {
        let (adapter, seen) = fake_wazzup(StatusCode::OK).await;
        assert!(adapter.send(" ", OutboundMessage::text("x")).await.is_err());
        assert!(adapter.send("1", OutboundMessage::text("  ")).await.is_err());
        assert!(seen.lock().expect("mutex").is_empty());
        assert!(WazzupAdapter::new("", "ch").is_err());
    }
}
