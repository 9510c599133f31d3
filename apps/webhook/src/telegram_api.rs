use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::{collections::HashMap, future::Future, time::Duration};
use tokio::time::sleep;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebhookInfo {
    #[serde(default)]
    pub url: String,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

/// The slice of the Bot API the webhook server and the bundled handlers use.
#[async_trait]
pub trait TelegramApi: Send + Sync {
    async fn get_webhook_info(&self, bot_token: &str) -> Result<WebhookInfo>;
    async fn set_webhook(
        &self,
        bot_token: &str,
        url: &str,
        secret: &str,
        allowed_updates: &[String],
        drop_pending: bool,
    ) -> Result<()>;
    async fn delete_webhook(&self, bot_token: &str, drop_pending: bool) -> Result<()>;
    /// Returns the sent message as Telegram echoes it back.
    async fn send_message(&self, bot_token: &str, chat_id: i64, text: &str) -> Result<Value>;
    async fn answer_callback_query(
        &self,
        bot_token: &str,
        callback_query_id: &str,
        text: Option<&str>,
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct HttpTelegramApi {
    client: Client,
    api_base: String,
}

impl HttpTelegramApi {
    pub fn new(client: Client, api_base: Option<String>) -> Self {
        let api_base = api_base.unwrap_or_else(|| "https://api.telegram.org".into());
        Self { client, api_base }
    }

    fn url(&self, bot_token: &str, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.api_base.trim_end_matches('/'),
            bot_token,
            method
        )
    }

    async fn with_retry<F, Fut, T>(mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        let delays = [
            Duration::from_millis(250),
            Duration::from_secs(1),
            Duration::from_secs(4),
        ];
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < delays.len() => {
                    tracing::debug!(attempt, error = %err, "telegram call failed, retrying");
                    sleep(delays[attempt]).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn call<T>(&self, bot_token: &str, method: &str, payload: &Value) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let res = self
            .client
            .post(self.url(bot_token, method))
            .timeout(REQUEST_TIMEOUT)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("telegram {method} request"))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("telegram {} {}: {}", method, status, body));
        }
        let body: TelegramResponse<T> = res
            .json()
            .await
            .with_context(|| format!("decode telegram {method} response"))?;
        if body.ok {
            Ok(body.result.unwrap_or_default())
        } else {
            Err(anyhow!(
                "telegram {} failed: {}",
                method,
                body.description.unwrap_or_else(|| "unknown error".into())
            ))
        }
    }
}

#[async_trait]
impl TelegramApi for HttpTelegramApi {
    async fn get_webhook_info(&self, bot_token: &str) -> Result<WebhookInfo> {
        let payload = json!({});
        Self::with_retry(|| self.call(bot_token, "getWebhookInfo", &payload)).await
    }

    async fn set_webhook(
        &self,
        bot_token: &str,
        url: &str,
        secret: &str,
        allowed_updates: &[String],
        drop_pending: bool,
    ) -> Result<()> {
        let payload = json!({
            "url": url,
            "secret_token": secret,
            "allowed_updates": allowed_updates,
            "drop_pending_updates": drop_pending,
        });
        Self::with_retry(|| async {
            self.call::<Value>(bot_token, "setWebhook", &payload)
                .await
                .map(drop)
        })
        .await
    }

    async fn delete_webhook(&self, bot_token: &str, drop_pending: bool) -> Result<()> {
        let payload = json!({ "drop_pending_updates": drop_pending });
        Self::with_retry(|| async {
            self.call::<Value>(bot_token, "deleteWebhook", &payload)
                .await
                .map(drop)
        })
        .await
    }

    // not retried: a timed-out send may still have been delivered
    async fn send_message(&self, bot_token: &str, chat_id: i64, text: &str) -> Result<Value> {
        let payload = json!({ "chat_id": chat_id, "text": text });
        self.call(bot_token, "sendMessage", &payload).await
    }

    async fn answer_callback_query(
        &self,
        bot_token: &str,
        callback_query_id: &str,
        text: Option<&str>,
    ) -> Result<()> {
        let mut payload = json!({ "callback_query_id": callback_query_id });
        if let Some(text) = text {
            payload["text"] = json!(text);
        }
        self.call::<Value>(bot_token, "answerCallbackQuery", &payload)
            .await
            .map(drop)
    }
}
