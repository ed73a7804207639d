//! Chat transport abstraction: the core's bot entry points depend on
//! this trait, not on a specific chat platform.

use async_trait::async_trait;

/// An opaque chat/user identifier. Telegram uses signed 64-bit chat IDs;
/// other platforms can pack their own ID shape into the same field.
pub type ChatId = i64;

#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: ChatId,
    pub user_id: i64,
    pub username: Option<String>,
    pub text: String,
    pub reply_to_text: Option<String>,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> anyhow::Result<()>;

    /// Whether `user_id` currently belongs to `group_id`. Backs the
    /// private entry's optional membership gate; transports that never
    /// gate (tests, platforms without a membership concept) can leave
    /// the default, which treats everyone as a member.
    async fn is_group_member(&self, group_id: ChatId, user_id: i64) -> anyhow::Result<bool> {
        let _ = (group_id, user_id);
        Ok(true)
    }
}

/// Minimal long-poll Telegram Bot API client.
pub struct TelegramTransport {
    client: reqwest::Client,
    token: String,
}

impl TelegramTransport {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.into(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.token)
    }

    /// Long-poll `getUpdates` once, returning the raw JSON payload for the
    /// caller to decode. `offset` advances past already-seen updates.
    pub async fn get_updates(&self, offset: Option<i64>) -> anyhow::Result<serde_json::Value> {
        let mut req = self.client.get(self.api_url("getUpdates")).query(&[("timeout", "30")]);
        if let Some(offset) = offset {
            req = req.query(&[("offset", offset)]);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("getUpdates failed: {}", resp.status());
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("sendMessage failed: {}", resp.status());
        }
        Ok(())
    }

    async fn is_group_member(&self, group_id: ChatId, user_id: i64) -> anyhow::Result<bool> {
        let resp = self
            .client
            .get(self.api_url("getChatMember"))
            .query(&[("chat_id", group_id.to_string()), ("user_id", user_id.to_string())])
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("getChatMember failed: {}", resp.status());
        }
        let body: serde_json::Value = resp.json().await?;
        let status = body
            .get("result")
            .and_then(|r| r.get("status"))
            .and_then(|s| s.as_str())
            .unwrap_or("left");
        Ok(matches!(status, "creator" | "administrator" | "member" | "restricted"))
    }
}
