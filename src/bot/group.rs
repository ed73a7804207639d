//! Whitelisted group entry point: only dispatches when the chat is in
//! `allowed_groups` and the message mentions the bot by name.

use std::sync::Arc;

use crate::bot::private::PrivateHandler;
use crate::bot::transport::IncomingMessage;
use crate::domain;

pub struct GroupHandler {
    allowed_groups: Vec<i64>,
    bot_name: String,
    inner: PrivateHandler,
}

impl GroupHandler {
    pub fn new(allowed_groups: Vec<i64>, bot_name: impl Into<String>, inner: PrivateHandler) -> Self {
        Self {
            allowed_groups,
            bot_name: bot_name.into(),
            inner,
        }
    }

    pub fn is_group_allowed(&self, chat_id: i64) -> bool {
        self.allowed_groups.contains(&chat_id)
    }

    pub fn is_bot_mentioned(&self, text: &str) -> bool {
        let needle = format!("@{}", self.bot_name.to_ascii_lowercase());
        text.to_ascii_lowercase().contains(&needle)
    }

    pub async fn handle(&self, msg: &IncomingMessage) -> anyhow::Result<()> {
        if !self.is_group_allowed(msg.chat_id) || !self.is_bot_mentioned(&msg.text) {
            return Ok(());
        }

        let mut stripped = msg.clone();
        stripped.text = domain::strip_mention(&msg.text, &self.bot_name);
        stripped.reply_to_text = msg
            .reply_to_text
            .as_deref()
            .map(|t| domain::strip_mention(t, &self.bot_name));

        self.inner.handle(&stripped).await
    }
}
