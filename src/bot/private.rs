//! Private one-to-one entry point: classify a domain mentioned in a
//! direct message (or in the message it replies to) and confirm adds.

use std::sync::Arc;

use crate::bot::rate_limit::RateLimiter;
use crate::bot::transport::{ChatTransport, IncomingMessage};
use crate::classifier::{Classifier, Decision};
use crate::config::RequiredGroup;
use crate::domain;

#[derive(Clone)]
pub struct PrivateHandler {
    classifier: Arc<Classifier>,
    rate_limiter: Arc<RateLimiter>,
    transport: Arc<dyn ChatTransport>,
    commit_email: String,
    required_group: Option<RequiredGroup>,
}

impl PrivateHandler {
    pub fn new(
        classifier: Arc<Classifier>,
        rate_limiter: Arc<RateLimiter>,
        transport: Arc<dyn ChatTransport>,
        commit_email: String,
    ) -> Self {
        Self {
            classifier,
            rate_limiter,
            transport,
            commit_email,
            required_group: None,
        }
    }

    /// Gate this handler behind membership in `group`: a user who hasn't
    /// joined is told to, instead of having their message classified.
    pub fn with_required_group(mut self, group: RequiredGroup) -> Self {
        self.required_group = Some(group);
        self
    }

    pub async fn handle(&self, msg: &IncomingMessage) -> anyhow::Result<()> {
        let reply = self.process(msg).await;
        self.transport.send_text(msg.chat_id, &reply).await
    }

    async fn process(&self, msg: &IncomingMessage) -> String {
        if let Some(group) = &self.required_group {
            match self.transport.is_group_member(group.id, msg.user_id).await {
                Ok(false) => {
                    return format!(
                        "You must join {} to use this bot: {}",
                        group.name, group.link
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "membership check failed, allowing request through");
                }
                Ok(true) => {}
            }
        }

        let text = source_text_for_classification(msg);
        let text = match text {
            Some(t) => t,
            None => {
                return "No valid domain found. Send a domain or a URL, e.g. `example.com`.".to_string();
            }
        };

        if let Some(normalized) = domain::extract_one(&text) {
            if normalized.is_cn {
                return format!(
                    "`{}` is a .cn domain — all .cn domains default to direct connection already.",
                    normalized.input_domain
                );
            }
        }

        let (allowed, remaining) = self.rate_limiter.check(msg.user_id);
        if !allowed {
            return "You've reached the hourly add limit. Please try again in an hour.".to_string();
        }

        let verdict = self.classifier.classify(&text).await;
        match &verdict.decision {
            Decision::Add { target } => {
                match self.classifier.confirm_add(&verdict, &self.commit_email).await {
                    Ok(commit) => {
                        self.rate_limiter.record(msg.user_id);
                        let (_, remaining_after) = self.rate_limiter.check(msg.user_id);
                        format!(
                            "Added `{target}` (commit `{commit}`). {remaining_after} adds left this hour."
                        )
                    }
                    Err(e) => format!("Failed to add `{target}`: {e}"),
                }
            }
            Decision::AlreadyCovered { reason } => {
                format!("`{}` is already covered: {reason}.", verdict.second_level_domain)
            }
            Decision::Reject { reason } => {
                let _ = remaining;
                format!("`{}` was not added: {reason}.", verdict.second_level_domain)
            }
            Decision::Error { reason } => format!("Could not process that domain: {reason}."),
        }
    }
}

fn source_text_for_classification(msg: &IncomingMessage) -> Option<String> {
    if domain::extract_one(&msg.text).is_some() {
        return Some(msg.text.clone());
    }
    msg.reply_to_text
        .as_ref()
        .filter(|t| domain::extract_one(t).is_some())
        .cloned()
}
