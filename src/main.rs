use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use rule_bot::bot::bootstrap;
use rule_bot::bot::group::GroupHandler;
use rule_bot::bot::private::PrivateHandler;
use rule_bot::bot::rate_limit::RateLimiter;
use rule_bot::bot::transport::{ChatTransport, IncomingMessage, TelegramTransport};
use rule_bot::catalog::CatalogManager;
use rule_bot::classifier::Classifier;
use rule_bot::config::Config;
use rule_bot::doh::{self, ResolverPool};
use rule_bot::rule_store::GitHubRuleStore;

#[derive(Debug, Parser)]
#[command(name = "rule-bot", about = "Chat-bot-operated curator for a China-direct-connection rule file")]
struct Cli {
    /// Run one classification and exit, instead of starting the bot loop.
    #[arg(long)]
    classify: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let data_dir = bootstrap::ensure_data_dirs(&config.data_dir);
    let catalog_manager = Arc::new(CatalogManager::new(
        &data_dir,
        config.geoip_urls.clone(),
        config.cn_ipv4_urls.clone(),
        config.geosite_urls.clone(),
        config.update_interval,
    )?);
    catalog_manager.bootstrap().await?;
    let refresher_token = catalog_manager.spawn_refresher();

    let doh_a = Arc::new(ResolverPool::new(doh::parse_pool(&config.doh_a, "a")));
    let doh_ns = Arc::new(ResolverPool::new(doh::parse_pool(&config.doh_ns, "ns")));

    let rule_store = Arc::new(GitHubRuleStore::new(
        config.rule_repo.clone(),
        config.direct_rule_file.clone(),
        config.github_token.clone(),
        config.commit_email.clone(),
    ));

    let classifier = Arc::new(Classifier::new(rule_store, doh_a, doh_ns, catalog_manager.clone()));

    if let Some(text) = cli.classify {
        let verdict = classifier.classify(&text).await;
        println!("{:#?}", verdict.decision);
        refresher_token.cancel();
        return Ok(());
    }

    let transport = Arc::new(TelegramTransport::new(config.bot_token.clone()));
    let rate_limiter = Arc::new(RateLimiter::new());
    let mut private = PrivateHandler::new(classifier, rate_limiter, transport.clone(), config.commit_email.clone());
    if let Some(group) = config.required_group.clone() {
        private = private.with_required_group(group);
    }
    let group = (!config.allowed_groups.is_empty())
        .then(|| GroupHandler::new(config.allowed_groups.clone(), "RuleBot", private.clone()));

    run_poll_loop(transport, private, group, refresher_token).await
}

async fn run_poll_loop(
    transport: Arc<TelegramTransport>,
    private: PrivateHandler,
    group: Option<GroupHandler>,
    refresher_token: CancellationToken,
) -> anyhow::Result<()> {
    let mut offset: Option<i64> = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
            updates = transport.get_updates(offset) => {
                match updates {
                    Ok(payload) => {
                        offset = dispatch_updates(&payload, &private, &group).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "getUpdates failed, backing off");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }
    }
    refresher_token.cancel();
    Ok(())
}

async fn dispatch_updates(
    payload: &serde_json::Value,
    private: &PrivateHandler,
    group: &Option<GroupHandler>,
) -> Option<i64> {
    let results = payload.get("result")?.as_array()?;
    let mut next_offset = None;
    for update in results {
        if let Some(update_id) = update.get("update_id").and_then(|v| v.as_i64()) {
            next_offset = Some(update_id + 1);
        }
        if let Some(msg) = parse_incoming(update) {
            let is_group = update
                .get("message")
                .and_then(|m| m.get("chat"))
                .and_then(|c| c.get("type"))
                .and_then(|t| t.as_str())
                .map(|t| t == "group" || t == "supergroup")
                .unwrap_or(false);

            let handled = if is_group {
                match group {
                    Some(g) => g.handle(&msg).await,
                    None => Ok(()),
                }
            } else {
                private.handle(&msg).await
            };
            if let Err(e) = handled {
                tracing::warn!(error = %e, "failed to handle update");
            }
        }
    }
    next_offset
}

fn parse_incoming(update: &serde_json::Value) -> Option<IncomingMessage> {
    let message = update.get("message")?;
    let chat_id = message.get("chat")?.get("id")?.as_i64()?;
    let user_id = message.get("from")?.get("id")?.as_i64()?;
    let username = message
        .get("from")
        .and_then(|f| f.get("username"))
        .and_then(|u| u.as_str())
        .map(str::to_string);
    let text = message.get("text")?.as_str()?.to_string();
    let reply_to_text = message
        .get("reply_to_message")
        .and_then(|r| r.get("text"))
        .and_then(|t| t.as_str())
        .map(str::to_string);

    Some(IncomingMessage {
        chat_id,
        user_id,
        username,
        text,
        reply_to_text,
    })
}
