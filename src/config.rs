//! Environment-variable configuration, matching the original bot's
//! shape: a handful of required secrets, everything else defaulted.

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 6 * 60 * 60;
const DEFAULT_COMMIT_EMAIL: &str = "noreply@users.noreply.github.com";

const DEFAULT_GEOIP_URLS: &[&str] = &[
    "https://gcore.jsdelivr.net/gh/Aethersailor/geoip@release/Country-without-asn.mmdb",
    "https://testingcf.jsdelivr.net/gh/Aethersailor/geoip@release/Country-without-asn.mmdb",
    "https://raw.githubusercontent.com/Aethersailor/geoip/release/Country-without-asn.mmdb",
];

const DEFAULT_CN_IPV4_URLS: &[&str] = &[
    "https://raw.githubusercontent.com/Aethersailor/geoip/refs/heads/release/text/cn-ipv4.txt",
    "https://gcore.jsdelivr.net/gh/Aethersailor/geoip@release/text/cn-ipv4.txt",
    "https://testingcf.jsdelivr.net/gh/Aethersailor/geoip@release/text/cn-ipv4.txt",
];

const DEFAULT_GEOSITE_URL: &str =
    "https://raw.githubusercontent.com/Loyalsoldier/v2ray-rules-dat/refs/heads/release/direct-list.txt";

const DEFAULT_DOH_A: &str = "alibaba=https://dns.alidns.com/dns-query,tencent=https://doh.pub/dns-query,cloudflare=https://cloudflare-dns.com/dns-query";
const DEFAULT_DOH_NS: &str = "cloudflare=https://cloudflare-dns.com/dns-query,google=https://dns.google/dns-query,quad9=https://dns.quad9.net/dns-query";

/// Membership gate the private entry point can enforce before answering:
/// all three fields must be set for gating to be enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredGroup {
    pub id: i64,
    pub name: String,
    pub link: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub github_token: String,
    pub rule_repo: String,
    pub direct_rule_file: String,
    pub commit_email: String,
    pub data_dir: PathBuf,
    pub update_interval: Duration,
    pub doh_a: String,
    pub doh_ns: String,
    pub allowed_groups: Vec<i64>,
    pub required_group: Option<RequiredGroup>,
    pub geoip_urls: Vec<String>,
    pub cn_ipv4_urls: Vec<String>,
    pub geosite_urls: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingRequired(String),
}

impl Config {
    /// Load from the process environment. The four required fields are
    /// hard errors; everything else falls back to a logged default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bot_token = required_env("BOT_TOKEN")?;
        let github_token = required_env("GITHUB_TOKEN")?;
        let rule_repo = required_env("RULE_REPO")?;
        let direct_rule_file = required_env("DIRECT_RULE_FILE")?;

        let commit_email = std::env::var("COMMIT_IDENTITY")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_COMMIT_EMAIL.to_string());

        let data_dir = resolve_data_dir();
        let update_interval = parse_update_interval(std::env::var("UPDATE_INTERVAL").ok());
        let doh_a = non_empty_env("DOH_A").unwrap_or_else(|| DEFAULT_DOH_A.to_string());
        let doh_ns = non_empty_env("DOH_NS").unwrap_or_else(|| DEFAULT_DOH_NS.to_string());
        let allowed_groups = parse_group_ids(std::env::var("ALLOWED_GROUPS").unwrap_or_default());
        let required_group = parse_required_group();

        let geoip_urls = parse_url_list("GEOIP_URLS", DEFAULT_GEOIP_URLS);
        let cn_ipv4_urls = parse_url_list("CN_IPV4_URLS", DEFAULT_CN_IPV4_URLS);
        let geosite_urls = parse_url_list("GEOSITE_URL", &[DEFAULT_GEOSITE_URL]);

        Ok(Self {
            bot_token,
            github_token,
            rule_repo,
            direct_rule_file,
            commit_email,
            data_dir,
            update_interval,
            doh_a,
            doh_ns,
            allowed_groups,
            required_group,
            geoip_urls,
            cn_ipv4_urls,
            geosite_urls,
        })
    }

    pub fn group_check_enabled(&self) -> bool {
        self.required_group.is_some()
    }
}

fn required_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::MissingRequired(key.to_string()))
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn resolve_data_dir() -> PathBuf {
    let configured = std::env::var("DATA_DIR").unwrap_or_default();
    let candidate = if configured.trim().is_empty() {
        PathBuf::from("/app/data")
    } else {
        PathBuf::from(configured.trim())
    };
    match std::fs::create_dir_all(&candidate) {
        Ok(()) => candidate,
        Err(e) => {
            tracing::warn!(path = %candidate.display(), error = %e, "data_dir uncreatable, falling back to temp dir");
            std::env::temp_dir().join("rule-bot")
        }
    }
}

fn parse_update_interval(value: Option<String>) -> Duration {
    match value.and_then(|v| v.trim().parse::<u64>().ok()) {
        Some(secs) if secs > 0 => Duration::from_secs(secs),
        Some(_) | None => Duration::from_secs(DEFAULT_UPDATE_INTERVAL_SECS),
    }
}

fn parse_group_ids(raw: String) -> Vec<i64> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<i64>() {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!(value = s, "invalid entry in ALLOWED_GROUPS, skipping");
                None
            }
        })
        .collect()
}

fn parse_required_group() -> Option<RequiredGroup> {
    let id_raw = non_empty_env("REQUIRED_GROUP_ID")?;
    let id = match id_raw.parse::<i64>() {
        Ok(id) => id,
        Err(_) => {
            tracing::warn!(value = id_raw, "invalid REQUIRED_GROUP_ID, ignoring");
            return None;
        }
    };
    let name = non_empty_env("REQUIRED_GROUP_NAME");
    let link = non_empty_env("REQUIRED_GROUP_LINK");
    match (name, link) {
        (Some(name), Some(link)) => Some(RequiredGroup { id, name, link }),
        _ => {
            tracing::warn!("REQUIRED_GROUP_ID set without NAME/LINK, membership gating disabled");
            None
        }
    }
}

fn parse_url_list(key: &str, defaults: &[&str]) -> Vec<String> {
    match non_empty_env(key) {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        None => defaults.iter().map(|s| s.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variable tests must not interleave with other tests
    // mutating process env; serialize them behind a single lock.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for key in [
            "BOT_TOKEN",
            "GITHUB_TOKEN",
            "RULE_REPO",
            "DIRECT_RULE_FILE",
            "COMMIT_IDENTITY",
            "DATA_DIR",
            "UPDATE_INTERVAL",
            "DOH_A",
            "DOH_NS",
            "ALLOWED_GROUPS",
            "REQUIRED_GROUP_ID",
            "REQUIRED_GROUP_NAME",
            "REQUIRED_GROUP_LINK",
            "GEOIP_URLS",
            "CN_IPV4_URLS",
            "GEOSITE_URL",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn minimal_env_fills_in_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("BOT_TOKEN", "t");
        std::env::set_var("GITHUB_TOKEN", "g");
        std::env::set_var("RULE_REPO", "owner/repo");
        std::env::set_var("DIRECT_RULE_FILE", "direct.txt");
        std::env::set_var("DATA_DIR", std::env::temp_dir().join("rule-bot-test-minimal"));

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.commit_email, DEFAULT_COMMIT_EMAIL);
        assert_eq!(cfg.update_interval, Duration::from_secs(DEFAULT_UPDATE_INTERVAL_SECS));
        assert!(cfg.allowed_groups.is_empty());
        assert!(cfg.required_group.is_none());
        assert_eq!(cfg.geoip_urls.len(), DEFAULT_GEOIP_URLS.len());
        clear_all();
    }

    #[test]
    fn invalid_update_interval_falls_back_to_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("BOT_TOKEN", "t");
        std::env::set_var("GITHUB_TOKEN", "g");
        std::env::set_var("RULE_REPO", "owner/repo");
        std::env::set_var("DIRECT_RULE_FILE", "direct.txt");
        std::env::set_var("UPDATE_INTERVAL", "-5");
        std::env::set_var("DATA_DIR", std::env::temp_dir().join("rule-bot-test-interval"));

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.update_interval, Duration::from_secs(DEFAULT_UPDATE_INTERVAL_SECS));
        clear_all();
    }

    #[test]
    fn allowed_groups_parses_comma_list_and_skips_invalid() {
        assert_eq!(parse_group_ids("1,2,not-a-number,3".to_string()), vec![1, 2, 3]);
        assert_eq!(parse_group_ids(String::new()), Vec::<i64>::new());
    }

    #[test]
    fn required_group_needs_all_three_fields() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("REQUIRED_GROUP_ID", "-100123");
        assert!(parse_required_group().is_none());
        std::env::set_var("REQUIRED_GROUP_NAME", "Main Chat");
        std::env::set_var("REQUIRED_GROUP_LINK", "https://t.me/example");
        let group = parse_required_group().unwrap();
        assert_eq!(group.id, -100123);
        clear_all();
    }
}
