use std::{env, time::Duration};

use anyhow::Context;

use crate::node::NodeConfig;

/// Centralizes every tunable spec defaults leave as "default X" so operators
/// can override without recompiling. Constructed once at process start via
/// [`Config::from_env`]; every other module takes an `Arc<Config>`.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub webhook_secret: Option<String>,
    pub webhook_rate_limit_per_minute: u32,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,

    pub rest_days: i64,
    pub quarantine_days: i64,

    pub emergency_bounce_pct: f64,
    pub emergency_spam_pct: f64,
    pub max_bounce_7d_pct: f64,
    pub max_spam_7d_pct: f64,
    pub bounce_pause_hours: i64,
    pub spam_pause_hours: i64,

    pub retry_max_retries: u32,
    pub retry_queue_path: std::path::PathBuf,

    pub node_connect_timeout: Duration,
    pub node_call_timeout: Duration,
    pub dns_resolver_timeout: Duration,
    pub downstream_http_timeout: Duration,
    pub graceful_reload_queue_depth_threshold: i64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        Ok(Self {
            database_url,
            webhook_secret: env::var("WEBHOOK_SECRET").ok(),
            webhook_rate_limit_per_minute: env_parse_or("WEBHOOK_RATE_LIMIT_PER_MINUTE", 200)?,
            telegram_bot_token: env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_chat_id: env::var("TELEGRAM_CHAT_ID").ok(),

            rest_days: env_parse_or("REST_DAYS", 14)?,
            quarantine_days: env_parse_or("QUARANTINE_DAYS", 30)?,

            emergency_bounce_pct: env_parse_or("EMERGENCY_BOUNCE_PCT", 5.0)?,
            emergency_spam_pct: env_parse_or("EMERGENCY_SPAM_PCT", 0.1)?,
            max_bounce_7d_pct: env_parse_or("MAX_BOUNCE_7D_PCT", 2.0)?,
            max_spam_7d_pct: env_parse_or("MAX_SPAM_7D_PCT", 0.03)?,
            bounce_pause_hours: env_parse_or("BOUNCE_PAUSE_HOURS", 72)?,
            spam_pause_hours: env_parse_or("SPAM_PAUSE_HOURS", 96)?,

            retry_max_retries: env_parse_or("RETRY_MAX_RETRIES", 10)?,
            retry_queue_path: env::var("RETRY_QUEUE_PATH")
                .unwrap_or_else(|_| "./data/retry_queue.jsonl".to_string())
                .into(),

            node_connect_timeout: Duration::from_secs(env_parse_or("NODE_CONNECT_TIMEOUT_SECS", 10)?),
            node_call_timeout: Duration::from_secs(env_parse_or("NODE_CALL_TIMEOUT_SECS", 30)?),
            dns_resolver_timeout: Duration::from_secs(env_parse_or("DNS_RESOLVER_TIMEOUT_SECS", 5)?),
            downstream_http_timeout: Duration::from_secs(env_parse_or(
                "DOWNSTREAM_HTTP_TIMEOUT_SECS",
                10,
            )?),
            graceful_reload_queue_depth_threshold: env_parse_or(
                "GRACEFUL_RELOAD_QUEUE_DEPTH_THRESHOLD",
                1000,
            )?,
        })
    }

    /// Outbound node inventory, read from `NODES_JSON` (a JSON array of
    /// [`NodeConfig`]). Empty when unset — the registry simply starts with
    /// no nodes and provisioning fails until one is registered.
    pub fn node_configs(&self) -> anyhow::Result<Vec<NodeConfig>> {
        match env::var("NODES_JSON") {
            Ok(raw) => serde_json::from_str(&raw).context("NODES_JSON is not a valid node array"),
            Err(_) => Ok(Vec::new()),
        }
    }
}

fn env_parse_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}
