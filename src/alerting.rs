use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;
use tracing::{error, warn};

use crate::config::Config;
use crate::models::{AlertCategory, AlertLogRepository, AlertSeverity};

/// Telegram alert delivery collaborator. An `AlertLog` row is written for
/// every alert attempt (sent or not) regardless of whether the Telegram
/// call itself succeeded, so operators keep an audit trail independent of
/// Telegram's own uptime.
pub struct Alerter {
    http: reqwest::Client,
    bot_token: Option<String>,
    chat_id: Option<String>,
    log: AlertLogRepository,
}

impl Alerter {
    pub fn new(config: &Config, pool: PgPool) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            bot_token: config.telegram_bot_token.clone(),
            chat_id: config.telegram_chat_id.clone(),
            log: AlertLogRepository::new(pool),
        }
    }

    /// Alerting with no Telegram credentials configured; every alert is
    /// still logged. Used by background jobs that construct a scoped
    /// `Alerter` without the full `Config` (and by tests).
    pub fn disabled(pool: PgPool) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token: None,
            chat_id: None,
            log: AlertLogRepository::new(pool),
        }
    }

    pub async fn alert(&self, severity: AlertSeverity, category: AlertCategory, message: &str) {
        let telegram_sent = self.send_telegram(severity, message).await;

        if let Err(e) = self
            .log
            .record(severity, category, message, telegram_sent)
            .await
        {
            error!("failed to persist alert log row: {e}");
        }
    }

    async fn send_telegram(&self, severity: AlertSeverity, message: &str) -> bool {
        let (Some(token), Some(chat_id)) = (&self.bot_token, &self.chat_id) else {
            return false;
        };

        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let text = format!("[{}] {}", severity.as_str().to_uppercase(), message);

        match self
            .http
            .post(&url)
            .json(&json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(status = %resp.status(), "telegram alert delivery rejected");
                false
            }
            Err(e) => {
                warn!("telegram alert delivery failed: {e}");
                false
            }
        }
    }
}
