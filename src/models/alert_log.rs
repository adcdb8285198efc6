use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::models::AlertLogId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    Warmup,
    Blacklist,
    Health,
    Provisioning,
}

impl AlertCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertCategory::Warmup => "warmup",
            AlertCategory::Blacklist => "blacklist",
            AlertCategory::Health => "health",
            AlertCategory::Provisioning => "provisioning",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlertLog {
    pub id: AlertLogId,
    pub occurred_at: DateTime<Utc>,
    pub severity: String,
    pub category: String,
    pub message: String,
    pub telegram_sent: bool,
}

#[derive(Clone)]
pub struct AlertLogRepository {
    pool: sqlx::PgPool,
}

impl AlertLogRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Written for every alert attempt regardless of whether delivery to
    /// Telegram itself succeeded, so operators have an audit trail
    /// independent of Telegram's uptime.
    pub async fn record(
        &self,
        severity: AlertSeverity,
        category: AlertCategory,
        message: &str,
        telegram_sent: bool,
    ) -> Result<AlertLog, Error> {
        sqlx::query_as!(
            AlertLog,
            r#"
            INSERT INTO alert_log (id, occurred_at, severity, category, message, telegram_sent)
            VALUES (gen_random_uuid(), now(), $1, $2, $3, $4)
            RETURNING id as "id: AlertLogId", occurred_at, severity, category, message, telegram_sent
            "#,
            severity.as_str(),
            category.as_str(),
            message,
            telegram_sent,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<AlertLog>, Error> {
        sqlx::query_as!(
            AlertLog,
            r#"
            SELECT id as "id: AlertLogId", occurred_at, severity, category, message, telegram_sent
            FROM alert_log
            ORDER BY occurred_at DESC
            LIMIT $1
            "#,
            limit,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }
}
