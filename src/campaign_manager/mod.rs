mod mock;
mod postgres;

pub use mock::InMemoryCampaignManagerAdapter;
pub use postgres::PgCampaignManagerAdapter;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CmError {
    #[error("campaign manager unreachable")]
    Unreachable,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("delivery server {0} not found")]
    ServerNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Active,
    Inactive,
    InUse,
}

impl ServerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::Active => "active",
            ServerStatus::Inactive => "inactive",
            ServerStatus::InUse => "in-use",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewDeliveryServer {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub from_email: String,
    pub from_name: String,
    pub hourly_quota: i32,
    pub max_connection_messages: i32,
    pub customer_ref: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BounceStats {
    pub sent: i64,
    pub delivered: i64,
    pub bounced: i64,
    pub complaints: i64,
    pub bounce_rate: f64,
    pub spam_rate: f64,
}

/// CRUD over delivery-server records in the campaign manager's own
/// relational store, reached by direct SQL with connection pooling and
/// host-failover (§4.2). The adapter degrades to a no-op state rather than
/// raise when the store is permanently unreachable: every operation then
/// returns `Err(CmError::Unreachable)` and the rest of the system keeps
/// running.
#[async_trait]
pub trait CampaignManagerAdapter: Send + Sync {
    async fn create_delivery_server(&self, new: NewDeliveryServer) -> Result<String, CmError>;
    async fn delete_delivery_server(&self, server_ref: &str) -> Result<(), CmError>;
    async fn set_server_status(&self, server_ref: &str, status: ServerStatus) -> Result<(), CmError>;
    async fn set_server_quota(&self, server_ref: &str, hourly_quota: i32) -> Result<(), CmError>;

    /// `hourly = max(1, floor(daily / 16 * 0.8))` — 16 active hours, 20% safety margin.
    async fn sync_warmup_quota(&self, server_ref: &str, daily_quota: i32) -> Result<(), CmError> {
        self.set_server_quota(server_ref, daily_to_hourly(daily_quota))
            .await
    }

    async fn reset_daily_usage(&self, server_ref: &str) -> Result<(), CmError>;
    async fn reset_all_daily_usage(&self) -> Result<(), CmError>;

    async fn get_bounce_stats(&self, server_ref: &str, days: i32) -> Result<BounceStats, CmError>;

    async fn get_option(&self, key: &str) -> Result<Option<String>, CmError>;
    async fn set_option(&self, key: &str, value: &str) -> Result<(), CmError>;

    async fn list_customers_with_servers(&self) -> Result<Vec<(String, Vec<String>)>, CmError>;
    /// Replace semantics: delete existing assignments for `customer_ref`, then insert.
    async fn assign_servers_to_customer(
        &self,
        customer_ref: &str,
        server_refs: &[String],
    ) -> Result<(), CmError>;
}

/// `daily_to_hourly(q) = max(1, floor(q/16 * 0.8))`. Shared by C2's quota
/// sync and C5's warmup engine.
pub fn daily_to_hourly(daily_quota: i32) -> i32 {
    ((daily_quota as f64 / 16.0) * 0.8).floor().max(1.0) as i32
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn daily_to_hourly_matches_formula() {
        assert_eq!(daily_to_hourly(0), 1);
        assert_eq!(daily_to_hourly(5), 1);
        assert_eq!(daily_to_hourly(16), 1); // floor(0.8) = 0 -> clamp to 1
        assert_eq!(daily_to_hourly(20_000), 1000);
    }
}
