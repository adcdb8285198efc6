use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use tracing::{error, warn};

use super::{BounceStats, CampaignManagerAdapter, CmError, NewDeliveryServer, ServerStatus};

/// Direct-SQL adapter over the campaign manager's own relational store.
/// Connects once at construction; if the configured host is unreachable and
/// looks like the container-runtime alias, retries against the runtime's
/// default gateway. If both fail, degrades to a no-op state rather than
/// propagate a panic or block the rest of the system.
///
/// `delivery_server`/`option`/`customer`/`delivery_server_to_customer`/
/// `campaign_delivery_log` live in the campaign manager's own schema, not
/// this crate's migrations — every query here is runtime-checked
/// (`sqlx::query`/`query_scalar`, no `query!`/`query_as!`) since there is no
/// `DATABASE_URL` pointed at that store (or a committed `.sqlx` cache for
/// it) available at this crate's build time.
pub struct PgCampaignManagerAdapter {
    pool: RwLock<Option<PgPool>>,
}

const CONTAINER_RUNTIME_ALIAS: &str = "host.docker.internal";
const DEFAULT_GATEWAY_FALLBACK: &str = "172.17.0.1";

impl PgCampaignManagerAdapter {
    pub async fn connect(database_url: &str) -> Self {
        let pool = match PgPool::connect(database_url).await {
            Ok(pool) => Some(pool),
            Err(e) => {
                warn!("campaign manager store unreachable at configured host: {e}");
                if database_url.contains(CONTAINER_RUNTIME_ALIAS) {
                    let fallback_url =
                        database_url.replace(CONTAINER_RUNTIME_ALIAS, DEFAULT_GATEWAY_FALLBACK);
                    match PgPool::connect(&fallback_url).await {
                        Ok(pool) => Some(pool),
                        Err(e) => {
                            error!("campaign manager store unreachable via gateway fallback too: {e}");
                            None
                        }
                    }
                } else {
                    None
                }
            }
        };

        Self {
            pool: RwLock::new(pool),
        }
    }

    async fn pool(&self) -> Result<PgPool, CmError> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or(CmError::Unreachable)
    }
}

#[async_trait]
impl CampaignManagerAdapter for PgCampaignManagerAdapter {
    async fn create_delivery_server(&self, new: NewDeliveryServer) -> Result<String, CmError> {
        let pool = self.pool().await?;
        let row = sqlx::query(
            r#"
            INSERT INTO delivery_server
                (name, hostname, port, protocol, type, from_email, from_name,
                 max_connection_messages, hourly_quota, daily_quota, monthly_quota,
                 hourly_usage, daily_usage, monthly_usage, status, date_added, last_updated)
            VALUES ($1, $2, $3, 'smtp', 'smtp', $4, $5, $6, $7, $7 * 24, $7 * 24 * 30,
                    0, 0, 0, 'active', now(), now())
            RETURNING id
            "#,
        )
        .bind(new.name)
        .bind(new.hostname)
        .bind(new.port as i32)
        .bind(new.from_email)
        .bind(new.from_name)
        .bind(new.max_connection_messages)
        .bind(new.hourly_quota)
        .fetch_one(&pool)
        .await?;

        let id: i32 = row.try_get("id")?;
        Ok(id.to_string())
    }

    async fn delete_delivery_server(&self, server_ref: &str) -> Result<(), CmError> {
        let pool = self.pool().await?;
        let id: i32 = server_ref
            .parse()
            .map_err(|_| CmError::ServerNotFound(server_ref.to_string()))?;
        sqlx::query("DELETE FROM delivery_server WHERE id = $1")
            .bind(id)
            .execute(&pool)
            .await?;
        Ok(())
    }

    async fn set_server_status(&self, server_ref: &str, status: ServerStatus) -> Result<(), CmError> {
        let pool = self.pool().await?;
        let id: i32 = server_ref
            .parse()
            .map_err(|_| CmError::ServerNotFound(server_ref.to_string()))?;
        sqlx::query("UPDATE delivery_server SET status = $2, last_updated = now() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&pool)
            .await?;
        Ok(())
    }

    async fn set_server_quota(&self, server_ref: &str, hourly_quota: i32) -> Result<(), CmError> {
        let pool = self.pool().await?;
        let id: i32 = server_ref
            .parse()
            .map_err(|_| CmError::ServerNotFound(server_ref.to_string()))?;
        sqlx::query(
            r#"
            UPDATE delivery_server
            SET hourly_quota = $2, daily_quota = $2 * 24, monthly_quota = $2 * 24 * 30,
                last_updated = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(hourly_quota)
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn reset_daily_usage(&self, server_ref: &str) -> Result<(), CmError> {
        let pool = self.pool().await?;
        let id: i32 = server_ref
            .parse()
            .map_err(|_| CmError::ServerNotFound(server_ref.to_string()))?;
        sqlx::query("UPDATE delivery_server SET daily_usage = 0 WHERE id = $1")
            .bind(id)
            .execute(&pool)
            .await?;
        Ok(())
    }

    async fn reset_all_daily_usage(&self) -> Result<(), CmError> {
        let pool = self.pool().await?;
        sqlx::query("UPDATE delivery_server SET daily_usage = 0")
            .execute(&pool)
            .await?;
        Ok(())
    }

    async fn get_bounce_stats(&self, server_ref: &str, days: i32) -> Result<BounceStats, CmError> {
        let pool = self.pool().await?;
        let id: i32 = server_ref
            .parse()
            .map_err(|_| CmError::ServerNotFound(server_ref.to_string()))?;

        // The campaign manager's own send-log table is outside this crate's
        // schema; it's reached by name only, scoped by server id and a
        // rolling window.
        let row = sqlx::query(
            r#"
            SELECT
                coalesce(sum(case when status = 'sent' then 1 else 0 end), 0)::bigint as sent,
                coalesce(sum(case when status = 'delivered' then 1 else 0 end), 0)::bigint as delivered,
                coalesce(sum(case when status = 'bounced' then 1 else 0 end), 0)::bigint as bounced,
                coalesce(sum(case when status = 'complained' then 1 else 0 end), 0)::bigint as complaints
            FROM campaign_delivery_log
            WHERE delivery_server_id = $1 AND sent_at >= now() - ($2 || ' days')::interval
            "#,
        )
        .bind(id)
        .bind(days.to_string())
        .fetch_one(&pool)
        .await?;

        let sent: i64 = row.try_get("sent")?;
        let delivered: i64 = row.try_get("delivered")?;
        let bounced: i64 = row.try_get("bounced")?;
        let complaints: i64 = row.try_get("complaints")?;

        let bounce_rate = if sent > 0 { bounced as f64 / sent as f64 } else { 0.0 };
        let spam_rate = if sent > 0 { complaints as f64 / sent as f64 } else { 0.0 };

        Ok(BounceStats {
            sent,
            delivered,
            bounced,
            complaints,
            bounce_rate,
            spam_rate,
        })
    }

    async fn get_option(&self, key: &str) -> Result<Option<String>, CmError> {
        let pool = self.pool().await?;
        let value: Option<String> = sqlx::query_scalar("SELECT option_value FROM option WHERE option_name = $1")
            .bind(key)
            .fetch_optional(&pool)
            .await?;
        Ok(value)
    }

    async fn set_option(&self, key: &str, value: &str) -> Result<(), CmError> {
        let pool = self.pool().await?;
        sqlx::query(
            r#"
            INSERT INTO option (option_name, option_value)
            VALUES ($1, $2)
            ON CONFLICT (option_name) DO UPDATE SET option_value = excluded.option_value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn list_customers_with_servers(&self) -> Result<Vec<(String, Vec<String>)>, CmError> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            r#"
            SELECT c.name as customer_name, array_agg(d.id::text) as server_ids
            FROM customer c
            JOIN delivery_server_to_customer d2c ON d2c.customer_id = c.id
            JOIN delivery_server d ON d.id = d2c.delivery_server_id
            GROUP BY c.name
            "#,
        )
        .fetch_all(&pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let customer_name: String = row.try_get("customer_name")?;
                let server_ids: Vec<String> = row.try_get("server_ids")?;
                Ok((customer_name, server_ids))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(CmError::from)
    }

    async fn assign_servers_to_customer(
        &self,
        customer_ref: &str,
        server_refs: &[String],
    ) -> Result<(), CmError> {
        let pool = self.pool().await?;
        let customer_id: i32 = customer_ref
            .parse()
            .map_err(|_| CmError::ServerNotFound(customer_ref.to_string()))?;
        let server_ids: Vec<i32> = server_refs
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();

        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM delivery_server_to_customer WHERE customer_id = $1")
            .bind(customer_id)
            .execute(&mut *tx)
            .await?;

        for server_id in server_ids {
            sqlx::query(
                "INSERT INTO delivery_server_to_customer (customer_id, delivery_server_id) VALUES ($1, $2)",
            )
            .bind(customer_id)
            .bind(server_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
