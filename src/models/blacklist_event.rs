use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::models::{BlacklistEventId, IpId, TenantId};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BlacklistEvent {
    pub id: BlacklistEventId,
    pub tenant_id: TenantId,
    pub ip_id: IpId,
    pub blacklist_name: String,
    pub listed_at: DateTime<Utc>,
    pub delisted_at: Option<DateTime<Utc>>,
    pub auto_recovered: bool,
    pub standby_ip_activated_ref: Option<IpId>,
}

#[derive(Clone)]
pub struct BlacklistEventRepository {
    pool: sqlx::PgPool,
}

impl BlacklistEventRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Opens a new event unless one is already open for `(ip_id, blacklist_name)`.
    pub async fn open_if_absent(
        &self,
        tenant_id: TenantId,
        ip_id: IpId,
        blacklist_name: &str,
    ) -> Result<Option<BlacklistEvent>, Error> {
        sqlx::query_as!(
            BlacklistEvent,
            r#"
            INSERT INTO blacklist_events
                (id, tenant_id, ip_id, blacklist_name, listed_at, delisted_at, auto_recovered, standby_ip_activated_ref)
            VALUES (gen_random_uuid(), $1, $2, $3, now(), null, false, null)
            ON CONFLICT DO NOTHING
            RETURNING id as "id: BlacklistEventId", tenant_id as "tenant_id: TenantId",
                      ip_id as "ip_id: IpId", blacklist_name, listed_at, delisted_at,
                      auto_recovered, standby_ip_activated_ref as "standby_ip_activated_ref: IpId"
            "#,
            *tenant_id,
            *ip_id,
            blacklist_name,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn list_open_for_ip(&self, ip_id: IpId) -> Result<Vec<BlacklistEvent>, Error> {
        sqlx::query_as!(
            BlacklistEvent,
            r#"
            SELECT id as "id: BlacklistEventId", tenant_id as "tenant_id: TenantId",
                   ip_id as "ip_id: IpId", blacklist_name, listed_at, delisted_at,
                   auto_recovered, standby_ip_activated_ref as "standby_ip_activated_ref: IpId"
            FROM blacklist_events
            WHERE ip_id = $1 AND delisted_at IS NULL
            "#,
            *ip_id,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn list_all_open(&self) -> Result<Vec<BlacklistEvent>, Error> {
        sqlx::query_as!(
            BlacklistEvent,
            r#"
            SELECT id as "id: BlacklistEventId", tenant_id as "tenant_id: TenantId",
                   ip_id as "ip_id: IpId", blacklist_name, listed_at, delisted_at,
                   auto_recovered, standby_ip_activated_ref as "standby_ip_activated_ref: IpId"
            FROM blacklist_events
            WHERE delisted_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn close(&self, id: BlacklistEventId) -> Result<BlacklistEvent, Error> {
        sqlx::query_as!(
            BlacklistEvent,
            r#"
            UPDATE blacklist_events
            SET delisted_at = now(), auto_recovered = true
            WHERE id = $1
            RETURNING id as "id: BlacklistEventId", tenant_id as "tenant_id: TenantId",
                      ip_id as "ip_id: IpId", blacklist_name, listed_at, delisted_at,
                      auto_recovered, standby_ip_activated_ref as "standby_ip_activated_ref: IpId"
            "#,
            *id,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn set_standby_activated(
        &self,
        id: BlacklistEventId,
        standby_ip: IpId,
    ) -> Result<(), Error> {
        sqlx::query!(
            "UPDATE blacklist_events SET standby_ip_activated_ref = $2 WHERE id = $1",
            *id,
            *standby_ip,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_by_tenant(&self, tenant_id: TenantId) -> Result<Vec<BlacklistEvent>, Error> {
        sqlx::query_as!(
            BlacklistEvent,
            r#"
            SELECT id as "id: BlacklistEventId", tenant_id as "tenant_id: TenantId",
                   ip_id as "ip_id: IpId", blacklist_name, listed_at, delisted_at,
                   auto_recovered, standby_ip_activated_ref as "standby_ip_activated_ref: IpId"
            FROM blacklist_events
            WHERE tenant_id = $1
            ORDER BY listed_at DESC
            "#,
            *tenant_id,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }
}
