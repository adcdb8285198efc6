use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::models::{IpEventId, IpId, TenantId};

/// Audit trail row for inbound webhook events (§6); feeds the event
/// consolidator's counters when the owning IP is warming.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpEvent {
    pub id: IpEventId,
    pub tenant_id: TenantId,
    pub ip_id: Option<IpId>,
    pub kind: String,
    pub recipient: Option<String>,
    pub domain: Option<String>,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

pub struct NewIpEvent {
    pub tenant_id: TenantId,
    pub ip_id: Option<IpId>,
    pub kind: String,
    pub recipient: Option<String>,
    pub domain: Option<String>,
    pub payload: serde_json::Value,
}

#[derive(Clone)]
pub struct IpEventRepository {
    pool: sqlx::PgPool,
}

impl IpEventRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, new: NewIpEvent) -> Result<IpEvent, Error> {
        sqlx::query_as!(
            IpEvent,
            r#"
            INSERT INTO ip_events (id, tenant_id, ip_id, kind, recipient, domain, payload, received_at)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, now())
            RETURNING id as "id: IpEventId", tenant_id as "tenant_id: TenantId",
                      ip_id as "ip_id: IpId", kind, recipient, domain, payload, received_at
            "#,
            *new.tenant_id,
            new.ip_id.map(|i| *i),
            new.kind,
            new.recipient,
            new.domain,
            new.payload,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn list_by_tenant(&self, tenant_id: TenantId) -> Result<Vec<IpEvent>, Error> {
        sqlx::query_as!(
            IpEvent,
            r#"
            SELECT id as "id: IpEventId", tenant_id as "tenant_id: TenantId",
                   ip_id as "ip_id: IpId", kind, recipient, domain, payload, received_at
            FROM ip_events
            WHERE tenant_id = $1
            ORDER BY received_at DESC
            "#,
            *tenant_id,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }
}
