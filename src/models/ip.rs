use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::models::{IpId, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "ip_purpose", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IpPurpose {
    Transactional,
    Marketing,
    Cold,
    Standby,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "ip_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IpStatus {
    Active,
    Retiring,
    Resting,
    Warming,
    Blacklisted,
    Standby,
    Quarantined,
}

impl IpStatus {
    /// Allowed transitions per the lifecycle manager's state table. Does not
    /// itself enforce the rule — callers consult it, `LifecycleManager`
    /// authoritatively rejects anything not listed here.
    pub fn allowed_targets(self) -> &'static [IpStatus] {
        use IpStatus::*;
        match self {
            Active => &[Retiring, Blacklisted],
            Retiring => &[Resting],
            Resting => &[Warming, Standby],
            Warming => &[Active, Blacklisted],
            Blacklisted => &[Resting, Standby],
            Standby => &[Warming, Active],
            Quarantined => &[],
        }
    }

    pub fn can_transition_to(self, target: IpStatus) -> bool {
        self.allowed_targets().contains(&target)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Ip {
    pub id: IpId,
    pub tenant_id: TenantId,
    pub address: IpNet,
    pub hostname: String,
    pub purpose: IpPurpose,
    pub status: IpStatus,
    pub weight: i16,
    pub vmta_name: Option<String>,
    pub pool_name: Option<String>,
    pub sender_email: Option<String>,
    pub node_id: Option<String>,
    pub mailwizz_server_ref: Option<String>,
    pub quarantine_until: Option<DateTime<Utc>>,
    pub blacklisted_on: Vec<String>,
    pub status_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

pub struct NewIp {
    pub tenant_id: TenantId,
    pub address: IpNet,
    pub hostname: String,
    pub purpose: IpPurpose,
    pub weight: i16,
    pub vmta_name: Option<String>,
    pub pool_name: Option<String>,
    pub sender_email: Option<String>,
    pub node_id: Option<String>,
    pub mailwizz_server_ref: Option<String>,
}

#[derive(Clone)]
pub struct IpRepository {
    pool: sqlx::PgPool,
}

impl IpRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn exists_with_address(&self, address: &IpNet) -> Result<bool, Error> {
        let found = sqlx::query_scalar!(
            r#"SELECT EXISTS(SELECT 1 FROM ips WHERE address = $1) as "found!""#,
            address as &IpNet,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    pub async fn create(&self, new: NewIp) -> Result<Ip, Error> {
        sqlx::query_as!(
            Ip,
            r#"
            INSERT INTO ips (id, tenant_id, address, hostname, purpose, status, weight,
                              vmta_name, pool_name, sender_email, node_id, mailwizz_server_ref,
                              status_changed_at, created_at)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, 'standby', $5, $6, $7, $8, $9, $10, now(), now())
            RETURNING id as "id: IpId", tenant_id as "tenant_id: TenantId", address,
                      hostname, purpose as "purpose: IpPurpose", status as "status: IpStatus",
                      weight, vmta_name, pool_name, sender_email, node_id, mailwizz_server_ref,
                      quarantine_until, blacklisted_on, status_changed_at, created_at
            "#,
            *new.tenant_id,
            &new.address as &IpNet,
            new.hostname,
            new.purpose as IpPurpose,
            new.weight,
            new.vmta_name,
            new.pool_name,
            new.sender_email,
            new.node_id,
            new.mailwizz_server_ref,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn get_by_id(&self, tenant_id: TenantId, id: IpId) -> Result<Ip, Error> {
        sqlx::query_as!(
            Ip,
            r#"
            SELECT id as "id: IpId", tenant_id as "tenant_id: TenantId", address,
                   hostname, purpose as "purpose: IpPurpose", status as "status: IpStatus",
                   weight, vmta_name, pool_name, sender_email, node_id, mailwizz_server_ref,
                   quarantine_until, blacklisted_on, status_changed_at, created_at
            FROM ips
            WHERE id = $1 AND tenant_id = $2
            "#,
            *id,
            *tenant_id,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Used by the lifecycle manager/provisioner when the tenant scope isn't
    /// yet known (e.g. resolving by address during deprovisioning).
    pub async fn get_by_id_any_tenant(&self, id: IpId) -> Result<Ip, Error> {
        sqlx::query_as!(
            Ip,
            r#"
            SELECT id as "id: IpId", tenant_id as "tenant_id: TenantId", address,
                   hostname, purpose as "purpose: IpPurpose", status as "status: IpStatus",
                   weight, vmta_name, pool_name, sender_email, node_id, mailwizz_server_ref,
                   quarantine_until, blacklisted_on, status_changed_at, created_at
            FROM ips
            WHERE id = $1
            "#,
            *id,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn list_by_status(&self, status: IpStatus) -> Result<Vec<Ip>, Error> {
        sqlx::query_as!(
            Ip,
            r#"
            SELECT id as "id: IpId", tenant_id as "tenant_id: TenantId", address,
                   hostname, purpose as "purpose: IpPurpose", status as "status: IpStatus",
                   weight, vmta_name, pool_name, sender_email, node_id, mailwizz_server_ref,
                   quarantine_until, blacklisted_on, status_changed_at, created_at
            FROM ips
            WHERE status = $1
            "#,
            status as IpStatus,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn list_by_any_status(&self, statuses: &[IpStatus]) -> Result<Vec<Ip>, Error> {
        sqlx::query_as!(
            Ip,
            r#"
            SELECT id as "id: IpId", tenant_id as "tenant_id: TenantId", address,
                   hostname, purpose as "purpose: IpPurpose", status as "status: IpStatus",
                   weight, vmta_name, pool_name, sender_email, node_id, mailwizz_server_ref,
                   quarantine_until, blacklisted_on, status_changed_at, created_at
            FROM ips
            WHERE status = ANY($1)
            "#,
            statuses as &[IpStatus],
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Correlates an inbound webhook to the IP it concerns, by whichever
    /// identifier that webhook's payload carries (§6's bounce/delivery/
    /// mailwizz/powermta event schemas).
    pub async fn find_by_vmta_name(&self, vmta_name: &str) -> Result<Option<Ip>, Error> {
        sqlx::query_as!(
            Ip,
            r#"
            SELECT id as "id: IpId", tenant_id as "tenant_id: TenantId", address,
                   hostname, purpose as "purpose: IpPurpose", status as "status: IpStatus",
                   weight, vmta_name, pool_name, sender_email, node_id, mailwizz_server_ref,
                   quarantine_until, blacklisted_on, status_changed_at, created_at
            FROM ips
            WHERE vmta_name = $1
            "#,
            vmta_name,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_server_ref(&self, server_ref: &str) -> Result<Option<Ip>, Error> {
        sqlx::query_as!(
            Ip,
            r#"
            SELECT id as "id: IpId", tenant_id as "tenant_id: TenantId", address,
                   hostname, purpose as "purpose: IpPurpose", status as "status: IpStatus",
                   weight, vmta_name, pool_name, sender_email, node_id, mailwizz_server_ref,
                   quarantine_until, blacklisted_on, status_changed_at, created_at
            FROM ips
            WHERE mailwizz_server_ref = $1
            "#,
            server_ref,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// First IP whose hostname ends with `domain` (e.g. hostname
    /// `mail.acme.example.com` matches domain `example.com`).
    pub async fn find_by_hostname_domain(&self, domain: &str) -> Result<Option<Ip>, Error> {
        sqlx::query_as!(
            Ip,
            r#"
            SELECT id as "id: IpId", tenant_id as "tenant_id: TenantId", address,
                   hostname, purpose as "purpose: IpPurpose", status as "status: IpStatus",
                   weight, vmta_name, pool_name, sender_email, node_id, mailwizz_server_ref,
                   quarantine_until, blacklisted_on, status_changed_at, created_at
            FROM ips
            WHERE hostname = $1 OR hostname LIKE '%.' || $1
            LIMIT 1
            "#,
            domain,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn list_by_tenant(&self, tenant_id: TenantId) -> Result<Vec<Ip>, Error> {
        sqlx::query_as!(
            Ip,
            r#"
            SELECT id as "id: IpId", tenant_id as "tenant_id: TenantId", address,
                   hostname, purpose as "purpose: IpPurpose", status as "status: IpStatus",
                   weight, vmta_name, pool_name, sender_email, node_id, mailwizz_server_ref,
                   quarantine_until, blacklisted_on, status_changed_at, created_at
            FROM ips
            WHERE tenant_id = $1
            ORDER BY created_at
            "#,
            *tenant_id,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Sets `status` and stamps `status_changed_at`; sets `quarantine_until`
    /// when provided (RESTING/QUARANTINED entry), clears it otherwise.
    pub async fn set_status(
        &self,
        id: IpId,
        status: IpStatus,
        quarantine_until: Option<DateTime<Utc>>,
    ) -> Result<Ip, Error> {
        sqlx::query_as!(
            Ip,
            r#"
            UPDATE ips
            SET status = $2, status_changed_at = now(), quarantine_until = $3
            WHERE id = $1
            RETURNING id as "id: IpId", tenant_id as "tenant_id: TenantId", address,
                      hostname, purpose as "purpose: IpPurpose", status as "status: IpStatus",
                      weight, vmta_name, pool_name, sender_email, node_id, mailwizz_server_ref,
                      quarantine_until, blacklisted_on, status_changed_at, created_at
            "#,
            *id,
            status as IpStatus,
            quarantine_until,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Locks the row for the life of `tx` (`SELECT ... FOR UPDATE`), making
    /// the row itself the synchronization point for a read-check-write
    /// transition: a concurrent caller blocks on this lock rather than
    /// racing against a stale in-memory read.
    pub async fn get_for_update(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        id: IpId,
    ) -> Result<Ip, Error> {
        sqlx::query_as!(
            Ip,
            r#"
            SELECT id as "id: IpId", tenant_id as "tenant_id: TenantId", address,
                   hostname, purpose as "purpose: IpPurpose", status as "status: IpStatus",
                   weight, vmta_name, pool_name, sender_email, node_id, mailwizz_server_ref,
                   quarantine_until, blacklisted_on, status_changed_at, created_at
            FROM ips
            WHERE id = $1
            FOR UPDATE
            "#,
            *id,
        )
        .fetch_one(&mut **tx)
        .await
        .map_err(Into::into)
    }

    /// Same update as [`Self::set_status`], against an open transaction —
    /// used together with [`Self::get_for_update`] so the lock covers both
    /// the read and the write.
    pub async fn set_status_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        id: IpId,
        status: IpStatus,
        quarantine_until: Option<DateTime<Utc>>,
    ) -> Result<Ip, Error> {
        sqlx::query_as!(
            Ip,
            r#"
            UPDATE ips
            SET status = $2, status_changed_at = now(), quarantine_until = $3
            WHERE id = $1
            RETURNING id as "id: IpId", tenant_id as "tenant_id: TenantId", address,
                      hostname, purpose as "purpose: IpPurpose", status as "status: IpStatus",
                      weight, vmta_name, pool_name, sender_email, node_id, mailwizz_server_ref,
                      quarantine_until, blacklisted_on, status_changed_at, created_at
            "#,
            *id,
            status as IpStatus,
            quarantine_until,
        )
        .fetch_one(&mut **tx)
        .await
        .map_err(Into::into)
    }

    pub async fn add_blacklist_name(&self, id: IpId, zone: &str) -> Result<Ip, Error> {
        sqlx::query_as!(
            Ip,
            r#"
            UPDATE ips
            SET blacklisted_on = array_append(
                array_remove(blacklisted_on, $2), $2
            )
            WHERE id = $1
            RETURNING id as "id: IpId", tenant_id as "tenant_id: TenantId", address,
                      hostname, purpose as "purpose: IpPurpose", status as "status: IpStatus",
                      weight, vmta_name, pool_name, sender_email, node_id, mailwizz_server_ref,
                      quarantine_until, blacklisted_on, status_changed_at, created_at
            "#,
            *id,
            zone,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn delete(&self, id: IpId) -> Result<(), Error> {
        sqlx::query!("DELETE FROM ips WHERE id = $1", *id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transition_table_matches_spec() {
        use IpStatus::*;
        assert!(Active.can_transition_to(Retiring));
        assert!(Active.can_transition_to(Blacklisted));
        assert!(!Active.can_transition_to(Warming));

        assert!(Retiring.can_transition_to(Resting));
        assert!(!Retiring.can_transition_to(Active));

        assert!(Resting.can_transition_to(Warming));
        assert!(Resting.can_transition_to(Standby));
        assert!(!Resting.can_transition_to(Active));

        assert!(Warming.can_transition_to(Active));
        assert!(Warming.can_transition_to(Blacklisted));

        assert!(Blacklisted.can_transition_to(Resting));
        assert!(Blacklisted.can_transition_to(Standby));

        assert!(Standby.can_transition_to(Warming));
        assert!(Standby.can_transition_to(Active));

        assert!(Quarantined.allowed_targets().is_empty());
    }
}
