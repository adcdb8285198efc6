use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::models::{IpId, TenantId, WarmupPlanId};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct WarmupPlan {
    pub id: WarmupPlanId,
    pub tenant_id: TenantId,
    pub ip_id: IpId,
    pub phase: String,
    pub started_at: DateTime<Utc>,
    pub current_daily_quota: i32,
    pub target_daily_quota: i32,
    pub bounce_rate_7d: f64,
    pub spam_rate_7d: f64,
    pub paused: bool,
    pub pause_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct WarmupDailyStat {
    pub id: uuid::Uuid,
    pub plan_id: WarmupPlanId,
    pub date: NaiveDate,
    pub sent: i32,
    pub delivered: i32,
    pub bounced: i32,
    pub complaints: i32,
    pub opens: i32,
    pub clicks: i32,
}

#[derive(Clone)]
pub struct WarmupRepository {
    pool: sqlx::PgPool,
}

impl WarmupRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_plan(
        &self,
        tenant_id: TenantId,
        ip_id: IpId,
        initial_quota: i32,
        target_quota: i32,
    ) -> Result<WarmupPlan, Error> {
        sqlx::query_as!(
            WarmupPlan,
            r#"
            INSERT INTO warmup_plans (id, tenant_id, ip_id, phase, started_at,
                                       current_daily_quota, target_daily_quota,
                                       bounce_rate_7d, spam_rate_7d, paused, pause_until)
            VALUES (gen_random_uuid(), $1, $2, 'day_1', now(), $3, $4, 0, 0, false, null)
            RETURNING id as "id: WarmupPlanId", tenant_id as "tenant_id: TenantId",
                      ip_id as "ip_id: IpId", phase, started_at, current_daily_quota,
                      target_daily_quota, bounce_rate_7d, spam_rate_7d, paused, pause_until
            "#,
            *tenant_id,
            *ip_id,
            initial_quota,
            target_quota,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn get_by_ip(&self, ip_id: IpId) -> Result<WarmupPlan, Error> {
        sqlx::query_as!(
            WarmupPlan,
            r#"
            SELECT id as "id: WarmupPlanId", tenant_id as "tenant_id: TenantId",
                   ip_id as "ip_id: IpId", phase, started_at, current_daily_quota,
                   target_daily_quota, bounce_rate_7d, spam_rate_7d, paused, pause_until
            FROM warmup_plans
            WHERE ip_id = $1
            "#,
            *ip_id,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn list_active(&self) -> Result<Vec<WarmupPlan>, Error> {
        sqlx::query_as!(
            WarmupPlan,
            r#"
            SELECT id as "id: WarmupPlanId", tenant_id as "tenant_id: TenantId",
                   ip_id as "ip_id: IpId", phase, started_at, current_daily_quota,
                   target_daily_quota, bounce_rate_7d, spam_rate_7d, paused, pause_until
            FROM warmup_plans
            WHERE phase NOT IN ('completed', 'emergency_stop')
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn count_stats(&self, plan_id: WarmupPlanId) -> Result<i64, Error> {
        sqlx::query_scalar!(
            r#"SELECT count(*) as "count!" FROM warmup_daily_stats WHERE plan_id = $1"#,
            *plan_id,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn sum_stats_since(
        &self,
        plan_id: WarmupPlanId,
        since: NaiveDate,
    ) -> Result<(i64, i64, i64, i64), Error> {
        let row = sqlx::query!(
            r#"
            SELECT
                coalesce(sum(sent), 0)::bigint as "sent!",
                coalesce(sum(delivered), 0)::bigint as "delivered!",
                coalesce(sum(bounced), 0)::bigint as "bounced!",
                coalesce(sum(complaints), 0)::bigint as "complaints!"
            FROM warmup_daily_stats
            WHERE plan_id = $1 AND date >= $2
            "#,
            *plan_id,
            since,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok((row.sent, row.delivered, row.bounced, row.complaints))
    }

    pub async fn set_phase_and_quota(
        &self,
        id: WarmupPlanId,
        phase: &str,
        current_daily_quota: i32,
    ) -> Result<WarmupPlan, Error> {
        sqlx::query_as!(
            WarmupPlan,
            r#"
            UPDATE warmup_plans
            SET phase = $2, current_daily_quota = $3
            WHERE id = $1
            RETURNING id as "id: WarmupPlanId", tenant_id as "tenant_id: TenantId",
                      ip_id as "ip_id: IpId", phase, started_at, current_daily_quota,
                      target_daily_quota, bounce_rate_7d, spam_rate_7d, paused, pause_until
            "#,
            *id,
            phase,
            current_daily_quota,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn set_pause(
        &self,
        id: WarmupPlanId,
        paused: bool,
        pause_until: Option<DateTime<Utc>>,
    ) -> Result<WarmupPlan, Error> {
        sqlx::query_as!(
            WarmupPlan,
            r#"
            UPDATE warmup_plans
            SET paused = $2, pause_until = $3
            WHERE id = $1
            RETURNING id as "id: WarmupPlanId", tenant_id as "tenant_id: TenantId",
                      ip_id as "ip_id: IpId", phase, started_at, current_daily_quota,
                      target_daily_quota, bounce_rate_7d, spam_rate_7d, paused, pause_until
            "#,
            *id,
            paused,
            pause_until,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn set_rates(
        &self,
        id: WarmupPlanId,
        bounce_rate_7d: f64,
        spam_rate_7d: f64,
    ) -> Result<WarmupPlan, Error> {
        sqlx::query_as!(
            WarmupPlan,
            r#"
            UPDATE warmup_plans
            SET bounce_rate_7d = $2, spam_rate_7d = $3
            WHERE id = $1
            RETURNING id as "id: WarmupPlanId", tenant_id as "tenant_id: TenantId",
                      ip_id as "ip_id: IpId", phase, started_at, current_daily_quota,
                      target_daily_quota, bounce_rate_7d, spam_rate_7d, paused, pause_until
            "#,
            *id,
            bounce_rate_7d,
            spam_rate_7d,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn delete(&self, id: WarmupPlanId) -> Result<(), Error> {
        sqlx::query!("DELETE FROM warmup_plans WHERE id = $1", *id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Upserts a daily stat row; a no-op if one already exists for the date
    /// (consolidation is idempotent).
    pub async fn upsert_daily_stat(
        &self,
        plan_id: WarmupPlanId,
        date: NaiveDate,
        sent: i32,
        delivered: i32,
        bounced: i32,
        complaints: i32,
        opens: i32,
        clicks: i32,
    ) -> Result<bool, Error> {
        let result = sqlx::query!(
            r#"
            INSERT INTO warmup_daily_stats
                (id, plan_id, date, sent, delivered, bounced, complaints, opens, clicks)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (plan_id, date) DO NOTHING
            "#,
            *plan_id,
            date,
            sent,
            delivered,
            bounced,
            complaints,
            opens,
            clicks,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn has_stat_for_date(
        &self,
        plan_id: WarmupPlanId,
        date: NaiveDate,
    ) -> Result<bool, Error> {
        let found = sqlx::query_scalar!(
            r#"SELECT EXISTS(SELECT 1 FROM warmup_daily_stats WHERE plan_id = $1 AND date = $2) as "found!""#,
            *plan_id,
            date,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sqlx::PgPool;

    #[sqlx::test(fixtures(path = "../../fixtures", scripts("tenants", "ips")))]
    async fn plan_lifecycle(db: PgPool) {
        let repo = WarmupRepository::new(db);
        let tenant_id: TenantId = "11111111-1111-1111-1111-111111111111".parse().unwrap();
        let ip_id: IpId = "22222222-2222-2222-2222-222222222221".parse().unwrap();

        let plan = repo.create_plan(tenant_id, ip_id, 5, 20_000).await.unwrap();
        assert_eq!(plan.phase, "day_1");
        assert_eq!(plan.current_daily_quota, 5);

        let count = repo.count_stats(plan.id).await.unwrap();
        assert_eq!(count, 0);

        let inserted = repo
            .upsert_daily_stat(plan.id, "2026-01-01".parse().unwrap(), 5, 5, 0, 0, 0, 0)
            .await
            .unwrap();
        assert!(inserted);

        let inserted_again = repo
            .upsert_daily_stat(plan.id, "2026-01-01".parse().unwrap(), 5, 5, 0, 0, 0, 0)
            .await
            .unwrap();
        assert!(!inserted_again);

        let count = repo.count_stats(plan.id).await.unwrap();
        assert_eq!(count, 1);
    }
}
