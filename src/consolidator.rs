use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{NaiveDate, Utc};
use sqlx::PgPool;
use tracing::warn;

use crate::error::Error;
use crate::models::{IpId, IpRepository, IpStatus, WarmupRepository};

#[derive(Debug, Clone, Copy, Default)]
struct DayCounters {
    sent: i32,
    delivered: i32,
    bounced: i32,
    complaints: i32,
    opens: i32,
    clicks: i32,
}

#[derive(Debug, Clone, Copy)]
pub enum CounterKind {
    Sent,
    Delivered,
    Bounced,
    Complaint,
    Open,
    Click,
}

/// In-memory per-IP per-day counter cache (§4.10, §9's "narrowed global
/// mutable state"). Multi-writer via [`Self::increment`], single-reader via
/// the daily consolidation job, which also clears the keys it consumes.
pub struct Consolidator {
    pool: PgPool,
    counters: Mutex<HashMap<(IpId, NaiveDate), DayCounters>>,
}

impl Consolidator {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn ips(&self) -> IpRepository {
        IpRepository::new(self.pool.clone())
    }

    fn warmup(&self) -> WarmupRepository {
        WarmupRepository::new(self.pool.clone())
    }

    /// Bumps today's counter for `ip_id` by one. Called from the webhook
    /// handlers whenever the inbound event carries a recognizable outcome;
    /// a no-op cost for IPs that are not currently WARMING is acceptable —
    /// the consolidation job only reads counters for WARMING|ACTIVE IPs.
    pub fn increment(&self, ip_id: IpId, kind: CounterKind) {
        self.increment_by(ip_id, kind, 1);
    }

    pub fn increment_by(&self, ip_id: IpId, kind: CounterKind, n: i32) {
        let today = Utc::now().date_naive();
        let mut counters = self.counters.lock().unwrap();
        let entry = counters.entry((ip_id, today)).or_default();
        match kind {
            CounterKind::Sent => entry.sent += n,
            CounterKind::Delivered => entry.delivered += n,
            CounterKind::Bounced => entry.bounced += n,
            CounterKind::Complaint => entry.complaints += n,
            CounterKind::Open => entry.opens += n,
            CounterKind::Click => entry.clicks += n,
        }
    }

    /// Daily 00:30 job: for each WARMING|ACTIVE IP with a warmup plan,
    /// upserts yesterday's counters into a `WarmupDailyStat` (unless one
    /// already exists) and drops the consumed keys. Idempotent: a day
    /// that's already been consolidated is left alone by
    /// `upsert_daily_stat`'s `ON CONFLICT DO NOTHING`, and its cache key is
    /// still cleared so the process doesn't accumulate stale entries.
    pub async fn consolidate_yesterday(&self) -> Result<usize, Error> {
        let yesterday = Utc::now().date_naive() - chrono::Duration::days(1);
        let mut consolidated = 0;

        let candidates = self.ips().list_by_any_status(&[IpStatus::Warming, IpStatus::Active]).await?;
        for ip in candidates {
            let day = {
                let mut counters = self.counters.lock().unwrap();
                counters.remove(&(ip.id, yesterday))
            };
            let Some(day) = day else {
                continue;
            };

            let plan = match self.warmup().get_by_ip(ip.id).await {
                Ok(plan) => plan,
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };

            let inserted = self
                .warmup()
                .upsert_daily_stat(
                    plan.id,
                    yesterday,
                    day.sent,
                    day.delivered,
                    day.bounced,
                    day.complaints,
                    day.opens,
                    day.clicks,
                )
                .await?;

            if inserted {
                consolidated += 1;
            } else {
                warn!(ip_id = %ip.id, date = %yesterday, "consolidation skipped, stat already present");
            }
        }

        Ok(consolidated)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{IpPurpose, NewIp, TenantId};
    use sqlx::PgPool;

    fn new_ip(tenant_id: TenantId, address: &str) -> NewIp {
        NewIp {
            tenant_id,
            address: address.parse().unwrap(),
            hostname: "mail.example.com".to_string(),
            purpose: IpPurpose::Cold,
            weight: 100,
            vmta_name: None,
            pool_name: None,
            sender_email: None,
            node_id: None,
            mailwizz_server_ref: None,
        }
    }

    #[test]
    fn increment_accumulates_per_ip_per_day() {
        // `connect_lazy` never touches the network; fine for exercising the
        // in-memory counter path without a live database.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/sendguard-unused")
            .unwrap();
        let consolidator = Consolidator::new(pool);
        let ip_id: IpId = "22222222-2222-2222-2222-222222222221".parse().unwrap();
        consolidator.increment(ip_id, CounterKind::Sent);
        consolidator.increment(ip_id, CounterKind::Sent);
        consolidator.increment(ip_id, CounterKind::Bounced);

        let today = Utc::now().date_naive();
        let counters = consolidator.counters.lock().unwrap();
        let day = counters.get(&(ip_id, today)).unwrap();
        assert_eq!(day.sent, 2);
        assert_eq!(day.bounced, 1);
    }

    #[sqlx::test(fixtures(path = "../fixtures", scripts("tenants")))]
    async fn consolidate_is_idempotent(db: PgPool) {
        let tenant_id: TenantId = "11111111-1111-1111-1111-111111111111".parse().unwrap();
        let ips = IpRepository::new(db.clone());
        let ip = ips.create(new_ip(tenant_id, "198.51.100.40/32")).await.unwrap();
        ips.set_status(ip.id, IpStatus::Warming, None).await.unwrap();

        let warmup = WarmupRepository::new(db.clone());
        let plan = warmup.create_plan(tenant_id, ip.id, 5, 20_000).await.unwrap();

        let consolidator = Consolidator::new(db.clone());
        let yesterday = Utc::now().date_naive() - chrono::Duration::days(1);
        consolidator
            .counters
            .lock()
            .unwrap()
            .insert((ip.id, yesterday), DayCounters { sent: 5, delivered: 5, ..Default::default() });

        let count = consolidator.consolidate_yesterday().await.unwrap();
        assert_eq!(count, 1);

        let has_stat = warmup.has_stat_for_date(plan.id, yesterday).await.unwrap();
        assert!(has_stat);

        // Re-running with the same key present should find nothing to do
        // (the cache entry was already consumed).
        consolidator
            .counters
            .lock()
            .unwrap()
            .insert((ip.id, yesterday), DayCounters { sent: 99, ..Default::default() });
        let count_again = consolidator.consolidate_yesterday().await.unwrap();
        assert_eq!(count_again, 0);

        let stat_count = warmup.count_stats(plan.id).await.unwrap();
        assert_eq!(stat_count, 1);
    }
}
