use std::sync::Arc;

use chrono::{Duration, Utc};
use ipnet::IpNet;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::alerting::Alerter;
use crate::config::Config;
use crate::error::Error;
use crate::models::{AlertCategory, AlertSeverity, BlacklistEventRepository, Ip, IpId, IpRepository, IpStatus};

/// Owns the IP state machine: allowed transitions, blacklist response,
/// quarantine release, monthly rotation.
pub struct LifecycleManager {
    pool: PgPool,
    config: Arc<Config>,
    alerter: Arc<Alerter>,
}

impl LifecycleManager {
    pub fn new(pool: PgPool, config: Arc<Config>, alerter: Arc<Alerter>) -> Self {
        Self {
            pool,
            config,
            alerter,
        }
    }

    fn ips(&self) -> IpRepository {
        IpRepository::new(self.pool.clone())
    }

    fn blacklist_events(&self) -> BlacklistEventRepository {
        BlacklistEventRepository::new(self.pool.clone())
    }

    /// Validates `target` against the current status's allowed-targets list
    /// and stamps `status_changed_at`. Transition to RESTING sets
    /// `quarantine_until = now() + rest_days`; every other target clears it.
    ///
    /// The read, the allowed-transition check and the write all happen
    /// under one `SELECT ... FOR UPDATE` row lock, so two callers racing on
    /// the same IP (e.g. a webhook-triggered `blacklist_response` and a
    /// scheduler tick) serialize on the row instead of both passing the
    /// check against the same stale read and lost-updating one transition.
    pub async fn transition(&self, ip_id: IpId, target: IpStatus) -> Result<Ip, Error> {
        let ips = self.ips();
        let mut tx = self.pool.begin().await?;

        let ip = ips.get_for_update(&mut tx, ip_id).await?;

        if !ip.status.can_transition_to(target) {
            return Err(Error::InvalidState(format!(
                "{:?} -> {:?} is not an allowed transition",
                ip.status, target
            )));
        }

        let quarantine_until = matches!(target, IpStatus::Resting)
            .then(|| Utc::now() + Duration::days(self.config.rest_days));

        let updated = ips.set_status_tx(&mut tx, ip_id, target, quarantine_until).await?;
        tx.commit().await?;
        info!(ip_id = %ip_id, from = ?ip.status, to = ?target, "ip transitioned");
        Ok(updated)
    }

    /// ACTIVE -> RETIRING -> RESTING under one row lock and one transaction,
    /// so a crash between the two legs can never strand an IP in RETIRING —
    /// a status `monthly_rotation` never revisits since it only selects
    /// ACTIVE IPs.
    async fn retire_and_rest(&self, ip_id: IpId) -> Result<(), Error> {
        let ips = self.ips();
        let mut tx = self.pool.begin().await?;

        let ip = ips.get_for_update(&mut tx, ip_id).await?;
        if !ip.status.can_transition_to(IpStatus::Retiring) {
            return Err(Error::InvalidState(format!(
                "{:?} -> Retiring is not an allowed transition",
                ip.status
            )));
        }
        ips.set_status_tx(&mut tx, ip_id, IpStatus::Retiring, None).await?;

        let quarantine_until = Utc::now() + Duration::days(self.config.rest_days);
        ips.set_status_tx(&mut tx, ip_id, IpStatus::Resting, Some(quarantine_until))
            .await?;

        tx.commit().await?;
        info!(ip_id = %ip_id, "ip retired and rested in one transaction");
        Ok(())
    }

    /// Forces QUARANTINED, bypassing the generic transition table: this is
    /// the emergency-stop escape hatch the warmup engine invokes, not a
    /// routine state-machine move.
    pub async fn force_quarantine(&self, ip_id: IpId, until: chrono::DateTime<Utc>) -> Result<Ip, Error> {
        let updated = self.ips().set_status(ip_id, IpStatus::Quarantined, Some(until)).await?;
        warn!(ip_id = %ip_id, until = %until, "ip forced into quarantine");
        Ok(updated)
    }

    /// On notification that `ip_id` is listed on `zones`: unions the zones
    /// into `blacklisted_on`, transitions to BLACKLISTED, and attempts to
    /// promote one STANDBY IP (of the same tenant) to ACTIVE.
    pub async fn blacklist_response(&self, ip_id: IpId, zones: &[String]) -> Result<(), Error> {
        let ips = self.ips();
        let events = self.blacklist_events();

        let mut ip = ips.get_by_id_any_tenant(ip_id).await?;
        for zone in zones {
            ip = ips.add_blacklist_name(ip_id, zone).await?;
        }

        if ip.status.can_transition_to(IpStatus::Blacklisted) {
            self.transition(ip_id, IpStatus::Blacklisted).await?;
        }

        let mut opened_events = Vec::new();
        for zone in zones {
            if let Some(event) = events.open_if_absent(ip.tenant_id, ip_id, zone).await? {
                opened_events.push(event);
            }
        }

        let standby = ips
            .list_by_status(IpStatus::Standby)
            .await?
            .into_iter()
            .find(|s| s.tenant_id == ip.tenant_id);

        if let Some(standby_ip) = &standby {
            self.transition(standby_ip.id, IpStatus::Active).await?;
            for event in &opened_events {
                events.set_standby_activated(event.id, standby_ip.id).await?;
            }
            info!(ip_id = %ip_id, standby_ip = %standby_ip.id, "standby promoted after blacklisting");
        } else {
            warn!(ip_id = %ip_id, "no standby ip available to promote after blacklisting");
        }

        self.alerter
            .alert(
                AlertSeverity::Critical,
                AlertCategory::Blacklist,
                &format!(
                    "ip {} blacklisted on {:?}; standby activated: {}",
                    address_label(&ip.address),
                    zones,
                    standby.map(|s| s.id.to_string()).unwrap_or_else(|| "none".to_string())
                ),
            )
            .await;

        Ok(())
    }

    /// Every RESTING IP whose `quarantine_until <= now()` transitions to WARMING.
    pub async fn release_expired_quarantines(&self) -> Result<Vec<IpId>, Error> {
        let ips = self.ips();
        let resting = ips.list_by_status(IpStatus::Resting).await?;
        let now = Utc::now();

        let mut released = Vec::new();
        for ip in resting {
            if ip.quarantine_until.is_some_and(|until| until <= now) {
                self.transition(ip.id, IpStatus::Warming).await?;
                released.push(ip.id);
            }
        }
        Ok(released)
    }

    /// Atomically selects all ACTIVE IPs ordered by oldest `status_changed_at`
    /// and retires each one (ACTIVE -> RETIRING -> RESTING, no grace window).
    /// Returns the retired addresses.
    pub async fn monthly_rotation(&self) -> Result<Vec<IpNet>, Error> {
        let ips = self.ips();
        let mut active = ips.list_by_status(IpStatus::Active).await?;
        active.sort_by_key(|ip| ip.status_changed_at);

        let mut retired = Vec::new();
        for ip in active {
            self.retire_and_rest(ip.id).await?;
            retired.push(ip.address);
        }

        info!(count = retired.len(), "monthly rotation complete");
        Ok(retired)
    }
}

fn address_label(address: &IpNet) -> String {
    address.addr().to_string()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{IpPurpose, NewIp, TenantId};
    use sqlx::PgPool;

    fn new_ip(tenant_id: TenantId, address: &str, purpose: IpPurpose) -> NewIp {
        NewIp {
            tenant_id,
            address: address.parse().unwrap(),
            hostname: "mail.example.com".to_string(),
            purpose,
            weight: 100,
            vmta_name: None,
            pool_name: None,
            sender_email: None,
            node_id: None,
            mailwizz_server_ref: None,
        }
    }

    #[sqlx::test(fixtures(path = "../fixtures", scripts("tenants")))]
    async fn blacklist_promotes_standby(db: PgPool) {
        let tenant_id: TenantId = "11111111-1111-1111-1111-111111111111".parse().unwrap();
        let ips = IpRepository::new(db.clone());

        let active = ips
            .create(new_ip(tenant_id, "10.0.0.1/32", IpPurpose::Cold))
            .await
            .unwrap();
        ips.set_status(active.id, IpStatus::Active, None).await.unwrap();

        let standby = ips
            .create(new_ip(tenant_id, "10.0.0.2/32", IpPurpose::Standby))
            .await
            .unwrap();
        ips.set_status(standby.id, IpStatus::Standby, None).await.unwrap();

        let config = Arc::new(Config::from_env().unwrap_or_else(|_| test_config()));
        let alerter = Arc::new(Alerter::disabled(db.clone()));
        let manager = LifecycleManager::new(db.clone(), config, alerter);

        manager
            .blacklist_response(active.id, &["zen.spamhaus.org".to_string()])
            .await
            .unwrap();

        let active_after = ips.get_by_id_any_tenant(active.id).await.unwrap();
        assert_eq!(active_after.status, IpStatus::Blacklisted);
        assert_eq!(active_after.blacklisted_on, vec!["zen.spamhaus.org".to_string()]);

        let standby_after = ips.get_by_id_any_tenant(standby.id).await.unwrap();
        assert_eq!(standby_after.status, IpStatus::Active);

        let events = BlacklistEventRepository::new(db).list_open_for_ip(active.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].standby_ip_activated_ref, Some(standby.id));
    }

    fn test_config() -> Config {
        Config {
            database_url: String::new(),
            webhook_secret: None,
            webhook_rate_limit_per_minute: 200,
            telegram_bot_token: None,
            telegram_chat_id: None,
            rest_days: 14,
            quarantine_days: 30,
            emergency_bounce_pct: 5.0,
            emergency_spam_pct: 0.1,
            max_bounce_7d_pct: 2.0,
            max_spam_7d_pct: 0.03,
            bounce_pause_hours: 72,
            spam_pause_hours: 96,
            retry_max_retries: 10,
            retry_queue_path: "/tmp/sendguard-test-retry-queue.jsonl".into(),
            node_connect_timeout: std::time::Duration::from_secs(10),
            node_call_timeout: std::time::Duration::from_secs(30),
            dns_resolver_timeout: std::time::Duration::from_secs(5),
            downstream_http_timeout: std::time::Duration::from_secs(10),
            graceful_reload_queue_depth_threshold: 1000,
        }
    }
}
