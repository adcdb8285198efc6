use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{LookupIpStrategy::Ipv4Only, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::Resolver;
use sqlx::PgPool;
use tracing::warn;

use crate::alerting::Alerter;
use crate::error::Error;
use crate::lifecycle::LifecycleManager;
use crate::models::{AlertCategory, AlertSeverity, BlacklistEventRepository, IpRepository, IpStatus};

/// Carried over verbatim from the original blacklist checker's zone list.
pub const RBL_ZONES: &[&str] = &[
    "zen.spamhaus.org",
    "bl.spamcop.net",
    "b.barracudacentral.org",
    "dnsbl.sorbs.net",
    "spam.dnsbl.sorbs.net",
    "ips.backscatterer.org",
    "psbl.surriel.com",
    "dyna.spamrats.com",
    "all.s5h.net",
];

/// A `d.c.b.a.<zone>` A-record lookup. `Some(true)` = a record resolved
/// (listed), `Some(false)` = NXDOMAIN/NoAnswer (clean), `None` = lookup
/// failed/timed out (treated as clean, never over-alert).
#[async_trait]
pub trait RblResolver: Send + Sync {
    async fn lookup(&self, query: &str) -> Option<bool>;
}

pub struct HickoryRblResolver {
    resolver: Resolver<TokioConnectionProvider>,
}

impl HickoryRblResolver {
    pub fn new(timeout: Duration) -> Self {
        let mut options = ResolverOpts::default();
        options.ip_strategy = Ipv4Only;
        options.timeout = timeout;
        options.attempts = 2;

        Self {
            resolver: Resolver::builder_with_config(ResolverConfig::default(), TokioConnectionProvider::default())
                .with_options(options)
                .build(),
        }
    }
}

#[async_trait]
impl RblResolver for HickoryRblResolver {
    async fn lookup(&self, query: &str) -> Option<bool> {
        match self.resolver.lookup_ip(query).await {
            Ok(lookup) => Some(lookup.iter().next().is_some()),
            Err(e) => {
                if matches!(e.kind(), hickory_resolver::error::ResolveErrorKind::NoRecordsFound { .. }) {
                    Some(false)
                } else {
                    warn!("rbl lookup for {query} failed: {e}");
                    None
                }
            }
        }
    }
}

/// Reverses the octets of an IPv4 address and appends the zone, e.g.
/// `1.0.0.127.zen.spamhaus.org` for `127.0.0.1`.
pub fn reverse_lookup_query(addr: Ipv4Addr, zone: &str) -> String {
    let [a, b, c, d] = addr.octets();
    format!("{d}.{c}.{b}.{a}.{zone}")
}

/// DNS-based RBL sweep over the fixed zone list for every ACTIVE/WARMING IP,
/// plus re-probing of already-open events for delisting.
pub struct BlacklistChecker {
    pool: PgPool,
    alerter: Arc<Alerter>,
    resolver: Arc<dyn RblResolver>,
}

impl BlacklistChecker {
    pub fn new(pool: PgPool, alerter: Arc<Alerter>, dns_resolver_timeout: Duration) -> Self {
        Self {
            pool,
            alerter,
            resolver: Arc::new(HickoryRblResolver::new(dns_resolver_timeout)),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn RblResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    fn ips(&self) -> IpRepository {
        IpRepository::new(self.pool.clone())
    }

    fn events(&self) -> BlacklistEventRepository {
        BlacklistEventRepository::new(self.pool.clone())
    }

    /// Full sweep: checks every ACTIVE/WARMING IP against every zone,
    /// re-probes open events for delisting, and returns the set of
    /// (ip_id, newly-listed zones) pairs so the caller can hand them to the
    /// lifecycle manager's blacklist response.
    pub async fn sweep(&self) -> Result<Vec<(crate::models::IpId, Vec<String>)>, Error> {
        let mut newly_listed = Vec::new();

        let candidates = self.ips().list_by_any_status(&[IpStatus::Active, IpStatus::Warming]).await?;
        for ip in &candidates {
            let std::net::IpAddr::V4(addr) = ip.address.addr() else {
                continue;
            };

            let mut listed_zones = Vec::new();
            for zone in RBL_ZONES {
                let query = reverse_lookup_query(addr, zone);
                if self.resolver.lookup(&query).await.unwrap_or(false) {
                    listed_zones.push((*zone).to_string());
                }
            }

            let mut opened = Vec::new();
            for zone in &listed_zones {
                if self.events().open_if_absent(ip.tenant_id, ip.id, zone).await?.is_some() {
                    opened.push(zone.clone());
                }
            }

            if !opened.is_empty() {
                newly_listed.push((ip.id, opened));
            }
        }

        self.recheck_open_events().await?;

        Ok(newly_listed)
    }

    /// Re-probes every currently open event; closes it if the zone now
    /// resolves clean.
    async fn recheck_open_events(&self) -> Result<(), Error> {
        let open = self.events().list_all_open().await?;
        for event in open {
            let ip = self.ips().get_by_id_any_tenant(event.ip_id).await?;
            let std::net::IpAddr::V4(addr) = ip.address.addr() else {
                continue;
            };
            let query = reverse_lookup_query(addr, &event.blacklist_name);
            let still_listed = self.resolver.lookup(&query).await.unwrap_or(false);

            if !still_listed {
                self.events().close(event.id).await?;
                self.alerter
                    .alert(
                        AlertSeverity::Info,
                        AlertCategory::Blacklist,
                        &format!("ip {} delisted from {}", event.ip_id, event.blacklist_name),
                    )
                    .await;
            }
        }
        Ok(())
    }
}

/// Runs a sweep and hands every newly-listed IP to the lifecycle manager's
/// blacklist response, per §4.7's "after a full sweep, pass all newly listed
/// IPs to C4" requirement.
pub async fn run_sweep_and_respond(
    checker: &BlacklistChecker,
    lifecycle: &LifecycleManager,
) -> Result<(), Error> {
    for (ip_id, zones) in checker.sweep().await? {
        lifecycle.blacklist_response(ip_id, &zones).await?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MockResolver {
        listed: Mutex<HashMap<String, bool>>,
    }

    impl MockResolver {
        fn new() -> Self {
            Self {
                listed: Mutex::new(HashMap::new()),
            }
        }

        fn set_listed(&self, query: &str, listed: bool) {
            self.listed.lock().unwrap().insert(query.to_string(), listed);
        }
    }

    #[async_trait]
    impl RblResolver for MockResolver {
        async fn lookup(&self, query: &str) -> Option<bool> {
            Some(*self.listed.lock().unwrap().get(query).unwrap_or(&false))
        }
    }

    #[test]
    fn reverse_lookup_query_reverses_octets() {
        let addr: Ipv4Addr = "127.0.0.1".parse().unwrap();
        assert_eq!(
            reverse_lookup_query(addr, "zen.spamhaus.org"),
            "1.0.0.127.zen.spamhaus.org"
        );
    }

    #[test]
    fn rbl_zones_has_nine_entries() {
        assert_eq!(RBL_ZONES.len(), 9);
    }

    #[tokio::test]
    async fn mock_resolver_reports_listed_and_clean() {
        let resolver = MockResolver::new();
        resolver.set_listed("1.0.0.127.zen.spamhaus.org", true);
        assert_eq!(resolver.lookup("1.0.0.127.zen.spamhaus.org").await, Some(true));
        assert_eq!(resolver.lookup("1.0.0.127.bl.spamcop.net").await, Some(false));
    }

    mod integration {
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

        #[sqlx::test(fixtures(path = "../fixtures", scripts("tenants")))]
        async fn sweep_opens_event_for_newly_listed_ip(db: PgPool) {
            let tenant_id: TenantId = "11111111-1111-1111-1111-111111111111".parse().unwrap();
            let ips = IpRepository::new(db.clone());
            let ip = ips.create(new_ip(tenant_id, "198.51.100.7/32")).await.unwrap();
            ips.set_status(ip.id, IpStatus::Active, None).await.unwrap();

            let resolver = Arc::new(MockResolver::new());
            resolver.set_listed("7.100.51.198.zen.spamhaus.org", true);

            let alerter = Arc::new(Alerter::disabled(db.clone()));
            let checker = BlacklistChecker::new(db.clone(), alerter, Duration::from_secs(5)).with_resolver(resolver);

            let listed = checker.sweep().await.unwrap();
            assert_eq!(listed.len(), 1);
            assert_eq!(listed[0].0, ip.id);
            assert_eq!(listed[0].1, vec!["zen.spamhaus.org".to_string()]);

            let events = BlacklistEventRepository::new(db).list_open_for_ip(ip.id).await.unwrap();
            assert_eq!(events.len(), 1);
        }

        #[sqlx::test(fixtures(path = "../fixtures", scripts("tenants")))]
        async fn recheck_closes_event_once_clean(db: PgPool) {
            let tenant_id: TenantId = "11111111-1111-1111-1111-111111111111".parse().unwrap();
            let ips = IpRepository::new(db.clone());
            let ip = ips.create(new_ip(tenant_id, "198.51.100.8/32")).await.unwrap();
            ips.set_status(ip.id, IpStatus::Active, None).await.unwrap();

            let events = BlacklistEventRepository::new(db.clone());
            events.open_if_absent(tenant_id, ip.id, "zen.spamhaus.org").await.unwrap();

            let resolver = Arc::new(MockResolver::new());
            let alerter = Arc::new(Alerter::disabled(db.clone()));
            let checker = BlacklistChecker::new(db.clone(), alerter, Duration::from_secs(5)).with_resolver(resolver);

            checker.recheck_open_events().await.unwrap();

            let open = events.list_open_for_ip(ip.id).await.unwrap();
            assert!(open.is_empty());
        }
    }
}
