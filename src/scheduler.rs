use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc};
use metrics::gauge;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::blacklist::{self, BlacklistChecker};
use crate::consolidator::Consolidator;
use crate::lifecycle::LifecycleManager;
use crate::models::IpStatus;
use crate::registry::NodeRegistry;
use crate::retry_queue::RetryQueue;
use crate::warmup_engine::WarmupEngine;

/// Fires every job in §4.9's cadence table on a shared UTC clock. Each job
/// runs in its own task so a slow collaborator never delays another job's
/// cadence; within one job ID, iterations are strictly sequential (the next
/// sleep is only computed after the previous run finishes), matching
/// `remails::periodically::run_periodically`'s loop shape. A failing run
/// logs and the loop continues — it never tears down the scheduler.
pub struct Scheduler {
    pool: sqlx::PgPool,
    node_registry: Arc<NodeRegistry>,
    lifecycle: Arc<LifecycleManager>,
    warmup_engine: Arc<WarmupEngine>,
    blacklist_checker: Arc<BlacklistChecker>,
    consolidator: Arc<Consolidator>,
    retry_queue: Arc<RetryQueue>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: sqlx::PgPool,
        node_registry: Arc<NodeRegistry>,
        lifecycle: LifecycleManager,
        warmup_engine: WarmupEngine,
        blacklist_checker: BlacklistChecker,
        consolidator: Consolidator,
        retry_queue: RetryQueue,
    ) -> Self {
        Self {
            pool,
            node_registry,
            lifecycle: Arc::new(lifecycle),
            warmup_engine: Arc::new(warmup_engine),
            blacklist_checker: Arc::new(blacklist_checker),
            consolidator: Arc::new(consolidator),
            retry_queue: Arc::new(retry_queue),
        }
    }

    /// Spawns every job from §4.9 and returns immediately; jobs keep running
    /// until `shutdown` is cancelled. `DNS validation` is omitted: per §6 it
    /// is an external collaborator's job, not one this core owns.
    pub fn spawn_all(&self, shutdown: CancellationToken) {
        spawn_interval("health_probe", StdDuration::from_secs(5 * 60), shutdown.clone(), {
            let registry = self.node_registry.clone();
            move || {
                let registry = registry.clone();
                async move {
                    let health = registry.health_check_all().await;
                    for h in &health {
                        info!(node_id = %h.node_id, reachable = h.reachable, running = h.running, queue_depth = h.queue_depth, "node health");
                    }
                    Ok(())
                }
            }
        });

        spawn_interval("prometheus_gauges", StdDuration::from_secs(60), shutdown.clone(), {
            let pool = self.pool.clone();
            move || {
                let pool = pool.clone();
                async move { refresh_gauges(&pool).await }
            }
        });

        spawn_interval("retry_queue_drain", StdDuration::from_secs(2 * 60), shutdown.clone(), {
            let retry_queue = self.retry_queue.clone();
            move || {
                let retry_queue = retry_queue.clone();
                async move { retry_queue.drain().await.map_err(|e| e.to_string()) }
            }
        });

        spawn_interval("blacklist_sweep", StdDuration::from_secs(4 * 60 * 60), shutdown.clone(), {
            let checker = self.blacklist_checker.clone();
            let lifecycle = self.lifecycle.clone();
            move || {
                let checker = checker.clone();
                let lifecycle = lifecycle.clone();
                async move { blacklist::run_sweep_and_respond(&checker, &lifecycle).await.map_err(|e| e.to_string()) }
            }
        });

        spawn_interval("warmup_quota_sync", StdDuration::from_secs(60 * 60), shutdown.clone(), {
            let engine = self.warmup_engine.clone();
            move || {
                let engine = engine.clone();
                async move { engine.sync_quota_job().await.map_err(|e| e.to_string()) }
            }
        });

        spawn_daily("quarantine_release", 4, 0, shutdown.clone(), {
            let lifecycle = self.lifecycle.clone();
            move || {
                let lifecycle = lifecycle.clone();
                async move { lifecycle.release_expired_quarantines().await.map(|_| ()).map_err(|e| e.to_string()) }
            }
        });

        spawn_daily("warmup_stats_consolidation", 0, 30, shutdown.clone(), {
            let consolidator = self.consolidator.clone();
            move || {
                let consolidator = consolidator.clone();
                async move { consolidator.consolidate_yesterday().await.map(|_| ()).map_err(|e| e.to_string()) }
            }
        });

        spawn_daily("warmup_daily_tick", 1, 0, shutdown.clone(), {
            let engine = self.warmup_engine.clone();
            move || {
                let engine = engine.clone();
                async move { engine.daily_tick().await.map_err(|e| e.to_string()) }
            }
        });

        spawn_monthly("monthly_rotation", 1, 3, 0, shutdown, {
            let lifecycle = self.lifecycle.clone();
            move || {
                let lifecycle = lifecycle.clone();
                async move { lifecycle.monthly_rotation().await.map(|_| ()).map_err(|e| e.to_string()) }
            }
        });
    }
}

async fn refresh_gauges(pool: &sqlx::PgPool) -> Result<(), String> {
    let ips = crate::models::IpRepository::new(pool.clone());
    for status in [
        IpStatus::Active,
        IpStatus::Warming,
        IpStatus::Standby,
        IpStatus::Quarantined,
        IpStatus::Blacklisted,
        IpStatus::Resting,
        IpStatus::Retiring,
    ] {
        let count = ips.list_by_status(status).await.map_err(|e| e.to_string())?.len();
        gauge!("sendguard_ips_by_status", "status" => format!("{status:?}").to_lowercase()).set(count as f64);
    }
    Ok(())
}

fn spawn_interval<F, Fut>(name: &'static str, period: StdDuration, shutdown: CancellationToken, job: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), String>> + Send,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(job = name, "scheduler job cancelled");
                    return;
                }
                _ = tokio::time::sleep(period) => {
                    if let Err(e) = job().await {
                        error!(job = name, "scheduled job failed: {e}");
                    }
                }
            }
        }
    });
}

fn spawn_daily<F, Fut>(name: &'static str, hour: u32, minute: u32, shutdown: CancellationToken, job: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), String>> + Send,
{
    tokio::spawn(async move {
        loop {
            let wait = duration_until_next_daily(hour, minute);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(job = name, "scheduler job cancelled");
                    return;
                }
                _ = tokio::time::sleep(wait) => {
                    if let Err(e) = job().await {
                        error!(job = name, "scheduled job failed: {e}");
                    }
                }
            }
        }
    });
}

fn spawn_monthly<F, Fut>(name: &'static str, day: u32, hour: u32, minute: u32, shutdown: CancellationToken, job: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), String>> + Send,
{
    tokio::spawn(async move {
        loop {
            let wait = duration_until_next_monthly(day, hour, minute);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(job = name, "scheduler job cancelled");
                    return;
                }
                _ = tokio::time::sleep(wait) => {
                    if let Err(e) = job().await {
                        error!(job = name, "scheduled job failed: {e}");
                    }
                }
            }
        }
    });
}

fn duration_until_next_daily(hour: u32, minute: u32) -> StdDuration {
    let now = Utc::now();
    let target_time = NaiveTime::from_hms_opt(hour, minute, 0).expect("valid hour/minute");
    let mut target = Utc.from_utc_datetime(&now.date_naive().and_time(target_time));
    if target <= now {
        target += Duration::days(1);
    }
    (target - now).to_std().unwrap_or(StdDuration::from_secs(1))
}

fn duration_until_next_monthly(day: u32, hour: u32, minute: u32) -> StdDuration {
    let now = Utc::now();
    let target_time = NaiveTime::from_hms_opt(hour, minute, 0).expect("valid hour/minute");

    let mut year = now.year();
    let mut month = now.month();
    loop {
        if let Some(date) = chrono::NaiveDate::from_ymd_opt(year, month, day) {
            let target = Utc.from_utc_datetime(&date.and_time(target_time));
            if target > now {
                return (target - now).to_std().unwrap_or(StdDuration::from_secs(1));
            }
        }
        month += 1;
        if month > 12 {
            month = 1;
            year += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn daily_wait_is_never_longer_than_a_day() {
        let wait = duration_until_next_daily(0, 30);
        assert!(wait <= StdDuration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn monthly_wait_lands_on_the_first() {
        let wait = duration_until_next_monthly(1, 3, 0);
        let target = Utc::now() + Duration::from_std(wait).unwrap();
        assert_eq!(target.day(), 1);
        assert_eq!(target.hour(), 3);
        assert_eq!(target.minute(), 0);
    }
}
