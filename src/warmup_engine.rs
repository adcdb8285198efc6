use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use sqlx::PgPool;
use tracing::warn;

use crate::alerting::Alerter;
use crate::campaign_manager::{CampaignManagerAdapter, ServerStatus};
use crate::error::Error;
use crate::lifecycle::LifecycleManager;
use crate::models::{AlertCategory, AlertSeverity, IpRepository, IpStatus, WarmupPlan, WarmupRepository};

/// The 70-day progressive daily-quota schedule, strictly monotonically
/// increasing, with day 1 = 5 and day 70 = 20000. `SCHEDULE[n-1]` is the
/// quota for day `n`.
pub const SCHEDULE: [i32; 70] = [
    5, 7, 10, 12, 15, 18, 20, 25, 29, 33, 38, 42, 46, 50, 59, 67, 76, 84, 93, 101, 110, 130, 150,
    170, 190, 210, 230, 250, 293, 336, 379, 421, 464, 507, 550, 643, 736, 829, 921, 1014, 1107,
    1200, 1400, 1600, 1800, 2000, 2200, 2400, 2600, 3014, 3429, 3843, 4257, 4671, 5086, 5500,
    6143, 6786, 7429, 8071, 8714, 9357, 10000, 11429, 12857, 14286, 15714, 17143, 18571, 20000,
];

pub const INITIAL_QUOTA: i32 = 5;
pub const TARGET_QUOTA: i32 = 20_000;
pub const PLAN_LENGTH_DAYS: i64 = 70;

/// `n<=0 -> day1`, `n>70 -> day70`.
pub fn get_quota_for_day(n: i64) -> i32 {
    let clamped = n.clamp(1, PLAN_LENGTH_DAYS) as usize;
    SCHEDULE[clamped - 1]
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SafetyVerdict {
    Safe,
    EmergencyStop,
    BouncePause,
    SpamPause,
}

/// Per-IP day-number computation, daily quota lookup, multi-horizon safety
/// evaluation, pause/resume, emergency stop, quota propagation to C2.
pub struct WarmupEngine {
    pool: PgPool,
    campaign_manager: Arc<dyn CampaignManagerAdapter>,
    alerter: Arc<Alerter>,
    lifecycle: LifecycleManager,
    emergency_bounce_pct: f64,
    emergency_spam_pct: f64,
    max_bounce_7d_pct: f64,
    max_spam_7d_pct: f64,
    bounce_pause_hours: i64,
    spam_pause_hours: i64,
    quarantine_days: i64,
}

impl WarmupEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        campaign_manager: Arc<dyn CampaignManagerAdapter>,
        alerter: Arc<Alerter>,
        lifecycle: LifecycleManager,
    ) -> Self {
        Self {
            pool,
            campaign_manager,
            alerter,
            lifecycle,
            emergency_bounce_pct: 5.0,
            emergency_spam_pct: 0.1,
            max_bounce_7d_pct: 2.0,
            max_spam_7d_pct: 0.03,
            bounce_pause_hours: 72,
            spam_pause_hours: 96,
            quarantine_days: 30,
        }
    }

    pub fn with_thresholds(
        mut self,
        emergency_bounce_pct: f64,
        emergency_spam_pct: f64,
        max_bounce_7d_pct: f64,
        max_spam_7d_pct: f64,
        bounce_pause_hours: i64,
        spam_pause_hours: i64,
        quarantine_days: i64,
    ) -> Self {
        self.emergency_bounce_pct = emergency_bounce_pct;
        self.emergency_spam_pct = emergency_spam_pct;
        self.max_bounce_7d_pct = max_bounce_7d_pct;
        self.max_spam_7d_pct = max_spam_7d_pct;
        self.bounce_pause_hours = bounce_pause_hours;
        self.spam_pause_hours = spam_pause_hours;
        self.quarantine_days = quarantine_days;
        self
    }

    fn warmup(&self) -> WarmupRepository {
        WarmupRepository::new(self.pool.clone())
    }

    fn ips(&self) -> IpRepository {
        IpRepository::new(self.pool.clone())
    }

    /// Creates a plan at `phase="day_1"`, `current_daily_quota=5` when `ip_id`
    /// enters WARMING.
    pub async fn create_plan(
        &self,
        tenant_id: crate::models::TenantId,
        ip_id: crate::models::IpId,
    ) -> Result<WarmupPlan, Error> {
        self.warmup()
            .create_plan(tenant_id, ip_id, INITIAL_QUOTA, TARGET_QUOTA)
            .await
    }

    /// `count(stats) + 1` if any stats exist, else `max(1, (now - started_at).days + 1)`,
    /// clamped to `<= 71`. Insensitive to wall-clock pauses: a day with no
    /// stat recorded (because the plan was paused) does not advance the count.
    pub async fn day_number(&self, plan: &WarmupPlan) -> Result<i64, Error> {
        let warmup = self.warmup();
        let stat_count = warmup.count_stats(plan.id).await?;

        let day = if stat_count > 0 {
            stat_count + 1
        } else {
            let elapsed = (Utc::now() - plan.started_at).num_days();
            (elapsed + 1).max(1)
        };

        Ok(day.min(PLAN_LENGTH_DAYS + 1))
    }

    /// Computes bounce% and spam% over the 24h and 7d horizons and applies
    /// the strict priority order from §4.5. Never skips a pause because a
    /// collaborator call failed: the state mutation always happens before
    /// the (best-effort) downstream propagation.
    pub async fn evaluate_safety(&self, plan: &WarmupPlan) -> Result<SafetyVerdict, Error> {
        let warmup = self.warmup();
        let today: NaiveDate = Utc::now().date_naive();

        let (sent_24h, _delivered_24h, bounced_24h, complaints_24h) =
            warmup.sum_stats_since(plan.id, today).await?;
        let (sent_7d, _delivered_7d, bounced_7d, complaints_7d) =
            warmup.sum_stats_since(plan.id, today - Duration::days(6)).await?;

        let bounce_pct_24h = pct(bounced_24h, sent_24h);
        let spam_pct_24h = pct(complaints_24h, sent_24h);
        let bounce_pct_7d = pct(bounced_7d, sent_7d);
        let spam_pct_7d = pct(complaints_7d, sent_7d);

        let ip = self.ips().get_by_id_any_tenant(plan.ip_id).await?;

        if bounce_pct_24h > self.emergency_bounce_pct || spam_pct_24h > self.emergency_spam_pct {
            let until = Utc::now() + Duration::days(self.quarantine_days);
            self.warmup()
                .set_phase_and_quota(plan.id, "emergency_stop", plan.current_daily_quota)
                .await?;
            self.warmup().set_pause(plan.id, true, Some(until)).await?;
            self.lifecycle.force_quarantine(plan.ip_id, until).await?;
            self.sync_quota_best_effort(&ip, 0, Some(ServerStatus::Inactive)).await;
            self.alerter
                .alert(
                    AlertSeverity::Critical,
                    AlertCategory::Warmup,
                    &format!(
                        "emergency stop: ip {} bounce_24h={bounce_pct_24h:.2}% spam_24h={spam_pct_24h:.2}%",
                        plan.ip_id
                    ),
                )
                .await;
            return Ok(SafetyVerdict::EmergencyStop);
        }

        if bounce_pct_7d > self.max_bounce_7d_pct {
            let until = Utc::now() + Duration::hours(self.bounce_pause_hours);
            self.warmup().set_pause(plan.id, true, Some(until)).await?;
            self.sync_quota_best_effort(&ip, 0, Some(ServerStatus::Inactive)).await;
            self.alerter
                .alert(
                    AlertSeverity::Warning,
                    AlertCategory::Warmup,
                    &format!("7-day bounce pause: ip {} bounce_7d={bounce_pct_7d:.2}%", plan.ip_id),
                )
                .await;
            return Ok(SafetyVerdict::BouncePause);
        }

        if spam_pct_7d > self.max_spam_7d_pct {
            let until = Utc::now() + Duration::hours(self.spam_pause_hours);
            self.warmup().set_pause(plan.id, true, Some(until)).await?;
            self.sync_quota_best_effort(&ip, 0, Some(ServerStatus::Inactive)).await;
            self.alerter
                .alert(
                    AlertSeverity::Critical,
                    AlertCategory::Warmup,
                    &format!("7-day spam pause: ip {} spam_7d={spam_pct_7d:.2}%", plan.ip_id),
                )
                .await;
            return Ok(SafetyVerdict::SpamPause);
        }

        self.warmup().set_rates(plan.id, bounce_pct_7d, spam_pct_7d).await?;
        Ok(SafetyVerdict::Safe)
    }

    async fn sync_quota_best_effort(&self, ip: &crate::models::Ip, daily_quota: i32, status: Option<ServerStatus>) {
        let Some(server_ref) = &ip.mailwizz_server_ref else {
            return;
        };

        if let Some(status) = status {
            if let Err(e) = self.campaign_manager.set_server_status(server_ref, status).await {
                warn!(ip_id = %ip.id, "failed to propagate server status: {e}");
            }
        }

        if daily_quota > 0 {
            if let Err(e) = self.campaign_manager.sync_warmup_quota(server_ref, daily_quota).await {
                warn!(ip_id = %ip.id, "failed to propagate warmup quota: {e}");
            }
        }
    }

    /// Runs once per day for every non-completed, non-emergency-stop plan.
    pub async fn daily_tick(&self) -> Result<(), Error> {
        let warmup = self.warmup();
        for plan in warmup.list_active().await? {
            if let Err(e) = self.tick_one_plan(&plan).await {
                warn!(plan_id = %plan.id, "daily tick failed for plan: {e}");
            }
        }
        Ok(())
    }

    async fn tick_one_plan(&self, plan: &WarmupPlan) -> Result<(), Error> {
        let warmup = self.warmup();
        let mut plan = plan.clone();

        if plan.paused {
            if plan.pause_until.is_some_and(|until| until <= Utc::now()) {
                plan = warmup.set_pause(plan.id, false, None).await?;
                let ip = self.ips().get_by_id_any_tenant(plan.ip_id).await?;
                self.sync_quota_best_effort(&ip, 0, Some(ServerStatus::Active)).await;
                self.alerter
                    .alert(
                        AlertSeverity::Info,
                        AlertCategory::Warmup,
                        &format!("pause cleared for plan {}", plan.id),
                    )
                    .await;
            } else {
                return Ok(());
            }
        }

        if self.evaluate_safety(&plan).await? != SafetyVerdict::Safe {
            return Ok(());
        }

        let day = self.day_number(&plan).await?;
        let ip = self.ips().get_by_id_any_tenant(plan.ip_id).await?;

        if day > PLAN_LENGTH_DAYS {
            warmup.set_phase_and_quota(plan.id, "completed", TARGET_QUOTA).await?;
            self.lifecycle.transition(plan.ip_id, IpStatus::Active).await?;
            if let Some(server_ref) = &ip.mailwizz_server_ref {
                if let Err(e) = self.campaign_manager.sync_warmup_quota(server_ref, TARGET_QUOTA).await {
                    warn!(plan_id = %plan.id, "quota sync failed on completion: {e}");
                }
                if let Err(e) = self.campaign_manager.set_server_status(server_ref, ServerStatus::Active).await {
                    warn!(plan_id = %plan.id, "status sync failed on completion: {e}");
                }
            }
            self.alerter
                .alert(
                    AlertSeverity::Info,
                    AlertCategory::Warmup,
                    &format!("plan {} completed, ip {} promoted to active", plan.id, plan.ip_id),
                )
                .await;
        } else {
            let quota = get_quota_for_day(day);
            warmup.set_phase_and_quota(plan.id, &format!("day_{day}"), quota).await?;
            if let Some(server_ref) = &ip.mailwizz_server_ref {
                if let Err(e) = self.campaign_manager.sync_warmup_quota(server_ref, quota).await {
                    warn!(plan_id = %plan.id, "quota sync failed for day {day}: {e}");
                }
            }
        }

        Ok(())
    }

    /// Hourly, independent of the daily tick: re-asserts the campaign
    /// manager's daily quota for every non-completed plan, to compensate for
    /// external drift.
    pub async fn sync_quota_job(&self) -> Result<(), Error> {
        let warmup = self.warmup();
        for plan in warmup.list_active().await? {
            let ip = self.ips().get_by_id_any_tenant(plan.ip_id).await?;
            if let Some(server_ref) = &ip.mailwizz_server_ref {
                if let Err(e) = self
                    .campaign_manager
                    .sync_warmup_quota(server_ref, plan.current_daily_quota)
                    .await
                {
                    warn!(plan_id = %plan.id, "hourly quota sync failed: {e}");
                }
            }
        }
        Ok(())
    }
}

fn pct(numerator: i64, denominator: i64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        (numerator as f64 / denominator as f64) * 100.0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn schedule_matches_spec_invariants() {
        assert_eq!(SCHEDULE.len(), 70);
        assert_eq!(SCHEDULE[0], 5);
        assert_eq!(SCHEDULE[69], 20_000);
        assert!(SCHEDULE.windows(2).all(|w| w[0] < w[1]));

        let checkpoints = [
            (7, 20),
            (14, 50),
            (21, 110),
            (28, 250),
            (35, 550),
            (42, 1200),
            (49, 2600),
            (56, 5500),
            (63, 10000),
            (70, 20_000),
        ];
        for (day, expected) in checkpoints {
            assert_eq!(SCHEDULE[day - 1], expected, "day {day}");
        }
    }

    #[test]
    fn happy_progression_week_one_matches_scenario() {
        let expected = [5, 7, 10, 12, 15, 18, 20];
        for (day, quota) in (1..=7).zip(expected) {
            assert_eq!(get_quota_for_day(day), quota, "day {day}");
        }
        assert_eq!(get_quota_for_day(8), 25);
    }

    #[test]
    fn get_quota_for_day_clamps_out_of_range() {
        assert_eq!(get_quota_for_day(0), get_quota_for_day(1));
        assert_eq!(get_quota_for_day(-5), get_quota_for_day(1));
        assert_eq!(get_quota_for_day(71), get_quota_for_day(70));
        assert_eq!(get_quota_for_day(1000), 20_000);
    }

    #[test]
    fn pct_handles_zero_denominator() {
        assert_eq!(pct(0, 0), 0.0);
        assert_eq!(pct(30, 1000), 3.0);
    }
}
