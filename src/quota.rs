//! Quota Service (C4)
//!
//! Reads a subscription + plan + current period, decides admit/reject at
//! connect, and atomically increments usage after a session. Reads/increments
//! go straight through the `Store` — unlike transcript persistence, quota
//! checks gate the handshake and cannot be deferred to the write queue.

use std::sync::Arc;

use chrono::{DateTime, Months, Utc};

use crate::errors::QuotaError;
use crate::model::QuotaAvailability;
use crate::store::Store;

pub struct QuotaService {
    store: Arc<dyn Store>,
}

impl QuotaService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn check_quota_availability(&self, org_id: &str) -> Result<QuotaAvailability, QuotaError> {
        let subscription = self
            .store
            .load_subscription(org_id)
            .await
            .map_err(|_| QuotaError::NoSubscription)?
            .ok_or(QuotaError::NoSubscription)?;

        if subscription.status != "active" {
            return Err(QuotaError::QuotaExceeded {
                current_plan: subscription.plan_id.clone(),
                quota_minutes: 0.0,
                used_minutes: 0.0,
            });
        }

        let plan = self
            .store
            .load_plan(&subscription.plan_id)
            .await
            .map_err(|_| QuotaError::NoSubscription)?
            .ok_or(QuotaError::NoSubscription)?;

        let used = if plan.quota_resets_monthly {
            let period = self.current_or_rolled_period(&subscription, Utc::now()).await?;
            period.usage_minutes
        } else {
            subscription.lifetime_usage_minutes
        };

        let remaining = plan.quota_minutes - used;
        let allowed = remaining > 0.0;

        if !allowed {
            return Err(QuotaError::QuotaExceeded {
                current_plan: plan.name,
                quota_minutes: plan.quota_minutes,
                used_minutes: used,
            });
        }

        Ok(QuotaAvailability {
            allowed: true,
            remaining_minutes: remaining,
            used_minutes: used,
            quota_minutes: plan.quota_minutes,
            plan_name: plan.name,
        })
    }

    /// `durationMs / 60000` (IEEE-754 division; stored as a fractional
    /// minutes value). Increments the lifetime counter or the current
    /// monthly period depending on the plan.
    pub async fn record_usage(&self, org_id: &str, duration_ms: i64) -> Result<(), QuotaError> {
        let minutes = duration_ms as f64 / 60_000.0;

        let subscription = self
            .store
            .load_subscription(org_id)
            .await
            .map_err(|_| QuotaError::NoSubscription)?
            .ok_or(QuotaError::NoSubscription)?;

        let plan = self
            .store
            .load_plan(&subscription.plan_id)
            .await
            .map_err(|_| QuotaError::NoSubscription)?
            .ok_or(QuotaError::NoSubscription)?;

        if plan.quota_resets_monthly {
            let period = self.current_or_rolled_period(&subscription, Utc::now()).await?;
            self.store
                .increment_period_usage(&period.id, minutes)
                .await
                .map_err(|_| QuotaError::NoSubscription)?;
        } else {
            self.store
                .increment_lifetime_usage(&subscription.id, minutes)
                .await
                .map_err(|_| QuotaError::NoSubscription)?;
        }

        Ok(())
    }

    /// Find the `UsagePeriod` covering `now`, rolling one forward if the
    /// current period is missing or expired.
    ///
    /// Rollover policy (see DESIGN.md for the open-question resolution):
    /// the new `periodStart` advances by the previous period's length
    /// (`periodEnd - periodStart`), and `periodEnd` is `periodStart + 1
    /// calendar month`, matching the spec's literal description rather than
    /// a calendar-aligned reset.
    async fn current_or_rolled_period(
        &self,
        subscription: &crate::model::OrganizationSubscription,
        now: DateTime<Utc>,
    ) -> Result<crate::model::UsagePeriod, QuotaError> {
        if let Some(period) = self
            .store
            .find_current_usage_period(&subscription.id, now)
            .await
            .map_err(|_| QuotaError::NoSubscription)?
        {
            return Ok(period);
        }

        let (prev_start, prev_end) = (
            subscription.current_period_start,
            subscription.current_period_end.unwrap_or(subscription.current_period_start),
        );
        let period_length = prev_end - prev_start;
        let new_start = if prev_end > prev_start { prev_end } else { now };
        let new_start = new_start.max(prev_start + period_length);
        let new_end = new_start + Months::new(1);

        self.store
            .advance_subscription_period(&subscription.id, new_start, new_end)
            .await
            .map_err(|_| QuotaError::NoSubscription)?;

        self.store
            .create_usage_period(&subscription.id, new_start, new_end)
            .await
            .map_err(|_| QuotaError::NoSubscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minutes_conversion_matches_spec_example() {
        let minutes = 3141_i64 as f64 / 60_000.0;
        assert!((minutes - 0.05235).abs() < 1e-6);
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::model::{OrganizationSubscription, SubscriptionPlan, UsagePeriod};
    use crate::store::memory::InMemoryStore;
    use chrono::Duration as ChronoDuration;

    fn subscription(id: &str, org_id: &str, plan_id: &str, lifetime_usage_minutes: f64) -> OrganizationSubscription {
        let now = Utc::now();
        OrganizationSubscription {
            id: id.into(),
            organization_id: org_id.into(),
            plan_id: plan_id.into(),
            status: "active".into(),
            current_period_start: now - ChronoDuration::days(1),
            current_period_end: Some(now + ChronoDuration::days(29)),
            lifetime_usage_minutes,
        }
    }

    fn plan(id: &str, name: &str, quota_minutes: f64, quota_resets_monthly: bool) -> SubscriptionPlan {
        SubscriptionPlan {
            id: id.into(),
            slug: name.to_lowercase(),
            name: name.into(),
            quota_minutes,
            quota_resets_monthly,
        }
    }

    fn store_with(sub: OrganizationSubscription, p: SubscriptionPlan) -> Arc<InMemoryStore> {
        let store = InMemoryStore::default();
        store.subscriptions.lock().unwrap().push(sub);
        store.plans.lock().unwrap().push(p);
        Arc::new(store)
    }

    /// Spec §8 scenario 5: free plan, lifetime quota 60, usage already at 60.
    #[tokio::test]
    async fn check_quota_availability_rejects_when_lifetime_quota_exhausted() {
        let sub = subscription("sub-1", "org-1", "plan-free", 60.0);
        let store = store_with(sub, plan("plan-free", "Free", 60.0, false));
        let quota = QuotaService::new(store);

        let err = quota.check_quota_availability("org-1").await.unwrap_err();

        match err {
            QuotaError::QuotaExceeded {
                current_plan,
                quota_minutes,
                used_minutes,
            } => {
                assert_eq!(current_plan, "Free");
                assert_eq!(quota_minutes, 60.0);
                assert_eq!(used_minutes, 60.0);
            }
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn check_quota_availability_admits_under_lifetime_quota() {
        let sub = subscription("sub-1", "org-1", "plan-pro", 10.0);
        let store = store_with(sub, plan("plan-pro", "Pro", 500.0, false));
        let quota = QuotaService::new(store);

        let availability = quota.check_quota_availability("org-1").await.unwrap();

        assert!(availability.allowed);
        assert_eq!(availability.used_minutes, 10.0);
        assert_eq!(availability.remaining_minutes, 490.0);
    }

    #[tokio::test]
    async fn check_quota_availability_fails_with_no_subscription() {
        let store = Arc::new(InMemoryStore::default());
        let quota = QuotaService::new(store);

        let err = quota.check_quota_availability("org-missing").await.unwrap_err();
        assert!(matches!(err, QuotaError::NoSubscription));
    }

    #[tokio::test]
    async fn record_usage_increments_lifetime_counter_for_non_monthly_plan() {
        let sub = subscription("sub-1", "org-1", "plan-pro", 0.0);
        let store = store_with(sub, plan("plan-pro", "Pro", 500.0, false));
        let quota = QuotaService::new(store.clone());

        quota.record_usage("org-1", 3_141).await.unwrap();

        let updated = store.subscriptions.lock().unwrap()[0].lifetime_usage_minutes;
        assert!((updated - 3_141.0 / 60_000.0).abs() < 1e-9);
    }

    /// Spec §8 scenario 1: monthly plan, a session of 3141ms increments the
    /// current `UsagePeriod` by `3141/60000`, not the lifetime counter.
    #[tokio::test]
    async fn record_usage_increments_current_period_for_monthly_plan() {
        let sub = subscription("sub-1", "org-1", "plan-pro-monthly", 0.0);
        let now = Utc::now();
        let store = store_with(sub, plan("plan-pro-monthly", "Pro", 500.0, true));
        store.periods.lock().unwrap().push(UsagePeriod {
            id: "period-1".into(),
            subscription_id: "sub-1".into(),
            period_start: now - ChronoDuration::days(1),
            period_end: now + ChronoDuration::days(29),
            usage_minutes: 0.0,
        });
        let quota = QuotaService::new(store.clone());

        quota.record_usage("org-1", 3_141).await.unwrap();

        let periods = store.periods.lock().unwrap();
        assert_eq!(periods.len(), 1, "rollover must not have fired when a current period already covers now");
        assert!((periods[0].usage_minutes - 3_141.0 / 60_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn record_usage_rolls_forward_an_expired_monthly_period() {
        let now = Utc::now();
        let sub = OrganizationSubscription {
            current_period_start: now - ChronoDuration::days(60),
            current_period_end: Some(now - ChronoDuration::days(30)),
            ..subscription("sub-1", "org-1", "plan-pro-monthly", 0.0)
        };
        let store = store_with(sub, plan("plan-pro-monthly", "Pro", 500.0, true));
        let quota = QuotaService::new(store.clone());

        quota.record_usage("org-1", 60_000).await.unwrap();

        let periods = store.periods.lock().unwrap();
        assert_eq!(periods.len(), 1, "an expired period must roll one forward rather than reusing the stale row");
        assert!((periods[0].usage_minutes - 1.0).abs() < 1e-9);
        assert!(periods[0].period_start <= now && periods[0].period_end >= now, "rolled period must cover now");
    }
}
