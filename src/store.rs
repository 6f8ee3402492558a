//! Persistence Pool (D2)
//!
//! The datastore the Quota Service (C4) and Durable Write Queue (C5) write
//! through. Exposed as a `Store` trait — grounded on the raw `sqlx::query_as`/
//! `query_scalar` style used against a `DbPool` — so tests can swap in an
//! in-memory implementation without a live Postgres instance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::errors::PersistenceError;
use crate::model::{OrganizationSubscription, Segment, SubscriptionPlan, TranscriptionRecord, TranscriptionStatus, UsagePeriod};

pub type DbPool = sqlx::PgPool;

/// Reduced payload for an `update`-only upsert: overwrites only the
/// streaming fields. `target_language`/`source_language` are set only on
/// finalization, never on a periodic checkpoint.
#[derive(Debug, Clone, Default)]
pub struct TranscriptionUpdate {
    pub duration_in_ms: i64,
    pub transcription_result: Option<Vec<Segment>>,
    pub translation_result: Option<Vec<Segment>>,
    pub vocabularies: Option<serde_json::Value>,
    pub status: TranscriptionStatus,
    pub target_language: Option<String>,
    pub source_language: Option<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn load_subscription(&self, org_id: &str) -> Result<Option<OrganizationSubscription>, PersistenceError>;
    async fn load_plan(&self, plan_id: &str) -> Result<Option<SubscriptionPlan>, PersistenceError>;

    async fn find_current_usage_period(
        &self,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<UsagePeriod>, PersistenceError>;

    async fn create_usage_period(
        &self,
        subscription_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<UsagePeriod, PersistenceError>;

    async fn advance_subscription_period(
        &self,
        subscription_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    async fn increment_lifetime_usage(&self, subscription_id: &str, minutes: f64) -> Result<(), PersistenceError>;
    async fn increment_period_usage(&self, period_id: &str, minutes: f64) -> Result<(), PersistenceError>;

    /// `create` populates all columns; used on the first periodic save or
    /// finalization for a conversationId that has never been written.
    async fn upsert_transcription_create(&self, record: &TranscriptionRecord) -> Result<(), PersistenceError>;

    /// `update` overwrites only streaming fields on an existing row.
    async fn upsert_transcription_update(&self, id: &str, fields: &TranscriptionUpdate) -> Result<(), PersistenceError>;
}

/// Postgres-backed implementation.
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn load_subscription(&self, org_id: &str) -> Result<Option<OrganizationSubscription>, PersistenceError> {
        sqlx::query_as::<_, OrganizationSubscriptionRow>(
            "SELECT id, organization_id, plan_id, status, current_period_start, current_period_end, lifetime_usage_minutes \
             FROM organization_subscriptions WHERE organization_id = $1",
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await
        .map(|row| row.map(Into::into))
        .map_err(|e| PersistenceError::classify(&e))
    }

    async fn load_plan(&self, plan_id: &str) -> Result<Option<SubscriptionPlan>, PersistenceError> {
        sqlx::query_as::<_, SubscriptionPlanRow>(
            "SELECT id, slug, name, quota_minutes, quota_resets_monthly FROM subscription_plans WHERE id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map(|row| row.map(Into::into))
        .map_err(|e| PersistenceError::classify(&e))
    }

    async fn find_current_usage_period(
        &self,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<UsagePeriod>, PersistenceError> {
        sqlx::query_as::<_, UsagePeriodRow>(
            "SELECT id, subscription_id, period_start, period_end, usage_minutes FROM usage_periods \
             WHERE subscription_id = $1 AND period_start <= $2 AND period_end >= $2",
        )
        .bind(subscription_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map(|row| row.map(Into::into))
        .map_err(|e| PersistenceError::classify(&e))
    }

    async fn create_usage_period(
        &self,
        subscription_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<UsagePeriod, PersistenceError> {
        let row = sqlx::query(
            "INSERT INTO usage_periods (id, subscription_id, period_start, period_end, usage_minutes) \
             VALUES (gen_random_uuid()::text, $1, $2, $3, 0) \
             ON CONFLICT (subscription_id, period_start) DO UPDATE SET subscription_id = EXCLUDED.subscription_id \
             RETURNING id, subscription_id, period_start, period_end, usage_minutes",
        )
        .bind(subscription_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PersistenceError::classify(&e))?;

        Ok(UsagePeriod {
            id: row.get("id"),
            subscription_id: row.get("subscription_id"),
            period_start: row.get("period_start"),
            period_end: row.get("period_end"),
            usage_minutes: row.get("usage_minutes"),
        })
    }

    async fn advance_subscription_period(
        &self,
        subscription_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            "UPDATE organization_subscriptions SET current_period_start = $2, current_period_end = $3 WHERE id = $1",
        )
        .bind(subscription_id)
        .bind(period_start)
        .bind(period_end)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::classify(&e))?;
        Ok(())
    }

    async fn increment_lifetime_usage(&self, subscription_id: &str, minutes: f64) -> Result<(), PersistenceError> {
        sqlx::query(
            "UPDATE organization_subscriptions SET lifetime_usage_minutes = lifetime_usage_minutes + $2 WHERE id = $1",
        )
        .bind(subscription_id)
        .bind(minutes)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::classify(&e))?;
        Ok(())
    }

    async fn increment_period_usage(&self, period_id: &str, minutes: f64) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE usage_periods SET usage_minutes = usage_minutes + $2 WHERE id = $1")
            .bind(period_id)
            .bind(minutes)
            .execute(&self.pool)
            .await
            .map_err(|e| PersistenceError::classify(&e))?;
        Ok(())
    }

    async fn upsert_transcription_create(&self, record: &TranscriptionRecord) -> Result<(), PersistenceError> {
        let transcription_json = record.transcription_result.as_ref().map(|s| serde_json::to_string(s).unwrap_or_default());
        let translation_json = record.translation_result.as_ref().map(|s| serde_json::to_string(s).unwrap_or_default());

        sqlx::query(
            "INSERT INTO transcriptions (id, organization_id, duration_in_ms, model_name, target_language, source_language, \
             transcription_result, translation_result, vocabularies, status, version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 1) \
             ON CONFLICT (id) DO UPDATE SET \
               duration_in_ms = EXCLUDED.duration_in_ms, \
               transcription_result = EXCLUDED.transcription_result, \
               translation_result = EXCLUDED.translation_result, \
               vocabularies = EXCLUDED.vocabularies, \
               status = CASE WHEN transcriptions.status = 'COMPLETED' AND EXCLUDED.status = 'NO_DATA' \
                             THEN transcriptions.status ELSE EXCLUDED.status END, \
               version = transcriptions.version + 1",
        )
        .bind(&record.id)
        .bind(&record.organization_id)
        .bind(record.duration_in_ms)
        .bind(&record.model_name)
        .bind(&record.target_language)
        .bind(&record.source_language)
        .bind(transcription_json)
        .bind(translation_json)
        .bind(&record.vocabularies)
        .bind(record.status)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::classify(&e))?;
        Ok(())
    }

    async fn upsert_transcription_update(&self, id: &str, fields: &TranscriptionUpdate) -> Result<(), PersistenceError> {
        let transcription_json = fields.transcription_result.as_ref().map(|s| serde_json::to_string(s).unwrap_or_default());
        let translation_json = fields.translation_result.as_ref().map(|s| serde_json::to_string(s).unwrap_or_default());

        sqlx::query(
            "UPDATE transcriptions SET \
               duration_in_ms = $2, \
               transcription_result = COALESCE($3, transcription_result), \
               translation_result = COALESCE($4, translation_result), \
               vocabularies = COALESCE($5, vocabularies), \
               status = CASE WHEN status = 'COMPLETED' AND $6 = 'NO_DATA' THEN status ELSE $6 END, \
               target_language = COALESCE($7, target_language), \
               source_language = COALESCE($8, source_language), \
               version = version + 1 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(fields.duration_in_ms)
        .bind(transcription_json)
        .bind(translation_json)
        .bind(&fields.vocabularies)
        .bind(fields.status)
        .bind(&fields.target_language)
        .bind(&fields.source_language)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::classify(&e))?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct OrganizationSubscriptionRow {
    id: String,
    organization_id: String,
    plan_id: String,
    status: String,
    current_period_start: DateTime<Utc>,
    current_period_end: Option<DateTime<Utc>>,
    lifetime_usage_minutes: f64,
}

impl From<OrganizationSubscriptionRow> for OrganizationSubscription {
    fn from(r: OrganizationSubscriptionRow) -> Self {
        Self {
            id: r.id,
            organization_id: r.organization_id,
            plan_id: r.plan_id,
            status: r.status,
            current_period_start: r.current_period_start,
            current_period_end: r.current_period_end,
            lifetime_usage_minutes: r.lifetime_usage_minutes,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionPlanRow {
    id: String,
    slug: String,
    name: String,
    quota_minutes: f64,
    quota_resets_monthly: bool,
}

impl From<SubscriptionPlanRow> for SubscriptionPlan {
    fn from(r: SubscriptionPlanRow) -> Self {
        Self {
            id: r.id,
            slug: r.slug,
            name: r.name,
            quota_minutes: r.quota_minutes,
            quota_resets_monthly: r.quota_resets_monthly,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UsagePeriodRow {
    id: String,
    subscription_id: String,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    usage_minutes: f64,
}

impl From<UsagePeriodRow> for UsagePeriod {
    fn from(r: UsagePeriodRow) -> Self {
        Self {
            id: r.id,
            subscription_id: r.subscription_id,
            period_start: r.period_start,
            period_end: r.period_end,
            usage_minutes: r.usage_minutes,
        }
    }
}

/// In-memory `Store` double so C4/C5 logic can be exercised without a live
/// Postgres instance.
#[cfg(test)]
pub mod memory {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryStore {
        pub subscriptions: Mutex<Vec<OrganizationSubscription>>,
        pub plans: Mutex<Vec<SubscriptionPlan>>,
        pub periods: Mutex<Vec<UsagePeriod>>,
        pub transcriptions: Mutex<std::collections::HashMap<String, TranscriptionRecord>>,
    }

    #[async_trait]
    impl Store for InMemoryStore {
        async fn load_subscription(&self, org_id: &str) -> Result<Option<OrganizationSubscription>, PersistenceError> {
            Ok(self.subscriptions.lock().unwrap().iter().find(|s| s.organization_id == org_id).cloned())
        }

        async fn load_plan(&self, plan_id: &str) -> Result<Option<SubscriptionPlan>, PersistenceError> {
            Ok(self.plans.lock().unwrap().iter().find(|p| p.id == plan_id).cloned())
        }

        async fn find_current_usage_period(
            &self,
            subscription_id: &str,
            now: DateTime<Utc>,
        ) -> Result<Option<UsagePeriod>, PersistenceError> {
            Ok(self
                .periods
                .lock()
                .unwrap()
                .iter()
                .find(|p| p.subscription_id == subscription_id && p.period_start <= now && p.period_end >= now)
                .cloned())
        }

        async fn create_usage_period(
            &self,
            subscription_id: &str,
            period_start: DateTime<Utc>,
            period_end: DateTime<Utc>,
        ) -> Result<UsagePeriod, PersistenceError> {
            let period = UsagePeriod {
                id: format!("{subscription_id}-{}", period_start.timestamp()),
                subscription_id: subscription_id.to_string(),
                period_start,
                period_end,
                usage_minutes: 0.0,
            };
            self.periods.lock().unwrap().push(period.clone());
            Ok(period)
        }

        async fn advance_subscription_period(
            &self,
            subscription_id: &str,
            period_start: DateTime<Utc>,
            period_end: DateTime<Utc>,
        ) -> Result<(), PersistenceError> {
            let mut subs = self.subscriptions.lock().unwrap();
            if let Some(sub) = subs.iter_mut().find(|s| s.id == subscription_id) {
                sub.current_period_start = period_start;
                sub.current_period_end = Some(period_end);
            }
            Ok(())
        }

        async fn increment_lifetime_usage(&self, subscription_id: &str, minutes: f64) -> Result<(), PersistenceError> {
            let mut subs = self.subscriptions.lock().unwrap();
            if let Some(sub) = subs.iter_mut().find(|s| s.id == subscription_id) {
                sub.lifetime_usage_minutes += minutes;
            }
            Ok(())
        }

        async fn increment_period_usage(&self, period_id: &str, minutes: f64) -> Result<(), PersistenceError> {
            let mut periods = self.periods.lock().unwrap();
            if let Some(period) = periods.iter_mut().find(|p| p.id == period_id) {
                period.usage_minutes += minutes;
            }
            Ok(())
        }

        async fn upsert_transcription_create(&self, record: &TranscriptionRecord) -> Result<(), PersistenceError> {
            self.transcriptions.lock().unwrap().insert(record.id.clone(), record.clone());
            Ok(())
        }

        async fn upsert_transcription_update(&self, id: &str, fields: &TranscriptionUpdate) -> Result<(), PersistenceError> {
            let mut transcriptions = self.transcriptions.lock().unwrap();
            let Some(existing) = transcriptions.get_mut(id) else {
                return Err(PersistenceError::Permanent(format!("no existing row for {id}")));
            };
            existing.duration_in_ms = fields.duration_in_ms;
            if fields.transcription_result.is_some() {
                existing.transcription_result = fields.transcription_result.clone();
            }
            if fields.translation_result.is_some() {
                existing.translation_result = fields.translation_result.clone();
            }
            if existing.status == TranscriptionStatus::Completed && fields.status == TranscriptionStatus::NoData {
                // monotonicity guard, mirrors the SQL CASE in PgStore
            } else {
                existing.status = fields.status;
            }
            Ok(())
        }
    }
}
