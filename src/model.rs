//! Data model shared by the Quota Service, Durable Write Queue, and Session
//! Gateway.
//!
//! These are the semantic entities from the spec's data model, not the raw
//! row shapes `sqlx` returns — `store.rs` maps between the two.

use serde::{Deserialize, Serialize};

/// `Transcription.status`. Monotone along `IN_PROGRESS -> {COMPLETED, NO_DATA, FAILED}`;
/// a final write must never downgrade `COMPLETED` to `NO_DATA`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transcription_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TranscriptionStatus {
    InProgress,
    Completed,
    NoData,
    Failed,
}

/// A single speaker-attributed, merged segment — the unit persisted in
/// `transcriptionResult`/`translationResult`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    pub role: String,
    pub text: String,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,
}

/// A subscription plan, as read for quota admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub quota_minutes: f64,
    pub quota_resets_monthly: bool,
}

/// An organization's subscription row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationSubscription {
    pub id: String,
    pub organization_id: String,
    pub plan_id: String,
    pub status: String,
    pub current_period_start: chrono::DateTime<chrono::Utc>,
    pub current_period_end: Option<chrono::DateTime<chrono::Utc>>,
    pub lifetime_usage_minutes: f64,
}

/// A rolling monthly usage window; unique on `(subscription_id, period_start)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsagePeriod {
    pub id: String,
    pub subscription_id: String,
    pub period_start: chrono::DateTime<chrono::Utc>,
    pub period_end: chrono::DateTime<chrono::Utc>,
    pub usage_minutes: f64,
}

/// Result of [`crate::quota::QuotaService::check_quota_availability`].
#[derive(Debug, Clone, Serialize)]
pub struct QuotaAvailability {
    pub allowed: bool,
    pub remaining_minutes: f64,
    pub used_minutes: f64,
    pub quota_minutes: f64,
    pub plan_name: String,
}

/// A durable transcription record — the thing the Durable Write Queue upserts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionRecord {
    pub id: String,
    pub organization_id: String,
    pub duration_in_ms: i64,
    pub model_name: String,
    pub target_language: String,
    pub source_language: Option<String>,
    pub transcription_result: Option<Vec<Segment>>,
    pub translation_result: Option<Vec<Segment>>,
    pub vocabularies: Option<serde_json::Value>,
    pub status: TranscriptionStatus,
    pub version: i32,
}

/// A live event forwarded to the client as `translation:result`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationResult {
    pub text: String,
    #[serde(rename = "type")]
    pub kind: TokenKind,
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_language: Option<String>,
    pub timestamp: i64,
    pub is_final: bool,
    pub speaker: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Original,
    Translation,
}

/// One token from an upstream `tokens` batch, as received over the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamToken {
    pub text: String,
    pub translation_status: Option<String>,
    #[serde(default)]
    pub is_final: bool,
    pub speaker: Option<i64>,
}

/// A parsed inbound upstream message.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamMessage {
    #[serde(default)]
    pub tokens: Vec<UpstreamToken>,
    pub detected_language: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub finished: bool,
}
