//! Error taxonomy for the transcription relay
//!
//! Mirrors the source's error code scheme: a flat string taxonomy clients
//! can match on, backed here by `thiserror` enums per layer so internal
//! code gets typed propagation while the wire representation stays a
//! `{code, message}` pair.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes shared across the wire contract (`transcription:error`,
/// `quota:exceeded`) and internal logging.
pub struct ErrorCodes;

impl ErrorCodes {
    pub const AUTH_FAILED: &'static str = "AUTH_FAILED";
    pub const MISSING_SESSION_PARAMS: &'static str = "MISSING_SESSION_PARAMS";
    pub const NO_ACTIVE_ORGANIZATION: &'static str = "NO_ACTIVE_ORGANIZATION";
    pub const NO_SUBSCRIPTION: &'static str = "NO_SUBSCRIPTION";
    pub const QUOTA_EXCEEDED: &'static str = "QUOTA_EXCEEDED";
    pub const UPSTREAM_CONNECT_FAILED: &'static str = "UPSTREAM_CONNECT_FAILED";
    pub const UPSTREAM_STREAM_ERROR: &'static str = "UPSTREAM_STREAM_ERROR";
    pub const RECORDING_NOT_STARTED: &'static str = "RECORDING_NOT_STARTED";
    pub const PERSISTENCE_TRANSIENT: &'static str = "PERSISTENCE_TRANSIENT";
    pub const PERSISTENCE_PERMANENT: &'static str = "PERSISTENCE_PERMANENT";
}

/// Standard error object shape sent to the client alongside `transcription:error`
/// and `quota:exceeded` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StandardError {
    pub fn new(code: &str, message: impl Into<String>, details: Option<serde_json::Value>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details,
        }
    }
}

impl std::fmt::Display for StandardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for StandardError {}

/// Errors surfaced while establishing or running a Session Gateway connection.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication failed")]
    AuthFailed,

    #[error("missing required session parameter: {0}")]
    MissingSessionParams(&'static str),

    #[error("no active organization for this session")]
    NoActiveOrganization,

    #[error("upstream connection failed: {0}")]
    UpstreamConnectFailed(String),

    #[error("upstream stream error: {0}")]
    UpstreamStreamError(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::AuthFailed => ErrorCodes::AUTH_FAILED,
            GatewayError::MissingSessionParams(_) => ErrorCodes::MISSING_SESSION_PARAMS,
            GatewayError::NoActiveOrganization => ErrorCodes::NO_ACTIVE_ORGANIZATION,
            GatewayError::UpstreamConnectFailed(_) => ErrorCodes::UPSTREAM_CONNECT_FAILED,
            GatewayError::UpstreamStreamError(_) => ErrorCodes::UPSTREAM_STREAM_ERROR,
        }
    }
}

/// Errors from the Quota Service (C4).
#[derive(Debug, Error, Clone)]
pub enum QuotaError {
    #[error("no subscription for organization")]
    NoSubscription,

    #[error("quota exceeded")]
    QuotaExceeded {
        current_plan: String,
        quota_minutes: f64,
        used_minutes: f64,
    },
}

impl QuotaError {
    pub fn code(&self) -> &'static str {
        match self {
            QuotaError::NoSubscription => ErrorCodes::NO_SUBSCRIPTION,
            QuotaError::QuotaExceeded { .. } => ErrorCodes::QUOTA_EXCEEDED,
        }
    }

    /// Build the `data` payload of a `quota:exceeded` event. `currentPlan` is
    /// a required key of the wire contract even when there's no subscription
    /// to name a plan from — it's `null` rather than omitted in that case.
    pub fn to_details(&self) -> serde_json::Value {
        match self {
            QuotaError::NoSubscription => serde_json::json!({
                "currentPlan": null,
                "upgradeRequired": true,
            }),
            QuotaError::QuotaExceeded {
                current_plan,
                quota_minutes,
                used_minutes,
            } => serde_json::json!({
                "currentPlan": current_plan,
                "quotaMinutes": quota_minutes,
                "usedMinutes": used_minutes,
                "upgradeRequired": true,
            }),
        }
    }
}

/// Errors from the Durable Write Queue (C5) and persistence pool.
///
/// The transient/permanent split drives the retry-vs-drop decision: transient
/// errors (connection refused, DNS failure, timeout, deadlock) are retried
/// with backoff, permanent errors are logged and dropped immediately.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("transient persistence error: {0}")]
    Transient(String),

    #[error("permanent persistence error: {0}")]
    Permanent(String),
}

impl PersistenceError {
    pub fn code(&self) -> &'static str {
        match self {
            PersistenceError::Transient(_) => ErrorCodes::PERSISTENCE_TRANSIENT,
            PersistenceError::Permanent(_) => ErrorCodes::PERSISTENCE_PERMANENT,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PersistenceError::Transient(_))
    }

    /// Classify a raw datastore error by substring match, same heuristic the
    /// source uses: connection refused, DNS failure, timeout, and deadlock
    /// are treated as transient; everything else is permanent.
    pub fn classify(err: &sqlx::Error) -> Self {
        let msg = err.to_string();
        let lower = msg.to_lowercase();
        let transient = ["connection refused", "timed out", "timeout", "deadlock", "could not resolve host", "connection reset"]
            .iter()
            .any(|needle| lower.contains(needle));
        if transient {
            PersistenceError::Transient(msg)
        } else {
            PersistenceError::Permanent(msg)
        }
    }
}

/// Errors from the Upstream STT Adapter (C1) transport itself, as opposed to
/// [`GatewayError::UpstreamStreamError`] which is the session-facing wrapper.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("websocket error: {0}")]
    WebSocketError(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("connect timeout")]
    ConnectTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_exceeded_details_match_wire_contract() {
        let err = QuotaError::QuotaExceeded {
            current_plan: "Free".into(),
            quota_minutes: 60.0,
            used_minutes: 60.0,
        };
        let details = err.to_details();
        assert_eq!(details["currentPlan"], "Free");
        assert_eq!(details["upgradeRequired"], true);
    }

    #[test]
    fn no_subscription_details_still_carries_current_plan_key() {
        let details = QuotaError::NoSubscription.to_details();
        assert!(details.get("currentPlan").is_some());
        assert!(details["currentPlan"].is_null());
        assert_eq!(details["upgradeRequired"], true);
    }

    #[test]
    fn persistence_error_classifies_transient_by_substring() {
        let err = sqlx::Error::PoolTimedOut;
        assert!(PersistenceError::classify(&err).is_transient());
    }
}
