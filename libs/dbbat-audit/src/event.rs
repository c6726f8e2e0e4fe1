use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Classifies an [`AuditEvent`]. New variants should stay verb-free nouns so
/// `as_str` reads naturally as `event_type` in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    AuthSuccess,
    AuthFailure,
    GrantMissing,
    StorageTargetRejected,
    ReadOnlyViolation,
    ReadOnlyBypassAttempt,
    PasswordChangeAttempt,
    QuotaExceeded,
    SessionClosed,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::AuthSuccess => "auth_success",
            AuditEventType::AuthFailure => "auth_failure",
            AuditEventType::GrantMissing => "grant_missing",
            AuditEventType::StorageTargetRejected => "storage_target_rejected",
            AuditEventType::ReadOnlyViolation => "read_only_violation",
            AuditEventType::ReadOnlyBypassAttempt => "read_only_bypass_attempt",
            AuditEventType::PasswordChangeAttempt => "password_change_attempt",
            AuditEventType::QuotaExceeded => "quota_exceeded",
            AuditEventType::SessionClosed => "session_closed",
        }
    }
}

/// A single structured audit record. `details` carries whatever
/// event-specific context matters (denial reason, SQL prefix, byte counts)
/// as a JSON blob rather than a pile of optional columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub user_id: Option<Uuid>,
    pub performed_by: Option<Uuid>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, user_id: Option<Uuid>, details: serde_json::Value) -> Self {
        Self {
            event_type,
            user_id,
            performed_by: None,
            details,
            created_at: Utc::now(),
        }
    }
}
