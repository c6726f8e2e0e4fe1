use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Read,
    Write,
}

impl AccessLevel {
    pub fn is_read_only(&self) -> bool {
        matches!(self, AccessLevel::Read)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyKind {
    Api,
    Web,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Outcome of `Store::verify_api_key`: identifies the bearer without
/// exposing the stored hash to callers.
#[derive(Debug, Clone)]
pub struct VerifiedApiKey {
    pub user_id: Uuid,
    pub key_id: Uuid,
    pub kind: ApiKeyKind,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl VerifiedApiKey {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.map(|exp| now < exp).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub database_name: String,
    pub target_username: String,
    pub encrypted_password: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub id: Uuid,
    pub user_id: Uuid,
    pub database_id: Uuid,
    pub access_level: AccessLevel,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub max_query_count: Option<i64>,
    pub max_bytes_transferred: Option<i64>,
    pub query_count: i64,
}

impl Grant {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.starts_at <= now && now < self.expires_at
    }
}

/// A finished pending query, ready to be written to the log. `parameters`
/// holds the Extended Query Protocol's bind values (None for Simple Query
/// Protocol statements, which carry no out-of-band parameters).
#[derive(Debug, Clone)]
pub struct NewQuery {
    pub connection_id: Uuid,
    pub sql_text: String,
    pub parameters: Option<serde_json::Value>,
    pub start_time: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub rows_affected: Option<i64>,
    pub error: Option<String>,
    pub copy_direction: Option<String>,
    pub copy_format: Option<String>,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct CapturedRow {
    pub row_number: i64,
    pub row_data: serde_json::Value,
    pub row_size_bytes: i64,
}
