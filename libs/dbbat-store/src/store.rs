use dbbat_audit::AuditEvent;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{CapturedRow, Database, Grant, NewQuery, User, VerifiedApiKey};

/// Everything the proxy core needs from the metadata store. Implementations
/// are free to be a real relational store ([`crate::pg::PgStore`]) or an
/// in-memory fixture ([`crate::memory::MemoryStore`]) for tests; the core
/// never reaches past this trait.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn find_user_by_username(&self, name: &str) -> Result<Option<User>>;
    async fn find_user_by_uid(&self, uid: Uuid) -> Result<Option<User>>;
    async fn verify_api_key(&self, plaintext: &str) -> Result<Option<VerifiedApiKey>>;
    async fn find_database_by_uid(&self, uid: Uuid) -> Result<Option<Database>>;
    async fn find_database_by_name(&self, name: &str) -> Result<Option<Database>>;
    async fn find_active_grant(&self, user_uid: Uuid, db_uid: Uuid) -> Result<Option<Grant>>;
    async fn create_connection(&self, user: Uuid, db: Uuid, src_ip: &str) -> Result<Uuid>;
    async fn close_connection(&self, conn_uid: Uuid) -> Result<()>;
    async fn increment_connection_stats(&self, conn_uid: Uuid, bytes: u64) -> Result<()>;
    async fn create_query(&self, record: NewQuery) -> Result<Uuid>;
    async fn store_query_rows(&self, query_uid: Uuid, rows: Vec<CapturedRow>) -> Result<()>;
    async fn log_audit_event(&self, event: AuditEvent) -> Result<()>;
}
