use std::collections::HashMap;

use dbbat_audit::AuditEvent;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{CapturedRow, Database, Grant, NewQuery, User, VerifiedApiKey};
use crate::store::Store;

/// An in-memory [`Store`] for tests: no sqlx pool, no running Postgres.
/// Seed it directly via the `insert_*` methods, then inspect `queries()`,
/// `query_rows()` and `audit_events()` after driving a session against it.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    api_keys: HashMap<String, VerifiedApiKey>,
    databases: HashMap<Uuid, Database>,
    grants: HashMap<(Uuid, Uuid), Grant>,
    connections: HashMap<Uuid, bool>,
    connection_bytes: HashMap<Uuid, u64>,
    queries: Vec<(Uuid, NewQuery)>,
    query_rows: HashMap<Uuid, Vec<CapturedRow>>,
    audit_events: Vec<AuditEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        self.inner.lock().await.users.insert(user.id, user);
    }

    pub async fn insert_api_key(&self, plaintext: impl Into<String>, key: VerifiedApiKey) {
        self.inner.lock().await.api_keys.insert(plaintext.into(), key);
    }

    pub async fn insert_database(&self, db: Database) {
        self.inner.lock().await.databases.insert(db.id, db);
    }

    pub async fn insert_grant(&self, grant: Grant) {
        self.inner
            .lock()
            .await
            .grants
            .insert((grant.user_id, grant.database_id), grant);
    }

    pub async fn queries(&self) -> Vec<NewQuery> {
        self.inner.lock().await.queries.iter().map(|(_, q)| q.clone()).collect()
    }

    pub async fn query_rows_for(&self, query_uid: Uuid) -> Vec<CapturedRow> {
        self.inner
            .lock()
            .await
            .query_rows
            .get(&query_uid)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn audit_events(&self) -> Vec<AuditEvent> {
        self.inner.lock().await.audit_events.clone()
    }

    pub async fn connection_bytes(&self, conn_uid: Uuid) -> u64 {
        self.inner
            .lock()
            .await
            .connection_bytes
            .get(&conn_uid)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn find_user_by_username(&self, name: &str) -> Result<Option<User>> {
        Ok(self
            .inner
            .lock()
            .await
            .users
            .values()
            .find(|u| u.username == name)
            .cloned())
    }

    async fn find_user_by_uid(&self, uid: Uuid) -> Result<Option<User>> {
        Ok(self.inner.lock().await.users.get(&uid).cloned())
    }

    async fn verify_api_key(&self, plaintext: &str) -> Result<Option<VerifiedApiKey>> {
        Ok(self.inner.lock().await.api_keys.get(plaintext).cloned())
    }

    async fn find_database_by_uid(&self, uid: Uuid) -> Result<Option<Database>> {
        Ok(self.inner.lock().await.databases.get(&uid).cloned())
    }

    async fn find_database_by_name(&self, name: &str) -> Result<Option<Database>> {
        Ok(self
            .inner
            .lock()
            .await
            .databases
            .values()
            .find(|d| d.name == name)
            .cloned())
    }

    async fn find_active_grant(&self, user_uid: Uuid, db_uid: Uuid) -> Result<Option<Grant>> {
        Ok(self
            .inner
            .lock()
            .await
            .grants
            .get(&(user_uid, db_uid))
            .filter(|g| g.is_active(chrono::Utc::now()))
            .cloned())
    }

    async fn create_connection(&self, _user: Uuid, _db: Uuid, _src_ip: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.inner.lock().await.connections.insert(id, true);
        Ok(id)
    }

    async fn close_connection(&self, conn_uid: Uuid) -> Result<()> {
        self.inner.lock().await.connections.insert(conn_uid, false);
        Ok(())
    }

    async fn increment_connection_stats(&self, conn_uid: Uuid, bytes: u64) -> Result<()> {
        *self
            .inner
            .lock()
            .await
            .connection_bytes
            .entry(conn_uid)
            .or_insert(0) += bytes;
        Ok(())
    }

    async fn create_query(&self, record: NewQuery) -> Result<Uuid> {
        let id = Uuid::now_v7();
        self.inner.lock().await.queries.push((id, record));
        Ok(id)
    }

    async fn store_query_rows(&self, query_uid: Uuid, rows: Vec<CapturedRow>) -> Result<()> {
        self.inner.lock().await.query_rows.insert(query_uid, rows);
        Ok(())
    }

    async fn log_audit_event(&self, event: AuditEvent) -> Result<()> {
        self.inner.lock().await.audit_events.push(event);
        Ok(())
    }
}
