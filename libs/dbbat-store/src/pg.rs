use dbbat_audit::AuditEvent;
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    AccessLevel, ApiKeyKind, CapturedRow, Database, Grant, NewQuery, User, VerifiedApiKey,
};
use crate::store::Store;

/// The production `Store`: a pooled connection to the relational metadata
/// database described in `users`/`databases`/`grants`/`connections`/
/// `queries`/`query_rows`/`audit_log`.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPool::connect(dsn).await?;
        Ok(Self::new(pool))
    }
}

fn access_level_from_str(s: &str) -> AccessLevel {
    match s {
        "write" => AccessLevel::Write,
        _ => AccessLevel::Read,
    }
}

fn api_key_kind_from_str(s: &str) -> ApiKeyKind {
    match s {
        "web" => ApiKeyKind::Web,
        _ => ApiKeyKind::Api,
    }
}

#[async_trait::async_trait]
impl Store for PgStore {
    async fn find_user_by_username(&self, name: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, username, password_hash, disabled, created_at \
             FROM users WHERE username = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| User {
            id: r.get("id"),
            username: r.get("username"),
            password_hash: r.get("password_hash"),
            disabled: r.get("disabled"),
            created_at: r.get("created_at"),
        }))
    }

    async fn find_user_by_uid(&self, uid: Uuid) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, username, password_hash, disabled, created_at \
             FROM users WHERE id = $1",
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| User {
            id: r.get("id"),
            username: r.get("username"),
            password_hash: r.get("password_hash"),
            disabled: r.get("disabled"),
            created_at: r.get("created_at"),
        }))
    }

    async fn verify_api_key(&self, plaintext: &str) -> Result<Option<VerifiedApiKey>> {
        // `key_prefix` is indexed and unique; the Argon2 hash comparison
        // itself is left to the caller once it has fetched `key_hash`. We
        // only do the O(1) prefix lookup here and re-verify the full hash
        // against `plaintext` before trusting the prefix match.
        let Some(prefix) = plaintext.get(..8) else {
            return Ok(None);
        };

        let row = sqlx::query(
            "SELECT user_id, id, kind, key_hash, expires_at, revoked_at \
             FROM api_keys WHERE key_prefix = $1",
        )
        .bind(prefix)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let key_hash: String = row.get("key_hash");
        match dbbat_crypto::verify_password(&key_hash, plaintext) {
            Ok(true) => {}
            Ok(false) | Err(_) => return Ok(None),
        }

        Ok(Some(VerifiedApiKey {
            user_id: row.get("user_id"),
            key_id: row.get("id"),
            kind: api_key_kind_from_str(row.get::<String, _>("kind").as_str()),
            expires_at: row.get("expires_at"),
            revoked_at: row.get("revoked_at"),
        }))
    }

    async fn find_database_by_uid(&self, uid: Uuid) -> Result<Option<Database>> {
        let row = sqlx::query(
            "SELECT id, name, host, port, database_name, target_username, encrypted_password \
             FROM databases WHERE id = $1",
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Database {
            id: r.get("id"),
            name: r.get("name"),
            host: r.get("host"),
            port: r.get::<i32, _>("port") as u16,
            database_name: r.get("database_name"),
            target_username: r.get("target_username"),
            encrypted_password: r.get("encrypted_password"),
        }))
    }

    async fn find_database_by_name(&self, name: &str) -> Result<Option<Database>> {
        let row = sqlx::query(
            "SELECT id, name, host, port, database_name, target_username, encrypted_password \
             FROM databases WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Database {
            id: r.get("id"),
            name: r.get("name"),
            host: r.get("host"),
            port: r.get::<i32, _>("port") as u16,
            database_name: r.get("database_name"),
            target_username: r.get("target_username"),
            encrypted_password: r.get("encrypted_password"),
        }))
    }

    async fn find_active_grant(&self, user_uid: Uuid, db_uid: Uuid) -> Result<Option<Grant>> {
        let row = sqlx::query(
            "SELECT id, user_id, database_id, access_level, starts_at, expires_at, \
                    revoked_at, max_query_count, max_bytes_transferred, query_count \
             FROM grants \
             WHERE user_id = $1 AND database_id = $2 \
               AND revoked_at IS NULL AND starts_at <= now() AND now() < expires_at",
        )
        .bind(user_uid)
        .bind(db_uid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Grant {
            id: r.get("id"),
            user_id: r.get("user_id"),
            database_id: r.get("database_id"),
            access_level: access_level_from_str(r.get::<String, _>("access_level").as_str()),
            starts_at: r.get("starts_at"),
            expires_at: r.get("expires_at"),
            revoked_at: r.get("revoked_at"),
            max_query_count: r.get("max_query_count"),
            max_bytes_transferred: r.get("max_bytes_transferred"),
            query_count: r.get("query_count"),
        }))
    }

    async fn create_connection(&self, user: Uuid, db: Uuid, src_ip: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO connections (id, user_id, database_id, src_ip, connected_at) \
             VALUES ($1, $2, $3, $4, now())",
        )
        .bind(id)
        .bind(user)
        .bind(db)
        .bind(src_ip)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn close_connection(&self, conn_uid: Uuid) -> Result<()> {
        sqlx::query("UPDATE connections SET disconnected_at = now() WHERE id = $1")
            .bind(conn_uid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_connection_stats(&self, conn_uid: Uuid, bytes: u64) -> Result<()> {
        sqlx::query(
            "UPDATE connections SET bytes_transferred = bytes_transferred + $2 WHERE id = $1",
        )
        .bind(conn_uid)
        .bind(bytes as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_query(&self, record: NewQuery) -> Result<Uuid> {
        let id = Uuid::now_v7();
        sqlx::query(
            "INSERT INTO queries \
                (id, connection_id, sql_text, parameters, start_time, duration_ms, \
                 rows_affected, error, copy_direction, copy_format, truncated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(id)
        .bind(record.connection_id)
        .bind(record.sql_text)
        .bind(record.parameters)
        .bind(record.start_time)
        .bind(record.duration_ms)
        .bind(record.rows_affected)
        .bind(record.error)
        .bind(record.copy_direction)
        .bind(record.copy_format)
        .bind(record.truncated)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn store_query_rows(&self, query_uid: Uuid, rows: Vec<CapturedRow>) -> Result<()> {
        // One insert per row keeps this readable; implementations that need
        // to make bulk inserts faster can swap this for `UNNEST`-based
        // batching without changing the trait surface.
        for row in rows {
            sqlx::query(
                "INSERT INTO query_rows (query_id, row_number, row_data, row_size_bytes) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(query_uid)
            .bind(row.row_number)
            .bind(row.row_data)
            .bind(row.row_size_bytes)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn log_audit_event(&self, event: AuditEvent) -> Result<()> {
        let id = Uuid::now_v7();
        sqlx::query(
            "INSERT INTO audit_log (id, event_type, user_id, performed_by, details, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(event.event_type.as_str())
        .bind(event.user_id)
        .bind(event.performed_by)
        .bind(event.details)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
