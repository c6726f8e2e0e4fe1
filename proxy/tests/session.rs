//! End-to-end session tests: a real `tokio::io::duplex` client side, a real
//! local TCP fake-upstream, and `MemoryStore` standing in for the metadata
//! database. Each test drives `session::run` exactly as the listener does.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use chrono::Utc;
use tokio::io::duplex;
use tokio::net::TcpListener;
use uuid::Uuid;

use dbbat_audit::{AuditEvent, AuditEventType, AuditLogger, AuditSink};
use dbbat_crypto::{database_aad, encrypt, EncryptionKey, PasswordVerifyCache};
use dbbat_proto::backend::{self, tag as backend_tag};
use dbbat_proto::codec;
use dbbat_proto::frontend::{startup_code, tag as frontend_tag};
use dbbat_store::{AccessLevel, Database, Grant, MemoryStore, Store, User};

use dbbat_proxy::capture::Ceilings;
use dbbat_proxy::config::StorageTarget;
use dbbat_proxy::session::{self, SessionContext};
use dbbat_proxy::upstream::UpstreamDialer;

const TEST_KEY: [u8; 32] = [7u8; 32];

struct TestAuditSink(Arc<MemoryStore>);

#[async_trait::async_trait]
impl AuditSink for TestAuditSink {
    async fn write(&self, event: AuditEvent) {
        let _ = Store::log_audit_event(self.0.as_ref(), event).await;
    }
}

/// Wires a `SessionContext` around an in-memory store. The dialer's own
/// guard target is unrelated to any grant's database, so a fixed loopback
/// address that nothing binds to is enough.
async fn make_context(store: Arc<MemoryStore>) -> Arc<SessionContext> {
    make_context_with_connect_timeout(store, Duration::from_secs(10)).await
}

async fn make_context_with_connect_timeout(store: Arc<MemoryStore>, connect_timeout: Duration) -> Arc<SessionContext> {
    let audit = Arc::new(AuditLogger::spawn(64, Arc::new(TestAuditSink(store.clone()))));
    let dialer = UpstreamDialer::new(StorageTarget {
        host: "203.0.113.1".to_string(),
        port: 1,
        database_name: "unused".to_string(),
    });
    let store: Arc<dyn Store> = store;
    Arc::new(SessionContext {
        store,
        audit,
        dialer,
        encryption_key: EncryptionKey::from_bytes(&TEST_KEY).unwrap(),
        password_cache: PasswordVerifyCache::new(Duration::from_secs(60)),
        ceilings: Ceilings::default(),
        connect_timeout,
    })
}

async fn seed_user_and_grant(
    store: &MemoryStore,
    upstream_addr: std::net::SocketAddr,
    access_level: AccessLevel,
    grant_active: bool,
) -> (Uuid, Database) {
    let user_id = Uuid::new_v4();
    store
        .insert_user(User {
            id: user_id,
            username: "alice".to_string(),
            password_hash: dbbat_crypto::hash_password("hunter2").unwrap(),
            disabled: false,
            created_at: Utc::now(),
        })
        .await;

    let db_id = Uuid::new_v4();
    let encrypted = encrypt(&EncryptionKey::from_bytes(&TEST_KEY).unwrap(), &database_aad(&db_id), b"target-secret");
    let database = Database {
        id: db_id,
        name: "analytics".to_string(),
        host: upstream_addr.ip().to_string(),
        port: upstream_addr.port(),
        database_name: "analytics".to_string(),
        target_username: "app".to_string(),
        encrypted_password: encrypted,
    };
    store.insert_database(database.clone()).await;

    let now = Utc::now();
    store
        .insert_grant(Grant {
            id: Uuid::new_v4(),
            user_id,
            database_id: db_id,
            access_level,
            starts_at: now - chrono::Duration::minutes(5),
            expires_at: if grant_active { now + chrono::Duration::hours(1) } else { now - chrono::Duration::minutes(1) },
            revoked_at: None,
            max_query_count: None,
            max_bytes_transferred: None,
            query_count: 0,
        })
        .await;

    (user_id, database)
}

fn encode_startup(user: &str, database: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i32(startup_code::PROTOCOL_3_0);
    for (k, v) in [("user", user), ("database", database)] {
        body.put_slice(k.as_bytes());
        body.put_u8(0);
        body.put_slice(v.as_bytes());
        body.put_u8(0);
    }
    body.put_u8(0);
    body
}

fn encode_password_message(password: &str) -> BytesMut {
    let mut body = BytesMut::with_capacity(password.len() + 1);
    body.put_slice(password.as_bytes());
    body.put_u8(0);
    body
}

fn encode_query(sql: &str) -> BytesMut {
    let mut body = BytesMut::with_capacity(sql.len() + 1);
    body.put_slice(sql.as_bytes());
    body.put_u8(0);
    body
}

fn encode_row_description_one_int_column(name: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i16(1);
    body.put_slice(name.as_bytes());
    body.put_u8(0);
    body.put_i32(0);
    body.put_i16(0);
    body.put_i32(23); // int4
    body.put_i16(4);
    body.put_i32(-1);
    body.put_i16(0);
    body
}

fn encode_data_row_one_column(value: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i16(1);
    body.put_i32(value.len() as i32);
    body.put_slice(value.as_bytes());
    body
}

fn encode_command_complete(tag: &str) -> BytesMut {
    let mut body = BytesMut::with_capacity(tag.len() + 1);
    body.put_slice(tag.as_bytes());
    body.put_u8(0);
    body
}

/// A fake upstream Postgres: accepts one connection, authenticates with
/// `AuthenticationOk`, and answers every `Query` with one row and
/// `CommandComplete`. Returns the SQL text of every query it saw.
async fn spawn_fake_upstream() -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut seen = Vec::new();

        // Startup phase: one untagged message, ignored beyond framing.
        codec::read_untagged(&mut stream).await.unwrap().unwrap();

        codec::write_tagged(&mut stream, backend_tag::AUTHENTICATION, &backend::encode_authentication_ok()).await.unwrap();
        codec::write_tagged(&mut stream, backend_tag::READY_FOR_QUERY, &backend::encode_ready_for_query(b'I')).await.unwrap();

        loop {
            let Some(msg) = codec::read_tagged(&mut stream).await.unwrap() else {
                break;
            };
            if msg.tag == frontend_tag::TERMINATE {
                break;
            }
            if msg.tag == frontend_tag::QUERY {
                let body = &msg.body;
                let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
                seen.push(String::from_utf8_lossy(&body[..end]).into_owned());

                codec::write_tagged(&mut stream, backend_tag::ROW_DESCRIPTION, &encode_row_description_one_int_column("n")).await.unwrap();
                codec::write_tagged(&mut stream, backend_tag::DATA_ROW, &encode_data_row_one_column("1")).await.unwrap();
                codec::write_tagged(&mut stream, backend_tag::COMMAND_COMPLETE, &encode_command_complete("SELECT 1")).await.unwrap();
                codec::write_tagged(&mut stream, backend_tag::READY_FOR_QUERY, &backend::encode_ready_for_query(b'I')).await.unwrap();
            }
        }
        seen
    });

    (addr, handle)
}

/// Like `spawn_fake_upstream`, but any query text containing "FAIL" gets an
/// `ErrorResponse` instead of a row + `CommandComplete`.
async fn spawn_fake_upstream_that_fails_on_keyword() -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut seen = Vec::new();

        codec::read_untagged(&mut stream).await.unwrap().unwrap();
        codec::write_tagged(&mut stream, backend_tag::AUTHENTICATION, &backend::encode_authentication_ok()).await.unwrap();
        codec::write_tagged(&mut stream, backend_tag::READY_FOR_QUERY, &backend::encode_ready_for_query(b'I')).await.unwrap();

        loop {
            let Some(msg) = codec::read_tagged(&mut stream).await.unwrap() else {
                break;
            };
            if msg.tag == frontend_tag::TERMINATE {
                break;
            }
            if msg.tag == frontend_tag::QUERY {
                let body = &msg.body;
                let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
                let sql = String::from_utf8_lossy(&body[..end]).into_owned();
                let failing = sql.contains("FAIL");
                seen.push(sql);

                if failing {
                    codec::write_tagged(&mut stream, backend_tag::ERROR_RESPONSE, &backend::encode_error_response("ERROR", "42601", "synthetic failure")).await.unwrap();
                } else {
                    codec::write_tagged(&mut stream, backend_tag::ROW_DESCRIPTION, &encode_row_description_one_int_column("n")).await.unwrap();
                    codec::write_tagged(&mut stream, backend_tag::DATA_ROW, &encode_data_row_one_column("1")).await.unwrap();
                    codec::write_tagged(&mut stream, backend_tag::COMMAND_COMPLETE, &encode_command_complete("SELECT 1")).await.unwrap();
                }
                codec::write_tagged(&mut stream, backend_tag::READY_FOR_QUERY, &backend::encode_ready_for_query(b'I')).await.unwrap();
            }
        }
        seen
    });

    (addr, handle)
}

#[tokio::test]
async fn failed_query_is_finalized_and_does_not_stall_the_next_one() {
    let store = Arc::new(MemoryStore::new());
    let (upstream_addr, upstream) = spawn_fake_upstream_that_fails_on_keyword().await;
    seed_user_and_grant(&store, upstream_addr, AccessLevel::Write, true).await;
    let ctx = make_context(store.clone()).await;

    let (mut client, server) = duplex(64 * 1024);
    let session_task = tokio::spawn(session::run(ctx, server, "127.0.0.1:9999".to_string()));

    codec::write_untagged(&mut client, &encode_startup("alice", "analytics")).await.unwrap();
    codec::read_tagged(&mut client).await.unwrap().unwrap(); // auth request
    codec::write_tagged(&mut client, frontend_tag::PASSWORD, &encode_password_message("hunter2")).await.unwrap();
    codec::read_tagged(&mut client).await.unwrap().unwrap(); // AuthenticationOk
    codec::read_tagged(&mut client).await.unwrap().unwrap(); // ReadyForQuery

    codec::write_tagged(&mut client, frontend_tag::QUERY, &encode_query("SELECT FAIL")).await.unwrap();
    let err = codec::read_tagged(&mut client).await.unwrap().unwrap();
    assert_eq!(err.tag, backend_tag::ERROR_RESPONSE);
    let ready = codec::read_tagged(&mut client).await.unwrap().unwrap();
    assert_eq!(ready.tag, backend_tag::READY_FOR_QUERY);

    codec::write_tagged(&mut client, frontend_tag::QUERY, &encode_query("SELECT 1")).await.unwrap();
    let row_desc = codec::read_tagged(&mut client).await.unwrap().unwrap();
    assert_eq!(row_desc.tag, backend_tag::ROW_DESCRIPTION);
    let data_row = codec::read_tagged(&mut client).await.unwrap().unwrap();
    assert_eq!(data_row.tag, backend_tag::DATA_ROW);
    let complete = codec::read_tagged(&mut client).await.unwrap().unwrap();
    assert_eq!(complete.tag, backend_tag::COMMAND_COMPLETE);
    let ready2 = codec::read_tagged(&mut client).await.unwrap().unwrap();
    assert_eq!(ready2.tag, backend_tag::READY_FOR_QUERY);

    codec::write_tagged(&mut client, frontend_tag::TERMINATE, &[]).await.unwrap();
    drop(client);

    session_task.await.unwrap();
    let seen = upstream.await.unwrap();
    assert_eq!(seen, vec!["SELECT FAIL".to_string(), "SELECT 1".to_string()]);

    let queries = store.queries().await;
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[0].sql_text, "SELECT FAIL");
    assert!(queries[0].error.is_some());
    assert_eq!(queries[1].sql_text, "SELECT 1");
    assert!(queries[1].error.is_none());
}

#[tokio::test]
async fn admitted_query_round_trips_and_is_captured() {
    let store = Arc::new(MemoryStore::new());
    let (upstream_addr, upstream) = spawn_fake_upstream().await;
    seed_user_and_grant(&store, upstream_addr, AccessLevel::Write, true).await;
    let ctx = make_context(store.clone()).await;

    let (mut client, server) = duplex(64 * 1024);
    let session_task = tokio::spawn(session::run(ctx, server, "127.0.0.1:9999".to_string()));

    codec::write_untagged(&mut client, &encode_startup("alice", "analytics")).await.unwrap();
    let auth_req = codec::read_tagged(&mut client).await.unwrap().unwrap();
    assert_eq!(auth_req.tag, backend_tag::AUTHENTICATION);

    codec::write_tagged(&mut client, frontend_tag::PASSWORD, &encode_password_message("hunter2")).await.unwrap();
    let auth_ok = codec::read_tagged(&mut client).await.unwrap().unwrap();
    assert_eq!(auth_ok.tag, backend_tag::AUTHENTICATION);
    let ready = codec::read_tagged(&mut client).await.unwrap().unwrap();
    assert_eq!(ready.tag, backend_tag::READY_FOR_QUERY);

    codec::write_tagged(&mut client, frontend_tag::QUERY, &encode_query("SELECT 1")).await.unwrap();
    let row_desc = codec::read_tagged(&mut client).await.unwrap().unwrap();
    assert_eq!(row_desc.tag, backend_tag::ROW_DESCRIPTION);
    let data_row = codec::read_tagged(&mut client).await.unwrap().unwrap();
    assert_eq!(data_row.tag, backend_tag::DATA_ROW);
    let complete = codec::read_tagged(&mut client).await.unwrap().unwrap();
    assert_eq!(complete.tag, backend_tag::COMMAND_COMPLETE);
    let ready2 = codec::read_tagged(&mut client).await.unwrap().unwrap();
    assert_eq!(ready2.tag, backend_tag::READY_FOR_QUERY);

    codec::write_tagged(&mut client, frontend_tag::TERMINATE, &[]).await.unwrap();
    drop(client);

    session_task.await.unwrap();
    let seen = upstream.await.unwrap();
    assert_eq!(seen, vec!["SELECT 1".to_string()]);

    let queries = store.queries().await;
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].sql_text, "SELECT 1");
    assert!(!queries[0].truncated);

    let events = store.audit_events().await;
    assert!(events.iter().any(|e| e.event_type == AuditEventType::AuthSuccess));
    assert!(events.iter().any(|e| e.event_type == AuditEventType::SessionClosed));
}

#[tokio::test]
async fn read_only_grant_denies_write_before_it_reaches_upstream() {
    let store = Arc::new(MemoryStore::new());
    let (upstream_addr, upstream) = spawn_fake_upstream().await;
    seed_user_and_grant(&store, upstream_addr, AccessLevel::Read, true).await;
    let ctx = make_context(store.clone()).await;

    let (mut client, server) = duplex(64 * 1024);
    let session_task = tokio::spawn(session::run(ctx, server, "127.0.0.1:9999".to_string()));

    codec::write_untagged(&mut client, &encode_startup("alice", "analytics")).await.unwrap();
    codec::read_tagged(&mut client).await.unwrap().unwrap(); // auth request
    codec::write_tagged(&mut client, frontend_tag::PASSWORD, &encode_password_message("hunter2")).await.unwrap();
    codec::read_tagged(&mut client).await.unwrap().unwrap(); // AuthenticationOk
    codec::read_tagged(&mut client).await.unwrap().unwrap(); // ReadyForQuery

    codec::write_tagged(&mut client, frontend_tag::QUERY, &encode_query("INSERT INTO t VALUES (1)")).await.unwrap();
    let err = codec::read_tagged(&mut client).await.unwrap().unwrap();
    assert_eq!(err.tag, backend_tag::ERROR_RESPONSE);
    let ready = codec::read_tagged(&mut client).await.unwrap().unwrap();
    assert_eq!(ready.tag, backend_tag::READY_FOR_QUERY);

    codec::write_tagged(&mut client, frontend_tag::TERMINATE, &[]).await.unwrap();
    drop(client);

    session_task.await.unwrap();
    let seen = upstream.await.unwrap();
    assert!(seen.iter().all(|s| !s.starts_with("INSERT")), "the INSERT must never reach upstream: saw {seen:?}");

    let events = store.audit_events().await;
    assert!(events.iter().any(|e| e.event_type == AuditEventType::ReadOnlyViolation));
}

#[tokio::test]
async fn missing_grant_is_denied_without_dialing_upstream() {
    let store = Arc::new(MemoryStore::new());
    store
        .insert_user(User {
            id: Uuid::new_v4(),
            username: "alice".to_string(),
            password_hash: dbbat_crypto::hash_password("hunter2").unwrap(),
            disabled: false,
            created_at: Utc::now(),
        })
        .await;
    // No database/grant seeded: "analytics" is unknown to this store.

    let unreachable = "203.0.113.1:1".parse().unwrap();
    let ctx = make_context(store.clone()).await;

    let (mut client, server) = duplex(64 * 1024);
    let session_task = tokio::spawn(session::run(ctx, server, "127.0.0.1:9999".to_string()));

    codec::write_untagged(&mut client, &encode_startup("alice", "analytics")).await.unwrap();
    codec::read_tagged(&mut client).await.unwrap().unwrap(); // auth request
    codec::write_tagged(&mut client, frontend_tag::PASSWORD, &encode_password_message("hunter2")).await.unwrap();

    let err = codec::read_tagged(&mut client).await.unwrap().unwrap();
    assert_eq!(err.tag, backend_tag::ERROR_RESPONSE);
    let ready = codec::read_tagged(&mut client).await.unwrap().unwrap();
    assert_eq!(ready.tag, backend_tag::READY_FOR_QUERY);
    assert!(codec::read_tagged(&mut client).await.unwrap().is_none());

    drop(client);
    session_task.await.unwrap();

    let events = store.audit_events().await;
    assert!(events.iter().any(|e| e.event_type == AuditEventType::GrantMissing));
    assert!(store.queries().await.is_empty());
}

#[tokio::test]
async fn handshake_times_out_when_client_never_sends_startup() {
    let store = Arc::new(MemoryStore::new());
    let ctx = make_context_with_connect_timeout(store.clone(), Duration::from_millis(50)).await;

    let (client, server) = duplex(64 * 1024);
    let session_task = tokio::spawn(session::run(ctx, server, "127.0.0.1:9999".to_string()));

    tokio::time::timeout(Duration::from_secs(5), session_task)
        .await
        .expect("session::run must give up once connect_timeout elapses")
        .unwrap();

    drop(client);
}
