//! One task per client connection. A short, mostly-synchronous handshake
//! authenticates the client, resolves its grant, decrypts the target
//! credential and dials upstream; once that succeeds the connection is
//! split into two independent pump tasks (client→upstream, upstream→
//! client) that share intercept/quota state behind one mutex.
//!
//! The client-facing stream is generic so the handshake and pumps can be
//! driven directly in tests over `tokio::io::duplex`, without a listener.

use std::sync::Arc;

use serde_json::json;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use uuid::Uuid;

use dbbat_audit::{AuditEvent, AuditEventType, AuditLogger};
use dbbat_crypto::{EncryptionKey, PasswordVerifyCache};
use dbbat_proto::backend::{self, tag as backend_tag};
use dbbat_proto::codec;
use dbbat_proto::frontend::{self, tag as frontend_tag, StartupLike};
use dbbat_store::{Database, Grant, Store};

use crate::capture::Ceilings;
use crate::error::{log_error, ProxyError, UserFacingError};
use crate::interceptor::{self, copy, extended, simple, Interceptor};
use crate::quota::QuotaEnforcer;
use crate::state::{InterceptState, PendingQuery};
use crate::upstream::{self, UpstreamDialer};

/// Everything a session needs that outlives any single connection.
pub struct SessionContext {
    pub store: Arc<dyn Store>,
    pub audit: Arc<AuditLogger>,
    pub dialer: UpstreamDialer,
    pub encryption_key: EncryptionKey,
    pub password_cache: PasswordVerifyCache,
    pub ceilings: Ceilings,
    /// How long [`handshake`] may run before the connection is dropped.
    pub connect_timeout: std::time::Duration,
}

/// Intercept/quota state shared by the two pumps, behind one mutex: both
/// fields are touched from either direction (e.g. the upstream pump's
/// `DataRow` handling updates quota bytes as well as captured rows), so a
/// single lock avoids any ordering hazard between two separate ones.
struct SessionState {
    intercept: InterceptState,
    interceptor: Interceptor,
}

/// Drive one accepted client connection to completion. Never panics on a
/// misbehaving peer; every protocol/store/upstream failure is logged and
/// ends the session.
pub async fn run<C>(ctx: Arc<SessionContext>, mut client: C, peer_addr: String)
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let outcome = match tokio::time::timeout(ctx.connect_timeout, handshake(&ctx, &mut client, &peer_addr)).await {
        Ok(Ok(Some(outcome))) => outcome,
        Ok(Ok(None)) => return,
        Ok(Err(err)) => {
            log_error(&err);
            return;
        }
        Err(_) => {
            log_error(&ProxyError::HandshakeTimedOut);
            return;
        }
    };

    drive(ctx, client, outcome, peer_addr).await;
}

struct HandshakeOutcome {
    upstream: TcpStream,
    connection_id: Uuid,
    interceptor: Interceptor,
}

/// Runs the startup/authentication/grant-resolution/upstream-dial sequence.
/// `Ok(None)` means the connection was denied (and already told so) or the
/// client hung up before completing it; the caller has nothing left to do.
async fn handshake<C>(
    ctx: &Arc<SessionContext>,
    client: &mut C,
    peer_addr: &str,
) -> Result<Option<HandshakeOutcome>, ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let Some(startup) = read_startup(client).await? else {
        return Ok(None);
    };

    let username = match startup.user() {
        Some(u) => u.to_string(),
        None => {
            deny(client, &ProxyError::StartupRejected("missing user parameter")).await?;
            return Ok(None);
        }
    };
    let database_name = match startup.database() {
        Some(d) => d.to_string(),
        None => {
            deny(client, &ProxyError::StartupRejected("missing database parameter")).await?;
            return Ok(None);
        }
    };
    let client_app_name = startup.application_name().map(str::to_string);

    send_tagged(client, backend_tag::AUTHENTICATION, &backend::encode_authentication_cleartext_password()).await?;

    let Some(pw_msg) = codec::read_tagged(client).await? else {
        return Ok(None);
    };
    if pw_msg.tag != frontend_tag::PASSWORD {
        deny(client, &ProxyError::StartupRejected("expected a password message")).await?;
        return Ok(None);
    }
    let password_bytes = frontend::parse_password_message(pw_msg.body)?;
    let password = String::from_utf8_lossy(&password_bytes).into_owned();

    let user_id = match authenticate_client(ctx, &username, &password).await {
        Ok(id) => id,
        Err(err) => {
            ctx.audit
                .log(AuditEvent::new(AuditEventType::AuthFailure, None, json!({"username": username})))
                .await;
            deny(client, &err).await?;
            return Ok(None);
        }
    };

    // An unknown database name and a database with no active grant for
    // this user produce the same outcome, so a client can't tell the two
    // apart and enumerate database names it isn't authorized to see.
    let (database, grant) = match resolve_grant(&ctx.store, user_id, &database_name).await? {
        Some(pair) => pair,
        None => {
            ctx.audit
                .log(AuditEvent::new(
                    AuditEventType::GrantMissing,
                    Some(user_id),
                    json!({"database": database_name}),
                ))
                .await;
            deny(client, &ProxyError::NoActiveGrant).await?;
            return Ok(None);
        }
    };

    let target_password = match decrypt_target_password(&ctx.encryption_key, &database) {
        Ok(p) => p,
        Err(err) => {
            deny(client, &err).await?;
            return Ok(None);
        }
    };

    let read_only = grant.access_level.is_read_only();
    let application_name = upstream::upstream_application_name(client_app_name.as_deref());

    let (upstream_stream, startup_relay) = match ctx
        .dialer
        .connect(&database, &target_password, &application_name, read_only)
        .await
    {
        Ok(pair) => pair,
        Err(err) => {
            let event_type = match &err {
                ProxyError::StorageTargetRejected => AuditEventType::StorageTargetRejected,
                _ => AuditEventType::AuthFailure,
            };
            ctx.audit
                .log(AuditEvent::new(event_type, Some(user_id), json!({"database": database_name})))
                .await;
            deny(client, &err).await?;
            return Ok(None);
        }
    };

    // A metadata-store hiccup here shouldn't take down an otherwise fully
    // authorized session; fall back to a synthetic id and keep going.
    let connection_id = match ctx.store.create_connection(user_id, database.id, peer_addr).await {
        Ok(id) => id,
        Err(err) => {
            log_error(&err);
            Uuid::new_v4()
        }
    };

    ctx.audit
        .log(AuditEvent::new(
            AuditEventType::AuthSuccess,
            Some(user_id),
            json!({"database": database_name, "connection_id": connection_id}),
        ))
        .await;

    send_tagged(client, backend_tag::AUTHENTICATION, &backend::encode_authentication_ok()).await?;
    for msg in &startup_relay {
        codec::forward_raw(client, msg).await?;
    }
    send_tagged(client, backend_tag::READY_FOR_QUERY, &backend::encode_ready_for_query(b'I')).await?;

    Ok(Some(HandshakeOutcome {
        upstream: upstream_stream,
        connection_id,
        interceptor: Interceptor::new(QuotaEnforcer::from_grant(&grant), read_only),
    }))
}

async fn read_startup<C: AsyncRead + AsyncWrite + Unpin>(client: &mut C) -> Result<Option<frontend::StartupMessage>, ProxyError> {
    loop {
        let Some(raw) = codec::read_untagged(client).await? else {
            return Ok(None);
        };
        match frontend::parse_startup_like(raw.body)? {
            StartupLike::SslRequest | StartupLike::GssEncRequest => {
                client.write_all(b"N").await?;
                client.flush().await?;
            }
            StartupLike::CancelRequest { .. } => {
                tracing::debug!("cancel request received during startup, closing without response");
                return Ok(None);
            }
            StartupLike::Startup(msg) => return Ok(Some(msg)),
        }
    }
}

async fn authenticate_client(ctx: &SessionContext, username: &str, password: &str) -> Result<Uuid, ProxyError> {
    let auth_failed = || ProxyError::AuthenticationFailed { user: username.to_string() };

    if let Some(key) = ctx.store.verify_api_key(password).await? {
        return if key.is_usable(chrono::Utc::now()) {
            Ok(key.user_id)
        } else {
            Err(auth_failed())
        };
    }

    let user = ctx.store.find_user_by_username(username).await?.ok_or_else(auth_failed)?;
    if user.disabled {
        return Err(auth_failed());
    }

    match ctx.password_cache.verify(user.id, &user.password_hash, password).await {
        Ok(true) => Ok(user.id),
        Ok(false) | Err(_) => Err(auth_failed()),
    }
}

async fn resolve_grant(store: &Arc<dyn Store>, user_id: Uuid, database_name: &str) -> Result<Option<(Database, Grant)>, ProxyError> {
    let Some(database) = store.find_database_by_name(database_name).await? else {
        return Ok(None);
    };
    let Some(grant) = store.find_active_grant(user_id, database.id).await? else {
        return Ok(None);
    };
    Ok(Some((database, grant)))
}

fn decrypt_target_password(key: &EncryptionKey, database: &Database) -> Result<String, ProxyError> {
    let aad = dbbat_crypto::database_aad(&database.id);
    let plaintext = dbbat_crypto::decrypt(key, &aad, &database.encrypted_password)
        .map_err(|_| ProxyError::StartupRejected("could not decrypt stored credential"))?;
    String::from_utf8(plaintext).map_err(|_| ProxyError::StartupRejected("stored credential is not valid utf-8"))
}

async fn send_tagged<W: AsyncWrite + Unpin>(writer: &mut W, tag: u8, body: &[u8]) -> Result<(), ProxyError> {
    codec::write_tagged(writer, tag, body).await?;
    Ok(())
}

/// Synthesize `ErrorResponse` (+ `ReadyForQuery` when the caller is in
/// Simple Query context) straight onto the client stream.
async fn deny<W: AsyncWrite + Unpin>(writer: &mut W, err: &ProxyError) -> Result<(), ProxyError> {
    log_error(err);
    let body = backend::encode_error_response("ERROR", err.sqlstate(), &err.to_string_client());
    codec::write_tagged(writer, backend_tag::ERROR_RESPONSE, &body).await?;
    let rfq = backend::encode_ready_for_query(b'I');
    codec::write_tagged(writer, backend_tag::READY_FOR_QUERY, &rfq).await?;
    Ok(())
}

// ---------------------------------------------------------------------
// Post-handshake: split streams, spawn the two pumps.
// ---------------------------------------------------------------------

struct PumpShared<C> {
    ctx: Arc<SessionContext>,
    state: Mutex<SessionState>,
    client_write: Arc<Mutex<WriteHalf<C>>>,
    connection_id: Uuid,
}

async fn drive<C>(ctx: Arc<SessionContext>, client: C, outcome: HandshakeOutcome, peer_addr: String)
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_read, client_write) = split(client);
    let (upstream_read, upstream_write) = split(outcome.upstream);

    let shared = Arc::new(PumpShared {
        ctx: ctx.clone(),
        state: Mutex::new(SessionState {
            intercept: InterceptState::new(),
            interceptor: outcome.interceptor,
        }),
        client_write: Arc::new(Mutex::new(client_write)),
        connection_id: outcome.connection_id,
    });

    let client_side = tokio::spawn(client_pump(shared.clone(), client_read, upstream_write));
    let upstream_side = tokio::spawn(upstream_pump(shared.clone(), upstream_read));

    let (client_result, upstream_result) = tokio::join!(client_side, upstream_side);
    if let Ok(Err(err)) = client_result {
        log_error(&err);
    }
    if let Ok(Err(err)) = upstream_result {
        log_error(&err);
    }

    if let Err(err) = ctx.store.close_connection(shared.connection_id).await {
        log_error(&err);
    }
    ctx.audit
        .log(AuditEvent::new(
            AuditEventType::SessionClosed,
            None,
            json!({"connection_id": shared.connection_id, "peer_addr": peer_addr}),
        ))
        .await;
}

fn take_active_pending(state: &mut InterceptState) -> Option<PendingQuery> {
    if state.current.is_some() {
        simple::take_current(state)
    } else {
        extended::dequeue(state)
    }
}

async fn audit_denial(ctx: &SessionContext, err: &ProxyError) {
    let event_type = match err {
        ProxyError::WriteNotPermitted => AuditEventType::ReadOnlyViolation,
        ProxyError::ReadOnlyBypass => AuditEventType::ReadOnlyBypassAttempt,
        ProxyError::PasswordChangeDenied => AuditEventType::PasswordChangeAttempt,
        ProxyError::QueryCountExceeded | ProxyError::ByteLimitExceeded => AuditEventType::QuotaExceeded,
        _ => return,
    };
    ctx.audit.log(AuditEvent::new(event_type, None, json!({"error": err.to_string()}))).await;
}

/// Synthesize a denial onto the shared client writer without ever touching
/// upstream. `ready` is set for Simple Query Protocol denials, which must
/// complete the query round trip themselves; Extended Query Protocol
/// denials leave `ReadyForQuery` to the eventual `Sync`.
async fn deny_inline<C>(client_write: &Arc<Mutex<WriteHalf<C>>>, err: &ProxyError, ready: bool) -> Result<(), ProxyError>
where
    C: AsyncWrite + Unpin,
{
    log_error(err);
    let mut writer = client_write.lock().await;
    let body = backend::encode_error_response("ERROR", err.sqlstate(), &err.to_string_client());
    codec::write_tagged(&mut *writer, backend_tag::ERROR_RESPONSE, &body).await?;
    if ready {
        let rfq = backend::encode_ready_for_query(b'I');
        codec::write_tagged(&mut *writer, backend_tag::READY_FOR_QUERY, &rfq).await?;
    }
    Ok(())
}

/// Reads client messages, applies policy/quota checks, and forwards
/// everything admitted upstream verbatim. A denial is synthesized straight
/// back to the client; upstream never sees the denied message at all.
async fn client_pump<C>(
    shared: Arc<PumpShared<C>>,
    mut client_read: ReadHalf<C>,
    mut upstream_write: WriteHalf<TcpStream>,
) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let Some(msg) = codec::read_tagged(&mut client_read).await? else {
            return Ok(());
        };

        match msg.tag {
            t if t == frontend_tag::QUERY => {
                let sql = frontend::parse_query(msg.body.clone())?;
                let admitted = {
                    let mut guard = shared.state.lock().await;
                    let guard = &mut *guard;
                    simple::admit_query(&mut guard.interceptor, &mut guard.intercept, &sql)
                };
                match admitted {
                    Ok(()) => codec::forward_raw(&mut upstream_write, &msg).await?,
                    Err(err) => {
                        audit_denial(&shared.ctx, &err).await;
                        deny_inline(&shared.client_write, &err, true).await?;
                    }
                }
            }
            t if t == frontend_tag::PARSE => {
                let parse = frontend::parse_parse(msg.body.clone())?;
                let result = {
                    let mut guard = shared.state.lock().await;
                    let guard = &mut *guard;
                    extended::on_parse(&guard.interceptor, &mut guard.intercept, parse)
                };
                match result {
                    Ok(()) => codec::forward_raw(&mut upstream_write, &msg).await?,
                    Err(err) => {
                        audit_denial(&shared.ctx, &err).await;
                        deny_inline(&shared.client_write, &err, false).await?;
                    }
                }
            }
            t if t == frontend_tag::BIND => {
                let bind = frontend::parse_bind(msg.body.clone())?;
                {
                    let mut guard = shared.state.lock().await;
                    extended::on_bind(&mut guard.intercept, bind);
                }
                codec::forward_raw(&mut upstream_write, &msg).await?;
            }
            t if t == frontend_tag::EXECUTE => {
                let execute = frontend::parse_execute(msg.body.clone())?;
                let result = {
                    let mut guard = shared.state.lock().await;
                    let guard = &mut *guard;
                    extended::on_execute(&mut guard.interceptor, &mut guard.intercept, &execute)
                };
                match result {
                    Ok(()) => codec::forward_raw(&mut upstream_write, &msg).await?,
                    Err(err) => {
                        audit_denial(&shared.ctx, &err).await;
                        deny_inline(&shared.client_write, &err, false).await?;
                    }
                }
            }
            t if t == frontend_tag::CLOSE => {
                let close = frontend::parse_close(msg.body.clone())?;
                {
                    let mut guard = shared.state.lock().await;
                    extended::on_close(&mut guard.intercept, close);
                }
                codec::forward_raw(&mut upstream_write, &msg).await?;
            }
            t if t == frontend_tag::COPY_DATA => {
                {
                    let mut guard = shared.state.lock().await;
                    let guard = &mut *guard;
                    let max_bytes = shared.ctx.ceilings.max_bytes;
                    if let Some(pending) = simple::active_pending(&mut guard.intercept) {
                        copy::on_copy_data(&mut guard.interceptor.quota, pending, &msg.body, max_bytes);
                    }
                }
                codec::forward_raw(&mut upstream_write, &msg).await?;
            }
            t if t == frontend_tag::COPY_FAIL => {
                let reason = frontend::parse_copy_fail(msg.body.clone())?;
                {
                    let mut guard = shared.state.lock().await;
                    if let Some(pending) = simple::active_pending(&mut guard.intercept) {
                        pending.error = Some(reason);
                    }
                }
                codec::forward_raw(&mut upstream_write, &msg).await?;
            }
            t if t == frontend_tag::TERMINATE => {
                let _ = codec::forward_raw(&mut upstream_write, &msg).await;
                return Ok(());
            }
            // DESCRIBE, SYNC, FLUSH, COPY_DONE, PASSWORD (mid-session, never
            // expected): nothing to intercept, forward as-is.
            _ => codec::forward_raw(&mut upstream_write, &msg).await?,
        }
    }
}

/// Reads upstream messages, feeds `RowDescription`/`DataRow`/COPY state
/// into whichever pending query is active, and forwards everything to the
/// client verbatim. `CommandComplete` finalizes and schedules the async
/// store writes so the hot path never blocks on them.
async fn upstream_pump<C>(shared: Arc<PumpShared<C>>, mut upstream_read: ReadHalf<TcpStream>) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut last_reported_bytes: u64 = 0;

    loop {
        let Some(msg) = codec::read_tagged(&mut upstream_read).await? else {
            return Ok(());
        };

        match msg.tag {
            t if t == backend_tag::ROW_DESCRIPTION => {
                let fields = backend::parse_row_description(msg.body.clone())?;
                {
                    let mut guard = shared.state.lock().await;
                    simple::on_row_description(&mut guard.intercept, fields);
                }
                forward_to_client(&shared.client_write, &msg).await?;
            }
            t if t == backend_tag::DATA_ROW => {
                let columns = backend::parse_data_row(msg.body.clone())?;
                {
                    let mut guard = shared.state.lock().await;
                    let guard = &mut *guard;
                    let max_rows = shared.ctx.ceilings.max_rows;
                    let decoded = simple::active_pending(&mut guard.intercept)
                        .map(|pending| crate::capture::decode_data_row(&pending.fields, &columns));
                    if let Some((row, size)) = decoded {
                        simple::on_data_row(&mut guard.interceptor, &mut guard.intercept, row, size, max_rows);
                    }
                }
                forward_to_client(&shared.client_write, &msg).await?;
            }
            t if t == backend_tag::COPY_IN_RESPONSE || t == backend_tag::COPY_OUT_RESPONSE => {
                let response = backend::parse_copy_response(msg.body.clone())?;
                let direction = if t == backend_tag::COPY_IN_RESPONSE {
                    crate::state::CopyDirection::In
                } else {
                    crate::state::CopyDirection::Out
                };
                {
                    let mut guard = shared.state.lock().await;
                    if let Some(pending) = simple::active_pending(&mut guard.intercept) {
                        let sql = pending.sql_text.clone();
                        copy::start(pending, direction, response.format != 0, &sql);
                    }
                }
                forward_to_client(&shared.client_write, &msg).await?;
            }
            t if t == backend_tag::COPY_DATA => {
                {
                    let mut guard = shared.state.lock().await;
                    let guard = &mut *guard;
                    let max_bytes = shared.ctx.ceilings.max_bytes;
                    if let Some(pending) = simple::active_pending(&mut guard.intercept) {
                        copy::on_copy_data(&mut guard.interceptor.quota, pending, &msg.body, max_bytes);
                    }
                }
                forward_to_client(&shared.client_write, &msg).await?;
            }
            t if t == backend_tag::ERROR_RESPONSE => {
                // No `CommandComplete` follows a failed statement, so the
                // pending query is finalized and dequeued here instead —
                // otherwise it would sit at the FIFO head forever and the
                // next successful query's `CommandComplete` would finalize
                // the wrong (stale) entry.
                let message = error_message(msg.body.clone())?;
                let finished = {
                    let mut guard = shared.state.lock().await;
                    let guard = &mut *guard;
                    simple::on_error_response(&mut guard.intercept, message);
                    take_active_pending(&mut guard.intercept).map(|mut pending| {
                        copy::finalize(&mut pending, shared.ctx.ceilings.max_rows);
                        let rows = std::mem::take(&mut pending.rows);
                        let bytes_this_query: u64 = rows.iter().map(|r| r.row_size_bytes.max(0) as u64).sum();
                        let record = interceptor::finalize(pending, shared.connection_id, None);
                        (record, rows, bytes_this_query)
                    })
                };
                if let Some((record, rows, bytes_this_query)) = finished {
                    spawn_query_write(&shared.ctx, record, rows);
                    let total = {
                        let guard = shared.state.lock().await;
                        guard.interceptor.quota.bytes_transferred()
                    };
                    let delta = total.saturating_sub(last_reported_bytes).max(bytes_this_query);
                    last_reported_bytes = total;
                    if delta > 0 {
                        spawn_stats_write(shared.ctx.store.clone(), shared.connection_id, delta);
                    }
                }
                forward_to_client(&shared.client_write, &msg).await?;
            }
            t if t == backend_tag::COMMAND_COMPLETE => {
                let tag = backend::parse_command_complete(msg.body.clone())?;
                let finished = {
                    let mut guard = shared.state.lock().await;
                    let guard = &mut *guard;
                    take_active_pending(&mut guard.intercept).map(|mut pending| {
                        copy::finalize(&mut pending, shared.ctx.ceilings.max_rows);
                        let rows = std::mem::take(&mut pending.rows);
                        let bytes_this_query: u64 = rows.iter().map(|r| r.row_size_bytes.max(0) as u64).sum();
                        let record = interceptor::finalize(pending, shared.connection_id, Some(tag.as_str()));
                        (record, rows, bytes_this_query)
                    })
                };
                if let Some((record, rows, bytes_this_query)) = finished {
                    spawn_query_write(&shared.ctx, record, rows);
                    let total = {
                        let guard = shared.state.lock().await;
                        guard.interceptor.quota.bytes_transferred()
                    };
                    let delta = total.saturating_sub(last_reported_bytes).max(bytes_this_query);
                    last_reported_bytes = total;
                    if delta > 0 {
                        spawn_stats_write(shared.ctx.store.clone(), shared.connection_id, delta);
                    }
                }
                forward_to_client(&shared.client_write, &msg).await?;
            }
            t if t == backend_tag::READY_FOR_QUERY => {
                {
                    let mut guard = shared.state.lock().await;
                    simple::on_ready_for_query(&mut guard.intercept);
                }
                forward_to_client(&shared.client_write, &msg).await?;
            }
            // PARAMETER_STATUS, BACKEND_KEY_DATA, COPY_DONE, NOTICE_RESPONSE,
            // and anything else: opaque to the core, forward as-is.
            _ => forward_to_client(&shared.client_write, &msg).await?,
        }
    }
}

async fn forward_to_client<C: AsyncWrite + Unpin>(client_write: &Arc<Mutex<WriteHalf<C>>>, msg: &codec::RawMessage) -> Result<(), ProxyError> {
    let mut writer = client_write.lock().await;
    codec::forward_raw(&mut *writer, msg).await?;
    Ok(())
}

fn error_message(body: bytes::Bytes) -> Result<String, ProxyError> {
    let fields = backend::parse_error_fields(body)?;
    Ok(fields
        .into_iter()
        .find(|(code, _)| *code == b'M')
        .map(|(_, value)| value)
        .unwrap_or_else(|| "upstream error".to_string()))
}

fn spawn_query_write(ctx: &Arc<SessionContext>, record: dbbat_store::NewQuery, rows: Vec<dbbat_store::CapturedRow>) {
    let store = ctx.store.clone();
    tokio::spawn(async move {
        let query_id = match store.create_query(record).await {
            Ok(id) => id,
            Err(err) => {
                log_error(&err);
                return;
            }
        };
        if !rows.is_empty() {
            if let Err(err) = store.store_query_rows(query_id, rows).await {
                log_error(&err);
            }
        }
    });
}

fn spawn_stats_write(store: Arc<dyn Store>, connection_id: Uuid, bytes: u64) {
    tokio::spawn(async move {
        if let Err(err) = store.increment_connection_stats(connection_id, bytes).await {
            log_error(&err);
        }
    });
}
