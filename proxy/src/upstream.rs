//! Dials the target database: guards against the target resolving back to
//! the proxy's own metadata store, performs PostgreSQL startup as the
//! stored target credential, and applies the read-only session flag for
//! `read` grants. One upstream connection per client session; no pooling.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use dbbat_proto::backend::{self, tag as backend_tag};
use dbbat_proto::codec;
use dbbat_proto::frontend::{read_cstring, startup_code, tag as frontend_tag};
use dbbat_store::Database;

use crate::config::StorageTarget;
use crate::error::ProxyError;
use crate::scram;

mod auth_code {
    pub const OK: i32 = 0;
    pub const CLEARTEXT: i32 = 3;
    pub const MD5: i32 = 5;
    pub const SASL: i32 = 10;
    pub const SASL_CONTINUE: i32 = 11;
    pub const SASL_FINAL: i32 = 12;
}

pub struct UpstreamDialer {
    storage_target: StorageTarget,
}

impl UpstreamDialer {
    pub fn new(storage_target: StorageTarget) -> Self {
        Self { storage_target }
    }

    fn guard(&self, database: &Database) -> Result<(), ProxyError> {
        let same_target = database.port == self.storage_target.port
            && hosts_equivalent(&database.host, &self.storage_target.host)
            && database.database_name == self.storage_target.database_name;
        if same_target {
            return Err(ProxyError::StorageTargetRejected);
        }
        Ok(())
    }

    /// Opens the upstream connection, authenticated and (if `read_only`)
    /// already switched into a read-only transaction default. Returns the
    /// raw stream with its startup phase fully consumed; the caller owns
    /// framing everything from here on.
    pub async fn connect(
        &self,
        database: &Database,
        target_password: &str,
        application_name: &str,
        read_only: bool,
    ) -> Result<(TcpStream, Vec<codec::RawMessage>), ProxyError> {
        self.guard(database)?;

        let mut stream = TcpStream::connect((database.host.as_str(), database.port)).await?;
        send_startup(&mut stream, &database.target_username, &database.database_name, application_name).await?;
        authenticate(&mut stream, &database.target_username, target_password).await?;
        let startup_messages = drain_until_ready(&mut stream).await?;

        if read_only {
            run_to_ready(&mut stream, "SET SESSION default_transaction_read_only = on;").await?;
        }

        Ok((stream, startup_messages))
    }
}

fn hosts_equivalent(a: &str, b: &str) -> bool {
    normalize_host(a) == normalize_host(b)
}

fn normalize_host(h: &str) -> &str {
    match h {
        "127.0.0.1" | "::1" | "localhost" => "localhost",
        other => other,
    }
}

/// `dbbat-<version>` or `dbbat-<version> / <client_app_name>`, truncated so
/// the whole string is at most 63 bytes (PostgreSQL's parameter-value cap
/// by convention, not a hard protocol limit here).
pub fn upstream_application_name(client_app_name: Option<&str>) -> String {
    let identity = crate::config::proxy_identity();
    let full = match client_app_name {
        Some(name) if !name.is_empty() => format!("{identity} / {name}"),
        _ => identity,
    };
    truncate_to_byte_limit(&full, 63)
}

/// Truncates `s` to at most `max_bytes` bytes, stepping back to the nearest
/// UTF-8 character boundary instead of splitting a multi-byte code point.
fn truncate_to_byte_limit(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

async fn send_startup(stream: &mut TcpStream, user: &str, database: &str, application_name: &str) -> Result<(), ProxyError> {
    let mut body = BytesMut::new();
    body.put_i32(startup_code::PROTOCOL_3_0);
    put_cstring_pair(&mut body, "user", user);
    put_cstring_pair(&mut body, "database", database);
    put_cstring_pair(&mut body, "application_name", application_name);
    body.put_u8(0);
    codec::write_untagged(stream, &body).await?;
    Ok(())
}

fn put_cstring_pair(body: &mut BytesMut, key: &str, value: &str) {
    body.put_slice(key.as_bytes());
    body.put_u8(0);
    body.put_slice(value.as_bytes());
    body.put_u8(0);
}

async fn send_password_message(stream: &mut TcpStream, payload: &[u8]) -> Result<(), ProxyError> {
    let mut body = BytesMut::with_capacity(payload.len() + 1);
    body.put_slice(payload);
    body.put_u8(0);
    codec::write_tagged(stream, dbbat_proto::frontend::tag::PASSWORD, &body).await?;
    Ok(())
}

fn md5_password_payload(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{password}{user}")));
    let mut salted = inner.into_bytes();
    salted.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(salted))
}

/// Consumes `AuthenticationXXX` challenges until `AuthenticationOk`.
/// Cleartext, MD5, and SCRAM-SHA-256 are all answered; anything else is
/// rejected as unsupported rather than half-implemented.
async fn authenticate(stream: &mut TcpStream, user: &str, password: &str) -> Result<(), ProxyError> {
    loop {
        let msg = codec::read_tagged(stream)
            .await?
            .ok_or(ProxyError::StartupRejected("upstream closed during authentication"))?;

        if msg.tag == backend_tag::ERROR_RESPONSE {
            return Err(upstream_error(msg.body)?);
        }
        if msg.tag != backend_tag::AUTHENTICATION {
            return Err(ProxyError::StartupRejected("unexpected message during upstream authentication"));
        }

        let mut body: Bytes = msg.body;
        if body.remaining() < 4 {
            return Err(ProxyError::StartupRejected("truncated authentication request"));
        }
        match body.get_i32() {
            auth_code::OK => return Ok(()),
            auth_code::CLEARTEXT => {
                send_password_message(stream, password.as_bytes()).await?;
            }
            auth_code::MD5 => {
                if body.remaining() < 4 {
                    return Err(ProxyError::StartupRejected("truncated MD5 salt"));
                }
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                let payload = md5_password_payload(user, password, &salt);
                send_password_message(stream, payload.as_bytes()).await?;
            }
            auth_code::SASL => {
                let mechanisms = parse_sasl_mechanisms(body)?;
                if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
                    return Err(ProxyError::UnsupportedUpstreamAuth);
                }
                scram_exchange(stream, password).await?;
            }
            _ => return Err(ProxyError::UnsupportedUpstreamAuth),
        }
    }
}

fn parse_sasl_mechanisms(mut body: Bytes) -> Result<Vec<String>, ProxyError> {
    let mut mechanisms = Vec::new();
    while body.remaining() > 0 {
        let name = read_cstring(&mut body)?;
        if name.is_empty() {
            break;
        }
        mechanisms.push(name);
    }
    Ok(mechanisms)
}

/// Drives the SCRAM-SHA-256 challenge/response to completion: sends
/// `SASLInitialResponse`, expects `AuthenticationSASLContinue`, sends
/// `SASLResponse`, and verifies `AuthenticationSASLFinal` before the
/// eventual `AuthenticationOk`.
async fn scram_exchange(stream: &mut TcpStream, password: &str) -> Result<(), ProxyError> {
    let client = scram::client_first();
    send_sasl_initial_response(stream, scram::MECHANISM, client.message.as_bytes()).await?;

    let continue_msg = codec::read_tagged(stream)
        .await?
        .ok_or(ProxyError::StartupRejected("upstream closed during SCRAM exchange"))?;
    if continue_msg.tag == backend_tag::ERROR_RESPONSE {
        return Err(upstream_error(continue_msg.body)?);
    }
    let mut continue_body: Bytes = continue_msg.body;
    if continue_msg.tag != backend_tag::AUTHENTICATION || continue_body.remaining() < 4 || continue_body.get_i32() != auth_code::SASL_CONTINUE {
        return Err(ProxyError::StartupRejected("expected AuthenticationSASLContinue"));
    }
    let server_first = String::from_utf8(continue_body.to_vec())
        .map_err(|_| ProxyError::StartupRejected("SCRAM server-first message was not valid UTF-8"))?;

    let client_final = scram::client_final(&client, &server_first, password)?;
    send_sasl_response(stream, client_final.message.as_bytes()).await?;

    let final_msg = codec::read_tagged(stream)
        .await?
        .ok_or(ProxyError::StartupRejected("upstream closed during SCRAM exchange"))?;
    if final_msg.tag == backend_tag::ERROR_RESPONSE {
        return Err(upstream_error(final_msg.body)?);
    }
    let mut final_body: Bytes = final_msg.body;
    if final_msg.tag != backend_tag::AUTHENTICATION || final_body.remaining() < 4 || final_body.get_i32() != auth_code::SASL_FINAL {
        return Err(ProxyError::StartupRejected("expected AuthenticationSASLFinal"));
    }
    let server_final = String::from_utf8(final_body.to_vec())
        .map_err(|_| ProxyError::StartupRejected("SCRAM server-final message was not valid UTF-8"))?;
    scram::verify_server_final(&client_final, &server_final)
}

async fn send_sasl_initial_response(stream: &mut TcpStream, mechanism: &str, initial_response: &[u8]) -> Result<(), ProxyError> {
    let mut body = BytesMut::with_capacity(mechanism.len() + 5 + initial_response.len());
    body.put_slice(mechanism.as_bytes());
    body.put_u8(0);
    body.put_i32(initial_response.len() as i32);
    body.put_slice(initial_response);
    codec::write_tagged(stream, frontend_tag::PASSWORD, &body).await?;
    Ok(())
}

async fn send_sasl_response(stream: &mut TcpStream, response: &[u8]) -> Result<(), ProxyError> {
    codec::write_tagged(stream, frontend_tag::PASSWORD, response).await?;
    Ok(())
}

fn upstream_error(body: Bytes) -> Result<ProxyError, ProxyError> {
    let fields = backend::parse_error_fields(body)?;
    let message = fields
        .into_iter()
        .find(|(code, _)| *code == b'M')
        .map(|(_, value)| value)
        .unwrap_or_else(|| "upstream rejected the connection".to_string());
    Ok(ProxyError::UpstreamRejected(message))
}

/// After authentication, the upstream sends `ParameterStatus`/
/// `BackendKeyData` freely before `ReadyForQuery`. These are collected and
/// handed back so the session can relay them to the client verbatim, per
/// the startup sequence's documented order.
async fn drain_until_ready(stream: &mut TcpStream) -> Result<Vec<codec::RawMessage>, ProxyError> {
    let mut collected = Vec::new();
    loop {
        let msg = codec::read_tagged(stream)
            .await?
            .ok_or(ProxyError::StartupRejected("upstream closed before ReadyForQuery"))?;
        match msg.tag {
            t if t == backend_tag::READY_FOR_QUERY => return Ok(collected),
            t if t == backend_tag::ERROR_RESPONSE => return Err(upstream_error(msg.body)?),
            t if t == backend_tag::PARAMETER_STATUS || t == backend_tag::BACKEND_KEY_DATA => {
                collected.push(msg);
            }
            _ => continue,
        }
    }
}

/// Issues a statement via the Simple Query Protocol and drains responses up
/// to the next `ReadyForQuery`, failing on any `ErrorResponse`.
async fn run_to_ready(stream: &mut TcpStream, sql: &str) -> Result<(), ProxyError> {
    let mut body = BytesMut::with_capacity(sql.len() + 1);
    body.put_slice(sql.as_bytes());
    body.put_u8(0);
    codec::write_tagged(stream, dbbat_proto::frontend::tag::QUERY, &body).await?;
    stream.flush().await?;
    drain_until_ready(stream).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db(host: &str, port: u16, name: &str) -> Database {
        Database {
            id: uuid::Uuid::new_v4(),
            name: "analytics".to_string(),
            host: host.to_string(),
            port,
            database_name: name.to_string(),
            target_username: "app".to_string(),
            encrypted_password: vec![],
        }
    }

    #[test]
    fn guard_rejects_a_host_port_database_match() {
        let dialer = UpstreamDialer::new(StorageTarget { host: "localhost".to_string(), port: 5432, database_name: "dbbat".to_string() });
        let err = dialer.guard(&db("127.0.0.1", 5432, "dbbat"));
        assert!(matches!(err, Err(ProxyError::StorageTargetRejected)));
    }

    #[test]
    fn guard_allows_a_different_database_on_the_same_host() {
        let dialer = UpstreamDialer::new(StorageTarget { host: "localhost".to_string(), port: 5432, database_name: "dbbat".to_string() });
        assert!(dialer.guard(&db("localhost", 5432, "analytics")).is_ok());
    }

    #[test]
    fn upstream_application_name_appends_client_app_name() {
        let name = upstream_application_name(Some("psql"));
        assert!(name.starts_with(&crate::config::proxy_identity()));
        assert!(name.ends_with("/ psql"));
    }

    #[test]
    fn upstream_application_name_is_truncated_to_63_bytes() {
        let long_name = "x".repeat(200);
        let name = upstream_application_name(Some(&long_name));
        assert!(name.len() <= 63);
    }

    #[test]
    fn upstream_application_name_truncation_is_utf8_safe() {
        // Each character is 3 bytes; a char-count truncation would land
        // mid-codepoint well before 63 bytes are used.
        let long_name = "名".repeat(100);
        let name = upstream_application_name(Some(&long_name));
        assert!(name.len() <= 63);
        assert!(String::from_utf8(name.into_bytes()).is_ok());
    }

    #[test]
    fn md5_payload_has_the_md5_prefix_and_is_deterministic() {
        let a = md5_password_payload("app", "secret", &[1, 2, 3, 4]);
        let b = md5_password_payload("app", "secret", &[1, 2, 3, 4]);
        assert!(a.starts_with("md5"));
        assert_eq!(a, b);
    }

    #[test]
    fn parses_a_sasl_mechanism_list() {
        let mut body = BytesMut::new();
        body.put_slice(b"SCRAM-SHA-256-PLUS\0");
        body.put_slice(b"SCRAM-SHA-256\0");
        body.put_u8(0);
        let mechanisms = parse_sasl_mechanisms(body.freeze()).unwrap();
        assert_eq!(mechanisms, vec!["SCRAM-SHA-256-PLUS", "SCRAM-SHA-256"]);
    }
}
