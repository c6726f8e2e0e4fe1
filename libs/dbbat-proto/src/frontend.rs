//! Client-to-server message tags and decoders.

use crate::error::{ProtoError, Result};
use bytes::{Buf, Bytes};
use std::collections::HashMap;

pub mod tag {
    pub const PASSWORD: u8 = b'p';
    pub const QUERY: u8 = b'Q';
    pub const PARSE: u8 = b'P';
    pub const BIND: u8 = b'B';
    pub const EXECUTE: u8 = b'E';
    pub const DESCRIBE: u8 = b'D';
    pub const CLOSE: u8 = b'C';
    pub const SYNC: u8 = b'S';
    pub const FLUSH: u8 = b'H';
    pub const COPY_DATA: u8 = b'd';
    pub const COPY_DONE: u8 = b'c';
    pub const COPY_FAIL: u8 = b'f';
    pub const TERMINATE: u8 = b'X';
}

/// Well-known startup codes, sent in place of the protocol version field.
pub mod startup_code {
    pub const PROTOCOL_3_0: i32 = 0x0003_0000;
    pub const SSL_REQUEST: i32 = 80_877_103;
    pub const GSSENC_REQUEST: i32 = 80_877_104;
    pub const CANCEL_REQUEST: i32 = 80_877_102;
}

#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub params: HashMap<String, String>,
}

impl StartupMessage {
    pub fn user(&self) -> Option<&str> {
        self.params.get("user").map(String::as_str)
    }

    pub fn database(&self) -> Option<&str> {
        self.params
            .get("database")
            .map(String::as_str)
            .or_else(|| self.user())
    }

    pub fn application_name(&self) -> Option<&str> {
        self.params.get("application_name").map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub enum StartupLike {
    Startup(StartupMessage),
    SslRequest,
    GssEncRequest,
    CancelRequest { process_id: i32, secret_key: i32 },
}

/// Parse the body of an untagged startup-phase message (the body as framed
/// by [`crate::codec::read_untagged`], i.e. excluding the length prefix).
pub fn parse_startup_like(mut body: Bytes) -> Result<StartupLike> {
    if body.remaining() < 4 {
        return Err(ProtoError::Malformed("startup body shorter than code field"));
    }
    let code = body.get_i32();
    match code {
        startup_code::SSL_REQUEST => Ok(StartupLike::SslRequest),
        startup_code::GSSENC_REQUEST => Ok(StartupLike::GssEncRequest),
        startup_code::CANCEL_REQUEST => {
            if body.remaining() < 8 {
                return Err(ProtoError::Malformed("cancel request too short"));
            }
            Ok(StartupLike::CancelRequest {
                process_id: body.get_i32(),
                secret_key: body.get_i32(),
            })
        }
        startup_code::PROTOCOL_3_0 => {
            let params = parse_cstring_pairs(&mut body)?;
            Ok(StartupLike::Startup(StartupMessage { params }))
        }
        other => Err(ProtoError::UnsupportedProtocolVersion(other)),
    }
}

fn parse_cstring_pairs(body: &mut Bytes) -> Result<HashMap<String, String>> {
    let mut params = HashMap::new();
    loop {
        let key = read_cstring(body)?;
        if key.is_empty() {
            break;
        }
        let value = read_cstring(body)?;
        params.insert(key, value);
    }
    Ok(params)
}

/// Read a NUL-terminated string, advancing `buf` past the terminator.
pub fn read_cstring(buf: &mut Bytes) -> Result<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtoError::Malformed("unterminated C string"))?;
    let s = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance(end + 1);
    Ok(s)
}

#[derive(Debug, Clone)]
pub struct Parse {
    pub statement_name: String,
    pub query: String,
    pub param_type_oids: Vec<i32>,
}

pub fn parse_parse(mut body: Bytes) -> Result<Parse> {
    let statement_name = read_cstring(&mut body)?;
    let query = read_cstring(&mut body)?;
    if body.remaining() < 2 {
        return Err(ProtoError::Malformed("Parse missing param count"));
    }
    let count = body.get_i16() as usize;
    let mut param_type_oids = Vec::with_capacity(count);
    for _ in 0..count {
        if body.remaining() < 4 {
            return Err(ProtoError::Malformed("Parse truncated param oids"));
        }
        param_type_oids.push(body.get_i32());
    }
    Ok(Parse {
        statement_name,
        query,
        param_type_oids,
    })
}

#[derive(Debug, Clone)]
pub struct Bind {
    pub portal: String,
    pub statement_name: String,
    pub param_format_codes: Vec<i16>,
    pub params: Vec<Option<Bytes>>,
    pub result_format_codes: Vec<i16>,
}

pub fn parse_bind(mut body: Bytes) -> Result<Bind> {
    let portal = read_cstring(&mut body)?;
    let statement_name = read_cstring(&mut body)?;

    let fmt_count = read_i16(&mut body)? as usize;
    let mut param_format_codes = Vec::with_capacity(fmt_count);
    for _ in 0..fmt_count {
        param_format_codes.push(read_i16(&mut body)?);
    }

    let param_count = read_i16(&mut body)? as usize;
    let mut params = Vec::with_capacity(param_count);
    for _ in 0..param_count {
        let len = read_i32(&mut body)?;
        if len < 0 {
            params.push(None);
        } else {
            let len = len as usize;
            if body.remaining() < len {
                return Err(ProtoError::Malformed("Bind truncated parameter value"));
            }
            params.push(Some(body.split_to(len)));
        }
    }

    let result_fmt_count = read_i16(&mut body)? as usize;
    let mut result_format_codes = Vec::with_capacity(result_fmt_count);
    for _ in 0..result_fmt_count {
        result_format_codes.push(read_i16(&mut body)?);
    }

    Ok(Bind {
        portal,
        statement_name,
        param_format_codes,
        params,
        result_format_codes,
    })
}

#[derive(Debug, Clone)]
pub struct Execute {
    pub portal: String,
    pub max_rows: i32,
}

pub fn parse_execute(mut body: Bytes) -> Result<Execute> {
    let portal = read_cstring(&mut body)?;
    let max_rows = read_i32(&mut body)?;
    Ok(Execute { portal, max_rows })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Statement,
    Portal,
}

#[derive(Debug, Clone)]
pub struct Close {
    pub kind: CloseKind,
    pub name: String,
}

pub fn parse_close(mut body: Bytes) -> Result<Close> {
    if body.remaining() < 1 {
        return Err(ProtoError::Malformed("Close/Describe missing kind byte"));
    }
    let kind = match body.get_u8() {
        b'S' => CloseKind::Statement,
        b'P' => CloseKind::Portal,
        _ => return Err(ProtoError::Malformed("unknown Close/Describe kind")),
    };
    let name = read_cstring(&mut body)?;
    Ok(Close { kind, name })
}

/// `Describe` has the identical wire shape as `Close`.
pub type Describe = Close;
pub fn parse_describe(body: Bytes) -> Result<Describe> {
    parse_close(body)
}

pub fn parse_query(mut body: Bytes) -> Result<String> {
    read_cstring(&mut body)
}

pub fn parse_password_message(mut body: Bytes) -> Result<Vec<u8>> {
    // The password payload is a C string; for SASL/GSS exchanges it may not
    // be, but the proxy only ever requests cleartext password auth so this
    // is always a NUL-terminated string in practice.
    let end = body
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(body.len());
    Ok(body[..end].to_vec())
}

pub fn parse_copy_fail(mut body: Bytes) -> Result<String> {
    read_cstring(&mut body)
}

fn read_i16(buf: &mut Bytes) -> Result<i16> {
    if buf.remaining() < 2 {
        return Err(ProtoError::Malformed("truncated i16 field"));
    }
    Ok(buf.get_i16())
}

fn read_i32(buf: &mut Bytes) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(ProtoError::Malformed("truncated i32 field"));
    }
    Ok(buf.get_i32())
}
