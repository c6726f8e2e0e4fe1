//! Server-to-client message tags, decoders, and encoders for the handful of
//! messages the proxy synthesizes itself (auth challenges, errors,
//! `ReadyForQuery`). Everything else the upstream sends is forwarded as an
//! opaque [`crate::codec::RawMessage`].

use crate::error::{ProtoError, Result};
use crate::frontend::read_cstring;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub mod tag {
    pub const AUTHENTICATION: u8 = b'R';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ROW_DESCRIPTION: u8 = b'T';
    pub const DATA_ROW: u8 = b'D';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const COPY_IN_RESPONSE: u8 = b'G';
    pub const COPY_OUT_RESPONSE: u8 = b'H';
    pub const COPY_DATA: u8 = b'd';
    pub const COPY_DONE: u8 = b'c';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const NOTICE_RESPONSE: u8 = b'N';
}

pub mod auth_code {
    pub const OK: i32 = 0;
    pub const CLEARTEXT_PASSWORD: i32 = 3;
}

#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: i32,
    pub type_len: i16,
    pub type_modifier: i32,
    pub format_code: i16,
}

pub fn parse_row_description(mut body: Bytes) -> Result<Vec<FieldDescription>> {
    let count = read_i16(&mut body)? as usize;
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        let name = read_cstring(&mut body)?;
        let table_oid = read_i32(&mut body)?;
        let column_attr = read_i16(&mut body)?;
        let type_oid = read_i32(&mut body)?;
        let type_len = read_i16(&mut body)?;
        let type_modifier = read_i32(&mut body)?;
        let format_code = read_i16(&mut body)?;
        fields.push(FieldDescription {
            name,
            table_oid,
            column_attr,
            type_oid,
            type_len,
            type_modifier,
            format_code,
        });
    }
    Ok(fields)
}

/// A decoded `DataRow`: each column is either `None` (SQL NULL) or the raw
/// wire bytes of the value (text or binary, depending on the field format).
pub fn parse_data_row(mut body: Bytes) -> Result<Vec<Option<Bytes>>> {
    let count = read_i16(&mut body)? as usize;
    let mut cols = Vec::with_capacity(count);
    for _ in 0..count {
        let len = read_i32(&mut body)?;
        if len < 0 {
            cols.push(None);
        } else {
            let len = len as usize;
            if body.remaining() < len {
                return Err(ProtoError::Malformed("DataRow truncated column value"));
            }
            cols.push(Some(body.split_to(len)));
        }
    }
    Ok(cols)
}

pub fn parse_command_complete(mut body: Bytes) -> Result<String> {
    read_cstring(&mut body)
}

#[derive(Debug, Clone)]
pub struct CopyResponse {
    pub format: u8,
    pub column_formats: Vec<i16>,
}

pub fn parse_copy_response(mut body: Bytes) -> Result<CopyResponse> {
    if body.remaining() < 1 {
        return Err(ProtoError::Malformed("Copy response missing format byte"));
    }
    let format = body.get_u8();
    let count = read_i16(&mut body)? as usize;
    let mut column_formats = Vec::with_capacity(count);
    for _ in 0..count {
        column_formats.push(read_i16(&mut body)?);
    }
    Ok(CopyResponse {
        format,
        column_formats,
    })
}

/// The fields of an `ErrorResponse`/`NoticeResponse`, keyed by their
/// single-byte field code (`S` severity, `C` sqlstate, `M` message, ...).
pub fn parse_error_fields(mut body: Bytes) -> Result<Vec<(u8, String)>> {
    let mut fields = Vec::new();
    loop {
        if body.remaining() < 1 {
            return Err(ProtoError::Malformed("ErrorResponse missing terminator"));
        }
        let code = body.get_u8();
        if code == 0 {
            break;
        }
        let value = read_cstring(&mut body)?;
        fields.push((code, value));
    }
    Ok(fields)
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

// ---------------------------------------------------------------------
// Encoders for messages the proxy synthesizes.
// ---------------------------------------------------------------------

pub fn encode_authentication_cleartext_password() -> BytesMut {
    let mut body = BytesMut::with_capacity(4);
    body.put_i32(auth_code::CLEARTEXT_PASSWORD);
    body
}

pub fn encode_authentication_ok() -> BytesMut {
    let mut body = BytesMut::with_capacity(4);
    body.put_i32(auth_code::OK);
    body
}

pub fn encode_ready_for_query(status: u8) -> BytesMut {
    let mut body = BytesMut::with_capacity(1);
    body.put_u8(status);
    body
}

pub fn encode_parameter_status(name: &str, value: &str) -> BytesMut {
    let mut body = BytesMut::with_capacity(name.len() + value.len() + 2);
    body.put_slice(name.as_bytes());
    body.put_u8(0);
    body.put_slice(value.as_bytes());
    body.put_u8(0);
    body
}

pub fn encode_backend_key_data(process_id: i32, secret_key: i32) -> BytesMut {
    let mut body = BytesMut::with_capacity(8);
    body.put_i32(process_id);
    body.put_i32(secret_key);
    body
}

/// Build an `ErrorResponse` body. `severity` is e.g. `"ERROR"`/`"FATAL"`,
/// `sqlstate` a 5-character SQLSTATE code, `message` the human-readable text.
pub fn encode_error_response(severity: &str, sqlstate: &str, message: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u8(b'S');
    body.put_slice(severity.as_bytes());
    body.put_u8(0);
    body.put_u8(b'V');
    body.put_slice(severity.as_bytes());
    body.put_u8(0);
    body.put_u8(b'C');
    body.put_slice(sqlstate.as_bytes());
    body.put_u8(0);
    body.put_u8(b'M');
    body.put_slice(message.as_bytes());
    body.put_u8(0);
    body.put_u8(0);
    body
}
