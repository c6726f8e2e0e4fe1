//! Decodes bind parameters and result rows into their canonical textual/JSON
//! form, and enforces the row/byte ceilings on captured results.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde_json::Value;

use dbbat_proto::backend::FieldDescription;

pub mod oid {
    pub const BOOL: i32 = 16;
    pub const BYTEA: i32 = 17;
    pub const INT8: i32 = 20;
    pub const INT2: i32 = 21;
    pub const INT4: i32 = 23;
    pub const TEXT: i32 = 25;
    pub const JSON: i32 = 114;
    pub const FLOAT4: i32 = 700;
    pub const FLOAT8: i32 = 701;
    pub const BPCHAR: i32 = 1042;
    pub const VARCHAR: i32 = 1043;
    pub const NUMERIC: i32 = 1700;
    pub const JSONB: i32 = 3802;
}

/// Decode a binary-format bind parameter into its textual representation,
/// per the wire formats listed in the core's capture/decoder design.
/// Text-format parameters (`format_code == 0`) are passed through by the
/// caller without calling this at all.
pub fn decode_binary_parameter(type_oid: i32, bytes: &[u8]) -> String {
    use oid::*;
    match type_oid {
        BOOL => {
            if bytes.first() == Some(&1) {
                "true".to_string()
            } else {
                "false".to_string()
            }
        }
        INT2 if bytes.len() == 2 => {
            i16::from_be_bytes([bytes[0], bytes[1]]).to_string()
        }
        INT4 if bytes.len() == 4 => i32::from_be_bytes(bytes.try_into().unwrap()).to_string(),
        INT8 if bytes.len() == 8 => i64::from_be_bytes(bytes.try_into().unwrap()).to_string(),
        FLOAT4 if bytes.len() == 4 => f32::from_be_bytes(bytes.try_into().unwrap()).to_string(),
        FLOAT8 if bytes.len() == 8 => f64::from_be_bytes(bytes.try_into().unwrap()).to_string(),
        TEXT | VARCHAR | BPCHAR => String::from_utf8_lossy(bytes).into_owned(),
        BYTEA => STANDARD.encode(bytes),
        _ => format!("(oid:{type_oid}){}", STANDARD.encode(bytes)),
    }
}

/// Decode a single text-format column value into a JSON value, per the
/// same OID families. On parse failure the value degrades to its raw
/// string form rather than failing the whole row.
fn decode_text_column(type_oid: i32, text: &str) -> Value {
    use oid::*;
    match type_oid {
        BOOL => match text {
            "t" | "true" | "1" => Value::Bool(true),
            "f" | "false" | "0" => Value::Bool(false),
            other => Value::String(other.to_string()),
        },
        INT2 | INT4 | INT8 => text
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .unwrap_or_else(|_| Value::String(text.to_string())),
        FLOAT4 | FLOAT8 | NUMERIC => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(text.to_string())),
        JSON | JSONB => serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())),
        _ => Value::String(text.to_string()),
    }
}

/// Decode a `DataRow`'s columns (already parsed into raw wire values by
/// `dbbat_proto::backend::parse_data_row`) into its canonical JSON object,
/// keyed by column name (or `col_N` when `RowDescription` lacked one).
/// Returns the row object and the sum of raw wire-value lengths (NULLs
/// contribute 0), which is `row_size_bytes` and also feeds
/// `bytes_transferred`.
pub fn decode_data_row(fields: &[FieldDescription], columns: &[Option<Bytes>]) -> (Value, u64) {
    let mut obj = serde_json::Map::with_capacity(columns.len());
    let mut size = 0u64;

    for (i, col) in columns.iter().enumerate() {
        let name = fields
            .get(i)
            .map(|f| f.name.clone())
            .unwrap_or_else(|| format!("col_{i}"));
        let type_oid = fields.get(i).map(|f| f.type_oid).unwrap_or(0);

        let value = match col {
            None => Value::Null,
            Some(bytes) => {
                size += bytes.len() as u64;
                let text = String::from_utf8_lossy(bytes);
                decode_text_column(type_oid, &text)
            }
        };
        obj.insert(name, value);
    }

    (Value::Object(obj), size)
}

/// Ceilings applied to a single pending query's captured result.
#[derive(Debug, Clone, Copy)]
pub struct Ceilings {
    pub max_rows: usize,
    pub max_bytes: usize,
}

impl Default for Ceilings {
    fn default() -> Self {
        Self {
            max_rows: 100_000,
            max_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Unescape COPY TEXT format per Postgres's own escaping rules:
/// `\\`→`\`, and `\n`/`\r`/`\t`/`\b`/`\f` map to their literal characters.
pub fn copy_text_unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Split one line of COPY TEXT data (without its trailing newline) into its
/// raw fields, without unescaping yet — callers decide how to map `\N`.
pub fn copy_text_split_line(line: &str) -> Vec<&str> {
    line.split('\t').collect()
}
