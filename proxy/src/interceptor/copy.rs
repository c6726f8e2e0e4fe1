//! COPY sub-protocol capture. `CopyOutResponse`/`CopyInResponse` open a
//! buffer bounded by the byte ceiling; `CopyData` appends to it; on
//! `CopyDone` the buffer is parsed (text format only) into captured rows
//! using the column names parsed out of the originating SQL. On overflow
//! the whole buffer is discarded, since a partial COPY capture is
//! semantically useless.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};

use crate::capture::{copy_text_split_line, copy_text_unescape};
use crate::quota::QuotaEnforcer;
use crate::state::{CopyDirection, CopyFormat, CopyState, PendingQuery};
use dbbat_store::CapturedRow;

fn column_list_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)COPY\s+\S+\s*\(([^)]*)\)").expect("static regex is valid"))
}

/// Parse the column names out of `COPY table(col1, col2) TO/FROM ...`. When
/// no explicit column list is given, an empty list is returned; the caller
/// falls back to positional `col_N` naming.
pub fn parse_copy_column_names(sql: &str) -> Vec<String> {
    column_list_re()
        .captures(sql)
        .map(|caps| {
            caps[1]
                .split(',')
                .map(|s| s.trim().trim_matches('"').to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

pub fn start(pending: &mut PendingQuery, direction: CopyDirection, binary_format: bool, sql: &str) {
    pending.copy = Some(CopyState {
        direction,
        format: if binary_format { CopyFormat::Binary } else { CopyFormat::Text },
        column_names: parse_copy_column_names(sql),
        buffer: Vec::new(),
        truncated: false,
    });
}

/// Append a `CopyData` chunk. On byte-ceiling overflow, discards the whole
/// buffer and marks it truncated; no error is raised to the client — the
/// COPY stream itself continues to completion, just uncaptured. Every chunk
/// counts against the grant's quota regardless of capture/truncation state,
/// the same as a Simple/Extended `DataRow` does.
pub fn on_copy_data(quota: &mut QuotaEnforcer, pending: &mut PendingQuery, chunk: &[u8], max_bytes: usize) {
    quota.record_bytes(chunk.len() as u64);
    let Some(copy) = pending.copy.as_mut() else { return };
    if copy.truncated {
        return;
    }
    if copy.buffer.len() + chunk.len() > max_bytes {
        copy.buffer.clear();
        copy.truncated = true;
        return;
    }
    copy.buffer.extend_from_slice(chunk);
}

/// On `CopyDone` for a text-format COPY, parse the accumulated buffer into
/// captured rows and propagate `truncated` onto the pending query itself.
/// Binary-format COPY is kept as opaque bytes only (not parsed). A parsed
/// row count over `max_rows` discards the whole buffer, same as Simple
/// Query Protocol's row ceiling.
pub fn finalize(pending: &mut PendingQuery, max_rows: usize) {
    let Some(copy) = pending.copy.take() else { return };
    pending.truncated = pending.truncated || copy.truncated;

    if copy.truncated || copy.format == CopyFormat::Binary {
        pending.copy = Some(CopyState { buffer: Vec::new(), ..copy });
        return;
    }

    let text = String::from_utf8_lossy(&copy.buffer);
    let mut rows = Vec::new();
    let mut row_number = 0i64;
    for line in text.split('\n') {
        if line.is_empty() || line == "\\." {
            continue;
        }
        row_number += 1;
        let row = decode_copy_line(line, &copy.column_names);
        rows.push(CapturedRow {
            row_number,
            row_data: row,
            row_size_bytes: line.len() as i64,
        });
    }

    pending.row_count = row_number;
    if row_number as usize > max_rows {
        pending.truncated = true;
    } else {
        pending.rows.extend(rows);
    }
    pending.copy = Some(CopyState { buffer: Vec::new(), ..copy });
}

fn decode_copy_line(line: &str, column_names: &[String]) -> Value {
    let fields = copy_text_split_line(line);
    let mut obj = serde_json::Map::with_capacity(fields.len());
    for (i, field) in fields.iter().enumerate() {
        let name = column_names.get(i).cloned().unwrap_or_else(|| format!("col_{i}"));
        let value = if *field == "\\N" {
            Value::Null
        } else {
            json!(copy_text_unescape(field))
        };
        obj.insert(name, value);
    }
    Value::Object(obj)
}
