//! The intercept state a session's two pumps share: the prepared-statement
//! and portal catalogs, the pending-query FIFO, the current Simple Query
//! Protocol slot, and any in-flight COPY state. Guarded by a mutex (see
//! `session.rs`): the protocol already serializes writes to this state, but
//! the implementation does not rely on that alone.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use dbbat_proto::backend::FieldDescription;
use dbbat_store::CapturedRow;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub sql_text: String,
    pub param_type_oids: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct Portal {
    pub statement_name: String,
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    In,
    Out,
}

impl CopyDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyDirection::In => "in",
            CopyDirection::Out => "out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyFormat {
    Text,
    Binary,
}

impl CopyFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyFormat::Text => "text",
            CopyFormat::Binary => "binary",
        }
    }
}

/// COPY sub-protocol state for the query currently streaming bulk data.
#[derive(Debug, Clone)]
pub struct CopyState {
    pub direction: CopyDirection,
    pub format: CopyFormat,
    pub column_names: Vec<String>,
    pub buffer: Vec<u8>,
    pub truncated: bool,
}

/// Created on `Query` (Simple) or `Execute` (Extended); holds everything
/// needed to produce one `queries` log record plus its captured rows.
#[derive(Debug, Clone)]
pub struct PendingQuery {
    pub sql_text: String,
    pub parameters: Option<Value>,
    pub start_time: DateTime<Utc>,
    pub rows: Vec<CapturedRow>,
    pub row_count: i64,
    pub truncated: bool,
    pub fields: Vec<FieldDescription>,
    pub copy: Option<CopyState>,
    pub error: Option<String>,
}

impl PendingQuery {
    pub fn new(sql_text: impl Into<String>, parameters: Option<Value>) -> Self {
        Self {
            sql_text: sql_text.into(),
            parameters,
            start_time: Utc::now(),
            rows: Vec::new(),
            row_count: 0,
            truncated: false,
            fields: Vec::new(),
            copy: None,
            error: None,
        }
    }

    /// Append a captured row, subject to the row ceiling. On overflow the
    /// buffer is discarded entirely and `truncated` is set; subsequent rows
    /// are not accumulated for this query.
    pub fn push_row(&mut self, row_data: Value, row_size_bytes: u64, max_rows: usize) {
        if self.truncated {
            return;
        }
        self.row_count += 1;
        if self.row_count as usize > max_rows {
            self.rows.clear();
            self.truncated = true;
            return;
        }
        self.rows.push(CapturedRow {
            row_number: self.row_count,
            row_data,
            row_size_bytes: row_size_bytes as i64,
        });
    }
}

/// Per-session mutable intercept state, shared by the two pump tasks.
#[derive(Default)]
pub struct InterceptState {
    pub statements: HashMap<String, PreparedStatement>,
    pub portals: HashMap<String, Portal>,
    /// Simple Query Protocol's single slot.
    pub current: Option<PendingQuery>,
    /// Extended Query Protocol's pipeline: Execute enqueues, CommandComplete
    /// dequeues in FIFO order regardless of how many Executes preceded Sync.
    pub pending_fifo: VecDeque<PendingQuery>,
}

impl InterceptState {
    pub fn new() -> Self {
        Self::default()
    }
}
