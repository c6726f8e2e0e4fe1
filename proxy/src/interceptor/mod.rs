//! Policy enforcement and query tracking for both the Simple and Extended
//! Query sub-protocols, plus COPY. A `Session` holds one `Interceptor`
//! behind a mutex shared by its two pumps (see `session.rs`); the functions
//! here take `&mut InterceptState` rather than locking themselves, so the
//! caller controls the critical section.

pub mod copy;
pub mod extended;
pub mod simple;

use chrono::Utc;
use uuid::Uuid;

use crate::quota::QuotaEnforcer;
use crate::state::PendingQuery;
use dbbat_store::NewQuery;

/// Checked and updated immediately before a Query/Execute is forwarded.
/// Quota state lives alongside the intercept state because both pumps need
/// to observe it (the upstream pump adds bytes as `DataRow`s arrive).
pub struct Interceptor {
    pub quota: QuotaEnforcer,
    pub read_only: bool,
}

impl Interceptor {
    pub fn new(quota: QuotaEnforcer, read_only: bool) -> Self {
        Self { quota, read_only }
    }
}

/// Extract rows-affected from a `CommandComplete` tag: the last
/// whitespace-separated token if (and only if) it parses as an integer.
/// `INSERT 0 N`, `UPDATE N`, `DELETE N`, `SELECT N` all end in a count;
/// `BEGIN`, `SET`, `COMMIT` etc. do not.
pub fn parse_rows_affected(tag: &str) -> Option<i64> {
    tag.split_whitespace().last()?.parse().ok()
}

/// Turn a finished `PendingQuery` into the record `Store::create_query`
/// persists, consuming any COPY state it was carrying.
pub fn finalize(pending: PendingQuery, connection_id: Uuid, command_tag: Option<&str>) -> NewQuery {
    let duration_ms = (Utc::now() - pending.start_time).num_milliseconds();
    let rows_affected = command_tag.and_then(parse_rows_affected);

    NewQuery {
        connection_id,
        sql_text: pending.sql_text,
        parameters: pending.parameters,
        start_time: pending.start_time,
        duration_ms: Some(duration_ms),
        rows_affected,
        error: pending.error,
        copy_direction: pending.copy.as_ref().map(|c| c.direction.as_str().to_string()),
        copy_format: pending.copy.as_ref().map(|c| c.format.as_str().to_string()),
        truncated: pending.truncated,
    }
}
