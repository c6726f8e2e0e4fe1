//! Simple Query Protocol: one `current` pending query at a time, admitted
//! or denied at `Query`, finalized on `CommandComplete`/cleared on
//! `ReadyForQuery`.

use serde_json::Value;

use dbbat_proto::backend::FieldDescription;

use crate::error::ProxyError;
use crate::interceptor::Interceptor;
use crate::policy;
use crate::state::{InterceptState, PendingQuery};

/// Quota check, then policy filters, then admit. On denial, nothing is
/// written to `current` and the caller must synthesize an `ErrorResponse`
/// plus `ReadyForQuery` without touching upstream.
pub fn admit_query(interceptor: &mut Interceptor, state: &mut InterceptState, sql: &str) -> Result<(), ProxyError> {
    interceptor.quota.check()?;
    policy::check(sql, interceptor.read_only)?;
    interceptor.quota.record_admitted_query();
    state.current = Some(PendingQuery::new(sql, None));
    Ok(())
}

/// The pending query that the next upstream response belongs to: `current`
/// under Simple Query Protocol, or the head of the Extended Query Protocol
/// FIFO when there's no Simple Query in flight.
pub fn active_pending(state: &mut InterceptState) -> Option<&mut PendingQuery> {
    if state.current.is_some() {
        state.current.as_mut()
    } else {
        state.pending_fifo.front_mut()
    }
}

pub fn on_row_description(state: &mut InterceptState, fields: Vec<FieldDescription>) {
    if let Some(current) = active_pending(state) {
        current.fields = fields;
    }
}

pub fn on_data_row(
    interceptor: &mut Interceptor,
    state: &mut InterceptState,
    row_data: Value,
    row_size_bytes: u64,
    max_rows: usize,
) {
    interceptor.quota.record_bytes(row_size_bytes);
    if let Some(current) = active_pending(state) {
        current.push_row(row_data, row_size_bytes, max_rows);
    }
}

pub fn on_error_response(state: &mut InterceptState, message: String) {
    if let Some(current) = active_pending(state) {
        current.error = Some(message);
    }
}

/// Takes (not clears) `current` so the caller can finalize and log it; the
/// slot itself is cleared on the subsequent `ReadyForQuery`.
pub fn take_current(state: &mut InterceptState) -> Option<PendingQuery> {
    state.current.take()
}

pub fn on_ready_for_query(state: &mut InterceptState) {
    state.current = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::QuotaEnforcer;
    use chrono::{Duration, Utc};
    use dbbat_store::{AccessLevel, Grant};
    use uuid::Uuid;

    fn read_only_interceptor() -> Interceptor {
        let now = Utc::now();
        let grant = Grant {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            database_id: Uuid::new_v4(),
            access_level: AccessLevel::Read,
            starts_at: now - Duration::hours(1),
            expires_at: now + Duration::hours(1),
            revoked_at: None,
            max_query_count: None,
            max_bytes_transferred: None,
            query_count: 0,
        };
        Interceptor::new(QuotaEnforcer::from_grant(&grant), true)
    }

    #[test]
    fn admits_select_under_read_grant() {
        let mut interceptor = read_only_interceptor();
        let mut state = InterceptState::new();
        assert!(admit_query(&mut interceptor, &mut state, "SELECT 1").is_ok());
        assert!(state.current.is_some());
    }

    #[test]
    fn denies_write_under_read_grant_without_touching_current() {
        let mut interceptor = read_only_interceptor();
        let mut state = InterceptState::new();
        let err = admit_query(&mut interceptor, &mut state, "INSERT INTO t VALUES (1)");
        assert!(matches!(err, Err(ProxyError::WriteNotPermitted)));
        assert!(state.current.is_none());
    }

    #[test]
    fn row_ceiling_clears_rows_but_keeps_the_count() {
        let mut interceptor = read_only_interceptor();
        let mut state = InterceptState::new();
        admit_query(&mut interceptor, &mut state, "SELECT 1").unwrap();
        for _ in 0..3 {
            on_data_row(&mut interceptor, &mut state, Value::Null, 1, 2);
        }
        let pending = take_current(&mut state).unwrap();
        assert!(pending.truncated);
        assert!(pending.rows.is_empty());
    }

    #[test]
    fn row_description_and_error_target_the_simple_current_slot() {
        let mut interceptor = read_only_interceptor();
        let mut state = InterceptState::new();
        admit_query(&mut interceptor, &mut state, "SELECT 1").unwrap();

        on_row_description(&mut state, vec![field("id")]);
        on_error_response(&mut state, "boom".to_string());

        let pending = take_current(&mut state).unwrap();
        assert_eq!(pending.fields.len(), 1);
        assert_eq!(pending.error.as_deref(), Some("boom"));
    }

    #[test]
    fn active_pending_falls_back_to_the_extended_fifo_head_when_no_simple_query_is_current() {
        let mut state = InterceptState::new();
        state.pending_fifo.push_back(PendingQuery::new("SELECT 2", None));

        on_row_description(&mut state, vec![field("n")]);

        assert_eq!(state.pending_fifo.front().unwrap().fields.len(), 1);
        assert!(state.current.is_none());
    }

    fn field(name: &str) -> FieldDescription {
        FieldDescription {
            name: name.to_string(),
            table_oid: 0,
            column_attr: 0,
            type_oid: 23,
            type_len: 4,
            type_modifier: -1,
            format_code: 0,
        }
    }
}
