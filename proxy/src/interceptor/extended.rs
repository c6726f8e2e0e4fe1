//! Extended Query Protocol: Parse/Bind build up a per-session statement and
//! portal catalog; Execute enqueues onto a FIFO (the client may pipeline
//! many Executes before a Sync); Close tears down a statement or portal;
//! Sync is a pass-through. Unknown portal/statement names are logged and
//! skipped rather than rejected, matching Postgres's own tolerance.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::json;

use dbbat_proto::frontend::{Bind, Close, CloseKind, Execute, Parse};

use crate::capture::decode_binary_parameter;
use crate::error::ProxyError;
use crate::interceptor::Interceptor;
use crate::policy;
use crate::state::{InterceptState, PendingQuery, Portal, PreparedStatement};

/// Stores the prepared statement and runs the same policy checks Simple
/// Query Protocol runs at `Query` time, so a read-only or password-change
/// violation is caught at `Parse` rather than only at `Execute`.
pub fn on_parse(interceptor: &Interceptor, state: &mut InterceptState, parse: Parse) -> Result<(), ProxyError> {
    policy::check(&parse.query, interceptor.read_only)?;
    state.statements.insert(
        parse.statement_name.clone(),
        PreparedStatement {
            sql_text: parse.query,
            param_type_oids: parse.param_type_oids,
        },
    );
    Ok(())
}

fn resolve_format_code(formats: &[i16], index: usize) -> i16 {
    match formats.len() {
        0 => 0,
        1 => formats[0],
        _ => formats.get(index).copied().unwrap_or(0),
    }
}

/// Resolves the bound statement's parameter OIDs and builds the captured
/// parameter record: `values` (text form), `raw` (base64 of the wire
/// bytes), `format_codes`, `type_oids`. An unknown statement name is logged
/// and the bind is skipped rather than rejected.
pub fn on_bind(state: &mut InterceptState, bind: Bind) {
    let Some(statement) = state.statements.get(&bind.statement_name) else {
        tracing::debug!(statement = %bind.statement_name, "Bind referenced unknown statement, skipping");
        return;
    };

    let mut values = Vec::with_capacity(bind.params.len());
    let mut raw = Vec::with_capacity(bind.params.len());
    let mut format_codes = Vec::with_capacity(bind.params.len());
    let mut type_oids = Vec::with_capacity(bind.params.len());

    for (i, param) in bind.params.iter().enumerate() {
        let format = resolve_format_code(&bind.param_format_codes, i);
        let oid = statement.param_type_oids.get(i).copied().unwrap_or(0);
        format_codes.push(format);
        type_oids.push(oid);

        match param {
            None => {
                values.push(serde_json::Value::Null);
                raw.push(serde_json::Value::Null);
            }
            Some(bytes) => {
                raw.push(json!(STANDARD.encode(bytes)));
                let value = if format == 0 {
                    String::from_utf8_lossy(bytes).into_owned()
                } else {
                    decode_binary_parameter(oid, bytes)
                };
                values.push(json!(value));
            }
        }
    }

    let parameters = json!({
        "values": values,
        "raw": raw,
        "format_codes": format_codes,
        "type_oids": type_oids,
    });

    state.portals.insert(
        bind.portal.clone(),
        Portal {
            statement_name: bind.statement_name,
            parameters: Some(parameters),
        },
    );
}

/// Quota check, then enqueue. An unknown portal name is logged and skipped
/// (no pending query is enqueued, and the caller still forwards the
/// Execute: Postgres itself will answer with its own error).
pub fn on_execute(
    interceptor: &mut Interceptor,
    state: &mut InterceptState,
    execute: &Execute,
) -> Result<(), ProxyError> {
    interceptor.quota.check()?;

    let Some(portal) = state.portals.get(&execute.portal) else {
        tracing::debug!(portal = %execute.portal, "Execute referenced unknown portal, skipping");
        return Ok(());
    };
    let Some(statement) = state.statements.get(&portal.statement_name) else {
        tracing::debug!(statement = %portal.statement_name, "Execute referenced unknown statement, skipping");
        return Ok(());
    };

    interceptor.quota.record_admitted_query();
    state
        .pending_fifo
        .push_back(PendingQuery::new(statement.sql_text.clone(), portal.parameters.clone()));
    Ok(())
}

pub fn on_close(state: &mut InterceptState, close: Close) {
    match close.kind {
        CloseKind::Statement => {
            state.statements.remove(&close.name);
        }
        CloseKind::Portal => {
            state.portals.remove(&close.name);
        }
    }
}

/// Dequeues the oldest pending query so the caller can finalize and log it.
pub fn dequeue(state: &mut InterceptState) -> Option<PendingQuery> {
    state.pending_fifo.pop_front()
}
