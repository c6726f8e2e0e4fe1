use std::{fmt, io};

use thiserror::Error;

/// A small combinator for pluggable error logging.
pub fn log_error<E: fmt::Display>(e: E) -> E {
    tracing::error!("{e}");
    e
}

/// Marks errors that may be safely shown to a client.
///
/// NOTE: this trait should not be implemented for [`anyhow::Error`], since it
/// is way too convenient and tends to proliferate all across the codebase,
/// ultimately leading to accidental leaks of sensitive data.
pub trait UserFacingError: ReportableError {
    /// SQLSTATE sent in the synthesized `ErrorResponse`.
    fn sqlstate(&self) -> &'static str;

    /// Format the error for the client. Every proxy-synthesized message is
    /// prefixed with `dbbat:` so it can never be mistaken for an error
    /// forwarded verbatim from upstream.
    #[inline(always)]
    fn to_string_client(&self) -> String {
        self.to_string()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Wrong password, missing grant, policy denial: the client's fault.
    User,

    /// The client hung up or reset the connection.
    ClientDisconnect,

    /// The metadata store failed; logged and dropped on the async path.
    Store,

    /// The upstream connection misbehaved or disconnected.
    Upstream,

    /// internal errors
    Service,
}

impl ErrorKind {
    pub fn to_metric_label(&self) -> &'static str {
        match self {
            ErrorKind::User => "user",
            ErrorKind::ClientDisconnect => "clientdisconnect",
            ErrorKind::Store => "store",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Service => "service",
        }
    }
}

pub trait ReportableError: fmt::Display + Send + 'static {
    fn get_error_kind(&self) -> ErrorKind;
}

/// Every fallible operation on the hot path returns this. Variants that are
/// ever shown to a client implement [`UserFacingError`]; store errors on the
/// async audit/log path never reach here — they're logged and dropped where
/// they occur instead.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("dbbat: password authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },

    #[error("dbbat: no active grant for this user and database")]
    NoActiveGrant,

    #[error("dbbat: target database matches this proxy's own storage, refusing to connect")]
    StorageTargetRejected,

    #[error("dbbat: write not permitted under a read-only grant")]
    WriteNotPermitted,

    #[error("dbbat: read-only bypass attempt rejected")]
    ReadOnlyBypass,

    #[error("dbbat: password changes are not permitted through this proxy")]
    PasswordChangeDenied,

    #[error("dbbat: query limit exceeded for this grant")]
    QueryCountExceeded,

    #[error("dbbat: byte transfer limit exceeded for this grant")]
    ByteLimitExceeded,

    #[error("dbbat: unsupported upstream authentication method")]
    UnsupportedUpstreamAuth,

    #[error("dbbat: upstream rejected startup: {0}")]
    UpstreamRejected(String),

    #[error("dbbat: startup rejected: {0}")]
    StartupRejected(&'static str),

    #[error("dbbat: connection timed out during startup/authentication")]
    HandshakeTimedOut,

    #[error(transparent)]
    Protocol(#[from] dbbat_proto::ProtoError),

    #[error("store error: {0}")]
    Store(#[from] dbbat_store::StoreError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ReportableError for ProxyError {
    fn get_error_kind(&self) -> ErrorKind {
        use ProxyError::*;
        match self {
            AuthenticationFailed { .. }
            | NoActiveGrant
            | StorageTargetRejected
            | WriteNotPermitted
            | ReadOnlyBypass
            | PasswordChangeDenied
            | QueryCountExceeded
            | ByteLimitExceeded
            | StartupRejected(_)
            | HandshakeTimedOut => ErrorKind::User,
            UnsupportedUpstreamAuth | UpstreamRejected(_) => ErrorKind::Upstream,
            Protocol(_) => ErrorKind::Service,
            Store(_) => ErrorKind::Store,
            Io(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset
                ) =>
            {
                ErrorKind::ClientDisconnect
            }
            Io(_) => ErrorKind::Service,
        }
    }
}

impl UserFacingError for ProxyError {
    fn sqlstate(&self) -> &'static str {
        use ProxyError::*;
        match self {
            AuthenticationFailed { .. } => "28P01",
            NoActiveGrant => "28000",
            StorageTargetRejected => "08006",
            WriteNotPermitted | ReadOnlyBypass => "25006",
            PasswordChangeDenied => "42501",
            QueryCountExceeded | ByteLimitExceeded => "57014",
            UnsupportedUpstreamAuth | UpstreamRejected(_) => "08004",
            StartupRejected(_) => "08001",
            HandshakeTimedOut => "08001",
            Protocol(_) | Store(_) | Io(_) => "XX000",
        }
    }
}
