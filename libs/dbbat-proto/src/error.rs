use thiserror::Error;

/// Errors arising from reading or decoding PostgreSQL wire messages.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message body too large: {0} bytes")]
    TooLarge(usize),

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("unsupported startup protocol version {0:#x}")]
    UnsupportedProtocolVersion(i32),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
