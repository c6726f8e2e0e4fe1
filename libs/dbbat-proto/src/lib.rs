//! PostgreSQL frontend/backend wire-protocol framing and message decoding.
//!
//! This crate knows how to frame messages (tag + length-prefixed body) and
//! decode the handful of message kinds the proxy needs to inspect. It does
//! not implement a full client or server driver: the proxy owns the session
//! state machine and drives this crate's decoders itself.

pub mod backend;
pub mod codec;
pub mod error;
pub mod frontend;

pub use error::{ProtoError, Result};
