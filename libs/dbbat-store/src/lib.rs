//! Domain types and the `Store` trait the proxy uses to reach its metadata
//! database: users, databases, grants, api keys, connections and the query
//! log. `PgStore` is the real sqlx-backed implementation; `MemoryStore` is
//! an in-memory fixture for tests.

mod error;
mod memory;
mod model;
mod pg;
mod store;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use model::{
    AccessLevel, ApiKeyKind, CapturedRow, Database, Grant, NewQuery, User, VerifiedApiKey,
};
pub use pg::PgStore;
pub use store::Store;
