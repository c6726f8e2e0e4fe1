use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("store row could not be decoded: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
