use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("No such key exists")]
    NoSuchKey,
}

pub type Result<T> = std::result::Result<T, StoreError>;
