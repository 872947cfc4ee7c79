use thiserror::Error;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis connection error: {0}")]
    ConnectionError(String),

    #[error("Redis command failed: {0}")]
    CommandError(#[from] redis::RedisError),

    #[error("Cache serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid TTL: {0}")]
    TtlError(String),
}

impl From<bb8::RunError<redis::RedisError>> for CacheError {
    fn from(error: bb8::RunError<redis::RedisError>) -> Self {
        CacheError::ConnectionError(error.to_string())
    }
}
