use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("broker error: {0}")]
    Broker(#[from] redis::RedisError),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("envelope validation failed: {0}")]
    Envelope(String),

    #[error("uniqueness conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;
