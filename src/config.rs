use crate::constants::{DEFAULT_CONSUMER_GROUP, DEFAULT_STREAM_KEY, MAX_BODY_SIZE};
use crate::error::{IngestError, Result};

/// Runtime configuration, sourced from the environment (a `.env` file is
/// loaded by `main` before this runs). Every field has a local-dev default.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_host: String,
    pub app_port: u16,
    pub redis_url: String,
    pub stream_key: String,
    pub consumer_group: String,
    pub max_body_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let app_port = match std::env::var("APP_PORT") {
            Ok(v) => v
                .parse::<u16>()
                .map_err(|e| IngestError::Config(format!("invalid APP_PORT '{}': {}", v, e)))?,
            Err(_) => 8000,
        };
        let max_body_size = match std::env::var("MAX_BODY_SIZE") {
            Ok(v) => v
                .parse::<usize>()
                .map_err(|e| IngestError::Config(format!("invalid MAX_BODY_SIZE '{}': {}", v, e)))?,
            Err(_) => MAX_BODY_SIZE,
        };
        Ok(Self {
            app_host: std::env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            app_port,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),
            stream_key: std::env::var("STREAM_KEY")
                .unwrap_or_else(|_| DEFAULT_STREAM_KEY.to_string()),
            consumer_group: std::env::var("CONSUMER_GROUP")
                .unwrap_or_else(|_| DEFAULT_CONSUMER_GROUP.to_string()),
            max_body_size,
        })
    }
}
