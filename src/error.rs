use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("malformed row: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("subscription to {topic} rejected: {reason}")]
    Rejected { topic: String, reason: String },
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("vote id is missing")]
    MissingVoteId,
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("{key} out of range: {value}")]
    OutOfRange { key: &'static str, value: f64 },
}
