use thiserror::Error;

use crate::linalg::LinalgError;

#[derive(Debug, Error)]
pub enum BanditError {
    #[error("Snapshot deserialization failed: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("Computation failed: {0}")]
    Computation(#[from] LinalgError),
    #[error("Persistence failed: {0}")]
    Persistence(String),
    #[error("Malformed model record: {0}")]
    Configuration(String),
    #[error("Unknown arm: {0}")]
    UnknownArm(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<rusqlite::Error> for BanditError {
    fn from(err: rusqlite::Error) -> Self {
        BanditError::Persistence(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BanditError>;
