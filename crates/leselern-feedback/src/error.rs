use leselern_bandits::BanditError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("signal log failed: {0}")]
    Log(String),
    #[error(transparent)]
    Bandit(#[from] BanditError),
    #[error("unknown impression: {0}")]
    UnknownImpression(String),
    #[error("invalid attribution config: {0}")]
    InvalidConfig(String),
}

impl From<rusqlite::Error> for FeedbackError {
    fn from(err: rusqlite::Error) -> Self {
        FeedbackError::Log(err.to_string())
    }
}

impl From<serde_json::Error> for FeedbackError {
    fn from(err: serde_json::Error) -> Self {
        FeedbackError::Log(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FeedbackError>;
