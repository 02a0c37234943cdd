//! Error types for Spendcast

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Not enough history to run a stage. Retrying is pointless until more
    /// expenses accrue.
    #[error("Insufficient data: need at least {required}, have {actual}")]
    InsufficientData { required: usize, actual: usize },

    /// Numerical or training failure. The previous artifact stays published.
    #[error("Model fit error: {0}")]
    ModelFit(String),

    /// Failure writing an artifact or model state file.
    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl Error {
    /// Whether the next scheduled cycle may succeed without new data
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::InsufficientData { .. } | Error::InvalidData(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
