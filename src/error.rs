use crate::types::DataRetrievalError;

/// Errors surfaced by the forecasting pipeline
#[derive(Debug, thiserror::Error)]
pub enum ForecastError {
    #[error("Invalid stock ticker: {0}")]
    InvalidTicker(String),

    #[error("Data unavailable for {ticker}: {reason}")]
    DataUnavailable { ticker: String, reason: String },

    #[error("Insufficient data: {rows} rows, need at least {required}")]
    InsufficientData { rows: usize, required: usize },

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Training failed: {0}")]
    TrainingFailure(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ForecastError {
    /// Caller mistakes (4xx) as opposed to server-side failures
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ForecastError::InvalidTicker(_)
                | ForecastError::InsufficientData { .. }
                | ForecastError::Validation(_)
        )
    }

    pub fn data_unavailable(ticker: &str, source: DataRetrievalError) -> Self {
        ForecastError::DataUnavailable {
            ticker: ticker.to_string(),
            reason: source.to_string(),
        }
    }
}

impl From<std::io::Error> for ForecastError {
    fn from(e: std::io::Error) -> Self {
        ForecastError::Storage(e.to_string())
    }
}

/// Result type for forecasting operations
pub type Result<T> = std::result::Result<T, ForecastError>;
