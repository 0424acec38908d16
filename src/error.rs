use thiserror::Error;

/// Main error type for the trading bot
#[derive(Error, Debug)]
pub enum RoboError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Exchange errors (transient: the next cycle re-derives truth)
    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Exchange request timed out: {0}")]
    Timeout(String),

    // Order execution errors
    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),

    // Market data errors
    #[error("Insufficient market data: {0}")]
    InsufficientData(String),

    // Persistence errors
    #[error("State store error: {0}")]
    Store(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl RoboError {
    /// Errors that only cost the current cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RoboError::Exchange(_)
                | RoboError::RateLimited(_)
                | RoboError::Timeout(_)
                | RoboError::OrderRejected(_)
                | RoboError::OrderNotFound(_)
                | RoboError::InsufficientData(_)
        )
    }
}

/// Result type alias for RoboError
pub type Result<T> = std::result::Result<T, RoboError>;
