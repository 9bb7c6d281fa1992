/// Centralized error types for the depth collector
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollectorError {
    // Venue Errors
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Exchange error: {venue} - {message}")]
    PermanentExchange { venue: String, message: String },

    #[error("Unsupported venue: {0}")]
    UnsupportedVenue(String),

    #[error("Instrument not available: {0}")]
    InstrumentUnavailable(String),

    // Network Errors
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Task timed out: {0}")]
    TaskTimeout(String),

    // Storage Errors
    #[error("Store request failed: {status} - {message}")]
    StoreRequest { status: u16, message: String },

    #[error("Store authentication failed: {0}")]
    StoreAuth(String),

    #[error("Store rejected access token: {0}")]
    StoreTokenRejected(String),

    #[error("Operation not supported by store: {0}")]
    StoreUnsupported(String),

    #[error("Append dropped after {attempts} conflicting attempts: {key}")]
    AppendConflictBudgetExhausted { key: String, attempts: u32 },

    #[error("Token signing failed: {0}")]
    TokenSigning(#[from] jsonwebtoken::errors::Error),

    // Data Errors
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] serde_json::Error),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    // File I/O Errors
    #[error("File I/O error: {0}")]
    FileError(#[from] std::io::Error),

    // System Errors
    #[error("No data sources available: {0}")]
    NoDataSources(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, CollectorError>;

impl CollectorError {
    /// Worth retrying with backoff at the call site
    pub fn is_transient(&self) -> bool {
        match self {
            CollectorError::RateLimited(_)
            | CollectorError::TransientNetwork(_)
            | CollectorError::TaskTimeout(_) => true,
            CollectorError::HttpError(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            CollectorError::StoreRequest { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Counts against venue health
    pub fn is_permanent_venue_error(&self) -> bool {
        matches!(
            self,
            CollectorError::PermanentExchange { .. } | CollectorError::InstrumentUnavailable(_)
        )
    }

    /// Check if error requires the process to stop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CollectorError::NoDataSources(_)
                | CollectorError::ConfigError(_)
                | CollectorError::ConfigSource(_)
        )
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            CollectorError::RateLimited(_) => "VENUE_001",
            CollectorError::TransientNetwork(_) => "VENUE_002",
            CollectorError::PermanentExchange { .. } => "VENUE_003",
            CollectorError::UnsupportedVenue(_) => "VENUE_004",
            CollectorError::InstrumentUnavailable(_) => "VENUE_005",
            CollectorError::HttpError(_) => "NET_001",
            CollectorError::TaskTimeout(_) => "NET_002",
            CollectorError::StoreRequest { .. } => "STORE_001",
            CollectorError::StoreAuth(_) => "STORE_002",
            CollectorError::StoreUnsupported(_) => "STORE_003",
            CollectorError::AppendConflictBudgetExhausted { .. } => "STORE_004",
            CollectorError::TokenSigning(_) => "STORE_005",
            CollectorError::StoreTokenRejected(_) => "STORE_006",
            CollectorError::InvalidRecord(_) => "DATA_001",
            CollectorError::SerializationError(_) => "DATA_002",
            CollectorError::ConfigError(_) => "CFG_001",
            CollectorError::ConfigSource(_) => "CFG_002",
            CollectorError::FileError(_) => "FILE_001",
            CollectorError::NoDataSources(_) => "SYS_001",
            CollectorError::InternalError(_) => "INT_001",
        }
    }
}
