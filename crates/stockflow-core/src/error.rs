use std::fmt;

// `thiserror` cannot derive this enum: the `source: String` field on
// `DataUnavailable` collides with its implicit source-field convention, and
// `String` does not implement `std::error::Error`. The impls below reproduce
// exactly what the derive would otherwise generate.
#[derive(Debug)]
pub enum StockflowError {
    // Input errors — reported before a run starts
    Validation(String),

    // Data-source errors
    DataUnavailable { source: String, message: String },

    RateLimitExceeded(String),

    // Cache errors
    CacheCorruption(String),

    // Retrieval errors
    RetrievalEmpty,

    // Step execution errors
    StepExhausted {
        step: String,
        attempts: u32,
        message: String,
    },

    Timeout(std::time::Duration),

    Cancelled,

    // Flow definition errors
    FlowDefinition(String),

    // Config errors
    Config(String),

    ConfigNotFound(String),

    // Storage errors
    Database(String),

    // I/O errors
    Io(std::io::Error),

    // JSON errors
    Json(serde_json::Error),
}

impl fmt::Display for StockflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "validation failed: {msg}"),
            Self::DataUnavailable { source, message } => {
                write!(f, "data unavailable from {source}: {message}")
            }
            Self::RateLimitExceeded(source) => {
                write!(f, "rate limit exceeded for source '{source}'")
            }
            Self::CacheCorruption(key) => write!(f, "cache entry corrupt for key '{key}'"),
            Self::RetrievalEmpty => write!(f, "no document cleared the relevance threshold"),
            Self::StepExhausted {
                step,
                attempts,
                message,
            } => write!(f, "step '{step}' exhausted {attempts} attempts: {message}"),
            Self::Timeout(d) => write!(f, "compute timed out after {d:?}"),
            Self::Cancelled => write!(f, "run cancelled"),
            Self::FlowDefinition(msg) => write!(f, "flow definition invalid: {msg}"),
            Self::Config(msg) => write!(f, "config error: {msg}"),
            Self::ConfigNotFound(path) => write!(f, "config file not found: {path}"),
            Self::Database(msg) => write!(f, "database error: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::Json(err) => write!(f, "JSON error: {err}"),
        }
    }
}

impl std::error::Error for StockflowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StockflowError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for StockflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

pub type Result<T> = std::result::Result<T, StockflowError>;
