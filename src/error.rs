use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImporterError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Invalid batch state: {message}")]
    Batch { message: String },

    #[error("Import run was cancelled")]
    Cancelled,
}

impl From<rusqlite::Error> for ImporterError {
    fn from(err: rusqlite::Error) -> Self {
        ImporterError::Database {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ImporterError>;

/// Why a single page request to the remote source did not produce a page.
///
/// Any of these ends pagination for the current run; pages already fetched are kept.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    #[error("timeout on request to {url}")]
    Timeout { url: String },

    #[error("HTTP error {status} from {url}")]
    HttpError { url: String, status: u16 },

    #[error("communication error with {url}: {message}")]
    Network { url: String, message: String },

    #[error("unreadable response body from {url}: {message}")]
    InvalidBody { url: String, message: String },
}

impl FetchFailure {
    /// Short label used for metrics and audit rows
    pub fn kind(&self) -> &'static str {
        match self {
            FetchFailure::Timeout { .. } => "timeout",
            FetchFailure::HttpError { .. } => "http_error",
            FetchFailure::Network { .. } => "network",
            FetchFailure::InvalidBody { .. } => "invalid_body",
        }
    }

    pub fn url(&self) -> &str {
        match self {
            FetchFailure::Timeout { url }
            | FetchFailure::HttpError { url, .. }
            | FetchFailure::Network { url, .. }
            | FetchFailure::InvalidBody { url, .. } => url,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationReason {
    #[error("field is missing")]
    Missing,

    #[error("field is empty")]
    Empty,

    #[error("expected {expected}")]
    WrongType { expected: &'static str },

    #[error("unparseable timestamp '{value}'")]
    UnparseableDate { value: String },

    #[error("no usable name")]
    NoUsableName,
}

/// A raw record that could not be turned into an [`Event`](crate::types::Event).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("record {} rejected, {field}: {reason}", .event_id.as_deref().unwrap_or("<unknown>"))]
pub struct ValidationFailure {
    pub event_id: Option<String>,
    pub field: &'static str,
    pub reason: ValidationReason,
}

impl ValidationFailure {
    pub fn new(event_id: Option<String>, field: &'static str, reason: ValidationReason) -> Self {
        Self {
            event_id,
            field,
            reason,
        }
    }
}
