use thiserror::Error;

/// Errors raised by chat and embedding provider backends.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider not available: {0}")]
    Unavailable(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("permanent provider error: {0}")]
    Permanent(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProviderError {
    /// Transient failures are retried with backoff at the ingestion layer;
    /// everything else fails the stage immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Http(_))
    }

    /// Classify a non-success vendor HTTP status: 429 and 5xx are transient,
    /// every other client error is permanent.
    pub fn from_status(status: reqwest::StatusCode, detail: String) -> Self {
        if status.as_u16() == 429 || status.is_server_error() {
            Self::Transient(format!("{status}: {detail}"))
        } else {
            Self::Permanent(format!("{status}: {detail}"))
        }
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("dimension mismatch: collection expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("store request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid request: {0}")]
    Request(String),
}
