use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexerError>;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Index error: {0}")]
    Index(#[from] arabica_index::IndexError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("DID resolution failed for {did}: {reason}")]
    Resolve { did: String, reason: String },

    #[error("Backfill source failed for {did} ({collection}): {reason}")]
    Source {
        did: String,
        collection: &'static str,
        reason: String,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Storage failure that must stop the current batch without advancing the cursor.
    #[must_use]
    pub fn is_index_unavailable(&self) -> bool {
        matches!(self, IndexerError::Index(err) if err.is_unavailable())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for IndexerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        IndexerError::Transport(err.to_string())
    }
}
