use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("index unavailable: {0}")]
    Unavailable(String),

    #[error("stored row is corrupt: {0}")]
    Corrupt(String),

    #[error("rejected record: {0}")]
    Malformed(#[from] arabica_protocol::ProtocolError),
}

impl IndexError {
    /// Storage-layer failure. Callers must not treat the write as applied.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            IndexError::Storage(_) | IndexError::Unavailable(_) | IndexError::Corrupt(_)
        )
    }

    pub(crate) fn unavailable(op: &str, detail: impl std::fmt::Display) -> Self {
        IndexError::Unavailable(format!("{op}: {detail}"))
    }
}
