use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid DID: {0}")]
    InvalidDid(String),

    #[error("invalid record key: {0}")]
    InvalidRecordKey(String),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("malformed {collection} record: {reason}")]
    MalformedRecord {
        collection: &'static str,
        reason: String,
    },

    #[error("frame decode error: {0}")]
    Frame(#[from] serde_json::Error),
}
