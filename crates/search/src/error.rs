use arabica_protocol::Collection;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SearchError>;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Index error: {0}")]
    Index(#[from] arabica_index::IndexError),

    #[error("No suggestions for collection {0}")]
    UnsupportedCollection(Collection),
}
