use thiserror::Error;

/// Every failure the store can surface. The set is closed on purpose:
/// callers match on kinds, not on source chains.
#[derive(Error, Debug)]
pub enum Error {
    #[error("key not found")]
    NotFound,
    #[error("datastore is not initialised")]
    NotInitialised,
    #[error("transaction already committed")]
    AlreadyCommitted,
    #[error(transparent)]
    Storage(#[from] sled::Error),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("broadcast error: {0}")]
    Broadcast(String),
    #[error("dag fetch error: {0}")]
    DagFetch(String),
    #[error("invalid option: {0}")]
    InvalidOption(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

impl Error {
    pub(crate) fn codec(e: impl std::fmt::Display) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Codec(e.to_string())
    }
}
