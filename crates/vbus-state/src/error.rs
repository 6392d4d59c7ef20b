use std::path::PathBuf;
use thiserror::Error;

use crate::StateKey;

pub type Result<T, E = StateError> = core::result::Result<T, E>;

/// Failure inside a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unable to encode state: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("writing flag {key} failed: {source}")]
    StorageWriteFailed {
        key: StateKey,
        #[source]
        source: StoreError,
    },
    #[error("clearing persisted state failed: {0}")]
    ClearFailed(#[source] StoreError),
    #[error("loading persisted state failed: {0}")]
    StorageLoad(#[source] StoreError),
    #[error("flag {key} holds a {found} value, not {expected}")]
    TypeMismatch {
        key: StateKey,
        expected: &'static str,
        found: &'static str,
    },
    #[error("flag {key} is not valid hex: {source}")]
    InvalidHex {
        key: StateKey,
        #[source]
        source: hex::FromHexError,
    },
}
