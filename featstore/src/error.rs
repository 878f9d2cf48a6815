//! Error type shared by every stage of the retrieval pipeline.

use std::fmt;

use thiserror::Error;

/// Which backing store a key was requested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreRole {
    Examples,
    CommFeats,
}

impl fmt::Display for StoreRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreRole::Examples => f.write_str("examples"),
            StoreRole::CommFeats => f.write_str("comm_feats"),
        }
    }
}

/// Coarse error classes, stable across the Rust and Python surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedErrorKind {
    Configuration,
    DataCorruption,
    DataLoss,
    InvalidInput,
    ResourceExhausted,
    Store,
    Io,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// A required key was absent from a store read under `MissPolicy::FailBatch`.
    /// `key` is the hex rendering of the raw store key.
    #[error("NotFound: key = {key} (store: {store})")]
    DataLoss { store: StoreRole, key: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("store error: {0}")]
    Store(#[from] rocksdb::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FeedError {
    pub fn kind(&self) -> FeedErrorKind {
        match self {
            FeedError::Configuration(_) => FeedErrorKind::Configuration,
            FeedError::DataCorruption(_) => FeedErrorKind::DataCorruption,
            FeedError::DataLoss { .. } => FeedErrorKind::DataLoss,
            FeedError::InvalidInput(_) => FeedErrorKind::InvalidInput,
            FeedError::ResourceExhausted(_) => FeedErrorKind::ResourceExhausted,
            FeedError::Store(_) => FeedErrorKind::Store,
            FeedError::Io(_) => FeedErrorKind::Io,
        }
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        FeedError::DataCorruption(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;

/// Render a raw key as lowercase hex, the form used in `DataLoss` messages.
pub fn hex_key(key: &[u8]) -> String {
    hex::encode(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_key() {
        assert_eq!(hex_key(&[0x07, 0x00, 0x00, 0x00]), "07000000");
        assert_eq!(hex_key(b"ab"), "6162");
        assert_eq!(hex_key(&[]), "");
    }

    #[test]
    fn test_data_loss_names_key() {
        let err = FeedError::DataLoss {
            store: StoreRole::Examples,
            key: hex_key(&42u32.to_le_bytes()),
        };
        assert_eq!(err.kind(), FeedErrorKind::DataLoss);
        let msg = err.to_string();
        assert!(msg.contains("2a000000"), "{msg}");
        assert!(msg.contains("examples"), "{msg}");
    }
}
