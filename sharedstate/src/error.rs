//! Error types shared across the reference subsystem.

use thiserror::Error;

/// Failure reported by a persistence store.
///
/// Stores map their underlying failures (filesystem, network, codec) into
/// one of these variants; the message carries the store-specific detail.
/// Errors are cheap to clone because references keep the most recent one
/// around as a sticky field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Reading from or writing to the backing medium failed.
    #[error("store I/O failed: {0}")]
    Io(String),
    /// The persisted bytes could not be decoded, or the value could not
    /// be encoded.
    #[error("store encoding failed: {0}")]
    Codec(String),
    /// Anything else the store wants to report.
    #[error("{0}")]
    Other(String),
}

/// Failure surfaced by a reference operation.
///
/// `Load` leaves the previous value intact (stale-but-available); `Save`
/// means the in-memory value already changed and was not rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SharedError {
    #[error("load failed: {0}")]
    Load(#[source] StoreError),
    #[error("save failed: {0}")]
    Save(#[source] StoreError),
}

impl SharedError {
    /// The store failure underneath, whichever direction it happened in.
    pub fn store_error(&self) -> &StoreError {
        match self {
            SharedError::Load(e) | SharedError::Save(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_direction_and_detail() {
        let err = SharedError::Save(StoreError::Io("disk full".to_string()));
        assert_eq!(err.to_string(), "save failed: store I/O failed: disk full");
        assert_eq!(err.store_error(), &StoreError::Io("disk full".to_string()));
    }
}
