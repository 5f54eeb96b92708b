use std::path::PathBuf;

use thiserror::Error;

/// Main error type for merge-engine operations
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing paired file: index {index_file} has no history sibling {history_file}")]
    MissingPair {
        index_file: String,
        history_file: String,
    },

    #[error("accessor index collision persisted after {retries} salt retries: {path}")]
    AccessorCollision { path: PathBuf, retries: u32 },

    #[error("merge cancelled")]
    Cancelled,

    #[error("corrupt file {file}: {reason}")]
    Corrupt { file: PathBuf, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("index build error: {0}")]
    IndexBuild(String),
}

/// Result type alias for merge-engine operations
pub type Result<T> = std::result::Result<T, MergeError>;

impl MergeError {
    /// Check if this error indicates a transient failure; the caller may
    /// retry the whole merge from the unchanged file sets.
    pub fn is_retriable(&self) -> bool {
        matches!(self, MergeError::Io(_))
    }

    pub(crate) fn corrupt(file: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        MergeError::Corrupt {
            file: file.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MergeError::MissingPair {
            index_file: "v1-accounts.0-2.ef".to_string(),
            history_file: "v1-accounts.0-2.v".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "missing paired file: index v1-accounts.0-2.ef has no history sibling v1-accounts.0-2.v"
        );
    }

    #[test]
    fn test_retriable_errors() {
        let io = MergeError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(io.is_retriable());
        assert!(!MergeError::Cancelled.is_retriable());
        assert!(!MergeError::MissingPair {
            index_file: String::new(),
            history_file: String::new(),
        }
        .is_retriable());
    }
}
