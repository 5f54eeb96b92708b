//! Hierarchical file-merge engine for tx-number-ranged state files.
//!
//! Each stream — domain values, per-key history, inverted index — is an
//! ordered set of immutable files over disjoint tx-number ranges. The
//! engine plans dyadic (power-of-two) merges over those sets, runs the
//! N-way sorted merges, installs the outputs atomically, and retires
//! the inputs behind reader refcounts.

pub mod cancel;
pub mod codec;
pub mod config;
pub mod error;
pub mod index;
pub mod seg;
pub mod store;

pub use cancel::CancelToken;
pub use config::{DomainConfig, IndexFlavor, StreamConfig};
pub use error::{MergeError, Result};
pub use store::{
    Domain, DomainRanges, DomainView, FileHandles, FileItem, FileRef, FileSet, History,
    HistoryRanges, HistoryView, InvertedIndex, InvertedIndexView, MergeProgress, MergeRange,
    ValueTransformer, COMMITMENT_STATE_KEY,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
