//! Stream stores: domains, histories and inverted indexes.
//!
//! Each store owns an ordered set of immutable files covering disjoint
//! tx-number ranges, plans dyadic merges over them, runs the N-way
//! merges, and swaps merged outputs in while retiring the inputs behind
//! reader refcounts.

mod cursor;
mod domain;
mod files;
mod history;
mod inverted;
mod plan;
mod view;

pub use cursor::*;
pub use domain::*;
pub use files::*;
pub use history::*;
pub use inverted::*;
pub use plan::*;
pub use view::*;

use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::{MergeError, Result};
use crate::index::{
    AccessorBuilder, AccessorIndex, ExistenceFilter, ExistenceFilterBuilder,
    DEFAULT_ACCESSOR_RETRIES,
};
use crate::seg::SegmentReader;

/// Counters a merge updates while running; cheap enough to share across
/// worker threads and poll from a supervisor.
#[derive(Debug, Default)]
pub struct MergeProgress {
    /// Output files fully built so far.
    pub files_built: AtomicU64,
    /// Distinct keys emitted across all output files.
    pub keys_processed: AtomicU64,
}

impl MergeProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Cancellation is checked between heap iterations in batches of this
/// many keys.
pub(crate) const CANCEL_CHECK_MASK: u64 = 0x3FF;

/// Build a key → offset accessor over a freshly merged data file,
/// restarting with the next salt on fingerprint collision.
pub(crate) fn build_key_accessor(
    cancel: &CancelToken,
    data: &Arc<SegmentReader>,
    path: &Path,
    base_salt: u32,
    no_fsync: bool,
) -> Result<AccessorIndex> {
    let key_count = data.word_count() / 2;
    let mut builder = AccessorBuilder::new(path, key_count, base_salt, no_fsync);
    let mut attempt = 0u32;
    loop {
        cancel.check()?;
        let mut g = data.getter();
        while g.has_next() {
            let offset = g.pos();
            let key = g.next()?;
            g.skip()?;
            builder.add_key(&key, offset);
        }
        if builder.try_build()? {
            break;
        }
        attempt += 1;
        if attempt >= DEFAULT_ACCESSOR_RETRIES {
            return Err(MergeError::AccessorCollision {
                path: path.to_path_buf(),
                retries: attempt,
            });
        }
        warn!(path = %path.display(), attempt, "accessor collision, restarting with next salt");
        builder.reset_next_salt();
    }
    AccessorIndex::open(path)
}

/// Build an existence filter over the keys of a merged data file.
pub(crate) fn build_existence_filter(
    data: &Arc<SegmentReader>,
    path: &Path,
    salt: u32,
    no_fsync: bool,
) -> Result<ExistenceFilter> {
    let mut builder = ExistenceFilterBuilder::new(path, salt, no_fsync);
    let mut g = data.getter();
    while g.has_next() {
        let key = g.next()?;
        g.skip()?;
        builder.add_key(&key);
    }
    builder.build()
}
