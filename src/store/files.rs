//! File items and the per-stream ordered file set.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use tracing::info;

use crate::index::{AccessorIndex, BtreeIndex, ExistenceFilter};
use crate::seg::SegmentReader;

/// Open resource handles of one on-disk file triple. Immutable once
/// attached to a [`FileItem`]; dropped as a unit when the item is
/// retired.
pub struct FileHandles {
    pub data: Arc<SegmentReader>,
    pub accessor: Option<AccessorIndex>,
    pub btree: Option<BtreeIndex>,
    pub existence: Option<ExistenceFilter>,
}

impl FileHandles {
    pub fn new(data: SegmentReader) -> Self {
        Self {
            data: Arc::new(data),
            accessor: None,
            btree: None,
            existence: None,
        }
    }

    fn paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.data.file_path().to_path_buf()];
        if let Some(a) = &self.accessor {
            paths.push(a.file_path().to_path_buf());
        }
        if let Some(b) = &self.btree {
            paths.push(b.file_path().to_path_buf());
        }
        if let Some(e) = &self.existence {
            paths.push(e.file_path().to_path_buf());
        }
        paths
    }
}

/// One immutable on-disk file covering `[start_tx_num, end_tx_num)`.
///
/// Apart from `refcount` and the monotonic false→true `can_delete`, the
/// item never changes after it enters a [`FileSet`].
pub struct FileItem {
    pub start_tx_num: u64,
    pub end_tx_num: u64,
    pub frozen: bool,
    pub refcount: AtomicU32,
    pub can_delete: AtomicBool,
    handles: RwLock<Option<Arc<FileHandles>>>,
}

impl FileItem {
    pub fn new(start_tx_num: u64, end_tx_num: u64, step: u64, steps_in_frozen_file: u64) -> Self {
        assert!(step > 0, "aggregation step must be positive");
        assert!(
            start_tx_num % step == 0 && end_tx_num % step == 0,
            "file [{start_tx_num}, {end_tx_num}) not aligned to step {step}"
        );
        assert!(start_tx_num < end_tx_num, "empty file range");
        Self {
            start_tx_num,
            end_tx_num,
            frozen: (end_tx_num - start_tx_num) / step >= steps_in_frozen_file,
            refcount: AtomicU32::new(0),
            can_delete: AtomicBool::new(false),
            handles: RwLock::new(None),
        }
    }

    pub fn with_handles(self, handles: FileHandles) -> Self {
        *self.handles.write() = Some(Arc::new(handles));
        self
    }

    pub fn set_handles(&self, handles: FileHandles) {
        *self.handles.write() = Some(Arc::new(handles));
    }

    pub fn handles(&self) -> Option<Arc<FileHandles>> {
        self.handles.read().clone()
    }

    /// Whether an accessor-style index (hash or B-tree) is attached.
    pub fn has_index(&self) -> bool {
        self.handles
            .read()
            .as_ref()
            .map(|h| h.accessor.is_some() || h.btree.is_some())
            .unwrap_or(false)
    }

    pub fn is_subset_of(&self, other: &FileItem) -> bool {
        (self.start_tx_num >= other.start_tx_num && self.end_tx_num <= other.end_tx_num)
            && !(self.start_tx_num == other.start_tx_num && self.end_tx_num == other.end_tx_num)
    }

    pub fn is_before(&self, other: &FileItem) -> bool {
        self.end_tx_num <= other.start_tx_num
    }

    pub fn mark_can_delete(&self) {
        self.can_delete.store(true, Ordering::Release);
    }

    /// Drop all handles and unlink the underlying files. Idempotent;
    /// safe to call while stale readers still hold the data `Arc` (the
    /// mmap stays valid until they drop it, the names are gone at once).
    pub fn close_files_and_remove(&self) {
        let taken = self.handles.write().take();
        if let Some(handles) = taken {
            info!(
                file = %handles.data.file_name(),
                "removing retired file"
            );
            for path in handles.paths() {
                let _ = fs::remove_file(path);
            }
        }
    }
}

impl std::fmt::Debug for FileItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileItem")
            .field("start_tx_num", &self.start_tx_num)
            .field("end_tx_num", &self.end_tx_num)
            .field("frozen", &self.frozen)
            .field("refcount", &self.refcount.load(Ordering::Relaxed))
            .field("can_delete", &self.can_delete.load(Ordering::Relaxed))
            .finish()
    }
}

/// Ordered collection of the files of one stream.
///
/// Items are keyed by `(end_tx_num, start_tx_num)` ascending. The
/// current visible cover — largest non-overlapping set of live files —
/// is cached and swapped atomically so readers never take the set lock.
pub struct FileSet {
    inner: RwLock<BTreeMap<(u64, u64), Arc<FileItem>>>,
    visible: ArcSwap<Vec<Arc<FileItem>>>,
}

impl FileSet {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
            visible: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Insert, replacing any existing item covering the same range. A
    /// replaced distinct item is marked deletable — it has been
    /// superseded by an identical-range rebuild.
    pub fn insert(&self, item: Arc<FileItem>) {
        let key = (item.end_tx_num, item.start_tx_num);
        let old = self.inner.write().insert(key, Arc::clone(&item));
        if let Some(old) = old {
            if !Arc::ptr_eq(&old, &item) {
                old.mark_can_delete();
            }
        }
    }

    pub fn remove(&self, item: &Arc<FileItem>) {
        let key = (item.end_tx_num, item.start_tx_num);
        let mut inner = self.inner.write();
        if let Some(existing) = inner.get(&key) {
            if Arc::ptr_eq(existing, item) {
                inner.remove(&key);
            }
        }
    }

    pub fn get(&self, start_tx_num: u64, end_tx_num: u64) -> Option<Arc<FileItem>> {
        self.inner
            .read()
            .get(&(end_tx_num, start_tx_num))
            .cloned()
    }

    /// Smallest `end_tx_num` across all items, garbage included.
    pub fn min_end_tx_num(&self) -> Option<u64> {
        self.inner.read().keys().next().map(|(end, _)| *end)
    }

    /// Largest `end_tx_num` across all items, garbage included.
    pub fn max_end_tx_num(&self) -> Option<u64> {
        self.inner.read().keys().next_back().map(|(end, _)| *end)
    }

    /// Snapshot of all items in `(end_tx_num, start_tx_num)` order.
    pub fn walk(&self) -> Vec<Arc<FileItem>> {
        self.inner.read().values().cloned().collect()
    }

    /// Recompute the visible cover: walk ascending, skip deletable or
    /// handle-less items, and let larger files subsume the smaller ones
    /// they fully contain.
    pub fn re_calc_visible(&self) {
        let mut cover: Vec<Arc<FileItem>> = Vec::new();
        for item in self.inner.read().values() {
            if item.can_delete.load(Ordering::Acquire) || item.handles().is_none() {
                continue;
            }
            while let Some(last) = cover.last() {
                if last.is_subset_of(item) {
                    cover.pop();
                } else {
                    break;
                }
            }
            cover.push(Arc::clone(item));
        }
        self.visible.store(Arc::new(cover));
    }

    /// The cached visible cover.
    pub fn visible(&self) -> Arc<Vec<Arc<FileItem>>> {
        self.visible.load_full()
    }
}

impl Default for FileSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(start: u64, end: u64) -> Arc<FileItem> {
        Arc::new(FileItem::new(start, end, 1, 32))
    }

    #[test]
    fn test_subset_and_before() {
        let small = item(2, 4);
        let big = item(0, 8);
        assert!(small.is_subset_of(&big));
        assert!(!big.is_subset_of(&small));
        assert!(!big.is_subset_of(&big));

        let early = item(0, 2);
        let late = item(2, 4);
        assert!(early.is_before(&late));
        assert!(!late.is_before(&early));
    }

    #[test]
    fn test_alignment_asserted() {
        let result = std::panic::catch_unwind(|| FileItem::new(1, 4, 2, 32));
        assert!(result.is_err());
    }

    #[test]
    fn test_frozen_threshold() {
        assert!(!FileItem::new(0, 16, 1, 32).frozen);
        assert!(FileItem::new(0, 32, 1, 32).frozen);
        assert!(FileItem::new(0, 64, 2, 32).frozen);
    }

    #[test]
    fn test_set_ordering_and_max() {
        let set = FileSet::new();
        set.insert(item(2, 3));
        set.insert(item(0, 2));
        set.insert(item(3, 4));
        let walked: Vec<(u64, u64)> = set
            .walk()
            .iter()
            .map(|i| (i.start_tx_num, i.end_tx_num))
            .collect();
        assert_eq!(walked, vec![(0, 2), (2, 3), (3, 4)]);
        assert_eq!(set.min_end_tx_num(), Some(2));
        assert_eq!(set.max_end_tx_num(), Some(4));
    }

    #[test]
    fn test_visible_cover_subsumes() {
        let set = FileSet::new();
        // Handles are required for visibility; fake them via an empty
        // segment is overkill here, so visibility of handle-less items
        // is exercised instead: nothing is visible.
        set.insert(item(0, 2));
        set.insert(item(2, 4));
        set.re_calc_visible();
        assert!(set.visible().is_empty());
    }
}
