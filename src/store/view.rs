//! Refcounted snapshot views over a [`FileSet`].

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::seg::SegmentReader;
use crate::store::{FileHandles, FileItem, FileSet};

/// A live reference to one file, pinned for the lifetime of a view.
///
/// Acquiring bumps the item's refcount; dropping releases it and, when
/// the item was retired meanwhile (`can_delete` with no remaining
/// readers), closes the handles and unlinks the files.
pub struct FileRef {
    item: Arc<FileItem>,
    handles: Arc<FileHandles>,
}

impl FileRef {
    /// Pin `item`. Returns `None` when the item is already retired or
    /// its handles are gone.
    pub fn acquire(item: &Arc<FileItem>) -> Option<FileRef> {
        item.refcount.fetch_add(1, Ordering::AcqRel);
        if item.can_delete.load(Ordering::Acquire) {
            Self::release(item);
            return None;
        }
        match item.handles() {
            Some(handles) => Some(FileRef {
                item: Arc::clone(item),
                handles,
            }),
            None => {
                Self::release(item);
                None
            }
        }
    }

    fn release(item: &Arc<FileItem>) {
        let prev = item.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "refcount underflow");
        if prev == 1 && item.can_delete.load(Ordering::Acquire) {
            item.close_files_and_remove();
        }
    }

    pub fn item(&self) -> &Arc<FileItem> {
        &self.item
    }

    pub fn start_tx_num(&self) -> u64 {
        self.item.start_tx_num
    }

    pub fn end_tx_num(&self) -> u64 {
        self.item.end_tx_num
    }

    pub fn handles(&self) -> &FileHandles {
        &self.handles
    }

    pub fn data(&self) -> &Arc<SegmentReader> {
        &self.handles.data
    }
}

impl Clone for FileRef {
    fn clone(&self) -> Self {
        self.item.refcount.fetch_add(1, Ordering::AcqRel);
        Self {
            item: Arc::clone(&self.item),
            handles: Arc::clone(&self.handles),
        }
    }
}

impl Drop for FileRef {
    fn drop(&mut self) {
        Self::release(&self.item);
    }
}

impl std::fmt::Debug for FileRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FileRef[{}, {})", self.start_tx_num(), self.end_tx_num())
    }
}

/// Pin the current visible cover of `set`.
pub fn materialize_view(set: &FileSet) -> Vec<FileRef> {
    set.visible()
        .iter()
        .filter_map(FileRef::acquire)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seg::SegmentWriter;

    fn item_with_file(dir: &std::path::Path, start: u64, end: u64) -> Arc<FileItem> {
        let path = dir.join(format!("v1-test.{start}-{end}.kv"));
        let mut w = SegmentWriter::create(&path, dir, false, true).unwrap();
        w.add_word(b"k").unwrap();
        w.add_word(b"v").unwrap();
        w.compress().unwrap();
        let item = FileItem::new(start, end, 1, 32)
            .with_handles(FileHandles::new(SegmentReader::open(&path).unwrap()));
        Arc::new(item)
    }

    #[test]
    fn test_view_pins_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let set = FileSet::new();
        set.insert(item_with_file(dir.path(), 0, 2));
        set.insert(item_with_file(dir.path(), 2, 4));
        set.re_calc_visible();

        let view = materialize_view(&set);
        assert_eq!(view.len(), 2);
        for r in &view {
            assert_eq!(r.item().refcount.load(Ordering::Relaxed), 1);
        }
        drop(view);
        for item in set.walk() {
            assert_eq!(item.refcount.load(Ordering::Relaxed), 0);
        }
    }

    #[test]
    fn test_cover_excludes_subsumed() {
        let dir = tempfile::tempdir().unwrap();
        let set = FileSet::new();
        set.insert(item_with_file(dir.path(), 0, 2));
        set.insert(item_with_file(dir.path(), 2, 4));
        set.insert(item_with_file(dir.path(), 0, 4));
        set.re_calc_visible();

        let view = materialize_view(&set);
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].start_tx_num(), 0);
        assert_eq!(view[0].end_tx_num(), 4);
    }

    #[test]
    fn test_deferred_unlink_after_last_reader() {
        let dir = tempfile::tempdir().unwrap();
        let set = FileSet::new();
        let item = item_with_file(dir.path(), 0, 2);
        let data_path = dir.path().join("v1-test.0-2.kv");
        set.insert(Arc::clone(&item));
        set.re_calc_visible();

        let view = materialize_view(&set);
        assert_eq!(view.len(), 1);

        // Retire while a reader still holds the file.
        item.mark_can_delete();
        assert!(data_path.exists());

        drop(view);
        assert!(!data_path.exists());
        assert!(item.handles().is_none());
    }

    #[test]
    fn test_acquire_refuses_retired_items() {
        let dir = tempfile::tempdir().unwrap();
        let item = item_with_file(dir.path(), 0, 2);
        item.mark_can_delete();
        assert!(FileRef::acquire(&item).is_none());
    }
}
