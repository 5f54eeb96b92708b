//! Inverted-index streams: key → Elias-Fano posting list of tx numbers.

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::codec::merge_elias_fano;
use crate::config::StreamConfig;
use crate::error::Result;
use crate::seg::{SegmentReader, SegmentWriter};
use crate::store::{
    build_existence_filter, build_key_accessor, materialize_view, scan_merge_candidates,
    CursorHeap, CursorItem, FileHandles, FileItem, FileRef, FileSet, MergeProgress, MergeRange,
    CANCEL_CHECK_MASK,
};

/// One inverted-index stream and its files.
pub struct InvertedIndex {
    cfg: StreamConfig,
    with_existence_index: bool,
    files: FileSet,
    merges_count: AtomicU64,
}

impl InvertedIndex {
    pub fn new(cfg: StreamConfig, with_existence_index: bool) -> Self {
        Self {
            cfg,
            with_existence_index,
            files: FileSet::new(),
            merges_count: AtomicU64::new(0),
        }
    }

    pub fn cfg(&self) -> &StreamConfig {
        &self.cfg
    }

    pub fn files(&self) -> &FileSet {
        &self.files
    }

    pub fn merges_count(&self) -> u64 {
        self.merges_count.load(Ordering::Relaxed)
    }

    pub(crate) fn note_merge(&self) {
        self.merges_count.fetch_add(1, Ordering::Relaxed);
    }

    /// End of coverage: the largest `end_tx_num` in the set.
    pub fn end_tx_num_minimax(&self) -> u64 {
        self.files.max_end_tx_num().unwrap_or(0)
    }

    /// Largest `end_tx_num` among files that carry an accessor index,
    /// optionally restricted to frozen files.
    pub fn end_indexed_tx_num_minimax(&self, need_frozen: bool) -> u64 {
        let mut max = 0;
        for item in self.files.walk() {
            if !item.has_index() || (need_frozen && !item.frozen) {
                continue;
            }
            max = max.max(item.end_tx_num);
        }
        max
    }

    /// Register a file produced outside the merge path.
    pub fn integrate_ingested_file(&self, item: Arc<FileItem>) {
        self.files.insert(item);
        self.files.re_calc_visible();
    }

    /// Install a merged output and retire its inputs. A frozen output
    /// additionally sweeps every earlier non-frozen file — `kill -9`
    /// leftovers have no other chance to be collected.
    pub fn integrate_merged_files(&self, mut outs: Vec<Arc<FileItem>>, input: Option<Arc<FileItem>>) {
        if let Some(ref in_item) = input {
            self.files.insert(Arc::clone(in_item));
            if in_item.frozen {
                for item in self.files.walk() {
                    if item.frozen || item.end_tx_num > in_item.end_tx_num {
                        continue;
                    }
                    outs.push(item);
                }
            }
        }
        for out in outs {
            self.files.remove(&out);
            out.mark_can_delete();
        }
        self.files.re_calc_visible();
    }

    /// Pin a snapshot of the visible files.
    pub fn view(&self) -> InvertedIndexView<'_> {
        InvertedIndexView {
            ii: self,
            files: materialize_view(&self.files),
        }
    }
}

/// Immutable snapshot of one inverted-index stream; the unit all merge
/// decisions consult.
pub struct InvertedIndexView<'a> {
    ii: &'a InvertedIndex,
    pub files: Vec<FileRef>,
}

impl InvertedIndexView<'_> {
    pub fn stream(&self) -> &InvertedIndex {
        self.ii
    }

    pub fn find_merge_range(&self, max_end_tx_num: u64, max_span: u64) -> MergeRange {
        scan_merge_candidates(
            &self.files,
            self.ii.cfg.aggregation_step,
            max_end_tx_num,
            max_span,
            true,
        )
    }

    /// Files whose ranges fall inside `[start_tx_num, end_tx_num)`, and
    /// the index of the first of them within the view.
    pub fn static_files_in_range(&self, start_tx_num: u64, end_tx_num: u64) -> (Vec<FileRef>, usize) {
        let mut out = Vec::with_capacity(self.files.len());
        let mut start_j = 0;
        for f in &self.files {
            if f.start_tx_num() < start_tx_num {
                start_j += 1;
                continue;
            }
            if f.end_tx_num() > end_tx_num {
                break;
            }
            out.push(f.clone());
        }
        (out, start_j)
    }

    /// End of visible coverage, optionally counting frozen files only.
    pub fn max_tx_num_in_files(&self, frozen_only: bool) -> u64 {
        if !frozen_only {
            return self.files.last().map(|f| f.end_tx_num()).unwrap_or(0);
        }
        self.files
            .iter()
            .rev()
            .find(|f| f.item().frozen)
            .map(|f| f.end_tx_num())
            .unwrap_or(0)
    }

    /// N-way merge of `files` (ranges concatenating to
    /// `[start_tx_num, end_tx_num)`, ascending) into one output file.
    /// Posting lists of the same key are unioned; later files' lists
    /// come first off the heap and earlier ones are prepended.
    pub fn merge_files(
        &self,
        cancel: &CancelToken,
        files: &[FileRef],
        start_tx_num: u64,
        end_tx_num: u64,
        progress: &MergeProgress,
    ) -> Result<Arc<FileItem>> {
        let cfg = &self.ii.cfg;
        let step = cfg.aggregation_step;
        let (from_step, to_step) = (start_tx_num / step, end_tx_num / step);
        let dat_path = cfg.ef_file_path(from_step, to_step);
        let idx_path = cfg.ef_accessor_file_path(from_step, to_step);
        let exi_path = cfg.ef_existence_file_path(from_step, to_step);

        let result =
            self.merge_files_inner(cancel, files, start_tx_num, end_tx_num, progress);
        if result.is_err() {
            for path in [&dat_path, &idx_path, &exi_path] {
                let _ = fs::remove_file(path);
            }
        }
        result
    }

    fn merge_files_inner(
        &self,
        cancel: &CancelToken,
        files: &[FileRef],
        start_tx_num: u64,
        end_tx_num: u64,
        progress: &MergeProgress,
    ) -> Result<Arc<FileItem>> {
        let cfg = &self.ii.cfg;
        let step = cfg.aggregation_step;
        let (from_step, to_step) = (start_tx_num / step, end_tx_num / step);

        let _read_ahead: Vec<_> = files.iter().map(|f| f.data().read_ahead()).collect();
        cancel.check()?;

        let dat_path = cfg.ef_file_path(from_step, to_step);
        let tmp_dir = cfg
            .tmp_dir
            .join(format!("{}-ef-{}-{}", cfg.filename_base, from_step, to_step));
        debug!(
            stream = %cfg.filename_base,
            range = %format!("{from_step}-{to_step}"),
            inputs = files.len(),
            "merging inverted index files"
        );
        let mut writer = SegmentWriter::create(&dat_path, &tmp_dir, cfg.compress, cfg.no_fsync)?;

        let mut heap = CursorHeap::new();
        for item in files {
            if let Some(cursor) = CursorItem::from_file(
                item.data().getter(),
                None,
                item.start_tx_num(),
                item.end_tx_num(),
                true,
            )? {
                heap.push(cursor);
            }
        }

        // The buffered pair trails the heap by one step so the final
        // pair can be patched before emission; flush it after the loop.
        let mut key_buf: Option<Vec<u8>> = None;
        let mut val_buf: Vec<u8> = Vec::new();
        let mut iterations = 0u64;
        loop {
            let (last_key, mut last_val) = match heap.peek() {
                Some(top) => (top.key.clone(), top.val.clone()),
                None => break,
            };
            iterations += 1;
            if iterations & CANCEL_CHECK_MASK == 0 {
                cancel.check()?;
            }
            let mut merged_once = false;
            while heap.peek().map_or(false, |c| c.key == last_key) {
                let mut cursor = heap.pop().expect("peeked");
                if merged_once {
                    last_val = merge_elias_fano(&cursor.val, &last_val)?;
                } else {
                    merged_once = true;
                }
                if cursor.advance()? {
                    heap.push(cursor);
                }
            }
            if let Some(key) = key_buf.take() {
                writer.add_word(&key)?;
                writer.add_word(&val_buf)?;
            }
            key_buf = Some(last_key);
            val_buf = last_val;
            progress.keys_processed.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(key) = key_buf.take() {
            writer.add_word(&key)?;
            writer.add_word(&val_buf)?;
        }
        writer.compress()?;
        drop(writer);

        let data = Arc::new(SegmentReader::open(&dat_path)?);
        let accessor = build_key_accessor(
            cancel,
            &data,
            &cfg.ef_accessor_file_path(from_step, to_step),
            cfg.salt,
            cfg.no_fsync,
        )?;
        let existence = if self.ii.with_existence_index {
            Some(build_existence_filter(
                &data,
                &cfg.ef_existence_file_path(from_step, to_step),
                cfg.salt,
                cfg.no_fsync,
            )?)
        } else {
            None
        };

        let out_item = Arc::new(FileItem::new(
            start_tx_num,
            end_tx_num,
            step,
            cfg.steps_in_frozen_file,
        ));
        out_item.set_handles(FileHandles {
            data,
            accessor: Some(accessor),
            btree: None,
            existence,
        });

        let _ = fs::remove_dir(&tmp_dir);
        self.ii.note_merge();
        progress.files_built.fetch_add(1, Ordering::Relaxed);
        Ok(out_item)
    }

    /// Collect and retire garbage made obsolete by `merged`: files fully
    /// contained in it, and older files already covered by something in
    /// this view. Unreferenced garbage is unlinked synchronously.
    pub fn clean_after_merge(&self, merged: Option<&Arc<FileItem>>) {
        let Some(merged) = merged else { return };
        for out in self.garbage(merged) {
            self.ii.files.remove(&out);
            out.mark_can_delete();
            if out.refcount.load(Ordering::Acquire) == 0 {
                out.close_files_and_remove();
            } else {
                info!(
                    range = %format!("[{}, {})", out.start_tx_num, out.end_tx_num),
                    refs = out.refcount.load(Ordering::Acquire),
                    "deferring removal until readers release"
                );
            }
        }
        self.ii.files.re_calc_visible();
    }

    /// Garbage predicate over the raw set. Frozen files are never
    /// garbage; interrupted merges may leave subsumed files that only
    /// show up here.
    pub(crate) fn garbage(&self, merged: &Arc<FileItem>) -> Vec<Arc<FileItem>> {
        let mut outs = Vec::new();
        for item in self.ii.files.walk() {
            if item.frozen {
                continue;
            }
            if item.is_subset_of(merged)
                || (item.is_before(merged) && self.has_cover_file(&item))
            {
                outs.push(item);
            }
        }
        outs
    }

    pub(crate) fn has_cover_file(&self, item: &FileItem) -> bool {
        self.files.iter().any(|f| item.is_subset_of(f.item()))
    }
}
