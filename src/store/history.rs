//! History streams: per-key value versions, tied to a sibling inverted
//! index that records the tx numbers of the changes.
//!
//! A history file `[a, b)` is only readable through its sibling index
//! file `[a, b)`: the index holds, per key, the Elias-Fano list of
//! change positions, and the history file holds the value bytes in the
//! same order. Merging therefore drives the index cursors and copies
//! value words from the paired history getters.

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::codec::EliasFano;
use crate::config::StreamConfig;
use crate::error::{MergeError, Result};
use crate::index::{AccessorBuilder, AccessorIndex, DEFAULT_ACCESSOR_RETRIES};
use crate::seg::{SegmentReader, SegmentWriter};
use crate::store::{
    dyadic_span, materialize_view, reconcile_history_index, CursorHeap, CursorItem, FileHandles,
    FileItem, FileRef, FileSet, HistoryRanges, InvertedIndex, InvertedIndexView, MergeProgress,
    CANCEL_CHECK_MASK,
};

/// One history stream, owning its sibling inverted-index stream.
pub struct History {
    cfg: StreamConfig,
    inverted_index: InvertedIndex,
    files: FileSet,
    /// Keep only the inverted index; no `.v` files are produced.
    dont_produce_files: bool,
    merges_count: AtomicU64,
}

impl History {
    pub fn new(cfg: StreamConfig, with_existence_index: bool, dont_produce_files: bool) -> Self {
        Self {
            inverted_index: InvertedIndex::new(cfg.clone(), with_existence_index),
            cfg,
            files: FileSet::new(),
            dont_produce_files,
            merges_count: AtomicU64::new(0),
        }
    }

    pub fn cfg(&self) -> &StreamConfig {
        &self.cfg
    }

    pub fn inverted_index(&self) -> &InvertedIndex {
        &self.inverted_index
    }

    pub fn files(&self) -> &FileSet {
        &self.files
    }

    pub fn merges_count(&self) -> u64 {
        self.merges_count.load(Ordering::Relaxed)
    }

    fn note_merge(&self) {
        self.merges_count.fetch_add(1, Ordering::Relaxed);
    }

    /// How far this stream's coverage reaches: the minimum of its own
    /// and its index's coverage. A non-producing history never limits
    /// anything and reports `u64::MAX`.
    pub fn end_tx_num_minimax(&self) -> u64 {
        if self.dont_produce_files {
            return u64::MAX;
        }
        let mut minimax = self.inverted_index.end_tx_num_minimax();
        if let Some(end) = self.files.max_end_tx_num() {
            if minimax == 0 || end < minimax {
                minimax = end;
            }
        }
        minimax
    }

    /// Largest indexed `end_tx_num`, min-ed with the sibling index.
    pub fn end_indexed_tx_num_minimax(&self, need_frozen: bool) -> u64 {
        let mut max = 0u64;
        if self.dont_produce_files && self.files.is_empty() {
            max = u64::MAX;
        }
        for item in self.files.walk() {
            if !item.has_index() || (need_frozen && !item.frozen) {
                continue;
            }
            max = max.max(item.end_tx_num);
        }
        max.min(self.inverted_index.end_indexed_tx_num_minimax(need_frozen))
    }

    /// Register a freshly built (history, index) pair; either side may
    /// be absent — a non-producing stream ingests only the index.
    pub fn integrate_ingested_files(
        &self,
        history_item: Option<Arc<FileItem>>,
        index_item: Option<Arc<FileItem>>,
    ) {
        if let Some(item) = index_item {
            self.inverted_index.integrate_ingested_file(item);
        }
        if let Some(item) = history_item {
            self.files.insert(item);
        }
        self.files.re_calc_visible();
    }

    /// Install merged outputs for both siblings and retire the inputs.
    pub fn integrate_merged_files(
        &self,
        index_outs: Vec<Arc<FileItem>>,
        history_outs: Vec<Arc<FileItem>>,
        index_in: Option<Arc<FileItem>>,
        history_in: Option<Arc<FileItem>>,
    ) {
        self.inverted_index.integrate_merged_files(index_outs, index_in);
        let mut outs = history_outs;
        if let Some(ref in_item) = history_in {
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

    pub fn view(&self) -> HistoryView<'_> {
        HistoryView {
            h: self,
            ic: self.inverted_index.view(),
            files: materialize_view(&self.files),
        }
    }
}

/// Snapshot of a history stream and its sibling index.
pub struct HistoryView<'a> {
    h: &'a History,
    pub ic: InvertedIndexView<'a>,
    pub files: Vec<FileRef>,
}

impl HistoryView<'_> {
    pub fn stream(&self) -> &History {
        self.h
    }

    pub fn find_merge_range(&self, max_end_tx_num: u64, max_span: u64) -> HistoryRanges {
        let mut r = HistoryRanges {
            index: self.ic.find_merge_range(max_end_tx_num, max_span),
            history: Default::default(),
        };
        let step = self.h.cfg.aggregation_step;
        for item in &self.files {
            if item.end_tx_num() > max_end_tx_num {
                continue;
            }
            let span = dyadic_span(item.end_tx_num(), step, max_span);
            let start = item.end_tx_num() - span;
            // A history file anchored at the proposed index start that
            // reaches at least as far as the current history proposal
            // already covers it.
            let found_superset =
                r.index.start == item.start_tx_num() && item.end_tx_num() >= r.history.end;
            if found_superset {
                r.history.present = false;
                r.history.start = start;
                r.history.end = item.end_tx_num();
            } else if start < item.start_tx_num()
                && (!r.history.present || start < r.history.start)
            {
                r.history.present = true;
                r.history.start = start;
                r.history.end = item.end_tx_num();
            }
        }
        reconcile_history_index(&mut r);
        r
    }

    pub fn max_tx_num_in_files(&self, frozen_only: bool) -> u64 {
        let own = if frozen_only {
            self.files
                .iter()
                .rev()
                .find(|f| f.item().frozen)
                .map(|f| f.end_tx_num())
                .unwrap_or(0)
        } else {
            self.files.last().map(|f| f.end_tx_num()).unwrap_or(0)
        };
        own.min(self.ic.max_tx_num_in_files(frozen_only))
    }

    /// Input files for the proposed ranges: `(index, history, start_idx)`.
    ///
    /// History inputs come from this view, but their paired index files
    /// are looked up in the raw sibling set — an interrupted earlier
    /// merge may have replaced them in the index view while the small
    /// files still exist for exactly this pairing.
    pub fn static_files_in_range(
        &self,
        r: &HistoryRanges,
    ) -> Result<(Vec<FileRef>, Vec<FileRef>, usize)> {
        if !r.history.present && r.index.present {
            let (index_files, start_j) = self.ic.static_files_in_range(r.index.start, r.index.end);
            return Ok((index_files, Vec::new(), start_j));
        }

        let mut index_files = Vec::new();
        let mut history_files = Vec::new();
        let mut start_j = 0;
        if r.history.present {
            let cfg = &self.h.cfg;
            let step = cfg.aggregation_step;
            for item in &self.files {
                if item.start_tx_num() < r.history.start {
                    start_j += 1;
                    continue;
                }
                if item.end_tx_num() > r.history.end {
                    break;
                }
                let (from_step, to_step) = (item.start_tx_num() / step, item.end_tx_num() / step);
                let paired = self
                    .h
                    .inverted_index
                    .files()
                    .get(item.start_tx_num(), item.end_tx_num())
                    .and_then(|idx| FileRef::acquire(&idx));
                match paired {
                    Some(idx_ref) => {
                        history_files.push(item.clone());
                        index_files.push(idx_ref);
                    }
                    None => {
                        return Err(MergeError::MissingPair {
                            index_file: cfg
                                .ef_file_path(from_step, to_step)
                                .file_name()
                                .map(|n| n.to_string_lossy().into_owned())
                                .unwrap_or_default(),
                            history_file: cfg
                                .v_file_path(from_step, to_step)
                                .file_name()
                                .map(|n| n.to_string_lossy().into_owned())
                                .unwrap_or_default(),
                        })
                    }
                }
            }
            if r.index.present && index_files.len() != history_files.len() {
                warn!(
                    index_files = index_files.len(),
                    history_files = history_files.len(),
                    "mismatched file counts for paired merge"
                );
            }
        }
        Ok((index_files, history_files, start_j))
    }

    /// Merge the index side, then — when the history range is present —
    /// the paired history files. Returns `(index, history)` outputs.
    pub fn merge_files(
        &self,
        cancel: &CancelToken,
        index_files: &[FileRef],
        history_files: &[FileRef],
        r: &HistoryRanges,
        progress: &MergeProgress,
    ) -> Result<(Option<Arc<FileItem>>, Option<Arc<FileItem>>)> {
        if !r.any() {
            return Ok((None, None));
        }

        // When only history merges (its index merged further ahead in an
        // earlier round), an index file covering exactly the history
        // range is still required: the history accessor is keyed by the
        // (txNum, key) pairs of that range. Reuse one if an interrupted
        // run already produced it, else union the paired small files.
        let mut index_is_new = true;
        let index_in = if r.index.present {
            self.ic
                .merge_files(cancel, index_files, r.index.start, r.index.end, progress)?
        } else {
            let existing = self
                .h
                .inverted_index
                .files()
                .get(r.history.start, r.history.end)
                .filter(|item| item.handles().is_some());
            match existing {
                Some(item) => {
                    index_is_new = false;
                    item
                }
                None => self.ic.merge_files(
                    cancel,
                    index_files,
                    r.history.start,
                    r.history.end,
                    progress,
                )?,
            }
        };

        if !r.history.present {
            return Ok((Some(index_in), None));
        }

        let cfg = &self.h.cfg;
        let step = cfg.aggregation_step;
        let (from_step, to_step) = (r.history.start / step, r.history.end / step);
        let dat_path = cfg.v_file_path(from_step, to_step);
        let idx_path = cfg.v_accessor_file_path(from_step, to_step);

        let result = self.merge_history_inner(
            cancel,
            index_files,
            history_files,
            &index_in,
            r,
            progress,
        );
        match result {
            Ok(history_in) => Ok((Some(index_in), Some(history_in))),
            Err(e) => {
                // A freshly merged index output cannot be installed
                // without its history sibling; unwind it too. A reused
                // pre-existing index file stays.
                if index_is_new {
                    index_in.mark_can_delete();
                    index_in.close_files_and_remove();
                }
                for path in [&dat_path, &idx_path] {
                    let _ = fs::remove_file(path);
                }
                Err(e)
            }
        }
    }

    fn merge_history_inner(
        &self,
        cancel: &CancelToken,
        index_files: &[FileRef],
        history_files: &[FileRef],
        index_in: &Arc<FileItem>,
        r: &HistoryRanges,
        progress: &MergeProgress,
    ) -> Result<Arc<FileItem>> {
        let cfg = &self.h.cfg;
        let step = cfg.aggregation_step;
        let (from_step, to_step) = (r.history.start / step, r.history.end / step);

        let _read_ahead: Vec<_> = index_files
            .iter()
            .chain(history_files.iter())
            .map(|f| f.data().read_ahead())
            .collect();
        cancel.check()?;

        let dat_path = cfg.v_file_path(from_step, to_step);
        let idx_path = cfg.v_accessor_file_path(from_step, to_step);
        let tmp_dir = cfg
            .tmp_dir
            .join(format!("{}-v-{}-{}", cfg.filename_base, from_step, to_step));
        debug!(
            stream = %cfg.filename_base,
            range = %format!("{from_step}-{to_step}"),
            inputs = history_files.len(),
            "merging history files"
        );
        let mut writer = SegmentWriter::create(&dat_path, &tmp_dir, cfg.compress, cfg.no_fsync)?;

        let mut heap = CursorHeap::new();
        for idx_item in index_files {
            // Full scan: interrupted shutdowns legitimately leave
            // differing file counts between the two sides.
            let paired = history_files.iter().find(|h| {
                h.start_tx_num() == idx_item.start_tx_num()
                    && h.end_tx_num() == idx_item.end_tx_num()
            });
            let paired = match paired {
                Some(p) => p,
                None => {
                    return Err(MergeError::MissingPair {
                        index_file: idx_item.data().file_name(),
                        history_file: cfg
                            .v_file_path(
                                idx_item.start_tx_num() / step,
                                idx_item.end_tx_num() / step,
                            )
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                    })
                }
            };
            if let Some(cursor) = CursorItem::from_file(
                idx_item.data().getter(),
                Some(paired.data().getter()),
                idx_item.start_tx_num(),
                idx_item.end_tx_num(),
                false,
            )? {
                heap.push(cursor);
            }
        }

        // Values are appended in true tx-num order: equal keys pop
        // earliest-file first, and within one cursor the paired getter
        // yields values in posting-list order.
        let mut key_count: u64 = 0;
        let mut iterations = 0u64;
        loop {
            let last_key = match heap.peek() {
                Some(top) => top.key.clone(),
                None => break,
            };
            iterations += 1;
            if iterations & CANCEL_CHECK_MASK == 0 {
                cancel.check()?;
            }
            while heap.peek().map_or(false, |c| c.key == last_key) {
                let mut cursor = heap.pop().expect("peeked");
                let count = EliasFano::count_of(&cursor.val)?;
                {
                    let pair = cursor
                        .pair_getter_mut()
                        .expect("history cursor carries a paired getter");
                    for i in 0..count {
                        assert!(
                            pair.has_next(),
                            "history file {} exhausted at value {i} of {count} for key {:02x?}",
                            pair.file_name(),
                            last_key
                        );
                        let value = pair.next()?;
                        writer.add_word(&value)?;
                    }
                }
                key_count += count;
                if cursor.advance()? {
                    heap.push(cursor);
                }
            }
            progress.keys_processed.fetch_add(1, Ordering::Relaxed);
        }
        writer.compress()?;
        drop(writer);

        let data = Arc::new(SegmentReader::open(&dat_path)?);
        let index_data = Arc::clone(
            &index_in
                .handles()
                .expect("freshly merged index file has handles")
                .data,
        );

        // Accessor keys are (txNum || key); offsets point at the value
        // words of the new history file in emission order.
        let mut builder = AccessorBuilder::new(&idx_path, key_count, cfg.salt, cfg.no_fsync);
        let mut attempt = 0u32;
        loop {
            cancel.check()?;
            let mut keys = index_data.getter();
            let mut values = data.getter();
            let mut value_offset = 0u64;
            let mut history_key = Vec::new();
            while keys.has_next() {
                let key = keys.next()?;
                let posting = keys.next()?;
                let ef = EliasFano::read(&posting)?;
                for tx_num in ef.iter() {
                    history_key.clear();
                    history_key.extend_from_slice(&tx_num.to_be_bytes());
                    history_key.extend_from_slice(&key);
                    builder.add_key(&history_key, value_offset);
                    value_offset = values.skip()?;
                }
            }
            if builder.try_build()? {
                break;
            }
            attempt += 1;
            if attempt >= DEFAULT_ACCESSOR_RETRIES {
                return Err(MergeError::AccessorCollision {
                    path: idx_path,
                    retries: attempt,
                });
            }
            warn!(path = %idx_path.display(), attempt, "accessor collision, restarting with next salt");
            builder.reset_next_salt();
        }
        let accessor = AccessorIndex::open(&idx_path)?;

        let out_item = Arc::new(FileItem::new(
            r.history.start,
            r.history.end,
            step,
            cfg.steps_in_frozen_file,
        ));
        out_item.set_handles(FileHandles {
            data,
            accessor: Some(accessor),
            btree: None,
            existence: None,
        });

        let _ = fs::remove_dir(&tmp_dir);
        self.h.note_merge();
        progress.files_built.fetch_add(1, Ordering::Relaxed);
        Ok(out_item)
    }

    /// Retire garbage after a paired merge. Skipped entirely while no
    /// history file was merged: the small index files must survive until
    /// history catches up, because they are its only pairing source.
    pub fn clean_after_merge(
        &self,
        merged: Option<&Arc<FileItem>>,
        merged_idx: Option<&Arc<FileItem>>,
    ) {
        let Some(merged) = merged else { return };
        for out in self.garbage(merged) {
            self.h.files.remove(&out);
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
        self.h.files.re_calc_visible();
        self.ic.clean_after_merge(merged_idx);
    }

    pub(crate) fn garbage(&self, merged: &Arc<FileItem>) -> Vec<Arc<FileItem>> {
        let mut outs = Vec::new();
        for item in self.h.files.walk() {
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
