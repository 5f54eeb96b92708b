//! Domain streams: latest value per key, with the change history and
//! its inverted index underneath.

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::config::{DomainConfig, IndexFlavor, StreamConfig};
use crate::error::Result;
use crate::index::BtreeIndexBuilder;
use crate::seg::{SegmentReader, SegmentWriter};
use crate::store::{
    build_existence_filter, build_key_accessor, dyadic_span, materialize_view, CursorHeap,
    CursorItem, DomainRanges, FileHandles, FileItem, FileRef, FileSet, History, HistoryView,
    MergeProgress, MergeRange, CANCEL_CHECK_MASK,
};

/// The one key a value transformer must never rewrite: it carries the
/// commitment state head rather than a branch reference.
pub const COMMITMENT_STATE_KEY: &[u8] = b"state";

/// Caller-supplied rewrite of merged values, keyed by the tx range of
/// the file the value came from. Used by the commitment domain to
/// re-target branch references onto the merged files.
pub type ValueTransformer<'a> = dyn Fn(&[u8], u64, u64) -> Result<Vec<u8>> + 'a;

/// One domain stream, owning its history (which owns the index).
pub struct Domain {
    cfg: StreamConfig,
    index_flavor: IndexFlavor,
    with_existence_index: bool,
    history: History,
    files: FileSet,
    merges_count: AtomicU64,
}

impl Domain {
    pub fn new(cfg: DomainConfig) -> Self {
        Self {
            history: History::new(
                cfg.stream.clone(),
                cfg.with_existence_index,
                cfg.dont_produce_history_files,
            ),
            index_flavor: cfg.index_flavor,
            with_existence_index: cfg.with_existence_index,
            cfg: cfg.stream,
            files: FileSet::new(),
            merges_count: AtomicU64::new(0),
        }
    }

    pub fn cfg(&self) -> &StreamConfig {
        &self.cfg
    }

    pub fn history(&self) -> &History {
        &self.history
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

    /// End of coverage across all three sub-streams.
    pub fn end_tx_num_minimax(&self) -> u64 {
        let mut minimax = self.history.end_tx_num_minimax();
        if let Some(end) = self.files.max_end_tx_num() {
            if minimax == 0 || end < minimax {
                minimax = end;
            }
        }
        minimax
    }

    /// Register a freshly built (values, history, index) triple; sides
    /// built elsewhere may be absent.
    pub fn integrate_ingested_files(
        &self,
        values_item: Option<Arc<FileItem>>,
        history_item: Option<Arc<FileItem>>,
        index_item: Option<Arc<FileItem>>,
    ) {
        self.history.integrate_ingested_files(history_item, index_item);
        if let Some(item) = values_item {
            self.files.insert(item);
        }
        self.files.re_calc_visible();
    }

    /// Install merged outputs and retire their inputs, including any
    /// interrupted-merge leftovers inside the merged values range.
    #[allow(clippy::too_many_arguments)]
    pub fn integrate_merged_files(
        &self,
        values_outs: Vec<Arc<FileItem>>,
        index_outs: Vec<Arc<FileItem>>,
        history_outs: Vec<Arc<FileItem>>,
        values_in: Option<Arc<FileItem>>,
        index_in: Option<Arc<FileItem>>,
        history_in: Option<Arc<FileItem>>,
    ) {
        self.history
            .integrate_merged_files(index_outs, history_outs, index_in, history_in);
        let mut outs = values_outs;
        if let Some(ref in_item) = values_in {
            self.files.insert(Arc::clone(in_item));
            for item in self.files.walk() {
                if item.frozen
                    || item.start_tx_num < in_item.start_tx_num
                    || item.end_tx_num > in_item.end_tx_num
                    || (item.start_tx_num == in_item.start_tx_num
                        && item.end_tx_num == in_item.end_tx_num)
                {
                    continue;
                }
                outs.push(item);
            }
        }
        for out in outs {
            self.files.remove(&out);
            out.mark_can_delete();
        }
        self.files.re_calc_visible();
    }

    pub fn view(&self) -> DomainView<'_> {
        DomainView {
            d: self,
            hc: self.history.view(),
            files: materialize_view(&self.files),
        }
    }
}

/// Snapshot of a domain and its history/index side.
pub struct DomainView<'a> {
    d: &'a Domain,
    pub hc: HistoryView<'a>,
    pub files: Vec<FileRef>,
}

impl DomainView<'_> {
    pub fn stream(&self) -> &Domain {
        self.d
    }

    pub fn find_merge_range(&self, max_end_tx_num: u64, max_span: u64) -> DomainRanges {
        let hr = self.hc.find_merge_range(max_end_tx_num, max_span);
        let step = self.d.cfg.aggregation_step;
        let mut r = DomainRanges {
            values: MergeRange::none(),
            history: hr.history,
            index: hr.index,
            agg_step: step,
        };
        for item in &self.files {
            if item.end_tx_num() > max_end_tx_num {
                break;
            }
            let span = dyadic_span(item.end_tx_num(), step, max_span);
            let start = item.end_tx_num() - span;
            if start < item.start_tx_num() && (!r.values.present || start < r.values.start) {
                r.values.present = true;
                r.values.start = start;
                r.values.end = item.end_tx_num();
            }
        }
        r
    }

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

    /// Input files for the proposed ranges:
    /// `(values, index, history, start_idx)`.
    pub fn static_files_in_range(
        &self,
        r: &DomainRanges,
    ) -> Result<(Vec<FileRef>, Vec<FileRef>, Vec<FileRef>, usize)> {
        let (index_files, history_files, mut start_j) = if r.index.present || r.history.present {
            self.hc.static_files_in_range(&r.history_ranges())?
        } else {
            (Vec::new(), Vec::new(), 0)
        };
        let mut values_files = Vec::new();
        if r.values.present {
            for item in &self.files {
                if item.start_tx_num() < r.values.start {
                    start_j += 1;
                    continue;
                }
                if item.end_tx_num() > r.values.end {
                    break;
                }
                values_files.push(item.clone());
            }
        }
        Ok((values_files, index_files, history_files, start_j))
    }

    /// Merge the history/index side, then the values files: newest file
    /// wins per key, an empty value at the absolute origin deletes the
    /// key, and an optional transformer rewrites surviving values.
    #[allow(clippy::too_many_arguments)]
    pub fn merge_files(
        &self,
        cancel: &CancelToken,
        values_files: &[FileRef],
        index_files: &[FileRef],
        history_files: &[FileRef],
        r: &DomainRanges,
        value_transformer: Option<&ValueTransformer<'_>>,
        progress: &MergeProgress,
    ) -> Result<(
        Option<Arc<FileItem>>,
        Option<Arc<FileItem>>,
        Option<Arc<FileItem>>,
    )> {
        if !r.any() {
            return Ok((None, None, None));
        }

        let (index_in, history_in) = self.hc.merge_files(
            cancel,
            index_files,
            history_files,
            &r.history_ranges(),
            progress,
        )?;

        if !r.values.present {
            return Ok((None, index_in, history_in));
        }

        let cfg = &self.d.cfg;
        let step = cfg.aggregation_step;
        let (from_step, to_step) = (r.values.start / step, r.values.end / step);
        let result =
            self.merge_values_inner(cancel, values_files, r, value_transformer, progress);
        match result {
            Ok(values_in) => Ok((Some(values_in), index_in, history_in)),
            Err(e) => {
                if let Some(item) = &history_in {
                    item.mark_can_delete();
                    item.close_files_and_remove();
                }
                if let Some(item) = &index_in {
                    // An index output reused from the sibling set is
                    // already installed; only fresh outputs unwind.
                    let installed = self
                        .d
                        .history
                        .inverted_index()
                        .files()
                        .get(item.start_tx_num, item.end_tx_num)
                        .map_or(false, |existing| Arc::ptr_eq(&existing, item));
                    if !installed {
                        item.mark_can_delete();
                        item.close_files_and_remove();
                    }
                }
                for path in [
                    cfg.kv_file_path(from_step, to_step),
                    cfg.kv_accessor_file_path(from_step, to_step),
                    cfg.kv_bt_file_path(from_step, to_step),
                    cfg.kv_existence_file_path(from_step, to_step),
                ] {
                    let _ = fs::remove_file(path);
                }
                Err(e)
            }
        }
    }

    fn merge_values_inner(
        &self,
        cancel: &CancelToken,
        values_files: &[FileRef],
        r: &DomainRanges,
        value_transformer: Option<&ValueTransformer<'_>>,
        progress: &MergeProgress,
    ) -> Result<Arc<FileItem>> {
        let cfg = &self.d.cfg;
        let step = cfg.aggregation_step;
        let (from_step, to_step) = (r.values.start / step, r.values.end / step);

        let _read_ahead: Vec<_> = values_files.iter().map(|f| f.data().read_ahead()).collect();
        cancel.check()?;

        let dat_path = cfg.kv_file_path(from_step, to_step);
        let tmp_dir = cfg
            .tmp_dir
            .join(format!("{}-kv-{}-{}", cfg.filename_base, from_step, to_step));
        debug!(
            stream = %cfg.filename_base,
            range = %r.to_string(),
            inputs = values_files.len(),
            "merging domain files"
        );
        let mut writer = SegmentWriter::create(&dat_path, &tmp_dir, cfg.compress, cfg.no_fsync)?;

        let mut heap = CursorHeap::new();
        for item in values_files {
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

        let transform = |key: &[u8], val: Vec<u8>, file_range: (u64, u64)| -> Result<Vec<u8>> {
            match value_transformer {
                Some(vt) if key != COMMITMENT_STATE_KEY => vt(&val, file_range.0, file_range.1),
                _ => Ok(val),
            }
        };

        let mut key_buf: Option<Vec<u8>> = None;
        let mut val_buf: Vec<u8> = Vec::new();
        let mut buf_file_range = (0u64, 0u64);
        let mut iterations = 0u64;
        loop {
            let (last_key, last_val, last_file_range) = match heap.peek() {
                Some(top) => (
                    top.key.clone(),
                    top.val.clone(),
                    (top.start_tx_num, top.end_tx_num),
                ),
                None => break,
            };
            iterations += 1;
            if iterations & CANCEL_CHECK_MASK == 0 {
                cancel.check()?;
            }
            // Advance every cursor holding this key; only the winner's
            // value (latest end_tx_num, popped first) is kept.
            while heap.peek().map_or(false, |c| c.key == last_key) {
                let mut cursor = heap.pop().expect("peeked");
                if cursor.advance()? {
                    heap.push(cursor);
                }
            }

            // An empty value merged down to the absolute origin means
            // the key was deleted and no older layer can shadow it.
            let deleted = r.values.start == 0 && last_val.is_empty();
            if !deleted {
                if let Some(key) = key_buf.take() {
                    let val = transform(&key, std::mem::take(&mut val_buf), buf_file_range)?;
                    writer.add_word(&key)?;
                    writer.add_word(&val)?;
                }
                key_buf = Some(last_key);
                val_buf = last_val;
                buf_file_range = last_file_range;
                progress.keys_processed.fetch_add(1, Ordering::Relaxed);
            }
        }
        if let Some(key) = key_buf.take() {
            let val = transform(&key, std::mem::take(&mut val_buf), buf_file_range)?;
            writer.add_word(&key)?;
            writer.add_word(&val)?;
        }
        writer.compress()?;
        drop(writer);

        let data = Arc::new(SegmentReader::open(&dat_path)?);
        let mut accessor = None;
        let mut btree = None;
        match self.d.index_flavor {
            IndexFlavor::Btree => {
                let mut builder =
                    BtreeIndexBuilder::new(cfg.kv_bt_file_path(from_step, to_step), cfg.no_fsync);
                let mut g = data.getter();
                while g.has_next() {
                    let offset = g.pos();
                    let key = g.next()?;
                    g.skip()?;
                    builder.add_key(&key, offset)?;
                }
                btree = Some(builder.build()?);
            }
            IndexFlavor::Accessor => {
                accessor = Some(build_key_accessor(
                    cancel,
                    &data,
                    &cfg.kv_accessor_file_path(from_step, to_step),
                    cfg.salt,
                    cfg.no_fsync,
                )?);
            }
        }
        let existence = if self.d.with_existence_index {
            Some(build_existence_filter(
                &data,
                &cfg.kv_existence_file_path(from_step, to_step),
                cfg.salt,
                cfg.no_fsync,
            )?)
        } else {
            None
        };

        let out_item = Arc::new(FileItem::new(
            r.values.start,
            r.values.end,
            step,
            cfg.steps_in_frozen_file,
        ));
        out_item.set_handles(FileHandles {
            data,
            accessor,
            btree,
            existence,
        });

        let _ = fs::remove_dir(&tmp_dir);
        self.d.note_merge();
        progress.files_built.fetch_add(1, Ordering::Relaxed);
        Ok(out_item)
    }

    /// Retire garbage after a merge across all three sub-streams.
    pub fn clean_after_merge(
        &self,
        merged_values: Option<&Arc<FileItem>>,
        merged_history: Option<&Arc<FileItem>>,
        merged_index: Option<&Arc<FileItem>>,
    ) {
        self.hc.clean_after_merge(merged_history, merged_index);
        let Some(merged) = merged_values else { return };
        for out in self.garbage(merged) {
            self.d.files.remove(&out);
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
        self.d.files.re_calc_visible();
    }

    pub(crate) fn garbage(&self, merged: &Arc<FileItem>) -> Vec<Arc<FileItem>> {
        let mut outs = Vec::new();
        for item in self.d.files.walk() {
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
