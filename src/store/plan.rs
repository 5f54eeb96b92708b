//! Merge planning: translating a view's file layout into concrete
//! merge ranges.
//!
//! A file ending at step `e` may legally grow to span `e & -e` steps —
//! the lowest set bit of its end step. Walking the view and keeping the
//! candidate with the smallest start yields the longest merge the
//! dyadic hierarchy allows.

use std::fmt;

use crate::store::FileRef;

/// A proposed merge for one sub-stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeRange {
    pub present: bool,
    pub start: u64,
    pub end: u64,
}

impl MergeRange {
    pub fn none() -> Self {
        Self::default()
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::none();
    }

    /// Render as `from-to` in step units.
    pub fn display_steps(&self, step: u64) -> String {
        format!("{}-{}", self.start / step, self.end / step)
    }
}

/// Merge proposal for a history stream and its sibling inverted index.
#[derive(Clone, Copy, Debug, Default)]
pub struct HistoryRanges {
    pub history: MergeRange,
    pub index: MergeRange,
}

impl HistoryRanges {
    pub fn any(&self) -> bool {
        self.history.present || self.index.present
    }

    pub fn display(&self, step: u64) -> String {
        let mut s = String::new();
        if self.history.present {
            s += &format!("hist: {}, ", self.history.display_steps(step));
        }
        if self.index.present {
            s += &format!("idx: {}", self.index.display_steps(step));
        }
        s
    }
}

/// Merge proposal for a domain: values plus its history/index side.
#[derive(Clone, Copy, Debug)]
pub struct DomainRanges {
    pub values: MergeRange,
    pub history: MergeRange,
    pub index: MergeRange,
    pub agg_step: u64,
}

impl DomainRanges {
    pub fn any(&self) -> bool {
        self.values.present || self.history.present || self.index.present
    }

    pub fn history_ranges(&self) -> HistoryRanges {
        HistoryRanges {
            history: self.history,
            index: self.index,
        }
    }
}

impl fmt::Display for DomainRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        if self.values.present {
            write!(f, "val:{}", self.values.display_steps(self.agg_step))?;
            wrote = true;
        }
        if self.history.present {
            if wrote {
                write!(f, ", ")?;
            }
            write!(f, "hist:{}", self.history.display_steps(self.agg_step))?;
            wrote = true;
        }
        if self.index.present {
            if wrote {
                write!(f, ", ")?;
            }
            write!(f, "idx:{}", self.index.display_steps(self.agg_step))?;
        }
        Ok(())
    }
}

/// Largest legal span (in tx numbers) of a file ending at `end_tx_num`,
/// capped by `max_span`.
pub(crate) fn dyadic_span(end_tx_num: u64, step: u64, max_span: u64) -> u64 {
    let end_step = end_tx_num / step;
    let span_step = end_step & end_step.wrapping_neg();
    (span_step * step).min(max_span)
}

/// Walk a view ascending and pick the merge candidate with the smallest
/// start. With `with_superset`, a file that strictly covers the current
/// selection replaces it and clears the proposal — the bigger file
/// already exists, so there is nothing left to merge below it.
pub(crate) fn scan_merge_candidates(
    files: &[FileRef],
    step: u64,
    max_end_tx_num: u64,
    max_span: u64,
    with_superset: bool,
) -> MergeRange {
    let mut r = MergeRange::none();
    for item in files {
        if item.end_tx_num() > max_end_tx_num {
            continue;
        }
        let span = dyadic_span(item.end_tx_num(), step, max_span);
        let start = item.end_tx_num() - span;
        let found_superset =
            with_superset && r.start == item.start_tx_num() && item.end_tx_num() >= r.end;
        if found_superset {
            r.present = false;
            r.start = start;
            r.end = item.end_tx_num();
        } else if start < item.start_tx_num() && (!r.present || start < r.start) {
            r.present = true;
            r.start = start;
            r.end = item.end_tx_num();
        }
    }
    r
}

/// Drop one side of a (history, index) proposal so the pair invariant
/// stays monotone: history must never outrun its index, and a lagging
/// history catches up before the index merges further.
pub(crate) fn reconcile_history_index(r: &mut HistoryRanges) {
    if !(r.history.present && r.index.present) {
        return;
    }
    if r.history.end > r.index.end {
        r.history.clear();
    } else if r.history.end < r.index.end {
        r.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dyadic_span() {
        // end step 6 = 0b110 spans 2 steps; end step 8 spans 8.
        assert_eq!(dyadic_span(6, 1, u64::MAX), 2);
        assert_eq!(dyadic_span(8, 1, u64::MAX), 8);
        assert_eq!(dyadic_span(8, 1, 4), 4);
        assert_eq!(dyadic_span(12, 2, u64::MAX), 4);
    }

    #[test]
    fn test_reconcile_drops_leading_history() {
        let mut r = HistoryRanges {
            history: MergeRange {
                present: true,
                start: 0,
                end: 8,
            },
            index: MergeRange {
                present: true,
                start: 0,
                end: 4,
            },
        };
        reconcile_history_index(&mut r);
        assert!(!r.history.present);
        assert!(r.index.present);
    }

    #[test]
    fn test_reconcile_drops_leading_index() {
        let mut r = HistoryRanges {
            history: MergeRange {
                present: true,
                start: 2,
                end: 4,
            },
            index: MergeRange {
                present: true,
                start: 0,
                end: 8,
            },
        };
        reconcile_history_index(&mut r);
        assert!(r.history.present);
        assert!(!r.index.present);
    }

    #[test]
    fn test_reconcile_keeps_equal_pair() {
        let mut r = HistoryRanges {
            history: MergeRange {
                present: true,
                start: 0,
                end: 4,
            },
            index: MergeRange {
                present: true,
                start: 0,
                end: 4,
            },
        };
        reconcile_history_index(&mut r);
        assert!(r.history.present && r.index.present);
    }

    #[test]
    fn test_domain_ranges_display() {
        let r = DomainRanges {
            values: MergeRange {
                present: true,
                start: 0,
                end: 8,
            },
            history: MergeRange::none(),
            index: MergeRange {
                present: true,
                start: 0,
                end: 8,
            },
            agg_step: 2,
        };
        assert_eq!(r.to_string(), "val:0-4, idx:0-4");
    }
}
