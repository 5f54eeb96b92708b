//! Merge cursors and their heap ordering.
//!
//! A cursor walks one sorted `(key, value)` source. The kinds form a
//! closed set, so dispatch is a tagged variant rather than a trait
//! object; the heap stores the variant directly.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::seg::WordGetter;

/// Where a cursor's pairs come from.
pub enum CursorSource {
    /// Sequential scan of an immutable segment file; history merges
    /// additionally carry a second getter into the paired values file.
    File {
        getter: WordGetter,
        pair_getter: Option<WordGetter>,
    },
    /// In-memory pairs, already sorted by key.
    Ram {
        items: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
    },
}

/// One entry of the multi-way merge heap.
pub struct CursorItem {
    pub key: Vec<u8>,
    pub val: Vec<u8>,
    pub start_tx_num: u64,
    pub end_tx_num: u64,
    /// Tie-break order for equal keys: `true` pops later files first
    /// (newest wins), `false` pops earlier files first (tx-num order).
    pub reverse: bool,
    pub source: CursorSource,
}

impl CursorItem {
    /// Open a cursor over a file source positioned at its first pair.
    /// Returns `None` for an empty file.
    pub fn from_file(
        mut getter: WordGetter,
        pair_getter: Option<WordGetter>,
        start_tx_num: u64,
        end_tx_num: u64,
        reverse: bool,
    ) -> Result<Option<Self>> {
        if !getter.has_next() {
            return Ok(None);
        }
        let key = getter.next()?;
        let val = getter.next()?;
        Ok(Some(Self {
            key,
            val,
            start_tx_num,
            end_tx_num,
            reverse,
            source: CursorSource::File {
                getter,
                pair_getter,
            },
        }))
    }

    /// Open a cursor over sorted in-memory pairs.
    pub fn from_ram(
        pairs: Vec<(Vec<u8>, Vec<u8>)>,
        start_tx_num: u64,
        end_tx_num: u64,
        reverse: bool,
    ) -> Option<Self> {
        let mut items = pairs.into_iter();
        let (key, val) = items.next()?;
        Some(Self {
            key,
            val,
            start_tx_num,
            end_tx_num,
            reverse,
            source: CursorSource::Ram { items },
        })
    }

    /// Load the next `(key, value)` pair. Returns `false` when the
    /// source is exhausted; the cursor must then leave the heap.
    pub fn advance(&mut self) -> Result<bool> {
        match &mut self.source {
            CursorSource::File { getter, .. } => {
                if !getter.has_next() {
                    return Ok(false);
                }
                self.key = getter.next()?;
                self.val = getter.next()?;
                Ok(true)
            }
            CursorSource::Ram { items } => match items.next() {
                Some((key, val)) => {
                    self.key = key;
                    self.val = val;
                    Ok(true)
                }
                None => Ok(false),
            },
        }
    }

    /// The paired values getter of a history cursor.
    pub fn pair_getter_mut(&mut self) -> Option<&mut WordGetter> {
        match &mut self.source {
            CursorSource::File { pair_getter, .. } => pair_getter.as_mut(),
            CursorSource::Ram { .. } => None,
        }
    }
}

impl PartialEq for CursorItem {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.end_tx_num == other.end_tx_num
    }
}

impl Eq for CursorItem {}

impl PartialOrd for CursorItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CursorItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; the smallest key must surface, so
        // the key comparison is inverted. Equal keys order by
        // end_tx_num according to `reverse`.
        other.key.cmp(&self.key).then_with(|| {
            if self.reverse {
                self.end_tx_num.cmp(&other.end_tx_num)
            } else {
                other.end_tx_num.cmp(&self.end_tx_num)
            }
        })
    }
}

/// Multi-way merge heap: smallest key on top.
pub type CursorHeap = BinaryHeap<CursorItem>;

#[cfg(test)]
mod tests {
    use super::*;

    fn ram(key: &[u8], end: u64, reverse: bool) -> CursorItem {
        CursorItem::from_ram(
            vec![(key.to_vec(), b"v".to_vec())],
            0,
            end,
            reverse,
        )
        .unwrap()
    }

    #[test]
    fn test_heap_orders_by_key_ascending() {
        let mut heap = CursorHeap::new();
        heap.push(ram(b"bbb", 1, true));
        heap.push(ram(b"aaa", 1, true));
        heap.push(ram(b"ccc", 1, true));
        assert_eq!(heap.pop().unwrap().key, b"aaa");
        assert_eq!(heap.pop().unwrap().key, b"bbb");
        assert_eq!(heap.pop().unwrap().key, b"ccc");
    }

    #[test]
    fn test_equal_keys_reverse_pops_latest_first() {
        let mut heap = CursorHeap::new();
        heap.push(ram(b"k", 2, true));
        heap.push(ram(b"k", 8, true));
        heap.push(ram(b"k", 4, true));
        assert_eq!(heap.pop().unwrap().end_tx_num, 8);
        assert_eq!(heap.pop().unwrap().end_tx_num, 4);
        assert_eq!(heap.pop().unwrap().end_tx_num, 2);
    }

    #[test]
    fn test_equal_keys_forward_pops_earliest_first() {
        let mut heap = CursorHeap::new();
        heap.push(ram(b"k", 8, false));
        heap.push(ram(b"k", 2, false));
        heap.push(ram(b"k", 4, false));
        assert_eq!(heap.pop().unwrap().end_tx_num, 2);
        assert_eq!(heap.pop().unwrap().end_tx_num, 4);
        assert_eq!(heap.pop().unwrap().end_tx_num, 8);
    }

    #[test]
    fn test_ram_cursor_advances_in_order() {
        let mut cursor = CursorItem::from_ram(
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
            ],
            0,
            4,
            true,
        )
        .unwrap();
        assert_eq!(cursor.key, b"a");
        assert!(cursor.advance().unwrap());
        assert_eq!(cursor.key, b"b");
        assert_eq!(cursor.val, b"2");
        assert!(!cursor.advance().unwrap());
    }
}
