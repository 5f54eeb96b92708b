//! Ordered key index with embedded cursor, backed by an FST map.
//!
//! Used as the `.bt` sibling of domain values files: maps every key to
//! its byte offset in the data file and supports ordered iteration,
//! which the accessor flavour cannot.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use fst::{Map, MapBuilder, Streamer};

use crate::error::{MergeError, Result};

/// Builder for a [`BtreeIndex`] file. Keys must be added in ascending
/// byte order — merge output already satisfies this.
pub struct BtreeIndexBuilder {
    path: PathBuf,
    no_fsync: bool,
    builder: MapBuilder<Vec<u8>>,
    key_count: u64,
}

impl BtreeIndexBuilder {
    pub fn new(path: impl Into<PathBuf>, no_fsync: bool) -> Self {
        Self {
            path: path.into(),
            no_fsync,
            builder: MapBuilder::memory(),
            key_count: 0,
        }
    }

    pub fn add_key(&mut self, key: &[u8], offset: u64) -> Result<()> {
        self.builder
            .insert(key, offset)
            .map_err(|e| MergeError::IndexBuild(e.to_string()))?;
        self.key_count += 1;
        Ok(())
    }

    pub fn build(self) -> Result<BtreeIndex> {
        let bytes = self
            .builder
            .into_inner()
            .map_err(|e| MergeError::IndexBuild(e.to_string()))?;
        let mut file = File::create(&self.path)?;
        file.write_all(&bytes)?;
        if !self.no_fsync {
            file.sync_all()?;
        }
        let map = Map::new(bytes).map_err(|e| MergeError::IndexBuild(e.to_string()))?;
        Ok(BtreeIndex {
            path: self.path,
            map,
        })
    }
}

/// Immutable ordered key → offset index.
pub struct BtreeIndex {
    path: PathBuf,
    map: Map<Vec<u8>>,
}

impl BtreeIndex {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let bytes = fs::read(&path)?;
        let map = Map::new(bytes).map_err(|e| MergeError::corrupt(&path, e.to_string()))?;
        Ok(Self { path, map })
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }

    pub fn key_count(&self) -> usize {
        self.map.len()
    }

    pub fn get(&self, key: &[u8]) -> Option<u64> {
        self.map.get(key)
    }

    /// Ordered cursor over `(key, offset)` pairs.
    pub fn keys(&self) -> BtreeCursor<'_> {
        BtreeCursor {
            stream: self.map.stream(),
        }
    }
}

/// Ordered iteration over a [`BtreeIndex`].
pub struct BtreeCursor<'a> {
    stream: fst::map::Stream<'a>,
}

impl BtreeCursor<'_> {
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<(Vec<u8>, u64)> {
        self.stream.next().map(|(k, v)| (k.to_vec(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_open_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1-test.0-2.bt");
        let mut b = BtreeIndexBuilder::new(&path, true);
        b.add_key(b"aaa", 0).unwrap();
        b.add_key(b"bbb", 10).unwrap();
        b.add_key(b"ccc", 25).unwrap();
        let built = b.build().unwrap();
        assert_eq!(built.key_count(), 3);

        let idx = BtreeIndex::open(&path).unwrap();
        assert_eq!(idx.get(b"bbb"), Some(10));
        assert_eq!(idx.get(b"zzz"), None);

        let mut cursor = idx.keys();
        assert_eq!(cursor.next(), Some((b"aaa".to_vec(), 0)));
        assert_eq!(cursor.next(), Some((b"bbb".to_vec(), 10)));
        assert_eq!(cursor.next(), Some((b"ccc".to_vec(), 25)));
        assert_eq!(cursor.next(), None);
    }

    #[test]
    fn test_out_of_order_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1-test.0-2.bt");
        let mut b = BtreeIndexBuilder::new(&path, true);
        b.add_key(b"bbb", 0).unwrap();
        assert!(b.add_key(b"aaa", 1).is_err());
    }
}
