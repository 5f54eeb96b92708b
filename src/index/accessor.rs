//! Salted-hash accessor index: key bytes → u64 offset.
//!
//! Keys are stored as salted 64-bit fingerprints sorted for binary
//! search. Two distinct keys landing on the same fingerprint is a
//! collision; the builder reports it and the caller restarts with the
//! next salt (bounded retries). Identical keys never occur — merge
//! output emits each key once.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};
use crate::index::fingerprint64;

/// Default ceiling for collision-driven salt restarts.
pub const DEFAULT_ACCESSOR_RETRIES: u32 = 8;

#[derive(Serialize, Deserialize)]
struct AccessorPayload {
    version: u8,
    salt: u32,
    entries: Vec<(u64, u64)>,
}

/// Builder for an [`AccessorIndex`] file.
pub struct AccessorBuilder {
    path: PathBuf,
    salt: u32,
    no_fsync: bool,
    entries: Vec<(u64, u64)>,
}

impl AccessorBuilder {
    pub fn new(path: impl Into<PathBuf>, key_count: u64, salt: u32, no_fsync: bool) -> Self {
        Self {
            path: path.into(),
            salt,
            no_fsync,
            entries: Vec::with_capacity(key_count as usize),
        }
    }

    pub fn salt(&self) -> u32 {
        self.salt
    }

    pub fn add_key(&mut self, key: &[u8], offset: u64) {
        self.entries.push((fingerprint64(self.salt, key), offset));
    }

    /// Clear staged keys and move to the next salt after a collision.
    pub fn reset_next_salt(&mut self) {
        self.salt = self.salt.wrapping_add(1);
        self.entries.clear();
    }

    /// Attempt to write the index file. Returns `Ok(false)` when two
    /// staged keys collided on fingerprint — the caller should
    /// [`AccessorBuilder::reset_next_salt`], re-feed the keys and retry.
    pub fn try_build(&mut self) -> Result<bool> {
        self.entries.sort_unstable_by_key(|(fp, _)| *fp);
        if self.entries.windows(2).any(|w| w[0].0 == w[1].0) {
            return Ok(false);
        }
        let payload = AccessorPayload {
            version: 1,
            salt: self.salt,
            entries: std::mem::take(&mut self.entries),
        };
        let bytes = bincode::serialize(&payload)?;
        let mut file = File::create(&self.path)?;
        file.write_all(&bytes)?;
        if !self.no_fsync {
            file.sync_all()?;
        }
        Ok(true)
    }
}

/// Immutable key → offset accessor, loaded fully in memory.
pub struct AccessorIndex {
    path: PathBuf,
    salt: u32,
    entries: Vec<(u64, u64)>,
}

impl AccessorIndex {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let bytes = fs::read(&path)?;
        let payload: AccessorPayload = bincode::deserialize(&bytes)?;
        if payload.version != 1 {
            return Err(MergeError::corrupt(
                &path,
                format!("unsupported accessor version {}", payload.version),
            ));
        }
        Ok(Self {
            path,
            salt: payload.salt,
            entries: payload.entries,
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn lookup(&self, key: &[u8]) -> Option<u64> {
        let fp = fingerprint64(self.salt, key);
        self.entries
            .binary_search_by_key(&fp, |(f, _)| *f)
            .ok()
            .map(|i| self.entries[i].1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1-test.0-1.kvi");
        let mut b = AccessorBuilder::new(&path, 3, 42, true);
        b.add_key(b"alpha", 0);
        b.add_key(b"beta", 17);
        b.add_key(b"gamma", 99);
        assert!(b.try_build().unwrap());

        let idx = AccessorIndex::open(&path).unwrap();
        assert_eq!(idx.key_count(), 3);
        assert_eq!(idx.lookup(b"alpha"), Some(0));
        assert_eq!(idx.lookup(b"beta"), Some(17));
        assert_eq!(idx.lookup(b"gamma"), Some(99));
        assert_eq!(idx.lookup(b"delta"), None);
    }

    #[test]
    fn test_collision_retry_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1-test.0-1.kvi");
        let mut b = AccessorBuilder::new(&path, 2, 7, true);
        // Same key staged twice models a fingerprint collision.
        b.add_key(b"dup", 1);
        b.add_key(b"dup", 2);
        assert!(!b.try_build().unwrap());

        let before = b.salt();
        b.reset_next_salt();
        assert_ne!(b.salt(), before);
        b.add_key(b"one", 1);
        b.add_key(b"two", 2);
        assert!(b.try_build().unwrap());
    }
}
