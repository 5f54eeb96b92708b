//! Existence filter: a compressed set of salted key fingerprints.
//!
//! `contains` may report a false positive on fingerprint collision but
//! never a false negative, so readers use it only to skip files that
//! certainly lack a key.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};
use crate::index::fingerprint32;

#[derive(Serialize, Deserialize)]
struct ExistencePayload {
    version: u8,
    salt: u32,
    bitmap: Vec<u8>,
}

/// Builder for an [`ExistenceFilter`] file.
pub struct ExistenceFilterBuilder {
    path: PathBuf,
    salt: u32,
    no_fsync: bool,
    bits: RoaringBitmap,
}

impl ExistenceFilterBuilder {
    pub fn new(path: impl Into<PathBuf>, salt: u32, no_fsync: bool) -> Self {
        Self {
            path: path.into(),
            salt,
            no_fsync,
            bits: RoaringBitmap::new(),
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.bits.insert(fingerprint32(self.salt, key));
    }

    pub fn build(self) -> Result<ExistenceFilter> {
        let mut bitmap = Vec::with_capacity(self.bits.serialized_size());
        self.bits
            .serialize_into(&mut bitmap)
            .map_err(|e| MergeError::IndexBuild(e.to_string()))?;
        let payload = ExistencePayload {
            version: 1,
            salt: self.salt,
            bitmap,
        };
        let bytes = bincode::serialize(&payload)?;
        let mut file = File::create(&self.path)?;
        file.write_all(&bytes)?;
        if !self.no_fsync {
            file.sync_all()?;
        }
        Ok(ExistenceFilter {
            path: self.path,
            salt: self.salt,
            bits: self.bits,
        })
    }
}

/// Immutable existence filter.
pub struct ExistenceFilter {
    path: PathBuf,
    salt: u32,
    bits: RoaringBitmap,
}

impl ExistenceFilter {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let bytes = fs::read(&path)?;
        let payload: ExistencePayload = bincode::deserialize(&bytes)?;
        if payload.version != 1 {
            return Err(MergeError::corrupt(
                &path,
                format!("unsupported filter version {}", payload.version),
            ));
        }
        let bits = RoaringBitmap::deserialize_from(&payload.bitmap[..])
            .map_err(|e| MergeError::corrupt(&path, e.to_string()))?;
        Ok(Self {
            path,
            salt: payload.salt,
            bits,
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.bits.contains(fingerprint32(self.salt, key))
    }
}
