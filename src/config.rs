//! Per-stream configuration.
//!
//! Configuration is pushed down into each stream's constructor: step
//! size, directories, compression and index flavour all live here, so no
//! stream needs an upward pointer to reach its parent's settings.

use std::path::PathBuf;

/// Default quantum of tx numbers per step.
pub const DEFAULT_AGGREGATION_STEP: u64 = 1_562_500;

/// Number of steps a file must span before it is considered frozen
/// (reached the maximum merge tier, never garbage).
pub const DEFAULT_STEPS_IN_FROZEN_FILE: u64 = 32;

/// Which index accompanies a domain's values file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexFlavor {
    /// Salted-hash accessor (`.kvi`).
    Accessor,
    /// Ordered key index with embedded cursor (`.bt`).
    Btree,
}

/// Configuration shared by every stream kind (values, history, index).
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Base name used in file names, e.g. `accounts` in `v1-accounts.0-2.kv`.
    pub filename_base: String,
    /// Directory holding the immutable data files.
    pub data_dir: PathBuf,
    /// Scratch directory for compressor intermediates and index builds.
    pub tmp_dir: PathBuf,
    /// Tx numbers per step; all file boundaries are multiples of this.
    pub aggregation_step: u64,
    /// Span (in steps) at which a file becomes frozen.
    pub steps_in_frozen_file: u64,
    /// Compress word payloads in data files.
    pub compress: bool,
    /// Skip fsync on produced files (tests, bulk loads).
    pub no_fsync: bool,
    /// Base salt for accessor and existence-filter hashing.
    pub salt: u32,
}

impl StreamConfig {
    pub fn new(filename_base: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            filename_base: filename_base.into(),
            tmp_dir: data_dir.join("tmp"),
            data_dir,
            aggregation_step: DEFAULT_AGGREGATION_STEP,
            steps_in_frozen_file: DEFAULT_STEPS_IN_FROZEN_FILE,
            compress: true,
            no_fsync: false,
            salt: rand::random(),
        }
    }

    pub fn with_step(mut self, step: u64) -> Self {
        assert!(step > 0, "aggregation step must be positive");
        self.aggregation_step = step;
        self
    }

    pub fn with_salt(mut self, salt: u32) -> Self {
        self.salt = salt;
        self
    }

    fn file_name(&self, from_step: u64, to_step: u64, ext: &str) -> PathBuf {
        self.data_dir.join(format!(
            "v1-{}.{}-{}.{}",
            self.filename_base, from_step, to_step, ext
        ))
    }

    /// Values (domain) data file.
    pub fn kv_file_path(&self, from_step: u64, to_step: u64) -> PathBuf {
        self.file_name(from_step, to_step, "kv")
    }

    /// Values accessor index.
    pub fn kv_accessor_file_path(&self, from_step: u64, to_step: u64) -> PathBuf {
        self.file_name(from_step, to_step, "kvi")
    }

    /// Values B-tree index.
    pub fn kv_bt_file_path(&self, from_step: u64, to_step: u64) -> PathBuf {
        self.file_name(from_step, to_step, "bt")
    }

    /// Values existence filter.
    pub fn kv_existence_file_path(&self, from_step: u64, to_step: u64) -> PathBuf {
        self.file_name(from_step, to_step, "kvei")
    }

    /// Inverted-index data file.
    pub fn ef_file_path(&self, from_step: u64, to_step: u64) -> PathBuf {
        self.file_name(from_step, to_step, "ef")
    }

    /// Inverted-index accessor index.
    pub fn ef_accessor_file_path(&self, from_step: u64, to_step: u64) -> PathBuf {
        self.file_name(from_step, to_step, "efi")
    }

    /// Inverted-index existence filter.
    pub fn ef_existence_file_path(&self, from_step: u64, to_step: u64) -> PathBuf {
        self.file_name(from_step, to_step, "efei")
    }

    /// History data file.
    pub fn v_file_path(&self, from_step: u64, to_step: u64) -> PathBuf {
        self.file_name(from_step, to_step, "v")
    }

    /// History accessor index.
    pub fn v_accessor_file_path(&self, from_step: u64, to_step: u64) -> PathBuf {
        self.file_name(from_step, to_step, "vi")
    }
}

/// Domain-level configuration: the values stream plus flags for its
/// history/index side.
#[derive(Clone, Debug)]
pub struct DomainConfig {
    pub stream: StreamConfig,
    /// Index built over the merged values file.
    pub index_flavor: IndexFlavor,
    /// Build `.kvei` / `.efei` existence filters alongside data files.
    pub with_existence_index: bool,
    /// History side keeps only the inverted index, producing no `.v` files.
    pub dont_produce_history_files: bool,
}

impl DomainConfig {
    pub fn new(stream: StreamConfig) -> Self {
        Self {
            stream,
            index_flavor: IndexFlavor::Btree,
            with_existence_index: true,
            dont_produce_history_files: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_naming() {
        let cfg = StreamConfig::new("accounts", "/data").with_step(16);
        assert_eq!(
            cfg.kv_file_path(0, 2),
            PathBuf::from("/data/v1-accounts.0-2.kv")
        );
        assert_eq!(
            cfg.ef_accessor_file_path(2, 4),
            PathBuf::from("/data/v1-accounts.2-4.efi")
        );
        assert_eq!(
            cfg.v_file_path(0, 32),
            PathBuf::from("/data/v1-accounts.0-32.v")
        );
    }
}
