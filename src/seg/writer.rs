use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;

use crate::error::Result;
use crate::seg::{encode_vbyte, FLAG_ZSTD, SEGMENT_MAGIC, SEGMENT_VERSION};

const ZSTD_LEVEL: i32 = 1;

/// Writer producing one immutable segment file.
///
/// Words are staged into a scratch file inside `tmp_dir`; `compress`
/// rewrites them into the final file with header and CRC32 footer. If
/// the writer is dropped before `compress` succeeds, both the scratch
/// file and any partial output are unlinked.
pub struct SegmentWriter {
    path: PathBuf,
    scratch_path: PathBuf,
    scratch: Option<BufWriter<File>>,
    word_count: u64,
    compress_payload: bool,
    no_fsync: bool,
    finished: bool,
}

impl SegmentWriter {
    pub fn create(
        path: impl Into<PathBuf>,
        tmp_dir: &Path,
        compress_payload: bool,
        no_fsync: bool,
    ) -> Result<Self> {
        let path = path.into();
        fs::create_dir_all(tmp_dir)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let scratch_name = match path.file_name() {
            Some(name) => format!("{}.tmp", name.to_string_lossy()),
            None => "segment.tmp".to_string(),
        };
        let scratch_path = tmp_dir.join(scratch_name);
        let scratch = BufWriter::new(File::create(&scratch_path)?);
        Ok(Self {
            path,
            scratch_path,
            scratch: Some(scratch),
            word_count: 0,
            compress_payload,
            no_fsync,
            finished: false,
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }

    pub fn word_count(&self) -> u64 {
        self.word_count
    }

    /// Append one length-prefixed word to the scratch stream.
    pub fn add_word(&mut self, word: &[u8]) -> Result<()> {
        let scratch = self
            .scratch
            .as_mut()
            .expect("add_word after compress/close");
        let mut prefix = Vec::with_capacity(10);
        encode_vbyte(word.len() as u64, &mut prefix);
        scratch.write_all(&prefix)?;
        scratch.write_all(word)?;
        self.word_count += 1;
        Ok(())
    }

    /// Finalise: rewrite the staged words into the destination file with
    /// header, optional zstd payload compression, and CRC32 footer.
    pub fn compress(&mut self) -> Result<()> {
        let mut scratch = self.scratch.take().expect("compress called twice");
        scratch.flush()?;
        drop(scratch);

        let raw = fs::read(&self.scratch_path)?;
        let (payload, flags) = if self.compress_payload {
            (zstd::encode_all(&raw[..], ZSTD_LEVEL)?, FLAG_ZSTD)
        } else {
            (raw, 0)
        };

        let mut out = Vec::with_capacity(super::HEADER_LEN + payload.len() + 4);
        out.extend_from_slice(SEGMENT_MAGIC);
        out.push(SEGMENT_VERSION);
        out.push(flags);
        out.extend_from_slice(&self.word_count.to_le_bytes());
        out.extend_from_slice(&payload);

        let mut hasher = Hasher::new();
        hasher.update(&out);
        out.extend_from_slice(&hasher.finalize().to_le_bytes());

        let mut file = File::create(&self.path)?;
        file.write_all(&out)?;
        if !self.no_fsync {
            file.sync_all()?;
        }
        drop(file);

        let _ = fs::remove_file(&self.scratch_path);
        self.finished = true;
        Ok(())
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.scratch = None;
            let _ = fs::remove_file(&self.scratch_path);
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seg::SegmentReader;
    use std::sync::Arc;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1-test.0-1.kv");
        let mut w = SegmentWriter::create(&path, dir.path(), true, true).unwrap();
        w.add_word(b"key1").unwrap();
        w.add_word(b"value-one").unwrap();
        w.add_word(b"key2").unwrap();
        w.add_word(b"").unwrap();
        w.compress().unwrap();

        let reader = Arc::new(SegmentReader::open(&path).unwrap());
        assert_eq!(reader.word_count(), 4);
        let mut g = reader.getter();
        assert!(g.has_next());
        assert_eq!(g.next().unwrap(), b"key1");
        assert_eq!(g.next().unwrap(), b"value-one");
        assert_eq!(g.next().unwrap(), b"key2");
        assert_eq!(g.next().unwrap(), b"");
        assert!(!g.has_next());
    }

    #[test]
    fn test_drop_without_compress_removes_partials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1-test.0-1.kv");
        {
            let mut w = SegmentWriter::create(&path, dir.path(), false, true).unwrap();
            w.add_word(b"partial").unwrap();
        }
        assert!(!path.exists());
        assert!(!dir.path().join("v1-test.0-1.kv.tmp").exists());
    }

    #[test]
    fn test_uncompressed_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1-test.0-1.ef");
        let mut w = SegmentWriter::create(&path, dir.path(), false, true).unwrap();
        for i in 0u32..100 {
            w.add_word(&i.to_le_bytes()).unwrap();
        }
        w.compress().unwrap();

        let reader = Arc::new(SegmentReader::open(&path).unwrap());
        assert_eq!(reader.word_count(), 100);
        let mut g = reader.getter();
        let mut n = 0u32;
        while g.has_next() {
            assert_eq!(g.next().unwrap(), n.to_le_bytes());
            n += 1;
        }
        assert_eq!(n, 100);
    }
}
