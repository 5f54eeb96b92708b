use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crc32fast::Hasher;
use memmap2::Mmap;

use crate::error::{MergeError, Result};
use crate::seg::{decode_vbyte, FLAG_ZSTD, HEADER_LEN, SEGMENT_MAGIC, SEGMENT_VERSION};

/// Read-only view of one segment file.
///
/// The raw file stays mmapped; compressed payloads are inflated once at
/// open. Readers are safe to share across threads and iterate
/// concurrently through independent [`WordGetter`]s.
pub struct SegmentReader {
    path: PathBuf,
    mmap: Mmap,
    /// Inflated payload when the file was written with compression.
    inflated: Option<Vec<u8>>,
    word_count: u64,
}

impl SegmentReader {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        // Safety: the file is immutable once published by the writer.
        let mmap = unsafe { Mmap::map(&file)? };
        drop(file);

        let data = &mmap[..];
        if data.len() < HEADER_LEN + 4 {
            return Err(MergeError::corrupt(&path, "file shorter than header"));
        }
        if &data[0..4] != SEGMENT_MAGIC {
            return Err(MergeError::corrupt(&path, "bad magic"));
        }
        if data[4] != SEGMENT_VERSION {
            return Err(MergeError::corrupt(
                &path,
                format!("unsupported version {}", data[4]),
            ));
        }
        let flags = data[5];
        let word_count = u64::from_le_bytes(data[6..14].try_into().unwrap());

        let body_end = data.len() - 4;
        let mut hasher = Hasher::new();
        hasher.update(&data[..body_end]);
        let expect = u32::from_le_bytes(data[body_end..].try_into().unwrap());
        if hasher.finalize() != expect {
            return Err(MergeError::corrupt(&path, "checksum mismatch"));
        }

        let inflated = if flags & FLAG_ZSTD != 0 {
            Some(
                zstd::decode_all(&data[HEADER_LEN..body_end])
                    .map_err(|e| MergeError::corrupt(&path, format!("zstd: {e}")))?,
            )
        } else {
            None
        };

        Ok(Self {
            path,
            mmap,
            inflated,
            word_count,
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Total number of words in the file (keys + values).
    pub fn word_count(&self) -> u64 {
        self.word_count
    }

    fn payload(&self) -> &[u8] {
        match &self.inflated {
            Some(bytes) => bytes,
            None => &self.mmap[HEADER_LEN..self.mmap.len() - 4],
        }
    }

    /// Advise the OS that the backing file is about to be scanned
    /// sequentially. Best-effort; pair with [`SegmentReader::read_ahead`]
    /// for scoped use.
    pub fn enable_read_ahead(&self) {
        #[cfg(unix)]
        let _ = self.mmap.advise(memmap2::Advice::Sequential);
    }

    pub fn disable_read_ahead(&self) {
        #[cfg(unix)]
        let _ = self.mmap.advise(memmap2::Advice::Normal);
    }

    /// Scoped read-ahead: enabled now, disabled when the guard drops.
    pub fn read_ahead(self: &Arc<Self>) -> ReadAheadGuard {
        self.enable_read_ahead();
        ReadAheadGuard {
            seg: Arc::clone(self),
        }
    }

    /// Sequential word cursor starting at the first word.
    pub fn getter(self: &Arc<Self>) -> WordGetter {
        WordGetter {
            seg: Arc::clone(self),
            pos: 0,
        }
    }
}

/// Disables read-ahead advice on drop, on all exit paths.
pub struct ReadAheadGuard {
    seg: Arc<SegmentReader>,
}

impl Drop for ReadAheadGuard {
    fn drop(&mut self) {
        self.seg.disable_read_ahead();
    }
}

/// Cursor over the words of a segment file.
pub struct WordGetter {
    seg: Arc<SegmentReader>,
    pos: usize,
}

impl WordGetter {
    pub fn has_next(&self) -> bool {
        self.pos < self.seg.payload().len()
    }

    /// Byte offset of the next unread word within the payload.
    pub fn pos(&self) -> u64 {
        self.pos as u64
    }

    pub fn file_name(&self) -> String {
        self.seg.file_name()
    }

    /// Read the next word.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Vec<u8>> {
        let payload = self.seg.payload();
        let mut pos = self.pos;
        let len = decode_vbyte(payload, &mut pos)
            .ok_or_else(|| MergeError::corrupt(&self.seg.path, "truncated word length"))?
            as usize;
        let end = pos
            .checked_add(len)
            .filter(|&e| e <= payload.len())
            .ok_or_else(|| MergeError::corrupt(&self.seg.path, "word overruns payload"))?;
        let word = payload[pos..end].to_vec();
        self.pos = end;
        Ok(word)
    }

    /// Skip the next word; returns the byte offset of the word that now
    /// follows, i.e. the offset a later getter would need to resume here.
    pub fn skip(&mut self) -> Result<u64> {
        let payload = self.seg.payload();
        let mut pos = self.pos;
        let len = decode_vbyte(payload, &mut pos)
            .ok_or_else(|| MergeError::corrupt(&self.seg.path, "truncated word length"))?
            as usize;
        let end = pos
            .checked_add(len)
            .filter(|&e| e <= payload.len())
            .ok_or_else(|| MergeError::corrupt(&self.seg.path, "word overruns payload"))?;
        self.pos = end;
        Ok(end as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seg::SegmentWriter;

    #[test]
    fn test_skip_reports_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1-test.0-1.v");
        let mut w = SegmentWriter::create(&path, dir.path(), false, true).unwrap();
        w.add_word(b"abc").unwrap();
        w.add_word(b"defgh").unwrap();
        w.compress().unwrap();

        let reader = Arc::new(SegmentReader::open(&path).unwrap());
        let mut g = reader.getter();
        let off1 = g.skip().unwrap();
        // one length byte plus three payload bytes
        assert_eq!(off1, 4);
        let off2 = g.skip().unwrap();
        assert_eq!(off2, 10);
        assert!(!g.has_next());
    }

    #[test]
    fn test_corrupt_checksum_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1-test.0-1.kv");
        let mut w = SegmentWriter::create(&path, dir.path(), false, true).unwrap();
        w.add_word(b"word").unwrap();
        w.compress().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            SegmentReader::open(&path),
            Err(MergeError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_read_ahead_guard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1-test.0-1.kv");
        let mut w = SegmentWriter::create(&path, dir.path(), true, true).unwrap();
        w.add_word(b"w").unwrap();
        w.compress().unwrap();

        let reader = Arc::new(SegmentReader::open(&path).unwrap());
        {
            let _guard = reader.read_ahead();
            let mut g = reader.getter();
            assert_eq!(g.next().unwrap(), b"w");
        }
    }
}
