// tradestore_core/src/storage.rs

//! Read-only access to the record file and the key index.
//!
//! Both files are reached through a `ByteSource`, either memory-mapped or
//! read positionally from an open file. The two are interchangeable.

use anyhow::Context;
use std::os::unix::fs::FileExt;

use crate::layout::{self, FixedEntry};
use crate::record::{self, RECORD_SIZE};

/// How the server reaches its backing files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AccessMode {
    #[serde(rename = "mmap")]
    Mapped,
    #[serde(rename = "buffered")]
    Buffered,
}

/// Random-access, read-only bytes.
pub trait ByteSource: Send + Sync {
    fn len(&self) -> u64;

    /// Fills `buf` from `offset`, failing if the range runs past the end.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct MappedSource {
    // Zero-length files cannot be mapped.
    map: Option<memmap2::Mmap>,
}

impl MappedSource {
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let len = file.metadata()?.len();

        let map = if len == 0 {
            None
        } else {
            // The files are written once by ingestion and never modified while served.
            let map = unsafe { memmap2::Mmap::map(&file) }
                .with_context(|| format!("Failed to map {}", path.display()))?;
            Some(map)
        };

        anyhow::Ok(MappedSource { map })
    }
}

impl ByteSource for MappedSource {
    fn len(&self) -> u64 {
        self.map.as_ref().map_or(0, |m| m.len() as u64)
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        let bytes: &[u8] = self.map.as_deref().unwrap_or(&[]);
        let start = usize::try_from(offset).map_err(|_| out_of_range(offset))?;
        let end = start.checked_add(buf.len()).ok_or_else(|| out_of_range(offset))?;
        let slice = bytes.get(start..end).ok_or_else(|| out_of_range(offset))?;
        buf.copy_from_slice(slice);
        Ok(())
    }
}

pub struct FileSource {
    file: std::fs::File,
    len: u64,
}

impl FileSource {
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let len = file.metadata()?.len();
        anyhow::Ok(FileSource { file, len })
    }
}

impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        FileExt::read_exact_at(&self.file, buf, offset)
    }
}

fn out_of_range(offset: u64) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("read at offset {} runs past the end of the file", offset),
    )
}

pub fn open_source<P: AsRef<std::path::Path>>(
    path: P,
    mode: AccessMode,
) -> anyhow::Result<Box<dyn ByteSource>> {
    anyhow::Ok(match mode {
        AccessMode::Mapped => Box::new(MappedSource::open(path)?),
        AccessMode::Buffered => Box::new(FileSource::open(path)?),
    })
}

/// The record file viewed as an arena of fixed-width rows.
pub struct RecordStore {
    source: Box<dyn ByteSource>,
    record_count: u32,
}

impl RecordStore {
    pub fn new(source: Box<dyn ByteSource>, record_count: u32) -> anyhow::Result<Self> {
        let expected = record_count as u64 * RECORD_SIZE as u64;
        if source.len() != expected {
            anyhow::bail!(
                "Record file is {} bytes, expected {} for {} records",
                source.len(),
                expected,
                record_count,
            );
        }
        anyhow::Ok(RecordStore { source, record_count })
    }

    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    /// Reads a 1-based row; rows outside `[1, record_count]` yield `None`.
    pub fn read_row(&self, row: u32) -> anyhow::Result<Option<record::Record>> {
        match layout::row_offset(row, self.record_count) {
            Some(offset) => self.read_at(offset).map(Some),
            None => anyhow::Ok(None),
        }
    }

    pub fn read_at(&self, offset: u64) -> anyhow::Result<record::Record> {
        if offset % RECORD_SIZE as u64 != 0 {
            anyhow::bail!("Offset {} is not on a record boundary", offset);
        }
        let mut buf = [0u8; RECORD_SIZE];
        self.source
            .read_exact_at(&mut buf, offset)
            .with_context(|| format!("Failed to read record at offset {}", offset))?;
        record::Record::decode(&buf)
            .with_context(|| format!("Corrupt record at offset {}", offset))
    }

    /// Reads `count` consecutive records starting at `offset` into `buf`.
    pub fn read_run(&self, offset: u64, count: usize, buf: &mut Vec<u8>) -> anyhow::Result<()> {
        buf.resize(count * RECORD_SIZE, 0);
        self.source
            .read_exact_at(buf, offset)
            .with_context(|| format!("Failed to read {} records at offset {}", count, offset))
    }
}

/// Sorted `(key, offset)` pairs searched in place.
pub struct KeyIndex {
    source: Box<dyn ByteSource>,
    entry_count: u64,
}

impl KeyIndex {
    pub fn new(source: Box<dyn ByteSource>) -> anyhow::Result<Self> {
        let len = source.len();
        if len % layout::KEY_ENTRY_SIZE as u64 != 0 {
            anyhow::bail!("Key index length {} is not a whole number of entries", len);
        }
        let entry_count = len / layout::KEY_ENTRY_SIZE as u64;
        anyhow::Ok(KeyIndex { source, entry_count })
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn entry(&self, index: u64) -> anyhow::Result<layout::KeyIndexEntry> {
        let mut buf = [0u8; layout::KEY_ENTRY_SIZE];
        self.source
            .read_exact_at(&mut buf, index * layout::KEY_ENTRY_SIZE as u64)
            .with_context(|| format!("Failed to read key index entry {}", index))?;
        layout::KeyIndexEntry::from_bytes(&buf)
    }

    /// Binary search for `key`.
    /// # Returns
    /// * The stored offset of the first entry with that key, or `None`.
    pub fn find(&self, key: u64) -> anyhow::Result<Option<i64>> {
        let (mut low, mut high) = (0u64, self.entry_count);
        while low < high {
            let mid = low + (high - low) / 2;
            if self.entry(mid)?.key < key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }

        if low < self.entry_count {
            let entry = self.entry(low)?;
            if entry.key == key {
                return anyhow::Ok(Some(entry.offset));
            }
        }
        anyhow::Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::KeyIndexEntry;
    use crate::record::tests::sample;

    fn write_keys(path: &std::path::Path, keys: &[(u64, i64)]) {
        let mut buf = Vec::new();
        for &(key, offset) in keys {
            KeyIndexEntry { key, offset }.write_to(&mut buf).unwrap();
        }
        std::fs::write(path, buf).unwrap();
    }

    #[test]
    fn key_search_in_both_modes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.bin");
        write_keys(&path, &[(1, 0), (5, 347), (9, 694), (12, 1041)]);

        for mode in [AccessMode::Mapped, AccessMode::Buffered] {
            let index = KeyIndex::new(open_source(&path, mode).unwrap()).unwrap();
            assert_eq!(index.entry_count(), 4);
            assert_eq!(index.find(1).unwrap(), Some(0));
            assert_eq!(index.find(9).unwrap(), Some(694));
            assert_eq!(index.find(12).unwrap(), Some(1041));
            assert_eq!(index.find(0).unwrap(), None);
            assert_eq!(index.find(6).unwrap(), None);
            assert_eq!(index.find(u64::MAX).unwrap(), None);
        }
    }

    #[test]
    fn duplicate_keys_resolve_to_first_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.bin");
        write_keys(&path, &[(3, 0), (3, 347), (3, 694), (4, 1041)]);

        let index = KeyIndex::new(open_source(&path, AccessMode::Buffered).unwrap()).unwrap();
        assert_eq!(index.find(3).unwrap(), Some(0));
    }

    #[test]
    fn empty_files_are_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        for mode in [AccessMode::Mapped, AccessMode::Buffered] {
            let index = KeyIndex::new(open_source(&path, mode).unwrap()).unwrap();
            assert_eq!(index.find(1).unwrap(), None);

            let store = RecordStore::new(open_source(&path, mode).unwrap(), 0).unwrap();
            assert!(store.read_row(1).unwrap().is_none());
        }
    }

    #[test]
    fn record_store_reads_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let records = [sample(1, 0, "buy"), sample(2, 0, "sell"), sample(3, 1, "buy")];
        let mut bytes = Vec::new();
        for r in &records {
            bytes.extend_from_slice(&r.encode().unwrap());
        }
        std::fs::write(&path, &bytes).unwrap();

        for mode in [AccessMode::Mapped, AccessMode::Buffered] {
            let store = RecordStore::new(open_source(&path, mode).unwrap(), 3).unwrap();
            assert_eq!(store.read_row(2).unwrap(), Some(records[1].clone()));
            assert_eq!(store.read_row(0).unwrap(), None);
            assert_eq!(store.read_row(4).unwrap(), None);

            let mut buf = Vec::new();
            store.read_run(RECORD_SIZE as u64, 2, &mut buf).unwrap();
            assert_eq!(buf.len(), 2 * RECORD_SIZE);
            assert!(store.read_run(RECORD_SIZE as u64, 3, &mut buf).is_err());
            assert!(store.read_at(5).is_err());
        }
    }

    #[test]
    fn record_store_rejects_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![0u8; RECORD_SIZE + 1]).unwrap();
        assert!(RecordStore::new(open_source(&path, AccessMode::Buffered).unwrap(), 1).is_err());
    }

    #[test]
    fn mapped_reads_past_end_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        let source = MappedSource::open(&path).unwrap();
        let mut buf = [0u8; 2];
        source.read_exact_at(&mut buf, 1).unwrap();
        assert_eq!(buf, [2, 3]);
        assert!(source.read_exact_at(&mut buf, 2).is_err());
        assert!(source.read_exact_at(&mut buf, u64::MAX).is_err());
    }
}
