// tradestore_core/src/layout.rs

//! On-disk artifacts produced by one ingestion pass.
//!
//! * record file: dense array of `RECORD_SIZE`-byte records.
//! * key index: `(u64 key, i64 offset)` pairs sorted ascending by key.
//! * block index: `(u32 min_slot, u32 max_slot, i64 offset)` per block, in build order.
//! * metadata: a single `(u32 record_count, u32 block_count, u32 record_size)` header.
//!
//! The small fixed entries are stored through bincode with fixed-width
//! integers in native byte order, which gives exactly the packed layouts above.

use anyhow::Context;
use bincode::Options;

use crate::record::RECORD_SIZE;
use crate::settings;

/// Default number of records summarized by one block index entry.
pub const BLOCK_SIZE: usize = 5000;

pub const METADATA_SIZE: usize = 12;
pub const BLOCK_ENTRY_SIZE: usize = 16;
pub const KEY_ENTRY_SIZE: usize = 16;

fn codec() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_native_endian()
}

/// A fixed-size entry persisted through bincode.
pub trait FixedEntry: serde::Serialize + serde::de::DeserializeOwned {
    const SIZE: usize;

    fn write_to<W: std::io::Write>(&self, writer: &mut W) -> anyhow::Result<()> {
        codec()
            .serialize_into(writer, self)
            .context("Failed to write index entry")
    }

    fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() != Self::SIZE {
            anyhow::bail!("Index entry is {} bytes, expected {}", bytes.len(), Self::SIZE);
        }
        codec()
            .deserialize(bytes)
            .context("Failed to decode index entry")
    }
}

/// Header written once after ingestion completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Metadata {
    pub record_count: u32,
    pub block_count: u32,
    pub record_size: u32,
}

impl FixedEntry for Metadata {
    const SIZE: usize = METADATA_SIZE;
}

/// Slot bounds and starting offset of one contiguous run of records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockIndexEntry {
    pub min_slot: u32,
    pub max_slot: u32,
    pub offset: i64,
}

impl FixedEntry for BlockIndexEntry {
    const SIZE: usize = BLOCK_ENTRY_SIZE;
}

impl BlockIndexEntry {
    pub fn covers_slot(&self, slot: u32) -> bool {
        self.min_slot <= slot && slot <= self.max_slot
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KeyIndexEntry {
    pub key: u64,
    pub offset: i64,
}

impl FixedEntry for KeyIndexEntry {
    const SIZE: usize = KEY_ENTRY_SIZE;
}

/// Byte offset of a 1-based row, or `None` when the row is outside `[1, record_count]`.
pub fn row_offset(row: u32, record_count: u32) -> Option<u64> {
    if row == 0 || row > record_count {
        return None;
    }
    Some((row as u64 - 1) * RECORD_SIZE as u64)
}

/// Paths of the four artifacts.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    pub record_file: std::path::PathBuf,
    pub key_index_file: std::path::PathBuf,
    pub block_index_file: std::path::PathBuf,
    pub metadata_file: std::path::PathBuf,
}

impl StoreLayout {
    /// Default file names inside `dir`.
    pub fn in_dir<P: AsRef<std::path::Path>>(dir: P) -> Self {
        Self::from_settings(&settings::StorageSettings {
            data_dir: dir.as_ref().to_string_lossy().into_owned(),
            ..Default::default()
        })
    }

    pub fn from_settings(storage: &settings::StorageSettings) -> Self {
        let dir = std::path::Path::new(&storage.data_dir);
        StoreLayout {
            record_file: dir.join(&storage.record_file),
            key_index_file: dir.join(&storage.key_index_file),
            block_index_file: dir.join(&storage.block_index_file),
            metadata_file: dir.join(&storage.metadata_file),
        }
    }

    /// Staging path the builder writes metadata to before publishing it.
    pub fn metadata_staging_file(&self) -> std::path::PathBuf {
        let mut name = self.metadata_file.clone().into_os_string();
        name.push(".tmp");
        name.into()
    }

    /// Reads the metadata header. A missing or short header means the
    /// build never completed.
    pub fn read_metadata(&self) -> anyhow::Result<Metadata> {
        let bytes = std::fs::read(&self.metadata_file).with_context(|| format!(
            "Failed to read metadata {} (was ingestion completed?)",
            self.metadata_file.display(),
        ))?;
        let metadata = Metadata::from_bytes(&bytes).with_context(|| format!(
            "Metadata {} is incomplete",
            self.metadata_file.display(),
        ))?;

        if metadata.record_size as usize != RECORD_SIZE {
            anyhow::bail!(
                "Metadata record_size {} does not match this build's record size {}",
                metadata.record_size,
                RECORD_SIZE,
            );
        }
        if (metadata.record_count == 0) != (metadata.block_count == 0) {
            anyhow::bail!(
                "Metadata is inconsistent: {} records in {} blocks",
                metadata.record_count,
                metadata.block_count,
            );
        }

        anyhow::Ok(metadata)
    }

    /// Loads the whole block index and checks it against the metadata and record file.
    pub fn read_block_index(&self, metadata: &Metadata) -> anyhow::Result<Vec<BlockIndexEntry>> {
        let bytes = std::fs::read(&self.block_index_file).with_context(|| format!(
            "Failed to read block index {}",
            self.block_index_file.display(),
        ))?;

        let expected = metadata.block_count as usize * BLOCK_ENTRY_SIZE;
        if bytes.len() != expected {
            anyhow::bail!(
                "Block index {} is {} bytes, metadata declares {} blocks ({} bytes)",
                self.block_index_file.display(),
                bytes.len(),
                metadata.block_count,
                expected,
            );
        }

        let blocks = bytes
            .chunks_exact(BLOCK_ENTRY_SIZE)
            .map(BlockIndexEntry::from_bytes)
            .collect::<anyhow::Result<Vec<_>>>()?;

        check_block_offsets(&blocks, metadata)?;
        anyhow::Ok(blocks)
    }

    /// Compares artifact sizes with what the metadata declares.
    pub fn verify_sizes(&self, metadata: &Metadata) -> anyhow::Result<()> {
        let checks = [
            (&self.record_file, metadata.record_count as u64 * RECORD_SIZE as u64),
            (&self.key_index_file, metadata.record_count as u64 * KEY_ENTRY_SIZE as u64),
        ];

        for (path, expected) in checks {
            let actual = std::fs::metadata(path)
                .with_context(|| format!("Failed to stat {}", path.display()))?
                .len();
            if actual != expected {
                anyhow::bail!(
                    "{} is {} bytes, metadata declares {} bytes",
                    path.display(),
                    actual,
                    expected,
                );
            }
        }

        anyhow::Ok(())
    }
}

fn check_block_offsets(blocks: &[BlockIndexEntry], metadata: &Metadata) -> anyhow::Result<()> {
    let store_len = metadata.record_count as i64 * RECORD_SIZE as i64;

    if let Some(first) = blocks.first() {
        if first.offset != 0 {
            anyhow::bail!("First block starts at offset {}, expected 0", first.offset);
        }
    }

    for (i, block) in blocks.iter().enumerate() {
        if block.offset % RECORD_SIZE as i64 != 0 || block.offset >= store_len {
            anyhow::bail!("Block {} has invalid offset {}", i, block.offset);
        }
        if block.min_slot > block.max_slot {
            anyhow::bail!(
                "Block {} has min_slot {} above max_slot {}",
                i,
                block.min_slot,
                block.max_slot,
            );
        }
        if i > 0 && block.offset <= blocks[i - 1].offset {
            anyhow::bail!("Block {} does not start after block {}", i, i - 1);
        }
    }

    anyhow::Ok(())
}
