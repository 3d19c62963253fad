// tradestore_core/src/builder.rs

//! Single-pass index builder.
//!
//! Records are appended to the record file as they arrive. Block bounds are
//! accumulated over runs of `block_size` records and the `(key, offset)`
//! pairs are collected in arrival order, then sorted once at the end.
//! Metadata is published last, so an interrupted build never looks complete.

use anyhow::Context;
use rayon::slice::ParallelSliceMut;
use std::io::Write;

use crate::layout::{self, FixedEntry};
use crate::record::{self, RECORD_SIZE};

/// Counts reported after a successful build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildSummary {
    pub record_count: u32,
    pub block_count: u32,
    pub duplicate_keys: usize,
}

/// Running bounds of the block being filled.
#[derive(Debug, Clone, Copy)]
struct BlockAccumulator {
    min_slot: u32,
    max_slot: u32,
    offset: i64,
    count: usize,
}

impl BlockAccumulator {
    fn start(slot: u32, offset: i64) -> Self {
        BlockAccumulator { min_slot: slot, max_slot: slot, offset, count: 1 }
    }

    fn include(&mut self, slot: u32) {
        self.min_slot = self.min_slot.min(slot);
        self.max_slot = self.max_slot.max(slot);
        self.count += 1;
    }

    fn entry(&self) -> layout::BlockIndexEntry {
        layout::BlockIndexEntry {
            min_slot: self.min_slot,
            max_slot: self.max_slot,
            offset: self.offset,
        }
    }
}

pub struct IndexBuilder {
    layout: layout::StoreLayout,
    block_size: usize,
    records: std::io::BufWriter<std::fs::File>,
    blocks: std::io::BufWriter<std::fs::File>,
    keys: Vec<layout::KeyIndexEntry>,
    current_block: Option<BlockAccumulator>,
    next_offset: i64,
    record_count: u32,
    block_count: u32,
    scratch: [u8; RECORD_SIZE],
}

impl IndexBuilder {
    /// Starts a fresh build, truncating any previous artifacts.
    /// # Arguments
    /// * `layout` - Where the four artifacts are written.
    /// * `block_size` - Records per block index entry.
    /// # Returns
    /// * `anyhow::Result<IndexBuilder>` ready to accept records.
    pub fn create(layout: &layout::StoreLayout, block_size: usize) -> anyhow::Result<Self> {
        if block_size == 0 {
            anyhow::bail!("Block size must be positive");
        }

        if let Some(parent) = layout.record_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        // Invalidate the previous build before touching anything else.
        remove_if_exists(&layout.metadata_file)?;
        remove_if_exists(&layout.metadata_staging_file())?;

        let records = create_file(&layout.record_file)?;
        let blocks = create_file(&layout.block_index_file)?;

        anyhow::Ok(IndexBuilder {
            layout: layout.clone(),
            block_size,
            records: std::io::BufWriter::new(records),
            blocks: std::io::BufWriter::new(blocks),
            keys: Vec::new(),
            current_block: None,
            next_offset: 0,
            record_count: 0,
            block_count: 0,
            scratch: [0u8; RECORD_SIZE],
        })
    }

    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    /// Appends one record to the store and both indexes.
    pub fn append(&mut self, record: &record::Record) -> anyhow::Result<()> {
        if self.record_count == u32::MAX {
            anyhow::bail!("Record store is full ({} records)", u32::MAX);
        }

        record
            .encode_into(&mut self.scratch)
            .with_context(|| format!("Cannot encode record {}", self.record_count + 1))?;
        self.records
            .write_all(&self.scratch)
            .with_context(|| format!("Failed to write {}", self.layout.record_file.display()))?;

        let offset = self.next_offset;
        self.keys.push(layout::KeyIndexEntry { key: record.key(), offset });

        match self.current_block.as_mut() {
            Some(block) => block.include(record.slot),
            None => self.current_block = Some(BlockAccumulator::start(record.slot, offset)),
        }
        if self.current_block.is_some_and(|b| b.count >= self.block_size) {
            self.flush_block()?;
        }

        self.next_offset += RECORD_SIZE as i64;
        self.record_count += 1;
        anyhow::Ok(())
    }

    fn flush_block(&mut self) -> anyhow::Result<()> {
        if let Some(block) = self.current_block.take() {
            block
                .entry()
                .write_to(&mut self.blocks)
                .with_context(|| format!("Failed to write {}", self.layout.block_index_file.display()))?;
            self.block_count += 1;
        }
        anyhow::Ok(())
    }

    /// Emits the trailing partial block, writes the sorted key index and
    /// publishes the metadata header.
    pub fn finish(mut self) -> anyhow::Result<BuildSummary> {
        self.flush_block()?;

        finish_writer(self.records, &self.layout.record_file)?;
        finish_writer(self.blocks, &self.layout.block_index_file)?;

        // Stable, so duplicate keys keep store order.
        self.keys.par_sort_by_key(|entry| entry.key);
        let duplicate_keys = self.keys.windows(2).filter(|w| w[0].key == w[1].key).count();
        if duplicate_keys > 0 {
            log::warn!(
                "{} records share a (slot, tx_idx) key with an earlier record; key lookups return the first",
                duplicate_keys,
            );
        }

        let mut key_writer = std::io::BufWriter::new(create_file(&self.layout.key_index_file)?);
        for entry in &self.keys {
            entry
                .write_to(&mut key_writer)
                .with_context(|| format!("Failed to write {}", self.layout.key_index_file.display()))?;
        }
        finish_writer(key_writer, &self.layout.key_index_file)?;

        let metadata = layout::Metadata {
            record_count: self.record_count,
            block_count: self.block_count,
            record_size: RECORD_SIZE as u32,
        };
        publish_metadata(&self.layout, &metadata)?;

        log::info!(
            "Build complete: {} records, {} blocks, {} key entries",
            metadata.record_count,
            metadata.block_count,
            self.keys.len(),
        );

        anyhow::Ok(BuildSummary {
            record_count: metadata.record_count,
            block_count: metadata.block_count,
            duplicate_keys,
        })
    }
}

fn create_file(path: &std::path::Path) -> anyhow::Result<std::fs::File> {
    std::fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))
}

fn remove_if_exists(path: &std::path::Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => anyhow::Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => anyhow::Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

fn finish_writer(writer: std::io::BufWriter<std::fs::File>, path: &std::path::Path) -> anyhow::Result<()> {
    let file = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush {}: {}", path.display(), e.error()))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync {}", path.display()))
}

fn publish_metadata(layout: &layout::StoreLayout, metadata: &layout::Metadata) -> anyhow::Result<()> {
    let staging = layout.metadata_staging_file();
    let mut file = create_file(&staging)?;
    metadata.write_to(&mut file)?;
    file.sync_all()
        .with_context(|| format!("Failed to sync {}", staging.display()))?;
    std::fs::rename(&staging, &layout.metadata_file).with_context(|| format!(
        "Failed to publish {}",
        layout.metadata_file.display(),
    ))
}
