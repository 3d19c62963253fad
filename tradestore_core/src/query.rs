// tradestore_core/src/query.rs

//! Query engine.
//!
//! A search carries two predicates combined with AND. The engine picks the
//! cheapest access path for it:
//! 1. a `Row` predicate in either position reads that single row directly;
//! 2. exactly one `Slot` and one `TxIdx` predicate go through the key index;
//! 3. anything else scans every block in store order.

use anyhow::Context;

use crate::layout;
use crate::record::{self, RECORD_SIZE};
use crate::storage;

/// One search constraint.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Predicate {
    #[default]
    Unset,
    Slot(u32),
    TxIdx(u32),
    Direction(String),
    Wallet(String),
    Row(u32),
}

impl Predicate {
    /// Whether `record` satisfies this predicate. `Unset` and `Row` never filter.
    pub fn matches(&self, record: &record::Record) -> bool {
        match self {
            Predicate::Unset | Predicate::Row(_) => true,
            Predicate::Slot(slot) => record.slot == *slot,
            Predicate::TxIdx(tx_idx) => record.tx_idx == *tx_idx,
            Predicate::Direction(direction) => record.direction == *direction,
            Predicate::Wallet(wallet) => record.signing_wallet == *wallet,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct SearchRequest {
    pub first: Predicate,
    pub second: Predicate,
}

/// How a request will be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPath {
    Row(u32),
    Key(u64),
    Scan,
}

impl std::fmt::Display for AccessPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessPath::Row(row) => write!(f, "row {}", row),
            AccessPath::Key(key) => write!(f, "key {:#018x}", key),
            AccessPath::Scan => write!(f, "scan"),
        }
    }
}

impl SearchRequest {
    pub fn new(first: Predicate, second: Predicate) -> Self {
        SearchRequest { first, second }
    }

    pub fn plan(&self) -> AccessPath {
        match (&self.first, &self.second) {
            (Predicate::Row(row), _) | (_, Predicate::Row(row)) => AccessPath::Row(*row),
            (Predicate::Slot(slot), Predicate::TxIdx(tx_idx))
            | (Predicate::TxIdx(tx_idx), Predicate::Slot(slot)) => {
                AccessPath::Key(record::composite_key(*slot, *tx_idx))
            }
            _ => AccessPath::Scan,
        }
    }

    pub fn matches(&self, record: &record::Record) -> bool {
        self.first.matches(record) && self.second.matches(record)
    }

    /// True when a block with these slot bounds cannot hold a match.
    fn excludes_block(&self, block: &layout::BlockIndexEntry) -> bool {
        [&self.first, &self.second].into_iter().any(|p| match p {
            Predicate::Slot(slot) => !block.covers_slot(*slot),
            _ => false,
        })
    }
}

/// Loaded once at startup and read-only afterwards.
pub struct QueryEngine {
    metadata: layout::Metadata,
    blocks: Vec<layout::BlockIndexEntry>,
    records: storage::RecordStore,
    keys: storage::KeyIndex,
}

impl QueryEngine {
    /// Loads metadata and the block index, opens the record file and key index.
    /// Any inconsistency between the artifacts is a startup failure.
    pub fn open(layout: &layout::StoreLayout, mode: storage::AccessMode) -> anyhow::Result<Self> {
        let metadata = layout.read_metadata()?;
        layout.verify_sizes(&metadata)?;
        let blocks = layout.read_block_index(&metadata)?;

        let records = storage::RecordStore::new(
            storage::open_source(&layout.record_file, mode)?,
            metadata.record_count,
        )?;
        let keys = storage::KeyIndex::new(storage::open_source(&layout.key_index_file, mode)?)?;

        log::debug!(
            "Loaded {} records in {} blocks ({:?} access)",
            metadata.record_count,
            metadata.block_count,
            mode,
        );

        anyhow::Ok(QueryEngine { metadata, blocks, records, keys })
    }

    pub fn metadata(&self) -> &layout::Metadata {
        &self.metadata
    }

    pub fn blocks(&self) -> &[layout::BlockIndexEntry] {
        &self.blocks
    }

    /// Number of records in block `index`, derived from where the next block starts.
    pub fn block_len(&self, index: usize) -> usize {
        let start = self.blocks[index].offset;
        let end = match self.blocks.get(index + 1) {
            Some(next) => next.offset,
            None => self.metadata.record_count as i64 * RECORD_SIZE as i64,
        };
        ((end - start) / RECORD_SIZE as i64) as usize
    }

    /// Resolves `request` into matching records, in store order.
    pub fn search(&self, request: &SearchRequest) -> anyhow::Result<Vec<record::Record>> {
        self.search_until(request, &|| false)
    }

    /// Like `search`, but a scan gives up between blocks once `cancelled` returns true.
    pub fn search_until(
        &self,
        request: &SearchRequest,
        cancelled: &dyn Fn() -> bool,
    ) -> anyhow::Result<Vec<record::Record>> {
        match request.plan() {
            AccessPath::Row(row) => {
                anyhow::Ok(self.records.read_row(row)?.into_iter().collect())
            }
            AccessPath::Key(key) => {
                let Some(offset) = self.keys.find(key)? else {
                    return anyhow::Ok(Vec::new());
                };
                let offset = u64::try_from(offset)
                    .with_context(|| format!("Key index holds negative offset {}", offset))?;
                anyhow::Ok(vec![self.records.read_at(offset)?])
            }
            AccessPath::Scan => self.scan(request, cancelled),
        }
    }

    fn scan(
        &self,
        request: &SearchRequest,
        cancelled: &dyn Fn() -> bool,
    ) -> anyhow::Result<Vec<record::Record>> {
        let mut results = Vec::new();
        let mut buf = Vec::new();
        let mut skipped_blocks = 0usize;

        for (i, block) in self.blocks.iter().enumerate() {
            if cancelled() {
                anyhow::bail!("Scan cancelled at block {} of {}", i, self.blocks.len());
            }
            if request.excludes_block(block) {
                skipped_blocks += 1;
                continue;
            }

            self.records.read_run(block.offset as u64, self.block_len(i), &mut buf)?;
            for chunk in buf.chunks_exact(RECORD_SIZE) {
                let record = record::Record::decode(chunk).with_context(|| format!(
                    "Corrupt record in block {} at offset {}",
                    i,
                    block.offset,
                ))?;
                if request.matches(&record) {
                    results.push(record);
                }
            }
        }

        log::debug!(
            "Scan matched {} records, pruned {} of {} blocks",
            results.len(),
            skipped_blocks,
            self.blocks.len(),
        );
        anyhow::Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::IndexBuilder;
    use crate::record::tests::sample;

    fn build(dir: &std::path::Path, records: &[record::Record], block_size: usize) -> layout::StoreLayout {
        let layout = layout::StoreLayout::in_dir(dir);
        let mut builder = IndexBuilder::create(&layout, block_size).unwrap();
        for r in records {
            builder.append(r).unwrap();
        }
        builder.finish().unwrap();
        layout
    }

    #[test]
    fn row_predicate_wins_in_either_position() {
        let request = SearchRequest::new(Predicate::Slot(1), Predicate::Row(4));
        assert_eq!(request.plan(), AccessPath::Row(4));
        let request = SearchRequest::new(Predicate::Row(2), Predicate::TxIdx(1));
        assert_eq!(request.plan(), AccessPath::Row(2));
    }

    #[test]
    fn slot_and_tx_idx_use_the_key_index_in_either_order() {
        let key = record::composite_key(10, 1);
        let request = SearchRequest::new(Predicate::Slot(10), Predicate::TxIdx(1));
        assert_eq!(request.plan(), AccessPath::Key(key));
        let request = SearchRequest::new(Predicate::TxIdx(1), Predicate::Slot(10));
        assert_eq!(request.plan(), AccessPath::Key(key));
    }

    #[test]
    fn other_combinations_scan() {
        let cases = [
            SearchRequest::default(),
            SearchRequest::new(Predicate::Slot(1), Predicate::Unset),
            SearchRequest::new(Predicate::Slot(1), Predicate::Slot(2)),
            SearchRequest::new(Predicate::Direction("buy".into()), Predicate::TxIdx(0)),
        ];
        for request in cases {
            assert_eq!(request.plan(), AccessPath::Scan, "{:?}", request);
        }
    }

    #[test]
    fn slot_predicates_prune_blocks() {
        let block = layout::BlockIndexEntry { min_slot: 10, max_slot: 20, offset: 0 };
        assert!(!SearchRequest::new(Predicate::Slot(15), Predicate::Unset).excludes_block(&block));
        assert!(SearchRequest::new(Predicate::Slot(21), Predicate::Unset).excludes_block(&block));
        assert!(SearchRequest::new(Predicate::Wallet("w".into()), Predicate::Slot(9)).excludes_block(&block));
        assert!(!SearchRequest::new(Predicate::TxIdx(99), Predicate::Unset).excludes_block(&block));
    }

    #[test]
    fn block_lengths_follow_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let records: Vec<_> = (0..7).map(|i| sample(i, 0, "buy")).collect();
        let layout = build(dir.path(), &records, 3);

        let engine = QueryEngine::open(&layout, storage::AccessMode::Mapped).unwrap();
        assert_eq!(engine.blocks().len(), 3);
        let lens: Vec<_> = (0..3).map(|i| engine.block_len(i)).collect();
        assert_eq!(lens, vec![3, 3, 1]);
    }

    #[test]
    fn scan_with_pruning_matches_unpruned_filter() {
        let dir = tempfile::tempdir().unwrap();
        // Slots are not sorted, so block bounds overlap.
        let slots = [5, 1, 9, 5, 3, 5, 8, 2, 5, 7];
        let records: Vec<_> = slots
            .iter()
            .enumerate()
            .map(|(i, &s)| sample(s, i as u32, if i % 2 == 0 { "buy" } else { "sell" }))
            .collect();
        let layout = build(dir.path(), &records, 3);
        let engine = QueryEngine::open(&layout, storage::AccessMode::Buffered).unwrap();

        let request = SearchRequest::new(Predicate::Slot(5), Predicate::Unset);
        let expected: Vec<_> = records.iter().filter(|r| r.slot == 5).cloned().collect();
        assert_eq!(engine.search(&request).unwrap(), expected);

        let request = SearchRequest::new(Predicate::Direction("sell".into()), Predicate::Slot(5));
        let expected: Vec<_> = records
            .iter()
            .filter(|r| r.slot == 5 && r.direction == "sell")
            .cloned()
            .collect();
        assert_eq!(engine.search(&request).unwrap(), expected);
    }

    #[test]
    fn contradictory_slots_match_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let records = [sample(1, 0, "buy"), sample(2, 0, "buy")];
        let layout = build(dir.path(), &records, 10);
        let engine = QueryEngine::open(&layout, storage::AccessMode::Mapped).unwrap();

        let request = SearchRequest::new(Predicate::Slot(1), Predicate::Slot(2));
        assert!(engine.search(&request).unwrap().is_empty());
    }

    #[test]
    fn empty_store_serves_empty_results() {
        let dir = tempfile::tempdir().unwrap();
        let layout = build(dir.path(), &[], 10);
        let engine = QueryEngine::open(&layout, storage::AccessMode::Mapped).unwrap();

        assert!(engine.search(&SearchRequest::default()).unwrap().is_empty());
        let request = SearchRequest::new(Predicate::Row(1), Predicate::Unset);
        assert!(engine.search(&request).unwrap().is_empty());
        let request = SearchRequest::new(Predicate::Slot(1), Predicate::TxIdx(1));
        assert!(engine.search(&request).unwrap().is_empty());
    }

    #[test]
    fn truncated_record_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let records = [sample(1, 0, "buy"), sample(2, 0, "buy")];
        let layout = build(dir.path(), &records, 10);

        let file = std::fs::OpenOptions::new().write(true).open(&layout.record_file).unwrap();
        file.set_len(RECORD_SIZE as u64).unwrap();

        assert!(QueryEngine::open(&layout, storage::AccessMode::Mapped).is_err());
    }
}
