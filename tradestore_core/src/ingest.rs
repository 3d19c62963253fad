// tradestore_core/src/ingest.rs

//! CSV ingestion pipeline.
//! Rows that do not decode into a record are logged and skipped;
//! storage failures abort the build.

use anyhow::Context;

use crate::builder;
use crate::record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub record_count: u32,
    pub block_count: u32,
    pub skipped: usize,
    pub duplicate_keys: usize,
}

/// Feeds every CSV row of `reader` into `builder` and finishes the build.
/// # Arguments
/// * `reader` - CSV source with columns in record field order.
/// * `builder` - A freshly created index builder.
/// * `has_headers` - Whether the first row is a header to skip.
/// # Returns
/// * `anyhow::Result<IngestSummary>` with final counts.
pub fn ingest_csv<R: std::io::Read>(
    reader: R,
    mut builder: builder::IndexBuilder,
    has_headers: bool,
) -> anyhow::Result<IngestSummary> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(has_headers)
        .flexible(true)
        .from_reader(reader);

    let mut row = csv::StringRecord::new();
    let mut skipped = 0usize;

    loop {
        match csv_reader.read_record(&mut row) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                if let csv::ErrorKind::Io(_) = e.kind() {
                    return Err(e).context("Failed to read CSV input");
                }
                let line = e.position().map_or(0, |p| p.line());
                log::warn!("Skipping line {}: {}", line, e);
                skipped += 1;
                continue;
            }
        }

        let fields: Vec<&str> = row.iter().collect();
        match record::Record::from_fields(&fields) {
            Ok(parsed) => builder.append(&parsed)?,
            Err(e) => {
                let line = row.position().map_or(0, |p| p.line());
                log::warn!("Skipping line {}: {}", line, e);
                skipped += 1;
            }
        }
    }

    let summary = builder.finish()?;

    anyhow::Ok(IngestSummary {
        record_count: summary.record_count,
        block_count: summary.block_count,
        skipped,
        duplicate_keys: summary.duplicate_keys,
    })
}

/// Opens `input` and ingests it.
pub fn ingest_file<P: AsRef<std::path::Path>>(
    input: P,
    builder: builder::IndexBuilder,
    has_headers: bool,
) -> anyhow::Result<IngestSummary> {
    let input = input.as_ref();
    let file = std::fs::File::open(input)
        .with_context(|| format!("Failed to open input {}", input.display()))?;
    ingest_csv(std::io::BufReader::new(file), builder, has_headers)
        .with_context(|| format!("Ingestion of {} failed", input.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout;

    const HEADER: &str = "block_time,slot,tx_idx,signing_wallet,direction,base_coin,base_coin_amount,quote_coin_amount,virtual_token_balance_after,virtual_sol_balance_after,signature,provided_gas_fee,provided_gas_limit,fee,consumed_gas\n";

    fn row(slot: u32, tx: u32, direction: &str) -> String {
        format!(
            "2025-03-01 12:00:00,{},{},W{},{},COIN,1,2,3,4,SIG{}x{},5,6,7,8\n",
            slot, tx, slot, direction, slot, tx,
        )
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout::StoreLayout::in_dir(dir.path());
        let input = format!(
            "{}{}{}{}{}",
            HEADER,
            row(10, 0, "buy"),
            "garbage,row\n",
            row(10, 1, "sell"),
            "2025-03-01 12:00:00,notanumber,0,W,buy,C,1,2,3,4,S,5,6,7,8\n",
        );

        let builder = builder::IndexBuilder::create(&layout, 10).unwrap();
        let summary = ingest_csv(input.as_bytes(), builder, true).unwrap();

        assert_eq!(summary.record_count, 2);
        assert_eq!(summary.block_count, 1);
        assert_eq!(summary.skipped, 2);
    }

    #[test]
    fn header_row_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout::StoreLayout::in_dir(dir.path());
        let input = format!("{}{}", row(1, 0, "buy"), row(2, 0, "buy"));

        let builder = builder::IndexBuilder::create(&layout, 10).unwrap();
        let summary = ingest_csv(input.as_bytes(), builder, false).unwrap();
        assert_eq!(summary.record_count, 2);
        assert_eq!(summary.skipped, 0);
    }

    #[test]
    fn oversized_direction_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout::StoreLayout::in_dir(dir.path());
        let input = format!("{}{}{}", HEADER, row(1, 0, "buyyy"), row(2, 0, "sell"));

        let builder = builder::IndexBuilder::create(&layout, 10).unwrap();
        let summary = ingest_csv(input.as_bytes(), builder, true).unwrap();
        assert_eq!(summary.record_count, 1);
        assert_eq!(summary.skipped, 1);
    }

    #[test]
    fn missing_input_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout::StoreLayout::in_dir(dir.path());
        let builder = builder::IndexBuilder::create(&layout, 10).unwrap();
        let err = ingest_file(dir.path().join("nope.csv"), builder, true).unwrap_err();
        assert!(format!("{:#}", err).contains("nope.csv"));
    }
}
