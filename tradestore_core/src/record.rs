// tradestore_core/src/record.rs

//! Fixed-width binary layout of one trade event.
//!
//! Fields are packed in declaration order with no padding. Text fields sit in
//! zero-padded slots whose last byte is always zero, integers use native byte
//! order. Every encoded record is exactly `RECORD_SIZE` bytes, so row `n`
//! (1-based) of a record file lives at `(n - 1) * RECORD_SIZE`.

use crate::error::RecordError;

pub const CAPTURED_AT_LEN: usize = 20;
pub const WALLET_LEN: usize = 50;
pub const DIRECTION_LEN: usize = 5;
pub const BASE_COIN_LEN: usize = 100;
pub const SIGNATURE_LEN: usize = 100;

/// Number of columns in one input tuple.
pub const FIELD_COUNT: usize = 15;

pub const RECORD_SIZE: usize = CAPTURED_AT_LEN
    + 4 // slot
    + 4 // tx_idx
    + WALLET_LEN
    + DIRECTION_LEN
    + BASE_COIN_LEN
    + 4 * 8 // amounts and virtual balances
    + SIGNATURE_LEN
    + 4 * 8; // gas and fee accounting

/// Combines slot and transaction position into the lookup key.
pub fn composite_key(slot: u32, tx_idx: u32) -> u64 {
    ((slot as u64) << 32) | tx_idx as u64
}

/// One trade event.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Record {
    pub captured_at: String,
    pub slot: u32,
    pub tx_idx: u32,
    pub signing_wallet: String,
    pub direction: String,
    pub base_coin: String,
    pub base_coin_amount: u64,
    pub quote_coin_amount: u64,
    pub virtual_token_balance_after: u64,
    pub virtual_sol_balance_after: u64,
    pub signature: String,
    pub provided_gas_fee: u64,
    pub provided_gas_limit: u64,
    pub fee: u64,
    pub consumed_gas: u64,
}

impl Record {
    pub fn key(&self) -> u64 {
        composite_key(self.slot, self.tx_idx)
    }

    /// Builds a record from one tokenized input row.
    /// # Arguments
    /// * `fields` - Column values in storage order, exactly `FIELD_COUNT` of them.
    /// # Returns
    /// * `Record` when every field parses and fits its slot, `RecordError` otherwise.
    pub fn from_fields(fields: &[&str]) -> Result<Self, RecordError> {
        if fields.len() != FIELD_COUNT {
            return Err(RecordError::FieldCount {
                expected: FIELD_COUNT,
                found: fields.len(),
            });
        }

        let record = Record {
            captured_at: fields[0].to_string(),
            slot: parse_u32("slot", fields[1])?,
            tx_idx: parse_u32("tx_idx", fields[2])?,
            signing_wallet: fields[3].to_string(),
            direction: fields[4].to_string(),
            base_coin: fields[5].to_string(),
            base_coin_amount: parse_u64("base_coin_amount", fields[6])?,
            quote_coin_amount: parse_u64("quote_coin_amount", fields[7])?,
            virtual_token_balance_after: parse_u64("virtual_token_balance_after", fields[8])?,
            virtual_sol_balance_after: parse_u64("virtual_sol_balance_after", fields[9])?,
            signature: fields[10].to_string(),
            provided_gas_fee: parse_u64("provided_gas_fee", fields[11])?,
            provided_gas_limit: parse_u64("provided_gas_limit", fields[12])?,
            fee: parse_u64("fee", fields[13])?,
            consumed_gas: parse_u64("consumed_gas", fields[14])?,
        };

        record.validate()?;
        Ok(record)
    }

    /// Checks that every text field fits its fixed slot.
    pub fn validate(&self) -> Result<(), RecordError> {
        check_text("captured_at", &self.captured_at, CAPTURED_AT_LEN)?;
        check_text("signing_wallet", &self.signing_wallet, WALLET_LEN)?;
        check_text("direction", &self.direction, DIRECTION_LEN)?;
        check_text("base_coin", &self.base_coin, BASE_COIN_LEN)?;
        check_text("signature", &self.signature, SIGNATURE_LEN)?;
        Ok(())
    }

    /// Writes the fixed-width form into `out`, which must be `RECORD_SIZE` bytes.
    pub fn encode_into(&self, out: &mut [u8]) -> Result<(), RecordError> {
        if out.len() != RECORD_SIZE {
            return Err(RecordError::Length {
                expected: RECORD_SIZE,
                found: out.len(),
            });
        }
        self.validate()?;

        let mut writer = FieldWriter { buf: out, pos: 0 };
        writer.put_text(&self.captured_at, CAPTURED_AT_LEN);
        writer.put_u32(self.slot);
        writer.put_u32(self.tx_idx);
        writer.put_text(&self.signing_wallet, WALLET_LEN);
        writer.put_text(&self.direction, DIRECTION_LEN);
        writer.put_text(&self.base_coin, BASE_COIN_LEN);
        writer.put_u64(self.base_coin_amount);
        writer.put_u64(self.quote_coin_amount);
        writer.put_u64(self.virtual_token_balance_after);
        writer.put_u64(self.virtual_sol_balance_after);
        writer.put_text(&self.signature, SIGNATURE_LEN);
        writer.put_u64(self.provided_gas_fee);
        writer.put_u64(self.provided_gas_limit);
        writer.put_u64(self.fee);
        writer.put_u64(self.consumed_gas);
        debug_assert_eq!(writer.pos, RECORD_SIZE);

        Ok(())
    }

    pub fn encode(&self) -> Result<[u8; RECORD_SIZE], RecordError> {
        let mut buf = [0u8; RECORD_SIZE];
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        if bytes.len() != RECORD_SIZE {
            return Err(RecordError::Length {
                expected: RECORD_SIZE,
                found: bytes.len(),
            });
        }

        let mut reader = FieldReader { buf: bytes, pos: 0 };
        Ok(Record {
            captured_at: reader.take_text("captured_at", CAPTURED_AT_LEN)?,
            slot: reader.take_u32(),
            tx_idx: reader.take_u32(),
            signing_wallet: reader.take_text("signing_wallet", WALLET_LEN)?,
            direction: reader.take_text("direction", DIRECTION_LEN)?,
            base_coin: reader.take_text("base_coin", BASE_COIN_LEN)?,
            base_coin_amount: reader.take_u64(),
            quote_coin_amount: reader.take_u64(),
            virtual_token_balance_after: reader.take_u64(),
            virtual_sol_balance_after: reader.take_u64(),
            signature: reader.take_text("signature", SIGNATURE_LEN)?,
            provided_gas_fee: reader.take_u64(),
            provided_gas_limit: reader.take_u64(),
            fee: reader.take_u64(),
            consumed_gas: reader.take_u64(),
        })
    }
}

fn parse_u32(field: &'static str, value: &str) -> Result<u32, RecordError> {
    value.trim().parse::<u32>().map_err(|_| RecordError::Integer {
        field,
        value: value.to_string(),
    })
}

fn parse_u64(field: &'static str, value: &str) -> Result<u64, RecordError> {
    value.trim().parse::<u64>().map_err(|_| RecordError::Integer {
        field,
        value: value.to_string(),
    })
}

/// One byte of every slot is reserved for the terminator.
fn check_text(field: &'static str, value: &str, width: usize) -> Result<(), RecordError> {
    if value.len() > width - 1 {
        return Err(RecordError::TooLong {
            field,
            len: value.len(),
            max: width - 1,
        });
    }
    if value.as_bytes().contains(&0) {
        return Err(RecordError::EmbeddedNul { field });
    }
    Ok(())
}

struct FieldWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl FieldWriter<'_> {
    fn put_text(&mut self, value: &str, width: usize) {
        let slot = &mut self.buf[self.pos..self.pos + width];
        slot.fill(0);
        slot[..value.len()].copy_from_slice(value.as_bytes());
        self.pos += width;
    }

    fn put_u32(&mut self, value: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&value.to_ne_bytes());
        self.pos += 4;
    }

    fn put_u64(&mut self, value: u64) {
        self.buf[self.pos..self.pos + 8].copy_from_slice(&value.to_ne_bytes());
        self.pos += 8;
    }
}

struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl FieldReader<'_> {
    fn take(&mut self, width: usize) -> &[u8] {
        let slice = &self.buf[self.pos..self.pos + width];
        self.pos += width;
        slice
    }

    fn take_text(&mut self, field: &'static str, width: usize) -> Result<String, RecordError> {
        let slot = self.take(width);
        let end = slot.iter().position(|&b| b == 0).unwrap_or(width);
        std::str::from_utf8(&slot[..end])
            .map(str::to_string)
            .map_err(|_| RecordError::InvalidUtf8 { field })
    }

    fn take_u32(&mut self) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4));
        u32::from_ne_bytes(raw)
    }

    fn take_u64(&mut self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8));
        u64::from_ne_bytes(raw)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample(slot: u32, tx_idx: u32, direction: &str) -> Record {
        Record {
            captured_at: "2025-03-01 12:00:00".to_string(),
            slot,
            tx_idx,
            signing_wallet: format!("wallet-{}", slot % 3),
            direction: direction.to_string(),
            base_coin: "So11111111111111111111111111111111111111112".to_string(),
            base_coin_amount: 1_000_000 + slot as u64,
            quote_coin_amount: 42,
            virtual_token_balance_after: u64::MAX,
            virtual_sol_balance_after: 7,
            signature: format!("sig-{}-{}", slot, tx_idx),
            provided_gas_fee: 5000,
            provided_gas_limit: 200_000,
            fee: 5000,
            consumed_gas: 150_000,
        }
    }

    #[test]
    fn record_size_matches_packed_layout() {
        assert_eq!(RECORD_SIZE, 347);
    }

    #[test]
    fn decode_inverts_encode() {
        let record = sample(10, 1, "buy");
        let bytes = record.encode().unwrap();
        assert_eq!(Record::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn text_at_the_bound_survives() {
        let mut record = sample(1, 1, "sell");
        record.captured_at = "x".repeat(CAPTURED_AT_LEN - 1);
        record.signature = "s".repeat(SIGNATURE_LEN - 1);
        let bytes = record.encode().unwrap();
        assert_eq!(Record::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn composite_key_packs_slot_high() {
        assert_eq!(composite_key(10, 1), (10u64 << 32) | 1);
        assert!(composite_key(1, u32::MAX) < composite_key(2, 0));
    }

    #[test]
    fn from_fields_parses_a_row() {
        let fields = [
            "2025-03-01 12:00:00", "10", "1", "wallet", "buy", "coin",
            "1", "2", "3", "4", "sig", "5", "6", "7", "8",
        ];
        let record = Record::from_fields(&fields).unwrap();
        assert_eq!(record.slot, 10);
        assert_eq!(record.tx_idx, 1);
        assert_eq!(record.direction, "buy");
        assert_eq!(record.consumed_gas, 8);
    }

    #[test]
    fn from_fields_rejects_wrong_count() {
        let err = Record::from_fields(&["a", "1"]).unwrap_err();
        assert_eq!(err, RecordError::FieldCount { expected: FIELD_COUNT, found: 2 });
    }

    #[test]
    fn from_fields_rejects_bad_integer() {
        let fields = [
            "t", "ten", "1", "w", "buy", "c", "1", "2", "3", "4", "s", "5", "6", "7", "8",
        ];
        let err = Record::from_fields(&fields).unwrap_err();
        assert!(matches!(err, RecordError::Integer { field: "slot", .. }));
    }

    #[test]
    fn oversized_text_is_rejected() {
        let mut record = sample(1, 1, "buy");
        record.direction = "short".to_string();
        let err = record.encode().unwrap_err();
        assert_eq!(err, RecordError::TooLong { field: "direction", len: 5, max: 4 });
    }

    #[test]
    fn embedded_nul_is_rejected() {
        let mut record = sample(1, 1, "buy");
        record.signing_wallet = "ab\0".to_string();
        assert_eq!(
            record.encode().unwrap_err(),
            RecordError::EmbeddedNul { field: "signing_wallet" },
        );
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let err = Record::decode(&[0u8; 10]).unwrap_err();
        assert_eq!(err, RecordError::Length { expected: RECORD_SIZE, found: 10 });
    }

    #[test]
    fn decode_rejects_invalid_utf8() {
        let mut bytes = sample(1, 1, "buy").encode().unwrap();
        bytes[0] = 0xff;
        assert_eq!(
            Record::decode(&bytes).unwrap_err(),
            RecordError::InvalidUtf8 { field: "captured_at" },
        );
    }
}
