// tradestore_core/src/wire.rs

//! Fixed-size messages exchanged over the request and reply pipes.
//!
//! Request: `client_pid: i32` followed by two predicates, each a `kind: u32`
//! and a `PREDICATE_VALUE_LEN`-byte value area. Numeric values occupy the
//! first four bytes of the area, text values are zero-padded.
//!
//! Response: `count: i32` followed by `count` encoded records.
//!
//! All integers are in native byte order. A short read or write is a failed
//! exchange, never a shorter message.

use anyhow::Context;

use crate::error::WireError;
use crate::query::{Predicate, SearchRequest};
use crate::record::{self, RECORD_SIZE};

pub const PREDICATE_VALUE_LEN: usize = record::WALLET_LEN;
pub const PREDICATE_SIZE: usize = 4 + PREDICATE_VALUE_LEN;
pub const REQUEST_SIZE: usize = 4 + 2 * PREDICATE_SIZE;

const KIND_NONE: u32 = 0;
const KIND_SLOT: u32 = 1;
const KIND_TX_IDX: u32 = 2;
const KIND_DIRECTION: u32 = 3;
const KIND_WALLET: u32 = 4;
const KIND_ROW: u32 = 5;

/// A request as read off the pipe. The sender is known even when the
/// predicates are malformed, so the server can still answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub client_pid: i32,
    pub search: Result<SearchRequest, WireError>,
}

pub fn encode_request(client_pid: i32, request: &SearchRequest) -> Result<[u8; REQUEST_SIZE], WireError> {
    let mut buf = [0u8; REQUEST_SIZE];
    buf[..4].copy_from_slice(&client_pid.to_ne_bytes());
    encode_predicate(&request.first, &mut buf[4..4 + PREDICATE_SIZE])?;
    encode_predicate(&request.second, &mut buf[4 + PREDICATE_SIZE..])?;
    Ok(buf)
}

pub fn decode_request(buf: &[u8; REQUEST_SIZE]) -> RequestFrame {
    let client_pid = i32::from_ne_bytes(read_4(&buf[..4]));
    let search = decode_predicate(&buf[4..4 + PREDICATE_SIZE]).and_then(|first| {
        let second = decode_predicate(&buf[4 + PREDICATE_SIZE..])?;
        Ok(SearchRequest { first, second })
    });
    RequestFrame { client_pid, search }
}

fn encode_predicate(predicate: &Predicate, out: &mut [u8]) -> Result<(), WireError> {
    let (kind, value) = out.split_at_mut(4);
    let code = match predicate {
        Predicate::Unset => KIND_NONE,
        Predicate::Slot(v) => {
            value[..4].copy_from_slice(&v.to_ne_bytes());
            KIND_SLOT
        }
        Predicate::TxIdx(v) => {
            value[..4].copy_from_slice(&v.to_ne_bytes());
            KIND_TX_IDX
        }
        Predicate::Row(v) => {
            value[..4].copy_from_slice(&v.to_ne_bytes());
            KIND_ROW
        }
        Predicate::Direction(text) => {
            put_text(text, value, record::DIRECTION_LEN)?;
            KIND_DIRECTION
        }
        Predicate::Wallet(text) => {
            put_text(text, value, record::WALLET_LEN)?;
            KIND_WALLET
        }
    };
    kind.copy_from_slice(&code.to_ne_bytes());
    Ok(())
}

fn decode_predicate(buf: &[u8]) -> Result<Predicate, WireError> {
    let kind = u32::from_ne_bytes(read_4(&buf[..4]));
    let value = &buf[4..];
    let number = || u32::from_ne_bytes(read_4(&value[..4]));

    Ok(match kind {
        KIND_NONE => Predicate::Unset,
        KIND_SLOT => Predicate::Slot(number()),
        KIND_TX_IDX => Predicate::TxIdx(number()),
        KIND_ROW => Predicate::Row(number()),
        KIND_DIRECTION => Predicate::Direction(take_text(value, record::DIRECTION_LEN)?),
        KIND_WALLET => Predicate::Wallet(take_text(value, record::WALLET_LEN)?),
        other => return Err(WireError::UnknownKind(other)),
    })
}

fn read_4(bytes: &[u8]) -> [u8; 4] {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    raw
}

/// Text predicates share the bounds of the record field they compare against.
fn put_text(text: &str, out: &mut [u8], width: usize) -> Result<(), WireError> {
    if text.len() > width - 1 {
        return Err(WireError::TextTooLong { len: text.len(), max: width - 1 });
    }
    if text.as_bytes().contains(&0) {
        return Err(WireError::EmbeddedNul);
    }
    out[..text.len()].copy_from_slice(text.as_bytes());
    Ok(())
}

fn take_text(value: &[u8], width: usize) -> Result<String, WireError> {
    let slot = &value[..width];
    let end = slot.iter().position(|&b| b == 0).unwrap_or(width);
    std::str::from_utf8(&slot[..end])
        .map(str::to_string)
        .map_err(|_| WireError::InvalidUtf8)
}

/// The count header followed by every record, as one buffer.
pub fn encode_response(records: &[record::Record]) -> anyhow::Result<Vec<u8>> {
    let count = i32::try_from(records.len())
        .with_context(|| format!("{} results do not fit the response header", records.len()))?;

    let mut out = vec![0u8; 4 + records.len() * RECORD_SIZE];
    out[..4].copy_from_slice(&count.to_ne_bytes());
    for (r, slot) in records.iter().zip(out[4..].chunks_exact_mut(RECORD_SIZE)) {
        r.encode_into(slot)?;
    }

    anyhow::Ok(out)
}

/// Writes the count header and every record.
pub fn write_response<W: std::io::Write>(writer: &mut W, records: &[record::Record]) -> anyhow::Result<()> {
    let bytes = encode_response(records)?;
    writer.write_all(&bytes).context("Failed to write response")?;
    writer.flush().context("Failed to flush response")?;

    anyhow::Ok(())
}

pub fn read_response<R: std::io::Read>(reader: &mut R) -> anyhow::Result<Vec<record::Record>> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).context("Failed to read result count")?;
    let count = i32::from_ne_bytes(header);
    if count < 0 {
        anyhow::bail!("Response declares a negative result count {}", count);
    }

    let mut records = Vec::with_capacity(count as usize);
    let mut buf = [0u8; RECORD_SIZE];
    for i in 0..count {
        reader
            .read_exact(&mut buf)
            .with_context(|| format!("Response ended after {} of {} records", i, count))?;
        records.push(record::Record::decode(&buf)?);
    }

    anyhow::Ok(records)
}
