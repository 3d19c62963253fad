// tradestore_core/src/lib.rs

//! Fixed-width trade event store.
//!
//! Ingestion writes a dense record file plus a block index, a sorted key
//! index and a metadata header. The query engine answers two-predicate
//! searches against those files, and the request server exposes it over
//! named pipes.

pub mod wire;
pub mod error;
pub mod query;
pub mod layout;
pub mod record;
pub mod server;
pub mod client;
pub mod ingest;
pub mod builder;
pub mod storage;
pub mod settings;
