//! Confidential traffic-data ledger and marketplace.
//!
//! Producers submit encrypted traffic records, aggregators sell encrypted datasets
//! through an escrow, and plaintexts are only ever revealed through a verified,
//! two-phase decryption protocol. [`market::Marketplace`] is the ledger state machine;
//! the rest of the crate serves it over HTTP and mirrors it into sqlite.

pub mod api;
pub mod capability;
pub mod config;
pub mod datasets;
pub mod db;
pub mod decryption;
pub mod errors;
pub mod escrow;
pub mod market;
pub mod models;
pub mod records;
pub mod relayer;
pub mod state;
pub mod zk;

#[cfg(test)]
mod testing;
