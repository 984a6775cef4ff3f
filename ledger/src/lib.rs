//! The ledger store: ingests erasure-coded block fragments ("shreds")
//! arriving out of order from the network, reconstructs missing data
//! via Reed-Solomon recovery, detects leader equivocation, and commits
//! the resulting state atomically to a column-family store.

#[macro_use]
extern crate log;

pub mod blockstore;
pub mod blockstore_db;
pub mod blockstore_meta;
pub mod blockstore_metrics;
pub mod blockstore_options;
pub mod leader_schedule_cache;
pub mod shred;
pub mod shredder;
