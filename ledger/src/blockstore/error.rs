//! The error that can be produced from Blockstore operations.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlockstoreError {
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] bincode::Error),
}
pub type Result<T> = std::result::Result<T, BlockstoreError>;
