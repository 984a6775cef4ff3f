use std::num::NonZeroUsize;

pub struct BlockstoreOptions {
    // Determines how the database is opened and which operations are
    // allowed on it.
    pub access_type: AccessType,
    /// The number of threads to use for rocksdb compactions.
    pub num_rocksdb_compaction_threads: NonZeroUsize,
    /// The number of threads to use for rocksdb memtable flushes.
    pub num_rocksdb_flush_threads: NonZeroUsize,
}

impl Default for BlockstoreOptions {
    /// The default options are the values used by [`crate::blockstore::Blockstore::open`].
    fn default() -> Self {
        Self {
            access_type: AccessType::Primary,
            num_rocksdb_compaction_threads: default_num_compaction_threads(),
            num_rocksdb_flush_threads: default_num_flush_threads(),
        }
    }
}

impl BlockstoreOptions {
    pub fn default_for_tests() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AccessType {
    /// Primary (read/write) access; only one process can have Primary access.
    Primary,
    /// Secondary (read) access; multiple processes can have Secondary access.
    /// Additionally, Secondary access can be obtained while another process
    /// already has Primary access.
    Secondary,
}

/// The default number of threads to use for rocksdb compaction in the rocksdb
/// low priority threadpool.
pub fn default_num_compaction_threads() -> NonZeroUsize {
    NonZeroUsize::new(num_cpus::get()).expect("thread count is non-zero")
}

/// The default number of threads to use for rocksdb memtable flushes in the
/// rocksdb high priority threadpool.
pub fn default_num_flush_threads() -> NonZeroUsize {
    NonZeroUsize::new((num_cpus::get() / 4).max(1)).expect("thread count is non-zero")
}
