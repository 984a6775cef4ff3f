pub use rocksdb::Direction as IteratorDirection;
use {
    crate::{
        blockstore::{
            column::{Column, ColumnName, TypedColumn},
            error::{BlockstoreError, Result},
        },
        blockstore_options::{AccessType, BlockstoreOptions},
    },
    rocksdb::{
        ColumnFamily, ColumnFamilyDescriptor, DBIterator, IteratorMode as RocksIteratorMode,
        Options, WriteBatch as RWriteBatch, DB,
    },
    std::{
        collections::HashSet,
        fs,
        marker::PhantomData,
        path::{Path, PathBuf},
        sync::Arc,
    },
};

const MAX_WRITE_BUFFER_SIZE: u64 = 256 * 1024 * 1024; // 256MB

pub enum IteratorMode<Index> {
    Start,
    End,
    From(Index, IteratorDirection),
}

#[derive(Debug)]
pub(crate) struct Rocks {
    db: rocksdb::DB,
    access_type: AccessType,
}

impl Rocks {
    pub(crate) fn open(path: PathBuf, options: BlockstoreOptions) -> Result<Rocks> {
        fs::create_dir_all(&path)?;

        let db_options = get_db_options(&options);
        let cf_descriptors = Self::cf_descriptors(&path, &options);

        let db = match options.access_type {
            AccessType::Primary => DB::open_cf_descriptors(&db_options, &path, cf_descriptors)?,
            AccessType::Secondary => {
                let secondary_path = path.join("trellis-secondary");
                info!(
                    "Opening Rocks with secondary (read only) access at: {secondary_path:?}. \
                     This secondary access could temporarily degrade other accesses, such as \
                     by the validator"
                );
                DB::open_cf_descriptors_as_secondary(
                    &db_options,
                    &path,
                    &secondary_path,
                    cf_descriptors,
                )?
            }
        };

        Ok(Rocks {
            db,
            access_type: options.access_type,
        })
    }

    /// Create the column family (CF) descriptors necessary to open the database.
    ///
    /// In order to open a RocksDB database with Primary access, all columns must be opened. So,
    /// in addition to creating descriptors for all of the expected columns, also create
    /// descriptors for columns that were discovered but are otherwise unknown to the software.
    ///
    /// One case where columns could be unknown is if a RocksDB database is modified with a newer
    /// software version that adds a new column, and then also opened with an older version that
    /// did not have knowledge of that new column.
    fn cf_descriptors(path: &Path, options: &BlockstoreOptions) -> Vec<ColumnFamilyDescriptor> {
        use crate::blockstore::column::columns::*;

        let mut cf_descriptors = vec![
            new_cf_descriptor::<SlotMeta>(options),
            new_cf_descriptor::<DeadSlots>(options),
            new_cf_descriptor::<DuplicateSlots>(options),
            new_cf_descriptor::<ErasureMeta>(options),
            new_cf_descriptor::<Orphans>(options),
            new_cf_descriptor::<Root>(options),
            new_cf_descriptor::<Index>(options),
            new_cf_descriptor::<ShredData>(options),
            new_cf_descriptor::<ShredCode>(options),
            new_cf_descriptor::<MerkleRootMeta>(options),
        ];

        // If the access type is Secondary, we don't need to open all of the
        // columns so we can just return immediately.
        match options.access_type {
            AccessType::Secondary => {
                return cf_descriptors;
            }
            AccessType::Primary => {}
        }

        // Attempt to detect the column families that are present. It is not a
        // fatal error if we cannot, for example, if the Blockstore is brand
        // new and will be created by the call to Rocks::open().
        let detected_cfs = match DB::list_cf(&Options::default(), path) {
            Ok(detected_cfs) => detected_cfs,
            Err(err) => {
                warn!("Unable to detect Rocks columns: {err:?}");
                vec![]
            }
        };
        // The default column is handled automatically, we don't need to create
        // a descriptor for it
        const DEFAULT_COLUMN_NAME: &str = "default";
        let known_cfs: HashSet<_> = cf_descriptors
            .iter()
            .map(|cf_descriptor| cf_descriptor.name().to_string())
            .chain(std::iter::once(DEFAULT_COLUMN_NAME.to_string()))
            .collect();
        detected_cfs.iter().for_each(|cf_name| {
            if !known_cfs.contains(cf_name.as_str()) {
                info!("Detected unknown column {cf_name}, opening column with basic options");
                // This version of the software was unaware of the column, so
                // it is fair to assume that we will not attempt to read or
                // write the column. So, set some bare bones settings to avoid
                // using extra resources on this unknown column.
                let mut options = Options::default();
                // Lower the default to avoid unnecessary allocations
                options.set_write_buffer_size(1024 * 1024);
                // Disable compactions to avoid any modifications to the column
                options.set_disable_auto_compactions(true);
                cf_descriptors.push(ColumnFamilyDescriptor::new(cf_name, options));
            }
        });

        cf_descriptors
    }

    pub(crate) const fn columns() -> [&'static str; 10] {
        use crate::blockstore::column::columns::*;
        [
            ErasureMeta::NAME,
            DeadSlots::NAME,
            DuplicateSlots::NAME,
            Index::NAME,
            Orphans::NAME,
            Root::NAME,
            SlotMeta::NAME,
            ShredData::NAME,
            ShredCode::NAME,
            MerkleRootMeta::NAME,
        ]
    }

    pub(crate) fn column<C>(self: &Arc<Self>) -> LedgerColumn<C>
    where
        C: Column + ColumnName,
    {
        LedgerColumn {
            backend: Arc::clone(self),
            column: PhantomData,
        }
    }

    pub(crate) fn destroy(path: &Path) -> Result<()> {
        DB::destroy(&Options::default(), path)?;

        Ok(())
    }

    pub(crate) fn cf_handle(&self, cf: &str) -> &ColumnFamily {
        self.db
            .cf_handle(cf)
            .expect("should never get an unknown column")
    }

    fn get_cf<K: AsRef<[u8]>>(&self, cf: &ColumnFamily, key: K) -> Result<Option<Vec<u8>>> {
        let opt = self.db.get_cf(cf, key)?;
        Ok(opt)
    }

    fn put_cf<K: AsRef<[u8]>>(&self, cf: &ColumnFamily, key: K, value: &[u8]) -> Result<()> {
        self.db.put_cf(cf, key, value)?;
        Ok(())
    }

    fn delete_cf<K: AsRef<[u8]>>(&self, cf: &ColumnFamily, key: K) -> Result<()> {
        self.db.delete_cf(cf, key)?;
        Ok(())
    }

    pub(crate) fn iterator_cf(
        &self,
        cf: &ColumnFamily,
        iterator_mode: RocksIteratorMode,
    ) -> DBIterator {
        self.db.iterator_cf(cf, iterator_mode)
    }

    pub(crate) fn batch(&self) -> WriteBatch {
        WriteBatch {
            write_batch: RWriteBatch::default(),
        }
    }

    pub(crate) fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .write(batch.write_batch)
            .map_err(BlockstoreError::RocksDb)
    }
}

pub struct WriteBatch {
    write_batch: RWriteBatch,
}

impl WriteBatch {
    fn put_cf<K: AsRef<[u8]>>(&mut self, cf: &ColumnFamily, key: K, value: &[u8]) -> Result<()> {
        self.write_batch.put_cf(cf, key, value);
        Ok(())
    }

    fn delete_cf<K: AsRef<[u8]>>(&mut self, cf: &ColumnFamily, key: K) -> Result<()> {
        self.write_batch.delete_cf(cf, key);
        Ok(())
    }
}

#[derive(Debug)]
pub struct LedgerColumn<C: Column + ColumnName> {
    backend: Arc<Rocks>,
    column: PhantomData<C>,
}

impl<C> LedgerColumn<C>
where
    C: Column + ColumnName,
{
    pub fn get_bytes(&self, index: C::Index) -> Result<Option<Vec<u8>>> {
        let key = <C as Column>::key(&index);
        self.backend.get_cf(self.handle(), key)
    }

    pub fn iter(
        &self,
        iterator_mode: IteratorMode<C::Index>,
    ) -> Result<impl Iterator<Item = (C::Index, Box<[u8]>)> + '_> {
        let start_key: <C as Column>::Key;
        let iterator_mode = match iterator_mode {
            IteratorMode::Start => RocksIteratorMode::Start,
            IteratorMode::End => RocksIteratorMode::End,
            IteratorMode::From(start, direction) => {
                start_key = <C as Column>::key(&start);
                RocksIteratorMode::From(start_key.as_ref(), direction)
            }
        };

        let iter = self.backend.iterator_cf(self.handle(), iterator_mode);
        Ok(iter.map(|pair| {
            let (key, value) = pair.unwrap();
            (C::index(&key), value)
        }))
    }

    #[inline]
    pub fn handle(&self) -> &ColumnFamily {
        self.backend.cf_handle(C::NAME)
    }

    /// Presence check without deserializing the value.
    pub fn contains(&self, index: C::Index) -> Result<bool> {
        let key = <C as Column>::key(&index);
        Ok(self.backend.db.get_pinned_cf(self.handle(), key)?.is_some())
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> Result<bool> {
        let mut iter = self.iter(IteratorMode::Start)?;
        Ok(iter.next().is_none())
    }

    pub fn put_bytes(&self, index: C::Index, value: &[u8]) -> Result<()> {
        let key = <C as Column>::key(&index);
        self.backend.put_cf(self.handle(), key, value)
    }

    pub fn put_bytes_in_batch(
        &self,
        batch: &mut WriteBatch,
        index: C::Index,
        value: &[u8],
    ) -> Result<()> {
        let key = <C as Column>::key(&index);
        batch.put_cf(self.handle(), key, value)
    }

    pub fn delete(&self, index: C::Index) -> Result<()> {
        let key = <C as Column>::key(&index);
        self.backend.delete_cf(self.handle(), key)
    }

    pub fn delete_in_batch(&self, batch: &mut WriteBatch, index: C::Index) -> Result<()> {
        let key = <C as Column>::key(&index);
        batch.delete_cf(self.handle(), key)
    }
}

impl<C> LedgerColumn<C>
where
    C: TypedColumn + ColumnName,
{
    pub fn get(&self, index: C::Index) -> Result<Option<C::Type>> {
        let key = <C as Column>::key(&index);
        if let Some(pinnable_slice) = self.backend.db.get_pinned_cf(self.handle(), key)? {
            let value = C::deserialize(pinnable_slice.as_ref())?;
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    pub fn put(&self, index: C::Index, value: &C::Type) -> Result<()> {
        let serialized_value = C::serialize(value)?;
        let key = <C as Column>::key(&index);
        self.backend.put_cf(self.handle(), key, &serialized_value)
    }

    pub fn put_in_batch(
        &self,
        batch: &mut WriteBatch,
        index: C::Index,
        value: &C::Type,
    ) -> Result<()> {
        let key = <C as Column>::key(&index);
        let serialized_value = C::serialize(value)?;
        batch.put_cf(self.handle(), key, &serialized_value)
    }
}

fn new_cf_descriptor<C: 'static + Column + ColumnName>(
    options: &BlockstoreOptions,
) -> ColumnFamilyDescriptor {
    ColumnFamilyDescriptor::new(C::NAME, get_cf_options::<C>(options))
}

fn get_cf_options<C: 'static + Column + ColumnName>(options: &BlockstoreOptions) -> Options {
    let mut cf_options = Options::default();
    // 256 * 8 = 2GB. 6 of these columns should take at most 12GB of RAM
    cf_options.set_max_write_buffer_number(8);
    cf_options.set_write_buffer_size(MAX_WRITE_BUFFER_SIZE as usize);
    let file_num_compaction_trigger = 4;
    // Recommend that this be around the size of level 0. Level 0 estimated size in stable state is
    // write_buffer_size * min_write_buffer_number_to_merge * level0_file_num_compaction_trigger
    let total_size_base = MAX_WRITE_BUFFER_SIZE * file_num_compaction_trigger;
    let file_size_base = total_size_base / 10;
    cf_options.set_level_zero_file_num_compaction_trigger(file_num_compaction_trigger as i32);
    cf_options.set_max_bytes_for_level_base(total_size_base);
    cf_options.set_target_file_size_base(file_size_base);

    if should_disable_auto_compactions(&options.access_type) {
        cf_options.set_disable_auto_compactions(true);
    }

    cf_options
}

fn get_db_options(blockstore_options: &BlockstoreOptions) -> Options {
    let mut options = Options::default();

    // Create missing items to support a clean start
    options.create_if_missing(true);
    options.create_missing_column_families(true);

    // rocksdb builds two threadpools: low and high priority. The low priority
    // pool is used for compactions whereas the high priority pool is used for
    // memtable flushes. Separate pools are created so that compactions are
    // unable to stall memtable flushes (which could stall memtable writes).
    let mut env = rocksdb::Env::new().unwrap();
    env.set_low_priority_background_threads(
        blockstore_options.num_rocksdb_compaction_threads.get() as i32,
    );
    env.set_high_priority_background_threads(
        blockstore_options.num_rocksdb_flush_threads.get() as i32
    );
    options.set_env(&env);
    // rocksdb will try to scale threadpool sizes automatically based on the
    // value set for max_background_jobs. But, we already set desired
    // threadpool sizes above, so set max_background_jobs to the minimum (2)
    // so that rocksdb will leave the previously configured sizes as-is.
    options.set_max_background_jobs(2);

    // Set max total wal size to 4G.
    options.set_max_total_wal_size(4 * 1024 * 1024 * 1024);

    if should_disable_auto_compactions(&blockstore_options.access_type) {
        options.set_disable_auto_compactions(true);
    }

    // Allow Rocks to open/keep open as many files as it needs for performance;
    // however, this is also explicitly required for a secondary instance.
    // See https://github.com/facebook/rocksdb/wiki/Secondary-instance
    options.set_max_open_files(-1);

    options
}

// Returns whether automatic compactions should be disabled for the entire
// database based upon the given access type.
fn should_disable_auto_compactions(access_type: &AccessType) -> bool {
    // Leave automatic compactions enabled (do not disable) in Primary mode;
    // disable in all other modes to prevent accidental cleaning
    !matches!(access_type, AccessType::Primary)
}

#[cfg(test)]
pub mod tests {
    use {
        super::*,
        crate::blockstore::column::columns::{ShredData, SlotMeta},
        crate::blockstore_meta,
        tempfile::tempdir,
    };

    #[test]
    fn test_cf_names_and_descriptors_equal_length() {
        let path = PathBuf::default();
        let options = BlockstoreOptions::default();
        // The names and descriptors don't need to be in the same order for our use cases;
        // however, there should be the same number of each. For example, adding a new column
        // should update both lists.
        assert_eq!(
            Rocks::columns().len(),
            Rocks::cf_descriptors(&path, &options).len()
        );
    }

    #[test]
    fn test_should_disable_auto_compactions() {
        assert!(!should_disable_auto_compactions(&AccessType::Primary));
        assert!(should_disable_auto_compactions(&AccessType::Secondary));
    }

    #[test]
    fn test_open_put_get_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let rocks = Arc::new(
            Rocks::open(temp_dir.path().to_path_buf(), BlockstoreOptions::default()).unwrap(),
        );

        let shred_data: LedgerColumn<ShredData> = rocks.column();
        assert!(shred_data.is_empty().unwrap());
        shred_data.put_bytes((3, 7), &[1, 2, 3]).unwrap();
        assert_eq!(shred_data.get_bytes((3, 7)).unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(shred_data.get_bytes((3, 8)).unwrap(), None);

        let meta: LedgerColumn<SlotMeta> = rocks.column();
        let slot_meta = blockstore_meta::SlotMeta::new(5, Some(4));
        meta.put(5, &slot_meta).unwrap();
        assert_eq!(meta.get(5).unwrap(), Some(slot_meta));

        // Batched writes land atomically.
        let mut batch = rocks.batch();
        shred_data
            .put_bytes_in_batch(&mut batch, (4, 0), &[9])
            .unwrap();
        shred_data.delete_in_batch(&mut batch, (3, 7)).unwrap();
        rocks.write(batch).unwrap();
        assert_eq!(shred_data.get_bytes((4, 0)).unwrap(), Some(vec![9]));
        assert_eq!(shred_data.get_bytes((3, 7)).unwrap(), None);
    }
}
