//! The `blockstore` module provides the ledger's persistent shred store:
//! iterative read, append write, and random access read of erasure-coded
//! block fragments and their per-slot metadata.

pub mod column;
pub mod error;

use {
    crate::{
        blockstore::column::columns as cf,
        blockstore_db::{IteratorDirection, IteratorMode, LedgerColumn, Rocks, WriteBatch},
        blockstore_meta::{
            DuplicateSlotProof, ErasureMeta, ErasureMetaStatus, Index, MerkleRootMeta, ShredIndex,
            SlotMeta,
        },
        blockstore_metrics::BlockstoreInsertionMetrics,
        blockstore_options::BlockstoreOptions,
        leader_schedule_cache::LeaderScheduleCache,
        shred::{
            self, ErasureSetId, Payload, ReedSolomonCache, Shred, ShredId, ShredType,
        },
    },
    assert_matches::debug_assert_matches,
    crossbeam_channel::{Sender, TrySendError},
    std::{
        borrow::Cow,
        cell::RefCell,
        cmp,
        collections::{
            btree_map::Entry as BTreeMapEntry, hash_map::Entry as HashMapEntry, BTreeMap,
            BTreeSet, HashMap, VecDeque,
        },
        fs,
        path::{Path, PathBuf},
        rc::Rc,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc, Mutex,
        },
        time::Instant,
    },
    thiserror::Error,
    trellis_sdk::{
        clock::{Slot, DEFAULT_TICKS_PER_SECOND},
        hash::Hash,
        timing::timestamp,
    },
};
pub use {
    crate::blockstore::error::{BlockstoreError, Result},
    crate::shred::verify_shred_slots,
};

// The blockstore files are stored under this directory within the ledger
// directory.
pub const BLOCKSTORE_DIRECTORY: &str = "rocksdb";

pub type CompletedSlotsSender = Sender<Vec<Slot>>;
pub type CompletedSlotsReceiver = crossbeam_channel::Receiver<Vec<Slot>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CompletedDataSetInfo {
    /// [`Slot`] to which the [`Shred`]s in this set belong.
    pub slot: Slot,
    /// Index of the first [`Shred`] in the range of shreds that belong to this set.
    pub start_index: u32,
    /// Index of the last [`Shred`] in the range of shreds that belong to this set.
    pub end_index: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PossibleDuplicateShred {
    Exists(Shred), // Blockstore has another shred in its spot
    LastIndexConflict(/* original */ Shred, /* conflict */ Payload), // The index of this shred conflicts with `slot_meta.last_index`
    ErasureConflict(/* original */ Shred, /* conflict */ Payload), // The erasure config of this coding shred conflicts with the config of the erasure set
    MerkleRootConflict(/* original */ Shred, /* conflict */ Payload), // Merkle root conflict in the same fec set
    ChainedMerkleRootConflict(/* original */ Shred, /* conflict */ Payload), // Merkle root chaining conflict with previous fec set
}

impl PossibleDuplicateShred {
    pub fn slot(&self) -> Slot {
        match self {
            Self::Exists(shred) => shred.slot(),
            Self::LastIndexConflict(shred, _) => shred.slot(),
            Self::ErasureConflict(shred, _) => shred.slot(),
            Self::MerkleRootConflict(shred, _) => shred.slot(),
            Self::ChainedMerkleRootConflict(shred, _) => shred.slot(),
        }
    }
}

#[derive(Debug)]
pub struct InsertResults {
    pub completed_data_set_infos: Vec<CompletedDataSetInfo>,
    pub duplicate_shreds: Vec<PossibleDuplicateShred>,
}

#[derive(Error, Debug)]
pub enum InsertDataShredError {
    #[error("Data shred already exists in Blockstore")]
    Exists,
    #[error("Invalid data shred")]
    InvalidShred,
    #[error(transparent)]
    BlockstoreError(#[from] BlockstoreError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ShredSource {
    Turbine,
    Repaired,
    Recovered,
}

/// A working-set value layered over the backing column: `Dirty` entries
/// carry modifications that must be flushed at commit time, `Clean`
/// entries were only read.
enum WorkingEntry<T> {
    Dirty(T), // Value has been modified with respect to the blockstore column
    Clean(T), // Value matches what is currently in the blockstore column
}

impl<T> WorkingEntry<T> {
    fn should_write(&self) -> bool {
        matches!(self, Self::Dirty(_))
    }
}

impl<T> AsRef<T> for WorkingEntry<T> {
    fn as_ref(&self) -> &T {
        match self {
            Self::Dirty(value) | Self::Clean(value) => value,
        }
    }
}

struct SlotMetaWorkingSetEntry {
    /// The dirty version of the `SlotMeta`
    new_slot_meta: Rc<RefCell<SlotMeta>>,
    /// The latest version of the `SlotMeta` that was persisted in the
    /// blockstore with the current implementation.
    old_slot_meta: Option<SlotMeta>,
    /// True only if at least one shred for this SlotMeta was inserted since
    /// this struct was created.
    did_insert_occur: bool,
}

impl SlotMetaWorkingSetEntry {
    /// Construct a new SlotMetaWorkingSetEntry with the specified `new_slot_meta`
    /// and `old_slot_meta`.  `did_insert_occur` is set to false.
    fn new(new_slot_meta: Rc<RefCell<SlotMeta>>, old_slot_meta: Option<SlotMeta>) -> Self {
        Self {
            new_slot_meta,
            old_slot_meta,
            did_insert_occur: false,
        }
    }
}

pub struct IndexMetaWorkingSetEntry {
    index: Index,
    // true only if at least one shred for this Index was inserted since the time this
    // struct was created
    did_insert_occur: bool,
}

/// Per-call scratch state for one `insert` batch: the working-set caches
/// layered over the store, the write batch the call accumulates into, and
/// the call's outputs.
struct ShredInsertionTracker {
    just_inserted_shreds: HashMap<ShredId, Shred>,
    // In-memory map that maintains the dirty copy of the erasure metas.
    // Ordered by erasure set id so that the chained merkle root checks can
    // reason about the "next" set in a slot.
    erasure_metas: BTreeMap<ErasureSetId, WorkingEntry<ErasureMeta>>,
    merkle_root_metas: HashMap<ErasureSetId, WorkingEntry<MerkleRootMeta>>,
    slot_meta_working_set: HashMap<u64, SlotMetaWorkingSetEntry>,
    index_working_set: HashMap<u64, IndexMetaWorkingSetEntry>,
    duplicate_shreds: Vec<PossibleDuplicateShred>,
    write_batch: WriteBatch,
    index_meta_time_us: u64,
    newly_completed_data_sets: Vec<CompletedDataSetInfo>,
}

impl ShredInsertionTracker {
    fn new(num_shreds: usize, write_batch: WriteBatch) -> Self {
        Self {
            just_inserted_shreds: HashMap::with_capacity(num_shreds),
            erasure_metas: BTreeMap::new(),
            merkle_root_metas: HashMap::new(),
            slot_meta_working_set: HashMap::new(),
            index_working_set: HashMap::new(),
            duplicate_shreds: vec![],
            write_batch,
            index_meta_time_us: 0,
            newly_completed_data_sets: vec![],
        }
    }
}

pub struct Blockstore {
    ledger_path: PathBuf,
    db: Arc<Rocks>,
    meta_cf: LedgerColumn<cf::SlotMeta>,
    dead_slots_cf: LedgerColumn<cf::DeadSlots>,
    duplicate_slots_cf: LedgerColumn<cf::DuplicateSlots>,
    erasure_meta_cf: LedgerColumn<cf::ErasureMeta>,
    orphans_cf: LedgerColumn<cf::Orphans>,
    index_cf: LedgerColumn<cf::Index>,
    data_shred_cf: LedgerColumn<cf::ShredData>,
    code_shred_cf: LedgerColumn<cf::ShredCode>,
    merkle_root_meta_cf: LedgerColumn<cf::MerkleRootMeta>,
    roots_cf: LedgerColumn<cf::Root>,
    // The latest root; only ever advanced by the external pruning
    // subsystem, read here with relaxed ordering.
    max_root: AtomicU64,
    insert_shreds_lock: Mutex<()>,
    new_shreds_signals: Mutex<Vec<Sender<bool>>>,
    completed_slots_senders: Mutex<Vec<CompletedSlotsSender>>,
}

impl Blockstore {
    pub fn ledger_path(&self) -> &PathBuf {
        &self.ledger_path
    }

    /// Opens a Ledger in directory, provides "infinite" window of shreds
    pub fn open(ledger_path: &Path) -> Result<Blockstore> {
        Self::do_open(ledger_path, BlockstoreOptions::default())
    }

    pub fn open_with_options(ledger_path: &Path, options: BlockstoreOptions) -> Result<Blockstore> {
        Self::do_open(ledger_path, options)
    }

    fn do_open(ledger_path: &Path, options: BlockstoreOptions) -> Result<Blockstore> {
        fs::create_dir_all(ledger_path)?;
        let blockstore_path = ledger_path.join(BLOCKSTORE_DIRECTORY);

        info!("Opening blockstore at {blockstore_path:?}");
        let db = Arc::new(Rocks::open(blockstore_path, options)?);

        let meta_cf = db.column();
        let dead_slots_cf = db.column();
        let duplicate_slots_cf = db.column();
        let erasure_meta_cf = db.column();
        let orphans_cf = db.column();
        let index_cf = db.column();
        let data_shred_cf = db.column();
        let code_shred_cf = db.column();
        let merkle_root_meta_cf = db.column();
        let roots_cf: LedgerColumn<cf::Root> = db.column();

        // Restore the last root from the column; the pruning subsystem
        // advances it from there.
        let max_root = roots_cf
            .iter(IteratorMode::End)?
            .next()
            .map(|(slot, _)| slot)
            .unwrap_or(0);

        Ok(Blockstore {
            ledger_path: ledger_path.to_path_buf(),
            db,
            meta_cf,
            dead_slots_cf,
            duplicate_slots_cf,
            erasure_meta_cf,
            orphans_cf,
            index_cf,
            data_shred_cf,
            code_shred_cf,
            merkle_root_meta_cf,
            roots_cf,
            max_root: AtomicU64::new(max_root),
            insert_shreds_lock: Mutex::new(()),
            new_shreds_signals: Mutex::new(vec![]),
            completed_slots_senders: Mutex::new(vec![]),
        })
    }

    pub fn destroy(ledger_path: &Path) -> Result<()> {
        // Database::destroy() fails if the root directory doesn't exist
        fs::create_dir_all(ledger_path)?;
        Rocks::destroy(&ledger_path.join(BLOCKSTORE_DIRECTORY))
    }

    pub fn meta(&self, slot: Slot) -> Result<Option<SlotMeta>> {
        self.meta_cf.get(slot)
    }

    pub fn get_index(&self, slot: Slot) -> Result<Option<Index>> {
        self.index_cf.get(slot)
    }

    pub fn erasure_meta(&self, erasure_set: ErasureSetId) -> Result<Option<ErasureMeta>> {
        let (slot, fec_set_index) = erasure_set.store_key();
        self.erasure_meta_cf.get((slot, u64::from(fec_set_index)))
    }

    pub fn merkle_root_meta(&self, erasure_set: ErasureSetId) -> Result<Option<MerkleRootMeta>> {
        self.merkle_root_meta_cf.get(erasure_set.store_key())
    }

    pub fn get_data_shred(&self, slot: Slot, index: u64) -> Result<Option<Vec<u8>>> {
        self.data_shred_cf.get_bytes((slot, index))
    }

    pub fn get_coding_shred(&self, slot: Slot, index: u64) -> Result<Option<Vec<u8>>> {
        self.code_shred_cf.get_bytes((slot, index))
    }

    pub fn slot_data_iterator(
        &self,
        slot: Slot,
        index: u64,
    ) -> Result<impl Iterator<Item = ((u64, u64), Box<[u8]>)> + '_> {
        let slot_iterator = self
            .data_shred_cf
            .iter(IteratorMode::From((slot, index), IteratorDirection::Forward))?;
        Ok(slot_iterator.take_while(move |((shred_slot, _), _)| *shred_slot == slot))
    }

    pub fn slot_coding_iterator(
        &self,
        slot: Slot,
        index: u64,
    ) -> Result<impl Iterator<Item = ((u64, u64), Box<[u8]>)> + '_> {
        let slot_iterator = self
            .code_shred_cf
            .iter(IteratorMode::From((slot, index), IteratorDirection::Forward))?;
        Ok(slot_iterator.take_while(move |((shred_slot, _), _)| *shred_slot == slot))
    }

    pub fn is_dead(&self, slot: Slot) -> bool {
        matches!(
            self.dead_slots_cf
                .get(slot)
                .expect("fetch from DeadSlots column family failed"),
            Some(true)
        )
    }

    pub fn is_full(&self, slot: Slot) -> bool {
        if let Ok(Some(meta)) = self.meta(slot) {
            return meta.is_full();
        }
        false
    }

    pub fn orphan(&self, slot: Slot) -> Result<Option<bool>> {
        self.orphans_cf.get(slot)
    }

    pub fn is_root(&self, slot: Slot) -> bool {
        matches!(
            self.roots_cf.get(slot).expect("fetch from Root column family failed"),
            Some(true)
        )
    }

    pub fn max_root(&self) -> Slot {
        self.max_root.load(Ordering::Relaxed)
    }

    pub fn set_roots<'a>(&self, rooted_slots: impl Iterator<Item = &'a Slot>) -> Result<()> {
        let mut write_batch = self.db.batch();
        let mut max_new_rooted_slot = 0;
        for slot in rooted_slots {
            max_new_rooted_slot = cmp::max(max_new_rooted_slot, *slot);
            self.roots_cf.put_in_batch(&mut write_batch, *slot, &true)?;
        }
        self.db.write(write_batch)?;
        self.max_root.fetch_max(max_new_rooted_slot, Ordering::Relaxed);
        Ok(())
    }

    pub fn has_duplicate_shreds_in_slot(&self, slot: Slot) -> bool {
        self.duplicate_slots_cf
            .contains(slot)
            .expect("fetch from DuplicateSlots column family failed")
    }

    pub fn get_duplicate_slot(&self, slot: Slot) -> Option<DuplicateSlotProof> {
        self.duplicate_slots_cf
            .get(slot)
            .expect("fetch from DuplicateSlots column family failed")
    }

    pub fn store_duplicate_slot(
        &self,
        slot: Slot,
        shred1: Vec<u8>,
        shred2: Vec<u8>,
    ) -> Result<()> {
        let duplicate_slot_proof = DuplicateSlotProof::new(shred1, shred2);
        self.duplicate_slots_cf.put(slot, &duplicate_slot_proof)
    }

    fn store_duplicate_if_not_existing(
        &self,
        slot: Slot,
        shred1: Vec<u8>,
        shred2: Vec<u8>,
    ) -> Result<()> {
        if !self.has_duplicate_shreds_in_slot(slot) {
            self.store_duplicate_slot(slot, shred1, shred2)
        } else {
            Ok(())
        }
    }

    /// Returns the existing shred's payload if the blockstore already holds
    /// a different shred at the same (slot, index, type).
    pub fn is_shred_duplicate(&self, shred: &Shred) -> Option<Vec<u8>> {
        let (slot, index, shred_type) = (shred.slot(), u64::from(shred.index()), shred.shred_type());
        let existing_shred = match shred_type {
            ShredType::Data => self.get_data_shred(slot, index),
            ShredType::Code => self.get_coding_shred(slot, index),
        }
        .expect("fetch from ShredData/ShredCode column family failed")?;
        (existing_shred != **shred.payload()).then_some(existing_shred)
    }

    pub fn add_new_shred_signal(&self, s: Sender<bool>) {
        self.new_shreds_signals.lock().unwrap().push(s);
    }

    pub fn add_completed_slots_signal(&self, s: CompletedSlotsSender) {
        self.completed_slots_senders.lock().unwrap().push(s);
    }

    pub fn drop_signal(&self) {
        self.new_shreds_signals.lock().unwrap().clear();
        self.completed_slots_senders.lock().unwrap().clear();
    }

    pub fn insert_shreds(
        &self,
        shreds: Vec<Shred>,
        leader_schedule: Option<&LeaderScheduleCache>,
        is_trusted: bool,
    ) -> Result<Vec<CompletedDataSetInfo>> {
        let shreds_len = shreds.len();
        let insert_results = self.do_insert_shreds(
            shreds,
            vec![false; shreds_len],
            leader_schedule,
            is_trusted,
            None, // retransmit-sender
            &ReedSolomonCache::default(),
            &mut BlockstoreInsertionMetrics::default(),
        )?;
        Ok(insert_results.completed_data_set_infos)
    }

    /// The main helper function that performs the shred insertion logic
    /// and updates corresponding metadata. Any detected duplicate shreds
    /// are passed to `handle_duplicate`.
    ///
    /// This function updates the following column families:
    ///   - [`cf::DeadSlots`]: mark a slot as dead if the inserted shreds
    ///     reveal a shorter alternative version of the slot. Specifically
    ///     when a new shred N marked as the last shred in slot S arrives,
    ///     but N.index() is less than the current slot_meta.received for
    ///     slot S, and the slot is not currently full.
    ///   - [`cf::ShredData`]: stores data shreds (in check_insert_data_shred).
    ///   - [`cf::ShredCode`]: stores coding shreds (in check_insert_coding_shred).
    ///   - [`cf::SlotMeta`]: the SlotMeta of the input `shreds` and their related
    ///     shreds are updated.  Specifically:
    ///     - `handle_chaining()` updates `cf::SlotMeta` in two ways.  First, it
    ///       updates the in-memory slot_meta_working_set, which will later be
    ///       persisted in commit_slot_meta_working_set().  Second, for the newly
    ///       chained slots (updated inside handle_chaining_for_slot()), it will
    ///       directly persist their slot-meta into `cf::SlotMeta`.
    ///     - In `commit_slot_meta_working_set()`, persists everything stored
    ///       in the in-memory structure slot_meta_working_set, which is updated
    ///       by both `check_insert_data_shred()` and `handle_chaining()`.
    ///   - [`cf::Orphans`]: add or remove the ID of a slot to `cf::Orphans`
    ///     if it becomes / is no longer an orphan slot in `handle_chaining()`.
    ///   - [`cf::ErasureMeta`]: the associated ErasureMeta of the coding and data
    ///     shreds inside `shreds` will be updated and committed to
    ///     `cf::ErasureMeta`.
    ///   - [`cf::MerkleRootMeta`]: the associated MerkleRootMeta of the shreds
    ///     inside `shreds` will be updated and committed to
    ///     `cf::MerkleRootMeta`.
    ///   - [`cf::Index`]: stores (slot id, index to the index_working_set_entry)
    ///     pair to the `cf::Index` column family for each index_working_set_entry
    ///     which insert did occur in this function call.
    ///
    /// Arguments:
    ///  - `shreds`: the shreds to be inserted.
    ///  - `is_repaired`: a boolean vector aligned with `shreds` where each
    ///    boolean indicates whether the corresponding shred is repaired or not.
    ///  - `leader_schedule`: the leader schedule; recovery is skipped when
    ///    absent.
    ///  - `is_trusted`: whether the shreds come from a trusted source. If this
    ///    is set to true, then the function will skip the shred duplication and
    ///    integrity checks.
    ///  - `retransmit_sender`: the sender for transmitting any recovered
    ///    shreds.
    ///  - `handle_duplicate`: a function for handling shreds that are detected
    ///    as duplicates of already stored or staged shreds.
    ///  - `metrics`: the metric for reporting detailed stats
    ///
    /// On success, the function returns an Ok result with a vector of
    /// `CompletedDataSetInfo`.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_shreds_handle_duplicate<F>(
        &self,
        shreds: Vec<Shred>,
        is_repaired: Vec<bool>,
        leader_schedule: Option<&LeaderScheduleCache>,
        is_trusted: bool,
        retransmit_sender: Option<&Sender<Vec<Payload>>>,
        handle_duplicate: &F,
        reed_solomon_cache: &ReedSolomonCache,
        metrics: &mut BlockstoreInsertionMetrics,
    ) -> Result<Vec<CompletedDataSetInfo>>
    where
        F: Fn(PossibleDuplicateShred),
    {
        let InsertResults {
            completed_data_set_infos,
            duplicate_shreds,
        } = self.do_insert_shreds(
            shreds,
            is_repaired,
            leader_schedule,
            is_trusted,
            retransmit_sender,
            reed_solomon_cache,
            metrics,
        )?;
        for shred in duplicate_shreds {
            handle_duplicate(shred);
        }
        Ok(completed_data_set_infos)
    }

    fn do_insert_shreds(
        &self,
        shreds: Vec<Shred>,
        is_repaired: Vec<bool>,
        leader_schedule: Option<&LeaderScheduleCache>,
        is_trusted: bool,
        retransmit_sender: Option<&Sender<Vec<Payload>>>,
        reed_solomon_cache: &ReedSolomonCache,
        metrics: &mut BlockstoreInsertionMetrics,
    ) -> Result<InsertResults> {
        assert_eq!(shreds.len(), is_repaired.len());
        let total_start = Instant::now();

        // Acquire the insertion lock; all inserters are serialized against
        // each other, readers go through the last committed batch.
        let start = Instant::now();
        let _lock = self.insert_shreds_lock.lock().unwrap();
        metrics.insert_lock_elapsed_us += start.elapsed().as_micros() as u64;

        let mut shred_insertion_tracker =
            ShredInsertionTracker::new(shreds.len(), self.db.batch());

        let start = Instant::now();
        self.attempt_shred_insertion(
            shreds,
            is_repaired,
            is_trusted,
            leader_schedule,
            &mut shred_insertion_tracker,
            metrics,
        );
        metrics.insert_shreds_elapsed_us += start.elapsed().as_micros() as u64;

        let start = Instant::now();
        if let Some(leader_schedule_cache) = leader_schedule {
            self.try_shred_recovery(
                leader_schedule_cache,
                reed_solomon_cache,
                retransmit_sender,
                is_trusted,
                &mut shred_insertion_tracker,
                metrics,
            );
        }
        metrics.shred_recovery_elapsed_us += start.elapsed().as_micros() as u64;

        let start = Instant::now();
        // Handle chaining for the members of the slot_meta_working_set that
        // were inserted into, drop the others.
        self.handle_chaining(
            &mut shred_insertion_tracker.write_batch,
            &mut shred_insertion_tracker.slot_meta_working_set,
        )?;
        self.check_chained_merkle_root_consistency(&mut shred_insertion_tracker);
        metrics.chaining_elapsed_us += start.elapsed().as_micros() as u64;

        let ShredInsertionTracker {
            erasure_metas,
            merkle_root_metas,
            mut write_batch,
            slot_meta_working_set,
            index_working_set,
            duplicate_shreds,
            newly_completed_data_sets,
            index_meta_time_us,
            just_inserted_shreds: _,
        } = shred_insertion_tracker;

        let start = Instant::now();
        let (should_signal, newly_completed_slots) =
            self.commit_slot_meta_working_set(&slot_meta_working_set, &mut write_batch)?;

        for (erasure_set, working_erasure_meta) in erasure_metas {
            if !working_erasure_meta.should_write() {
                // Not a new erasure meta
                continue;
            }
            let (slot, fec_set_index) = erasure_set.store_key();
            self.erasure_meta_cf.put_in_batch(
                &mut write_batch,
                (slot, u64::from(fec_set_index)),
                working_erasure_meta.as_ref(),
            )?;
        }

        for (erasure_set, working_merkle_root_meta) in merkle_root_metas {
            if !working_merkle_root_meta.should_write() {
                // Not a new merkle root meta
                continue;
            }
            self.merkle_root_meta_cf.put_in_batch(
                &mut write_batch,
                erasure_set.store_key(),
                working_merkle_root_meta.as_ref(),
            )?;
        }

        for (&slot, index_working_set_entry) in index_working_set.iter() {
            if index_working_set_entry.did_insert_occur {
                self.index_cf
                    .put_in_batch(&mut write_batch, slot, &index_working_set_entry.index)?;
            }
        }
        metrics.commit_working_sets_elapsed_us += start.elapsed().as_micros() as u64;

        let start = Instant::now();
        self.db.write(write_batch)?;
        metrics.write_batch_elapsed_us += start.elapsed().as_micros() as u64;

        send_signals(
            &self.new_shreds_signals.lock().unwrap(),
            &self.completed_slots_senders.lock().unwrap(),
            should_signal,
            newly_completed_slots,
        );

        metrics.total_elapsed_us += total_start.elapsed().as_micros() as u64;
        metrics.index_meta_time_us += index_meta_time_us;

        Ok(InsertResults {
            completed_data_set_infos: newly_completed_data_sets,
            duplicate_shreds,
        })
    }

    fn attempt_shred_insertion(
        &self,
        shreds: Vec<Shred>,
        is_repaired: Vec<bool>,
        is_trusted: bool,
        leader_schedule: Option<&LeaderScheduleCache>,
        shred_insertion_tracker: &mut ShredInsertionTracker,
        metrics: &mut BlockstoreInsertionMetrics,
    ) {
        metrics.num_shreds += shreds.len();
        for (shred, is_repaired) in shreds.into_iter().zip(is_repaired) {
            let shred_source = if is_repaired {
                ShredSource::Repaired
            } else {
                ShredSource::Turbine
            };
            match shred.shred_type() {
                ShredType::Data => {
                    match self.check_insert_data_shred(
                        shred,
                        shred_insertion_tracker,
                        is_trusted,
                        leader_schedule,
                        shred_source,
                    ) {
                        Err(InsertDataShredError::Exists) => {
                            if is_repaired {
                                metrics.num_repaired_data_shreds_exists += 1;
                            } else {
                                metrics.num_turbine_data_shreds_exists += 1;
                            }
                        }
                        Err(InsertDataShredError::InvalidShred) => {
                            metrics.num_data_shreds_invalid += 1
                        }
                        Err(InsertDataShredError::BlockstoreError(err)) => {
                            error!("blockstore error: {err}");
                        }
                        Ok(completed_data_sets) => {
                            if is_repaired {
                                metrics.num_repair += 1;
                            }
                            shred_insertion_tracker
                                .newly_completed_data_sets
                                .extend(completed_data_sets);
                            metrics.num_inserted += 1;
                        }
                    };
                }
                ShredType::Code => {
                    self.check_insert_coding_shred(
                        shred,
                        shred_insertion_tracker,
                        is_trusted,
                        metrics,
                    );
                }
            };
        }
    }

    /// Create an entry to the specified `write_batch` that performs shred
    /// insertion and associated metadata update.  The function also updates
    /// its in-memory copy of the associated metadata.
    ///
    /// Currently, this function must be invoked while holding
    /// `insert_shreds_lock` as it performs read-modify-write operations
    /// on multiple column families.
    ///
    /// The resulting `write_batch` may include updates to [`cf::DeadSlots`]
    /// and [`cf::ShredData`].  Note that it will also update the in-memory copy
    /// of `erasure_metas`, `merkle_root_metas`, and `index_working_set`, which
    /// will later be used to update other column families such as
    /// [`cf::ErasureMeta`] and [`cf::Index`].
    ///
    /// Arguments:
    /// - `shred`: the shred to be inserted
    /// - `shred_insertion_tracker`: collection of working-set caches and
    ///     outputs for the in-flight insertion call
    /// - `is_trusted`: if false, this function will check whether the
    ///     input shred is duplicate.
    /// - `leader_schedule`: the leader schedule will be used to check
    ///     whether it is okay to insert the input shred.
    /// - `shred_source`: the source of the shred.
    fn check_insert_data_shred(
        &self,
        shred: Shred,
        shred_insertion_tracker: &mut ShredInsertionTracker,
        is_trusted: bool,
        leader_schedule: Option<&LeaderScheduleCache>,
        shred_source: ShredSource,
    ) -> std::result::Result<Vec<CompletedDataSetInfo>, InsertDataShredError> {
        let slot = shred.slot();
        let shred_index = u64::from(shred.index());

        let ShredInsertionTracker {
            index_working_set,
            slot_meta_working_set,
            erasure_metas,
            merkle_root_metas,
            just_inserted_shreds,
            write_batch,
            duplicate_shreds,
            index_meta_time_us,
            ..
        } = shred_insertion_tracker;

        let index_meta_working_set_entry =
            self.get_index_meta_entry(slot, index_working_set, index_meta_time_us);
        let index_meta = &mut index_meta_working_set_entry.index;

        let slot_meta_entry = self.get_slot_meta_entry(
            slot_meta_working_set,
            slot,
            shred
                .parent()
                .map_err(|_| InsertDataShredError::InvalidShred)?,
        );
        let slot_meta = &mut slot_meta_entry.new_slot_meta.borrow_mut();

        let erasure_set = shred.erasure_set();
        if let HashMapEntry::Vacant(entry) = merkle_root_metas.entry(erasure_set) {
            if let Some(meta) = self.merkle_root_meta(erasure_set).unwrap() {
                entry.insert(WorkingEntry::Clean(meta));
            }
        }

        if !is_trusted {
            if Self::is_data_shred_present(&shred, slot_meta, index_meta.data()) {
                duplicate_shreds.push(PossibleDuplicateShred::Exists(shred));
                return Err(InsertDataShredError::Exists);
            }

            if shred.last_in_slot() && shred_index < slot_meta.received && !slot_meta.is_full() {
                // We got a last shred < slot_meta.received, which signals there's an alternative,
                // shorter version of the slot. Because also `!slot_meta.is_full()`, then this
                // means, for the current version of the slot, we might never get all the
                // shreds < the current last index, never replay this slot, and make no
                // progress (for instance if a leader sends an additional detached "last index"
                // shred with a very high index, but none of the intermediate shreds). Ideally, we would
                // just purge all shreds > the new last index slot, but because replay may have already
                // replayed entries past the newly detected "last" shred, then mark the slot as dead
                // and wait for replay to dump and repair the correct version.
                warn!(
                    "Received *last* shred index {shred_index} less than previous shred index {}, \
                     and slot {slot} is not full, marking slot dead",
                    slot_meta.received
                );
                self.dead_slots_cf.put_in_batch(write_batch, slot, &true)?;
            }

            if !self.should_insert_data_shred(
                &shred,
                slot_meta,
                just_inserted_shreds,
                self.max_root(),
                leader_schedule,
                shred_source,
                duplicate_shreds,
            ) {
                return Err(InsertDataShredError::InvalidShred);
            }

            if let Some(merkle_root_meta) = merkle_root_metas.get(&erasure_set) {
                // A previous shred has been inserted in this batch or in blockstore
                // Compare our current shred against the previous shred for potential
                // conflicts
                if !self.check_merkle_root_consistency(
                    just_inserted_shreds,
                    slot,
                    merkle_root_meta.as_ref(),
                    &shred,
                    duplicate_shreds,
                ) {
                    return Err(InsertDataShredError::InvalidShred);
                }
            }
        }

        let newly_completed_data_sets = self.insert_data_shred(
            slot_meta,
            index_meta.data_mut(),
            &shred,
            write_batch,
            shred_source,
        )?;
        merkle_root_metas
            .entry(erasure_set)
            .or_insert(WorkingEntry::Dirty(MerkleRootMeta::from_shred(&shred)));
        just_inserted_shreds.insert(shred.id(), shred);
        index_meta_working_set_entry.did_insert_occur = true;
        slot_meta_entry.did_insert_occur = true;
        if let BTreeMapEntry::Vacant(entry) = erasure_metas.entry(erasure_set) {
            if let Some(meta) = self.erasure_meta(erasure_set).unwrap() {
                entry.insert(WorkingEntry::Clean(meta));
            }
        }
        Ok(newly_completed_data_sets)
    }

    fn check_insert_coding_shred(
        &self,
        shred: Shred,
        shred_insertion_tracker: &mut ShredInsertionTracker,
        is_trusted: bool,
        metrics: &mut BlockstoreInsertionMetrics,
    ) -> bool {
        let slot = shred.slot();
        let shred_index = u64::from(shred.index());

        let ShredInsertionTracker {
            index_working_set,
            erasure_metas,
            merkle_root_metas,
            just_inserted_shreds,
            write_batch,
            duplicate_shreds,
            index_meta_time_us,
            ..
        } = shred_insertion_tracker;

        let index_meta_working_set_entry =
            self.get_index_meta_entry(slot, index_working_set, index_meta_time_us);
        let index_meta = &mut index_meta_working_set_entry.index;

        let erasure_set = shred.erasure_set();
        if let HashMapEntry::Vacant(entry) = merkle_root_metas.entry(erasure_set) {
            if let Some(meta) = self.merkle_root_meta(erasure_set).unwrap() {
                entry.insert(WorkingEntry::Clean(meta));
            }
        }

        // This gives the index of first coding shred in this FEC block
        // So, all coding shreds in a given FEC block will have the same set index
        if !is_trusted {
            if index_meta.coding().contains(shred_index) {
                metrics.num_code_shreds_exists += 1;
                duplicate_shreds.push(PossibleDuplicateShred::Exists(shred));
                return false;
            }

            if !Self::should_insert_coding_shred(&shred, self.max_root()) {
                metrics.num_code_shreds_invalid += 1;
                return false;
            }

            if let Some(merkle_root_meta) = merkle_root_metas.get(&erasure_set) {
                // A previous shred has been inserted in this batch or in blockstore
                // Compare our current shred against the previous shred for potential
                // conflicts
                if !self.check_merkle_root_consistency(
                    just_inserted_shreds,
                    slot,
                    merkle_root_meta.as_ref(),
                    &shred,
                    duplicate_shreds,
                ) {
                    metrics.num_code_shreds_invalid += 1;
                    return false;
                }
            }
        }

        let erasure_meta_entry = erasure_metas.entry(erasure_set).or_insert_with(|| {
            self.erasure_meta(erasure_set)
                .expect("Expect database get to succeed")
                .map(WorkingEntry::Clean)
                .unwrap_or_else(|| {
                    WorkingEntry::Dirty(
                        ErasureMeta::from_coding_shred(&shred)
                            .expect("coding shred must produce erasure meta"),
                    )
                })
        });
        let erasure_meta = erasure_meta_entry.as_ref();

        if !erasure_meta.check_coding_shred(&shred) {
            metrics.num_code_shreds_invalid_erasure_config += 1;
            if !self.has_duplicate_shreds_in_slot(slot) {
                if let Some(conflicting_shred) = self
                    .find_conflicting_coding_shred(slot, erasure_meta, just_inserted_shreds)
                    .map(Cow::into_owned)
                {
                    if let Err(e) = self.store_duplicate_slot(
                        slot,
                        conflicting_shred.clone(),
                        shred.payload().clone().into(),
                    ) {
                        warn!(
                            "Unable to store conflicting erasure meta duplicate proof for \
                             {slot} {erasure_set:?} {e}"
                        );
                    }
                    duplicate_shreds.push(PossibleDuplicateShred::ErasureConflict(
                        shred.clone(),
                        Payload::from(conflicting_shred),
                    ));
                } else {
                    error!(
                        "Unable to find the conflicting coding shred that set {erasure_meta:?}. \
                         This should only happen in extreme cases where blockstore cleanup has \
                         caught up to the root. Skipping the erasure meta duplicate shred check"
                    );
                }
            }
            // ToDo: This is a potential slashing condition
            warn!("Received multiple erasure configs for the same erasure set!!!");
            warn!(
                "Slot: {}, shred index: {}, erasure_set: {:?}, is_duplicate: {}, stored config: \
                 {:#?}, new shred: {:#?}",
                slot,
                shred.index(),
                erasure_set,
                self.has_duplicate_shreds_in_slot(slot),
                erasure_meta.config(),
                shred,
            );
            return false;
        }

        // insert coding shred into rocks
        let result = self
            .insert_coding_shred(index_meta, &shred, write_batch)
            .is_ok();

        if result {
            index_meta_working_set_entry.did_insert_occur = true;
            metrics.num_inserted += 1;

            merkle_root_metas
                .entry(erasure_set)
                .or_insert(WorkingEntry::Dirty(MerkleRootMeta::from_shred(&shred)));
        }

        if let HashMapEntry::Vacant(entry) = just_inserted_shreds.entry(shred.id()) {
            metrics.num_code_shreds_inserted += 1;
            entry.insert(shred);
        }

        result
    }

    fn should_insert_coding_shred(shred: &Shred, max_root: Slot) -> bool {
        debug_assert_matches!(shred.sanitize(), Ok(()));
        shred.is_code() && shred.slot() > max_root
    }

    fn insert_coding_shred(
        &self,
        index_meta: &mut Index,
        shred: &Shred,
        write_batch: &mut WriteBatch,
    ) -> Result<()> {
        let slot = shred.slot();
        let shred_index = u64::from(shred.index());

        // Assert guaranteed by integrity checks on the shred that happen before
        // `insert_coding_shred` is called
        debug_assert_matches!(shred.sanitize(), Ok(()));
        assert!(shred.is_code());

        // Commit step: commit all changes to the mutable structures at once, or none at all.
        // We don't want only a subset of these changes going through.
        self.code_shred_cf
            .put_bytes_in_batch(write_batch, (slot, shred_index), shred.payload())?;
        index_meta.coding_mut().insert(shred_index);

        Ok(())
    }

    fn is_data_shred_present(shred: &Shred, slot_meta: &SlotMeta, data_index: &ShredIndex) -> bool {
        let shred_index = u64::from(shred.index());
        // Check that the shred doesn't already exist in blockstore
        shred_index < slot_meta.consumed || data_index.contains(shred_index)
    }

    fn get_shred_from_just_inserted_or_db<'a>(
        &'a self,
        just_inserted_shreds: &'a HashMap<ShredId, Shred>,
        shred_id: ShredId,
    ) -> Option<Cow<'a, [u8]>> {
        let (slot, index, shred_type) = (
            shred_id.slot(),
            u64::from(shred_id.index()),
            shred_id.shred_type(),
        );
        match (just_inserted_shreds.get(&shred_id), shred_type) {
            (Some(shred), _) => Some(Cow::Borrowed(shred.payload().as_ref())),
            // If it doesn't exist in the just inserted set, it must exist in
            // the backing store
            (_, ShredType::Data) => self
                .get_data_shred(slot, index)
                .expect("fetch from ShredData column family failed")
                .map(Cow::Owned),
            (_, ShredType::Code) => self
                .get_coding_shred(slot, index)
                .expect("fetch from ShredCode column family failed")
                .map(Cow::Owned),
        }
    }

    fn find_conflicting_coding_shred<'a>(
        &'a self,
        slot: Slot,
        erasure_meta: &ErasureMeta,
        just_received_shreds: &'a HashMap<ShredId, Shred>,
    ) -> Option<Cow<'a, [u8]>> {
        // Search for the shred which set the initial erasure config, either inserted,
        // or in the current batch in just_received_shreds.
        let index = erasure_meta.first_received_coding_shred_index()?;
        let shred_id = ShredId::new(slot, index, ShredType::Code);
        self.get_shred_from_just_inserted_or_db(just_received_shreds, shred_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn should_insert_data_shred(
        &self,
        shred: &Shred,
        slot_meta: &SlotMeta,
        just_inserted_shreds: &HashMap<ShredId, Shred>,
        max_root: Slot,
        leader_schedule: Option<&LeaderScheduleCache>,
        shred_source: ShredSource,
        duplicate_shreds: &mut Vec<PossibleDuplicateShred>,
    ) -> bool {
        let shred_index = u64::from(shred.index());
        let slot = shred.slot();
        let last_in_slot = shred.last_in_slot();
        debug_assert_matches!(shred.sanitize(), Ok(()));
        // Check that we do not receive shred_index >= than the last_index
        // for the slot
        let last_index = slot_meta.last_index;
        if last_index.map(|ix| shred_index >= ix).unwrap_or_default() {
            let leader_pubkey = leader_schedule
                .and_then(|leader_schedule| leader_schedule.slot_leader_at(slot));

            let ending_shred_id = ShredId::new(
                slot,
                u32::try_from(last_index.unwrap()).unwrap(),
                ShredType::Data,
            );
            if let Some(ending_shred) = self
                .get_shred_from_just_inserted_or_db(just_inserted_shreds, ending_shred_id)
                .map(Cow::into_owned)
            {
                if self
                    .store_duplicate_if_not_existing(
                        slot,
                        ending_shred.clone(),
                        shred.payload().clone().into(),
                    )
                    .is_err()
                {
                    warn!("store duplicate error");
                }
                duplicate_shreds.push(PossibleDuplicateShred::LastIndexConflict(
                    shred.clone(),
                    Payload::from(ending_shred),
                ));
            } else {
                error!(
                    "Last index data shred {ending_shred_id:?} indicated by slot meta \
                     {slot_meta:?} is missing from blockstore. This should only happen in \
                     extreme cases where blockstore cleanup has caught up to the root. Skipping \
                     data shred insertion"
                );
            }

            error!(
                "Leader {leader_pubkey:?}, slot {slot}: received index {shred_index} >= \
                 slot.last_index {last_index:?}, shred_source: {shred_source:?}"
            );
            return false;
        }
        // Check that we do not receive a shred with "last_index" true, but shred_index
        // less than our current received
        if last_in_slot && shred_index < slot_meta.received {
            let leader_pubkey = leader_schedule
                .and_then(|leader_schedule| leader_schedule.slot_leader_at(slot));

            let ending_shred_id = ShredId::new(
                slot,
                u32::try_from(slot_meta.received - 1).unwrap(),
                ShredType::Data,
            );
            if let Some(ending_shred) = self
                .get_shred_from_just_inserted_or_db(just_inserted_shreds, ending_shred_id)
                .map(Cow::into_owned)
            {
                if self
                    .store_duplicate_if_not_existing(
                        slot,
                        ending_shred.clone(),
                        shred.payload().clone().into(),
                    )
                    .is_err()
                {
                    warn!("store duplicate error");
                }
                duplicate_shreds.push(PossibleDuplicateShred::LastIndexConflict(
                    shred.clone(),
                    Payload::from(ending_shred),
                ));
            } else {
                error!(
                    "Last received data shred {ending_shred_id:?} indicated by slot meta \
                     {slot_meta:?} is missing from blockstore. This should only happen in \
                     extreme cases where blockstore cleanup has caught up to the root. Skipping \
                     data shred insertion"
                );
            }

            error!(
                "Leader {leader_pubkey:?}, slot {slot}: received shred_index {shred_index} < \
                 slot.received {}, shred_source: {shred_source:?}",
                slot_meta.received
            );
            return false;
        }

        // TODO Shouldn't this use shred.parent() instead and update
        // slot_meta.parent_slot accordingly?
        slot_meta
            .parent_slot
            .map(|parent_slot| verify_shred_slots(slot, parent_slot, max_root))
            .unwrap_or_default()
    }

    /// Returns true if there is no merkle root conflict between
    /// the existing `merkle_root_meta` and `shred`
    ///
    /// Otherwise return false and if not already present, add duplicate proof to
    /// `duplicate_shreds`.
    fn check_merkle_root_consistency(
        &self,
        just_inserted_shreds: &HashMap<ShredId, Shred>,
        slot: Slot,
        merkle_root_meta: &MerkleRootMeta,
        shred: &Shred,
        duplicate_shreds: &mut Vec<PossibleDuplicateShred>,
    ) -> bool {
        let new_merkle_root = shred.merkle_root().ok();
        if merkle_root_meta.merkle_root() == new_merkle_root {
            // No conflict, either both merkle shreds with same merkle root
            // or both legacy shreds with merkle_root `None`
            return true;
        }

        warn!(
            "Received conflicting merkle roots for slot: {slot}, erasure_set: {:?} original \
             merkle root meta {merkle_root_meta:?} vs conflicting merkle root {new_merkle_root:?} \
             shred index {} type {:?}. Reporting as duplicate",
            shred.erasure_set(),
            shred.index(),
            shred.shred_type(),
        );

        if !self.has_duplicate_shreds_in_slot(slot) {
            let shred_id = ShredId::new(
                slot,
                merkle_root_meta.first_received_shred_index(),
                merkle_root_meta.first_received_shred_type(),
            );
            let Some(conflicting_shred) = self
                .get_shred_from_just_inserted_or_db(just_inserted_shreds, shred_id)
                .map(Cow::into_owned)
            else {
                error!(
                    "Shred {shred_id:?} indicated by merkle root meta {merkle_root_meta:?} is \
                     missing from blockstore. This should only happen in extreme cases where \
                     blockstore cleanup has caught up to the root. Skipping the merkle root \
                     consistency check"
                );
                return true;
            };
            if self
                .store_duplicate_if_not_existing(
                    slot,
                    conflicting_shred.clone(),
                    shred.payload().clone().into(),
                )
                .is_err()
            {
                warn!("store duplicate error");
            }
            duplicate_shreds.push(PossibleDuplicateShred::MerkleRootConflict(
                shred.clone(),
                Payload::from(conflicting_shred),
            ));
        }
        false
    }

    /// Checks the chained merkle root consistency of every `Dirty` erasure
    /// meta (forward check from that set's first received coding shred) and
    /// every `Dirty` merkle root meta (backward check from its first
    /// received shred). Conflicts are purely consultative: they append to
    /// `duplicate_shreds` and never fail the insertion call.
    fn check_chained_merkle_root_consistency(
        &self,
        shred_insertion_tracker: &mut ShredInsertionTracker,
    ) {
        let just_inserted_shreds = &shred_insertion_tracker.just_inserted_shreds;
        let erasure_metas = &shred_insertion_tracker.erasure_metas;
        let merkle_root_metas = &shred_insertion_tracker.merkle_root_metas;
        let duplicate_shreds = &mut shred_insertion_tracker.duplicate_shreds;

        for (erasure_set, working_erasure_meta) in erasure_metas.iter() {
            if !working_erasure_meta.should_write() {
                // Not a new erasure meta
                continue;
            }
            let (slot, _) = erasure_set.store_key();
            if self.has_duplicate_shreds_in_slot(slot) {
                continue;
            }
            // First coding shred from this erasure batch, check the forward merkle root chaining
            let erasure_meta = working_erasure_meta.as_ref();
            let Some(shred_index) = erasure_meta.first_received_coding_shred_index() else {
                error!(
                    "First received coding index of {erasure_set:?} does not fit in u32, \
                     skipping the forward chained merkle root check"
                );
                continue;
            };
            let shred_id = ShredId::new(slot, shred_index, ShredType::Code);
            let Some(shred) = just_inserted_shreds.get(&shred_id) else {
                error!(
                    "Erasure meta was just created, initial shred {shred_id:?} must exist in \
                     just inserted shreds"
                );
                continue;
            };
            self.check_forward_chained_merkle_root_consistency(
                shred,
                erasure_meta,
                just_inserted_shreds,
                merkle_root_metas,
                duplicate_shreds,
            );
        }

        for (erasure_set, working_merkle_root_meta) in merkle_root_metas.iter() {
            if !working_merkle_root_meta.should_write() {
                // Not a new merkle root meta
                continue;
            }
            let (slot, _) = erasure_set.store_key();
            if self.has_duplicate_shreds_in_slot(slot) {
                continue;
            }
            // First shred from this erasure batch, check the backwards merkle root chaining
            let merkle_root_meta = working_merkle_root_meta.as_ref();
            let shred_id = ShredId::new(
                slot,
                merkle_root_meta.first_received_shred_index(),
                merkle_root_meta.first_received_shred_type(),
            );
            let Some(shred) = just_inserted_shreds.get(&shred_id) else {
                error!(
                    "Merkle root meta was just created, initial shred {shred_id:?} must exist \
                     in just inserted shreds"
                );
                continue;
            };
            self.check_backwards_chained_merkle_root_consistency(
                shred,
                just_inserted_shreds,
                erasure_metas,
                duplicate_shreds,
            );
        }
    }

    /// Returns true if there is no chaining conflict between
    /// the `shred` and `merkle_root_meta` of the next FEC set,
    /// or if shreds from the next set are yet to be received.
    ///
    /// Otherwise return false and add duplicate proof to
    /// `duplicate_shreds`.
    ///
    /// This is intended to be used right after `shred`'s `erasure_meta`
    /// is created for the first time.
    fn check_forward_chained_merkle_root_consistency(
        &self,
        shred: &Shred,
        erasure_meta: &ErasureMeta,
        just_inserted_shreds: &HashMap<ShredId, Shred>,
        merkle_root_metas: &HashMap<ErasureSetId, WorkingEntry<MerkleRootMeta>>,
        duplicate_shreds: &mut Vec<PossibleDuplicateShred>,
    ) -> bool {
        debug_assert!(erasure_meta.check_coding_shred(shred));
        let slot = shred.slot();

        // If a shred from the next fec set has already been inserted, check the chaining
        let Some(next_fec_set_index) = erasure_meta.next_fec_set_index() else {
            error!("Invalid erasure meta, unable to compute next fec set index {erasure_meta:?}");
            return false;
        };
        let next_erasure_set = ErasureSetId::new(slot, next_fec_set_index);
        let Some(next_merkle_root_meta) = merkle_root_metas
            .get(&next_erasure_set)
            .map(WorkingEntry::as_ref)
            .copied()
            .or_else(|| {
                self.merkle_root_meta(next_erasure_set)
                    .expect("fetch from MerkleRootMeta column family failed")
            })
        else {
            // No shred from the next fec set has been received
            return true;
        };
        let next_shred_id = ShredId::new(
            slot,
            next_merkle_root_meta.first_received_shred_index(),
            next_merkle_root_meta.first_received_shred_type(),
        );
        let Some(next_shred) = self
            .get_shred_from_just_inserted_or_db(just_inserted_shreds, next_shred_id)
            .map(Cow::into_owned)
        else {
            error!(
                "Shred {next_shred_id:?} indicated by merkle root meta {next_merkle_root_meta:?} \
                 is missing from blockstore. This should only happen in extreme cases where \
                 blockstore cleanup has caught up to the root. Skipping the forward chained \
                 merkle root consistency check"
            );
            return true;
        };
        let merkle_root = shred.merkle_root().ok();
        let chained_merkle_root = shred::layout::get_chained_merkle_root(&next_shred);
        if !check_chaining(merkle_root, chained_merkle_root) {
            warn!(
                "Received conflicting chained merkle roots for slot: {slot}, shred {:?} type {:?} \
                 has merkle root {merkle_root:?}, however next fec set shred {next_shred_id:?} \
                 chains to merkle root {chained_merkle_root:?}. Reporting as duplicate",
                shred.erasure_set(),
                shred.shred_type(),
            );
            if !self.has_duplicate_shreds_in_slot(slot) {
                if self
                    .store_duplicate_if_not_existing(
                        slot,
                        next_shred.clone(),
                        shred.payload().clone().into(),
                    )
                    .is_err()
                {
                    warn!("store duplicate error");
                }
                duplicate_shreds.push(PossibleDuplicateShred::ChainedMerkleRootConflict(
                    shred.clone(),
                    Payload::from(next_shred),
                ));
            }
            return false;
        }
        true
    }

    /// Returns true if there is no chaining conflict between
    /// the `shred` and the merkle root of the previous FEC set,
    /// or if shreds from the previous set are yet to be received.
    ///
    /// Otherwise return false and add duplicate proof to
    /// `duplicate_shreds`.
    ///
    /// This is intended to be used right after `shred`'s `merkle_root_meta`
    /// is created for the first time.
    fn check_backwards_chained_merkle_root_consistency(
        &self,
        shred: &Shred,
        just_inserted_shreds: &HashMap<ShredId, Shred>,
        erasure_metas: &BTreeMap<ErasureSetId, WorkingEntry<ErasureMeta>>,
        duplicate_shreds: &mut Vec<PossibleDuplicateShred>,
    ) -> bool {
        let slot = shred.slot();
        let erasure_set = shred.erasure_set();
        let fec_set_index = shred.fec_set_index();

        if fec_set_index == 0 {
            // There is no previous erasure set
            return true;
        }
        let Some((_, prev_erasure_meta)) = self
            .previous_erasure_set(erasure_set, erasure_metas)
            .expect("Expect database operations to succeed")
        else {
            // No shreds from the previous erasure batch have been received,
            // so nothing to check. Once the previous erasure batch is
            // received, we will verify this chain through the forward check.
            return true;
        };
        let Some(prev_shred_index) = prev_erasure_meta.first_received_coding_shred_index() else {
            return true;
        };
        let prev_shred_id = ShredId::new(slot, prev_shred_index, ShredType::Code);
        let Some(prev_shred) = self
            .get_shred_from_just_inserted_or_db(just_inserted_shreds, prev_shred_id)
            .map(Cow::into_owned)
        else {
            warn!(
                "Shred {prev_shred_id:?} indicated by the erasure meta {prev_erasure_meta:?} is \
                 missing from blockstore. This should only happen if blockstore cleanup has \
                 caught up to the root. Skipping the backwards chained merkle root consistency \
                 check"
            );
            return true;
        };
        let merkle_root = shred::layout::get_merkle_root(&prev_shred);
        let chained_merkle_root = shred.chained_merkle_root().ok();
        if !check_chaining(merkle_root, chained_merkle_root) {
            warn!(
                "Received conflicting chained merkle roots for slot: {slot}, shred {:?} type {:?} \
                 chains to merkle root {chained_merkle_root:?}, however previous fec set coding \
                 shred {prev_shred_id:?} has merkle root {merkle_root:?}. Reporting as duplicate",
                shred.erasure_set(),
                shred.shred_type(),
            );
            if !self.has_duplicate_shreds_in_slot(slot) {
                if self
                    .store_duplicate_if_not_existing(
                        slot,
                        prev_shred.clone(),
                        shred.payload().clone().into(),
                    )
                    .is_err()
                {
                    warn!("store duplicate error");
                }
                duplicate_shreds.push(PossibleDuplicateShred::ChainedMerkleRootConflict(
                    shred.clone(),
                    Payload::from(prev_shred),
                ));
            }
            return false;
        }
        true
    }

    /// Returns the previous consecutive erasure set for `erasure_set` in
    /// the same slot, i.e. the set whose index range ends exactly where
    /// `erasure_set` begins.
    fn previous_erasure_set(
        &self,
        erasure_set: ErasureSetId,
        erasure_metas: &BTreeMap<ErasureSetId, WorkingEntry<ErasureMeta>>,
    ) -> Result<Option<(ErasureSetId, ErasureMeta)>> {
        let (slot, fec_set_index) = erasure_set.store_key();

        // Check the previous entry from the in memory map to see if it is the
        // consecutive set to `erasure_set`
        let candidate = erasure_metas
            .range(ErasureSetId::new(slot, 0)..erasure_set)
            .next_back()
            .filter(|(_, candidate_erasure_meta)| {
                candidate_erasure_meta.as_ref().next_fec_set_index() == Some(fec_set_index)
            })
            .map(|(erasure_set, erasure_meta)| (*erasure_set, *erasure_meta.as_ref()));
        if candidate.is_some() {
            return Ok(candidate);
        }

        // Consecutive set was not found in memory, scan the column for a candidate
        let Some(((candidate_slot, candidate_fec_set_index), candidate_erasure_meta_bytes)) = self
            .erasure_meta_cf
            .iter(IteratorMode::From(
                (slot, u64::from(fec_set_index)),
                IteratorDirection::Reverse,
            ))?
            // Skip entries of the current erasure set itself
            .find(|((candidate_slot, candidate_fec_set_index), _)| {
                *candidate_slot != slot || *candidate_fec_set_index != u64::from(fec_set_index)
            })
        else {
            return Ok(None);
        };
        if candidate_slot != slot {
            return Ok(None);
        }
        let candidate_erasure_meta: ErasureMeta =
            bincode::deserialize(&candidate_erasure_meta_bytes)?;
        if candidate_erasure_meta.next_fec_set_index() != Some(fec_set_index) {
            return Ok(None);
        }
        Ok(Some((
            ErasureSetId::new(slot, u32::try_from(candidate_fec_set_index).unwrap()),
            candidate_erasure_meta,
        )))
    }

    fn insert_data_shred(
        &self,
        slot_meta: &mut SlotMeta,
        data_index: &mut ShredIndex,
        shred: &Shred,
        write_batch: &mut WriteBatch,
        _shred_source: ShredSource,
    ) -> Result<Vec<CompletedDataSetInfo>> {
        let slot = shred.slot();
        let index = u64::from(shred.index());

        let last_in_slot = if shred.last_in_slot() {
            debug!("got last in slot");
            true
        } else {
            false
        };

        let last_in_data = if shred.data_complete() {
            debug!("got last in data");
            true
        } else {
            false
        };

        // Parent for slot meta should have been set by this point
        assert!(!slot_meta.is_orphan());

        let new_consumed = if slot_meta.consumed == index {
            let mut current_index = index + 1;

            while data_index.contains(current_index) {
                current_index += 1;
            }
            current_index
        } else {
            slot_meta.consumed
        };

        // Commit step: commit all changes to the mutable structures at once, or none at all.
        // We don't want only a subset of these changes going through.
        self.data_shred_cf
            .put_bytes_in_batch(write_batch, (slot, index), shred.payload())?;
        data_index.insert(index);
        let newly_completed_data_sets = update_slot_meta(
            last_in_slot,
            last_in_data,
            slot_meta,
            index as u32,
            new_consumed,
            shred.reference_tick(),
            data_index,
        )
        .into_iter()
        .map(|(start_index, end_index)| CompletedDataSetInfo {
            slot,
            start_index,
            end_index,
        })
        .collect();

        trace!("inserted shred into slot {slot:?} and index {index:?}");

        Ok(newly_completed_data_sets)
    }

    fn try_shred_recovery(
        &self,
        leader_schedule_cache: &LeaderScheduleCache,
        reed_solomon_cache: &ReedSolomonCache,
        retransmit_sender: Option<&Sender<Vec<Payload>>>,
        is_trusted: bool,
        shred_insertion_tracker: &mut ShredInsertionTracker,
        metrics: &mut BlockstoreInsertionMetrics,
    ) {
        // Recovery rules:
        // 1. Only try recovery around indexes for which new data or coding shreds are received
        // 2. For new data shreds, check if an erasure set exists. If not, don't try recovery
        // 3. Before trying recovery, check if enough number of shreds have been received
        // 3a. Enough number of shreds = (#data + #coding shreds) > erasure.num_data
        let mut recovered_shreds = Vec::new();
        for (erasure_set, working_erasure_meta) in shred_insertion_tracker.erasure_metas.iter() {
            let erasure_meta = working_erasure_meta.as_ref();
            let slot = erasure_set.slot();
            let index_meta_entry = shred_insertion_tracker
                .index_working_set
                .get(&slot)
                .expect("Index");
            let index = &index_meta_entry.index;
            match erasure_meta.status(index) {
                ErasureMetaStatus::CanRecover => {
                    self.recover_shreds(
                        index,
                        erasure_meta,
                        &shred_insertion_tracker.just_inserted_shreds,
                        &mut recovered_shreds,
                        reed_solomon_cache,
                    );
                }
                ErasureMetaStatus::DataFull => (),
                ErasureMetaStatus::StillNeed(needed) => {
                    trace!("erasure set {erasure_set:?} still needs {needed} shreds");
                }
            };
        }

        metrics.num_recovered += recovered_shreds
            .iter()
            .filter(|shred| shred.is_data())
            .count();

        let mut retransmit_payloads = Vec::new();
        for shred in recovered_shreds {
            let Some(leader) = leader_schedule_cache.slot_leader_at(shred.slot()) else {
                continue;
            };
            if !shred.verify(&leader) {
                metrics.num_recovered_failed_sig += 1;
                continue;
            }
            // Since the data shreds are fully recovered from the erasure
            // batch, no need to store coding shreds in blockstore.
            if shred.is_code() {
                retransmit_payloads.push(shred.into_payload());
                continue;
            }
            match self.check_insert_data_shred(
                shred.clone(),
                shred_insertion_tracker,
                is_trusted,
                Some(leader_schedule_cache),
                ShredSource::Recovered,
            ) {
                Err(InsertDataShredError::Exists) => {
                    metrics.num_recovered_exists += 1;
                }
                Err(InsertDataShredError::InvalidShred) => {
                    metrics.num_recovered_failed_invalid += 1;
                }
                Err(InsertDataShredError::BlockstoreError(err)) => {
                    error!("blockstore error: {err}");
                }
                Ok(completed_data_sets) => {
                    shred_insertion_tracker
                        .newly_completed_data_sets
                        .extend(completed_data_sets);
                    metrics.num_recovered_inserted += 1;
                    retransmit_payloads.push(shred.into_payload());
                }
            }
        }

        if !retransmit_payloads.is_empty() {
            if let Some(retransmit_sender) = retransmit_sender {
                let _ = retransmit_sender.send(retransmit_payloads);
            }
        }
    }

    fn recover_shreds(
        &self,
        index: &Index,
        erasure_meta: &ErasureMeta,
        prev_inserted_shreds: &HashMap<ShredId, Shred>,
        recovered_shreds: &mut Vec<Shred>,
        reed_solomon_cache: &ReedSolomonCache,
    ) {
        // Find shreds for this erasure set and try recovery
        let slot = index.slot;
        let available_shreds: Vec<_> = self
            .get_recovery_data_shreds(index, slot, erasure_meta, prev_inserted_shreds)
            .chain(self.get_recovery_coding_shreds(index, slot, erasure_meta, prev_inserted_shreds))
            .collect();
        match shred::recover(available_shreds, reed_solomon_cache) {
            Ok(mut result) => {
                trace!(
                    "Recovered {} shreds for slot {slot} erasure set starting at {:?}",
                    result.len(),
                    erasure_meta.data_shreds_indices().next(),
                );
                recovered_shreds.append(&mut result);
            }
            Err(err) => {
                warn!("shred recovery error for slot {slot}: {err:?}");
            }
        }
    }

    fn get_recovery_data_shreds<'a>(
        &'a self,
        index: &'a Index,
        slot: Slot,
        erasure_meta: &'a ErasureMeta,
        prev_inserted_shreds: &'a HashMap<ShredId, Shred>,
    ) -> impl Iterator<Item = Shred> + 'a {
        erasure_meta.data_shreds_indices().filter_map(move |i| {
            let key = ShredId::new(slot, u32::try_from(i).unwrap(), ShredType::Data);
            if let Some(shred) = prev_inserted_shreds.get(&key) {
                return Some(shred.clone());
            }
            if !index.data().contains(i) {
                return None;
            }
            match self.data_shred_cf.get_bytes((slot, i)).unwrap() {
                None => {
                    warn!("Data shred deleted while reading for recovery");
                    None
                }
                Some(data) => Shred::new_from_serialized_shred(data).ok(),
            }
        })
    }

    fn get_recovery_coding_shreds<'a>(
        &'a self,
        index: &'a Index,
        slot: Slot,
        erasure_meta: &'a ErasureMeta,
        prev_inserted_shreds: &'a HashMap<ShredId, Shred>,
    ) -> impl Iterator<Item = Shred> + 'a {
        erasure_meta.coding_shreds_indices().filter_map(move |i| {
            let key = ShredId::new(slot, u32::try_from(i).unwrap(), ShredType::Code);
            if let Some(shred) = prev_inserted_shreds.get(&key) {
                return Some(shred.clone());
            }
            if !index.coding().contains(i) {
                return None;
            }
            match self.code_shred_cf.get_bytes((slot, i)).unwrap() {
                None => {
                    warn!("Code shred deleted while reading for recovery");
                    None
                }
                Some(code) => Shred::new_from_serialized_shred(code).ok(),
            }
        })
    }

    fn get_index_meta_entry<'a>(
        &self,
        slot: Slot,
        index_working_set: &'a mut HashMap<u64, IndexMetaWorkingSetEntry>,
        index_meta_time_us: &mut u64,
    ) -> &'a mut IndexMetaWorkingSetEntry {
        let start = Instant::now();
        let res = index_working_set.entry(slot).or_insert_with(|| {
            let newly_inserted_meta = self
                .index_cf
                .get(slot)
                .unwrap()
                .unwrap_or_else(|| Index::new(slot));
            IndexMetaWorkingSetEntry {
                index: newly_inserted_meta,
                did_insert_occur: false,
            }
        });
        *index_meta_time_us += start.elapsed().as_micros() as u64;
        res
    }

    /// Obtain the SlotMeta from the in-memory slot_meta_working_set or load
    /// it from the database if it does not exist in slot_meta_working_set.
    ///
    /// In case none of the above has the specified SlotMeta, a new one will
    /// be created.
    ///
    /// Note that this function will also update the parent slot of the
    /// specified slot if it was previously an orphan.
    fn get_slot_meta_entry<'a>(
        &self,
        slot_meta_working_set: &'a mut HashMap<u64, SlotMetaWorkingSetEntry>,
        slot: Slot,
        parent_slot: Slot,
    ) -> &'a mut SlotMetaWorkingSetEntry {
        // Check if we've already inserted the slot metadata for this shred's slot
        slot_meta_working_set.entry(slot).or_insert_with(|| {
            // Store a 2-tuple of the metadata (working copy, backup copy)
            if let Some(mut meta) = self
                .meta_cf
                .get(slot)
                .expect("Expect database get to succeed")
            {
                let backup = Some(meta.clone());
                // If parent_slot == None, then this is one of the orphans inserted
                // during the chaining process, see the function find_slot_meta_in_cached_state()
                // for details. Slots that are orphans are missing a parent_slot, so we should
                // fill in the parent now that we know it.
                if meta.is_orphan() {
                    meta.parent_slot = Some(parent_slot);
                }

                SlotMetaWorkingSetEntry::new(Rc::new(RefCell::new(meta)), backup)
            } else {
                SlotMetaWorkingSetEntry::new(
                    Rc::new(RefCell::new(SlotMeta::new(slot, Some(parent_slot)))),
                    None,
                )
            }
        })
    }

    /// For each slot in the slot_meta_working_set which has any change, include
    /// corresponding updates to cf::SlotMeta via the specified `write_batch`.
    /// The `write_batch` will later be atomically committed to the blockstore.
    ///
    /// On success, the function returns an Ok result with <should_signal,
    /// newly_completed_slots> pair where:
    ///  - `should_signal`: a boolean flag indicating whether to send signal.
    ///  - `newly_completed_slots`: a subset of slot_meta_working_set which are
    ///    newly completed.
    fn commit_slot_meta_working_set(
        &self,
        slot_meta_working_set: &HashMap<u64, SlotMetaWorkingSetEntry>,
        write_batch: &mut WriteBatch,
    ) -> Result<(bool, Vec<u64>)> {
        let mut should_signal = false;
        let mut newly_completed_slots = vec![];
        let completed_slots_senders = self.completed_slots_senders.lock().unwrap();

        // Check if any metadata was changed, if so, insert the new version of the
        // metadata into the write batch
        for (slot, slot_meta_entry) in slot_meta_working_set.iter() {
            // Any slot that wasn't written to should have been filtered out by now.
            assert!(slot_meta_entry.did_insert_occur);
            let meta: &SlotMeta = &RefCell::borrow(&*slot_meta_entry.new_slot_meta);
            let meta_backup = &slot_meta_entry.old_slot_meta;
            if !completed_slots_senders.is_empty() && is_newly_completed_slot(meta, meta_backup) {
                newly_completed_slots.push(*slot);
            }
            // Check if the working copy of the metadata has changed
            if Some(meta) != meta_backup.as_ref() {
                should_signal = should_signal || slot_has_updates(meta, meta_backup);
                self.meta_cf.put_in_batch(write_batch, *slot, meta)?;
            }
        }

        Ok((should_signal, newly_completed_slots))
    }

    /// For each entry in `working_set` whose `did_insert_occur` is true, this
    /// function handles its chaining effect by updating the SlotMeta of both
    /// the slot and its parent slot to reflect the slot descends from the
    /// parent slot.  In addition, when a slot is newly connected, it also
    /// checks whether any of its direct and indirect children slots are connected
    /// or not.
    ///
    /// This function may update column families [`cf::SlotMeta`] and
    /// [`cf::Orphans`].
    fn handle_chaining(
        &self,
        write_batch: &mut WriteBatch,
        working_set: &mut HashMap<u64, SlotMetaWorkingSetEntry>,
    ) -> Result<()> {
        // Handle chaining for all the SlotMetas that were inserted into
        working_set.retain(|_, entry| entry.did_insert_occur);
        let mut new_chained_slots = HashMap::new();
        let working_set_slots: Vec<_> = working_set.keys().copied().collect();
        for slot in working_set_slots {
            self.handle_chaining_for_slot(write_batch, working_set, &mut new_chained_slots, slot)?;
        }

        // Write all the newly changed slots in new_chained_slots to the write_batch
        for (slot, meta) in new_chained_slots.iter() {
            let meta: &SlotMeta = &RefCell::borrow(meta);
            self.meta_cf.put_in_batch(write_batch, *slot, meta)?;
        }
        Ok(())
    }

    /// A helper function of handle_chaining which handles the chaining based
    /// on the `SlotMetaWorkingSetEntry` of the specified `slot`.  Specifically,
    /// it handles the following two things:
    ///
    /// 1. based on the `SlotMetaWorkingSetEntry` for `slot`, check if `slot`
    ///    did not previously have a parent slot but does now.  If `slot` satisfies
    ///    this condition, update the Orphan property of both `slot` and its parent
    ///    slot based on their current orphan status.
    ///
    /// 2. if the `SlotMetaWorkingSetEntry` for `slot` indicates this slot
    ///    is newly connected to a parent slot, then this function will update
    ///    the is_connected property of all its direct and indirect children slots.
    fn handle_chaining_for_slot(
        &self,
        write_batch: &mut WriteBatch,
        working_set: &HashMap<u64, SlotMetaWorkingSetEntry>,
        new_chained_slots: &mut HashMap<u64, Rc<RefCell<SlotMeta>>>,
        slot: Slot,
    ) -> Result<()> {
        let slot_meta_entry = working_set
            .get(&slot)
            .expect("Slot must exist in the working_set hashmap");

        let meta = &slot_meta_entry.new_slot_meta;
        let meta_backup = &slot_meta_entry.old_slot_meta;
        {
            let mut meta_mut = meta.borrow_mut();
            let was_orphan_slot =
                meta_backup.is_some() && meta_backup.as_ref().unwrap().is_orphan();

            // If:
            // 1) This is a new slot
            // 2) slot != 0
            // then try to chain this slot to a previous slot
            if slot != 0 && meta_mut.parent_slot.is_some() {
                let prev_slot = meta_mut.parent_slot.unwrap();

                // Check if the slot represented by meta_mut is either a new slot or a orphan.
                // In both cases we need to run the chaining logic b/c the parent on the slot was
                // previously unknown.
                if meta_backup.is_none() || was_orphan_slot {
                    let prev_slot_meta =
                        self.find_slot_meta_else_create(working_set, new_chained_slots, prev_slot)?;

                    // This is a newly inserted slot/orphan so run the chaining logic to link it to a
                    // newly discovered parent
                    chain_new_slot_to_prev_slot(
                        &mut prev_slot_meta.borrow_mut(),
                        slot,
                        &mut meta_mut,
                    );

                    // If the parent of `slot` is a newly inserted orphan, insert it into the orphans
                    // column family
                    if RefCell::borrow(&*prev_slot_meta).is_orphan() {
                        self.orphans_cf.put_in_batch(write_batch, prev_slot, &true)?;
                    }
                }
            }

            // At this point this slot has received a parent, so it's no longer an orphan
            if was_orphan_slot {
                self.orphans_cf.delete_in_batch(write_batch, slot)?;
            }
        }

        // If this is a newly completed slot and the parent is connected, then the
        // slot is now connected. Mark the slot as connected, and then traverse the
        // children to update their parent_connected and connected status.
        let should_propagate_is_connected =
            is_newly_completed_slot(&RefCell::borrow(meta), meta_backup)
                && RefCell::borrow(meta).is_parent_connected();

        if should_propagate_is_connected {
            meta.borrow_mut().set_connected();
            self.traverse_children_mut(
                meta,
                working_set,
                new_chained_slots,
                SlotMeta::set_parent_connected,
            )?;
        }

        Ok(())
    }

    /// Traverse all the children (direct and indirect) of `slot_meta`, and apply
    /// `slot_function` to each of the children (but not `slot_meta`).
    fn traverse_children_mut<F>(
        &self,
        slot_meta: &Rc<RefCell<SlotMeta>>,
        working_set: &HashMap<u64, SlotMetaWorkingSetEntry>,
        passed_visited_slots: &mut HashMap<u64, Rc<RefCell<SlotMeta>>>,
        slot_function: F,
    ) -> Result<()>
    where
        F: Fn(&mut SlotMeta) -> bool,
    {
        let slot_meta = slot_meta.borrow();
        let mut next_slots: VecDeque<u64> = slot_meta.next_slots.to_vec().into();
        while !next_slots.is_empty() {
            let slot = next_slots.pop_front().unwrap();
            let meta_ref =
                self.find_slot_meta_else_create(working_set, passed_visited_slots, slot)?;
            let mut meta = meta_ref.borrow_mut();
            if slot_function(&mut meta) {
                meta.next_slots
                    .iter()
                    .for_each(|slot| next_slots.push_back(*slot));
            }
        }
        Ok(())
    }

    /// Returns the `SlotMeta` with the specified `slot_index`.  The resulting
    /// `SlotMeta` could be either from the cache or from the DB.  Specifically,
    /// the function:
    ///
    /// 1) Finds the slot metadata in the cache of dirty slot metadata we've
    ///    previously touched, otherwise:
    /// 2) Searches the database for that slot metadata. If still no luck, then:
    /// 3) Create a dummy orphan slot in the database.
    fn find_slot_meta_else_create(
        &self,
        working_set: &HashMap<u64, SlotMetaWorkingSetEntry>,
        chained_slots: &mut HashMap<u64, Rc<RefCell<SlotMeta>>>,
        slot_index: u64,
    ) -> Result<Rc<RefCell<SlotMeta>>> {
        let result = find_slot_meta_in_cached_state(working_set, chained_slots, slot_index);
        if let Some(slot) = result {
            Ok(slot)
        } else {
            self.find_slot_meta_in_db_else_create(slot_index, chained_slots)
        }
    }

    /// A helper function to [`Self::find_slot_meta_else_create`] that searches
    /// the `SlotMeta` based on the specified `slot` in the database and
    /// updates `insert_map`.
    ///
    /// If the database does not contain a matched entry, then it will create
    /// a dummy orphan slot in the database.
    fn find_slot_meta_in_db_else_create(
        &self,
        slot: Slot,
        insert_map: &mut HashMap<u64, Rc<RefCell<SlotMeta>>>,
    ) -> Result<Rc<RefCell<SlotMeta>>> {
        if let Some(slot_meta) = self.meta_cf.get(slot)? {
            insert_map.insert(slot, Rc::new(RefCell::new(slot_meta)));
        } else {
            // If this slot doesn't exist, make a orphan slot. This way we
            // remember which slots chained to this one when we eventually get a real shred
            // for this slot
            insert_map.insert(slot, Rc::new(RefCell::new(SlotMeta::new_orphan(slot))));
        }
        Ok(insert_map.get(&slot).unwrap().clone())
    }

    /// Mark a root `slot` as connected, traverse `slot`'s children and update
    /// the children's connected status if appropriate.
    ///
    /// A ledger with a full path of blocks from genesis to the latest root will
    /// have all of the rooted blocks marked as connected such that new blocks
    /// could also be connected. However, starting from some root (such as from
    /// a snapshot) is a valid way to join a cluster. For this case, mark this
    /// root as connected such that the node that joined midway through can
    /// have their slots considered connected.
    pub fn set_and_chain_connected_on_root_and_next_slots(&self, root: Slot) -> Result<()> {
        let mut root_meta = self
            .meta(root)?
            .unwrap_or_else(|| SlotMeta::new(root, None));
        // If the slot was already connected, there is nothing to do as this slot's
        // children are also assumed to be appropriately connected
        if root_meta.is_connected() {
            return Ok(());
        }
        info!("Marking slot {root} and any full children slots as connected");
        let mut write_batch = self.db.batch();

        // Mark both connected bits on the root slot so that the flags for this
        // slot match the flags of slots that become connected the typical way.
        root_meta.set_parent_connected();
        root_meta.set_connected();
        self.meta_cf
            .put_in_batch(&mut write_batch, root_meta.slot, &root_meta)?;

        let mut next_slots = VecDeque::from(root_meta.next_slots);
        while !next_slots.is_empty() {
            let slot = next_slots.pop_front().unwrap();
            let mut meta = self.meta(slot)?.unwrap_or_else(|| {
                panic!("Slot {slot} is a child but has no SlotMeta in blockstore")
            });

            if meta.set_parent_connected() {
                next_slots.extend(meta.next_slots.iter());
            }
            self.meta_cf.put_in_batch(&mut write_batch, meta.slot, &meta)?;
        }

        self.db.write(write_batch)?;
        Ok(())
    }

    /// Delete a slot's shreds and per-slot metadata, and clear the slot's
    /// `SlotMeta` except for the `next_slots` field, so that the slot can be
    /// replaced once the correct version of it is repaired.
    ///
    /// This function currently requires `insert_shreds_lock`, as it performs
    /// read-modify-write operations on the same column families as the
    /// inserter.
    pub fn clear_unconfirmed_slot(&self, slot: Slot) {
        let _lock = self.insert_shreds_lock.lock().unwrap();
        if let Some(mut slot_meta) = self
            .meta(slot)
            .expect("Couldn't fetch from SlotMeta column family")
        {
            // Clear all slot related information
            self.purge_slot_contents(slot)
                .expect("Purge database operations failed");

            // Clear this slot as a next slot from parent
            if let Some(parent_slot) = slot_meta.parent_slot {
                let mut parent_slot_meta = self
                    .meta(parent_slot)
                    .expect("Couldn't fetch from SlotMeta column family")
                    .expect("Unconfirmed slot should have had parent slot set");
                // .retain() is a linear scan; however, next_slots should
                // only contain several elements so this isn't so bad
                parent_slot_meta
                    .next_slots
                    .retain(|&next_slot| next_slot != slot);
                self.meta_cf
                    .put(parent_slot, &parent_slot_meta)
                    .expect("Couldn't insert into SlotMeta column family");
            }
            // Reinsert parts of `slot_meta` that are important to retain, like the `next_slots`
            // field.
            slot_meta.clear_unconfirmed_slot();
            self.meta_cf
                .put(slot, &slot_meta)
                .expect("Couldn't insert into SlotMeta column family");
        } else {
            error!("clear_unconfirmed_slot() called on slot {slot} with no SlotMeta");
        }
    }

    // Deletes the slot's shreds, index, erasure metas, merkle root metas,
    // and dead/orphan markers in one atomic batch.
    fn purge_slot_contents(&self, slot: Slot) -> Result<()> {
        let mut write_batch = self.db.batch();
        if let Some(index) = self.get_index(slot)? {
            for ix in index.data().range(..) {
                self.data_shred_cf
                    .delete_in_batch(&mut write_batch, (slot, *ix))?;
            }
            for ix in index.coding().range(..) {
                self.code_shred_cf
                    .delete_in_batch(&mut write_batch, (slot, *ix))?;
            }
        }
        for (key, _) in self
            .erasure_meta_cf
            .iter(IteratorMode::From((slot, 0), IteratorDirection::Forward))?
            .take_while(|((meta_slot, _), _)| *meta_slot == slot)
        {
            self.erasure_meta_cf.delete_in_batch(&mut write_batch, key)?;
        }
        for (key, _) in self
            .merkle_root_meta_cf
            .iter(IteratorMode::From((slot, 0), IteratorDirection::Forward))?
            .take_while(|((meta_slot, _), _)| *meta_slot == slot)
        {
            self.merkle_root_meta_cf
                .delete_in_batch(&mut write_batch, key)?;
        }
        self.index_cf.delete_in_batch(&mut write_batch, slot)?;
        self.dead_slots_cf.delete_in_batch(&mut write_batch, slot)?;
        self.orphans_cf.delete_in_batch(&mut write_batch, slot)?;
        self.db.write(write_batch)
    }
}

// Legacy shreds do not carry merkle roots and cannot conflict on chaining.
fn check_chaining(merkle_root: Option<Hash>, chained_merkle_root: Option<Hash>) -> bool {
    chained_merkle_root.is_none() || chained_merkle_root == merkle_root
}

// Update the `completed_data_indexes` with a new shred `new_shred_index`. If a
// data set is complete, return the range of shred indexes [start_index, end_index]
// for that completed data set.
fn update_completed_data_indexes(
    is_last_in_data: bool,
    new_shred_index: u32,
    received_data_shreds: &ShredIndex,
    // Shreds indices which are marked data complete.
    completed_data_indexes: &mut BTreeSet<u32>,
) -> Vec<(u32, u32)> {
    let start_shred_index = completed_data_indexes
        .range(..new_shred_index)
        .next_back()
        .map(|index| index + 1)
        .unwrap_or_default();
    // Consecutive entries i, k, j in this vector represent potential ranges [i, k),
    // [k, j) that could be completed data ranges
    let mut shred_indices = vec![start_shred_index];
    // `new_shred_index` is data complete, so need to insert here into the
    // `completed_data_indexes`
    if is_last_in_data {
        completed_data_indexes.insert(new_shred_index);
        shred_indices.push(new_shred_index + 1);
    }
    if let Some(index) = completed_data_indexes.range(new_shred_index + 1..).next() {
        shred_indices.push(index + 1);
    }
    shred_indices
        .windows(2)
        .filter(|ix| {
            let (begin, end) = (ix[0] as u64, ix[1] as u64);
            let num_shreds = (end - begin) as usize;
            received_data_shreds.range(begin..end).count() == num_shreds
        })
        .map(|ix| (ix[0], ix[1] - 1))
        .collect()
}

fn update_slot_meta(
    is_last_in_slot: bool,
    is_last_in_data: bool,
    slot_meta: &mut SlotMeta,
    index: u32,
    new_consumed: u64,
    reference_tick: u8,
    received_data_shreds: &ShredIndex,
) -> Vec<(u32, u32)> {
    let first_insert = slot_meta.received == 0;
    // Index is zero-indexed, while the "received" height starts from 1,
    // so received = index + 1 for the same shred.
    slot_meta.received = cmp::max(u64::from(index) + 1, slot_meta.received);
    if first_insert {
        // predict the timestamp of what would have been the first shred in this slot
        let slot_time_elapsed = u64::from(reference_tick) * 1000 / DEFAULT_TICKS_PER_SECOND;
        slot_meta.first_shred_timestamp = timestamp() - slot_time_elapsed;
    }
    slot_meta.consumed = new_consumed;
    // The consumed index can never overrun the received height.
    debug_assert!(slot_meta.consumed <= slot_meta.received);
    // If the last index in the slot hasn't been set before, then
    // set it to this shred index
    if is_last_in_slot && slot_meta.last_index.is_none() {
        slot_meta.last_index = Some(u64::from(index));
    }
    update_completed_data_indexes(
        is_last_in_slot || is_last_in_data,
        index,
        received_data_shreds,
        &mut slot_meta.completed_data_indexes,
    )
}

/// Returns the `SlotMeta` of the specified `slot` from the two cached states:
/// `working_set` and `chained_slots`.  If both contain the `SlotMeta`, then
/// the latest one from the `working_set` will be returned.
fn find_slot_meta_in_cached_state(
    working_set: &HashMap<u64, SlotMetaWorkingSetEntry>,
    chained_slots: &HashMap<u64, Rc<RefCell<SlotMeta>>>,
    slot: Slot,
) -> Option<Rc<RefCell<SlotMeta>>> {
    if let Some(entry) = working_set.get(&slot) {
        Some(entry.new_slot_meta.clone())
    } else {
        chained_slots.get(&slot).cloned()
    }
}

// 1) Chain current_slot to the previous slot defined by prev_slot_meta
fn chain_new_slot_to_prev_slot(
    prev_slot_meta: &mut SlotMeta,
    current_slot: Slot,
    current_slot_meta: &mut SlotMeta,
) {
    if !prev_slot_meta.next_slots.contains(&current_slot) {
        prev_slot_meta.next_slots.push(current_slot);
    }
    if prev_slot_meta.is_connected() {
        current_slot_meta.set_parent_connected();
    }
}

fn is_newly_completed_slot(slot_meta: &SlotMeta, backup_slot_meta: &Option<SlotMeta>) -> bool {
    slot_meta.is_full()
        && (backup_slot_meta.is_none()
            || slot_meta.consumed != backup_slot_meta.as_ref().unwrap().consumed)
}

/// Returns a boolean indicating whether a slot has received additional shreds
/// that can be replayed since the previous update to the slot's SlotMeta.
fn slot_has_updates(slot_meta: &SlotMeta, slot_meta_backup: &Option<SlotMeta>) -> bool {
    // First, this slot's parent must be connected in order to even consider
    // starting replay; otherwise, the replayed results may not be valid.
    slot_meta.is_parent_connected() &&
        // Then,
        // If the slot didn't exist in the db before, any consecutive shreds
        // at the start of the slot are ready to be replayed.
        ((slot_meta_backup.is_none() && slot_meta.consumed != 0) ||
        // Or,
        // If the slot has more consecutive shreds than it last did from the
        // last update, those shreds are new and also ready to be replayed.
        (slot_meta_backup.is_some() && slot_meta_backup.as_ref().unwrap().consumed != slot_meta.consumed))
}

fn send_signals(
    new_shreds_signals: &[Sender<bool>],
    completed_slots_senders: &[CompletedSlotsSender],
    should_signal: bool,
    newly_completed_slots: Vec<u64>,
) {
    if should_signal {
        for signal in new_shreds_signals {
            match signal.try_send(true) {
                Ok(_) => {}
                Err(TrySendError::Full(_)) => {
                    trace!("replay wake up signal channel is full.")
                }
                Err(TrySendError::Disconnected(_)) => {
                    trace!("replay wake up signal channel is disconnected.")
                }
            }
        }
    }

    if !completed_slots_senders.is_empty() && !newly_completed_slots.is_empty() {
        let mut slots: Vec<_> = (0..completed_slots_senders.len() - 1)
            .map(|_| newly_completed_slots.clone())
            .collect();

        slots.push(newly_completed_slots);

        for (signal, slots) in completed_slots_senders.iter().zip(slots.into_iter()) {
            let res = signal.try_send(slots);
            if let Err(TrySendError::Full(_)) = res {
                error!("Unable to send newly completed slot because channel is full");
            }
        }
    }
}

#[cfg(test)]
pub mod tests {
    use {
        super::*,
        crate::shred::{
            ProcessShredsStats, ShredData, ShredFlags, Shredder, SIZE_OF_PAYLOAD,
        },
        crate::shredder::ReedSolomonCache,
        assert_matches::assert_matches,
        proptest::prelude::*,
        rand::{rngs::StdRng, seq::SliceRandom, SeedableRng},
        tempfile::TempDir,
        trellis_sdk::signature::Keypair,
    };

    fn get_tmp_ledger_path_auto_delete() -> TempDir {
        tempfile::Builder::new()
            .prefix("ledger")
            .tempdir()
            .unwrap()
    }

    // Deterministic payload so that identical shreds can be regenerated
    // across blockstores within one test.
    fn make_slot_shreds(
        keypair: &Keypair,
        slot: Slot,
        parent_slot: Slot,
        num_data_shreds: usize,
        is_full: bool,
    ) -> Vec<Shred> {
        let shredder = Shredder::new(slot, parent_slot, 0, 0).unwrap();
        let capacity = shred::data_shred_capacity(Some(false));
        let data: Vec<u8> = (0..capacity * num_data_shreds)
            .map(|i| (i % 251) as u8)
            .collect();
        shredder
            .make_shreds_from_data(
                keypair,
                &data,
                is_full,
                None, // chained_merkle_root
                0,    // next_shred_index
                &ReedSolomonCache::default(),
                &mut ProcessShredsStats::default(),
            )
            .unwrap()
    }

    fn new_legacy_data_shred(slot: Slot, index: u32, parent_offset: u16, flags: ShredFlags) -> Shred {
        Shred::from(ShredData::new_from_data(
            slot,
            index,
            parent_offset,
            &[9; 16],
            flags,
            0, // reference_tick
            0, // version
            0, // fec_set_index
        ))
    }

    fn insert_for_results(blockstore: &Blockstore, shreds: Vec<Shred>) -> InsertResults {
        let num_shreds = shreds.len();
        blockstore
            .do_insert_shreds(
                shreds,
                vec![false; num_shreds],
                None,  // leader_schedule
                false, // is_trusted
                None,  // retransmit-sender
                &ReedSolomonCache::default(),
                &mut BlockstoreInsertionMetrics::default(),
            )
            .unwrap()
    }

    #[test]
    fn test_insert_single_data_shred() {
        let ledger_path = get_tmp_ledger_path_auto_delete();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        let shred = new_legacy_data_shred(1, 0, 1, ShredFlags::empty());
        let insert_results = insert_for_results(&blockstore, vec![shred.clone()]);
        assert!(insert_results.completed_data_set_infos.is_empty());
        assert!(insert_results.duplicate_shreds.is_empty());

        assert_eq!(
            blockstore.get_data_shred(1, 0).unwrap().unwrap().as_slice(),
            shred.payload().as_ref()
        );
        let index = blockstore.get_index(1).unwrap().unwrap();
        assert!(index.data().contains(0));
        assert_eq!(index.data().num_shreds(), 1);
        assert_eq!(index.coding().num_shreds(), 0);

        let meta = blockstore.meta(1).unwrap().unwrap();
        assert_eq!(meta.parent_slot, Some(0));
        assert_eq!(meta.received, 1);
        assert_eq!(meta.consumed, 1);
        assert_eq!(meta.last_index, None);
        assert!(!meta.is_orphan());
        assert!(!meta.is_full());
    }

    #[test]
    fn test_insert_data_shred_twice_reports_exists() {
        let ledger_path = get_tmp_ledger_path_auto_delete();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        let shred = new_legacy_data_shred(1, 0, 1, ShredFlags::empty());
        let insert_results = insert_for_results(&blockstore, vec![shred.clone()]);
        assert!(insert_results.duplicate_shreds.is_empty());
        let meta = blockstore.meta(1).unwrap().unwrap();

        // Inserting the same shred again stores nothing new and reports
        // exactly one duplicate.
        let insert_results = insert_for_results(&blockstore, vec![shred.clone()]);
        assert_eq!(
            insert_results.duplicate_shreds,
            vec![PossibleDuplicateShred::Exists(shred.clone())]
        );
        assert!(insert_results.completed_data_set_infos.is_empty());
        assert_eq!(blockstore.meta(1).unwrap().unwrap(), meta);
        assert_eq!(
            blockstore.get_data_shred(1, 0).unwrap().unwrap().as_slice(),
            shred.payload().as_ref()
        );

        // Same id with the same payload is not an equivocation; a different
        // payload at the same id is.
        assert_eq!(blockstore.is_shred_duplicate(&shred), None);
        let conflicting = Shred::from(ShredData::new_from_data(
            1,
            0,
            1,
            &[7; 20],
            ShredFlags::empty(),
            0,
            0,
            0,
        ));
        assert_eq!(
            blockstore.is_shred_duplicate(&conflicting).as_deref(),
            Some(shred.payload().as_ref())
        );
    }

    #[test]
    fn test_completed_data_ranges() {
        let ledger_path = get_tmp_ledger_path_auto_delete();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();
        let keypair = Keypair::new();

        let shreds = make_slot_shreds(&keypair, 2, 1, 4, /*is_full:*/ true);
        let data_shreds: Vec<_> = shreds.iter().filter(|s| s.is_data()).cloned().collect();
        assert_eq!(data_shreds.len(), 4);

        // Insert all but the data-complete shred; no range closes.
        let insert_results =
            insert_for_results(&blockstore, data_shreds[..3].to_vec());
        assert!(insert_results.completed_data_set_infos.is_empty());

        // The final shred closes the whole range.
        let insert_results =
            insert_for_results(&blockstore, data_shreds[3..].to_vec());
        assert_eq!(
            insert_results.completed_data_set_infos,
            vec![CompletedDataSetInfo {
                slot: 2,
                start_index: 0,
                end_index: 3,
            }]
        );

        let meta = blockstore.meta(2).unwrap().unwrap();
        assert_eq!(meta.last_index, Some(3));
        assert_eq!(meta.consumed, 4);
        assert!(meta.is_full());
        assert!(blockstore.is_full(2));
        assert!(!blockstore.is_dead(2));
    }

    #[test]
    fn test_handle_chaining_basic() {
        let ledger_path = get_tmp_ledger_path_auto_delete();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();
        let keypair = Keypair::new();

        let slot_0_shreds = make_slot_shreds(&keypair, 0, 0, 2, true);
        let slot_1_shreds = make_slot_shreds(&keypair, 1, 0, 2, true);
        let slot_2_shreds = make_slot_shreds(&keypair, 2, 1, 2, true);

        // Insert slot 1.
        blockstore.insert_shreds(slot_1_shreds, None, false).unwrap();
        let meta_1 = blockstore.meta(1).unwrap().unwrap();
        assert!(meta_1.next_slots.is_empty());
        assert!(!meta_1.is_connected());
        assert_eq!(meta_1.parent_slot, Some(0));
        // Slot 0 was created as an orphan placeholder chaining to slot 1.
        let meta_0 = blockstore.meta(0).unwrap().unwrap();
        assert!(meta_0.is_orphan());
        assert_eq!(meta_0.next_slots, vec![1]);
        assert_eq!(blockstore.orphan(0).unwrap(), Some(true));

        // Insert slot 2.
        blockstore.insert_shreds(slot_2_shreds, None, false).unwrap();
        let meta_1 = blockstore.meta(1).unwrap().unwrap();
        assert_eq!(meta_1.next_slots, vec![2]);
        assert!(!meta_1.is_connected());
        let meta_2 = blockstore.meta(2).unwrap().unwrap();
        assert!(meta_2.next_slots.is_empty());
        assert!(!meta_2.is_connected());

        // Insert slot 0; connectivity propagates down the chain.
        blockstore.insert_shreds(slot_0_shreds, None, false).unwrap();
        let meta_0 = blockstore.meta(0).unwrap().unwrap();
        assert_eq!(meta_0.next_slots, vec![1]);
        assert!(!meta_0.is_orphan());
        assert!(meta_0.is_connected());
        let meta_1 = blockstore.meta(1).unwrap().unwrap();
        assert_eq!(meta_1.next_slots, vec![2]);
        assert!(meta_1.is_connected());
        let meta_2 = blockstore.meta(2).unwrap().unwrap();
        assert!(meta_2.next_slots.is_empty());
        assert!(meta_2.is_connected());
        assert_eq!(blockstore.orphan(0).unwrap(), None);
    }

    #[test]
    fn test_orphans() {
        let ledger_path = get_tmp_ledger_path_auto_delete();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();
        let keypair = Keypair::new();

        // Slot 2 arrives first; its unknown parent 1 becomes an orphan.
        blockstore
            .insert_shreds(make_slot_shreds(&keypair, 2, 1, 1, true), None, false)
            .unwrap();
        assert_eq!(blockstore.orphan(1).unwrap(), Some(true));
        assert!(blockstore.meta(1).unwrap().unwrap().is_orphan());

        // Slot 1 arrives; slot 1 is adopted, its unknown parent 0 becomes
        // the orphan.
        blockstore
            .insert_shreds(make_slot_shreds(&keypair, 1, 0, 1, true), None, false)
            .unwrap();
        assert_eq!(blockstore.orphan(1).unwrap(), None);
        assert_eq!(blockstore.orphan(0).unwrap(), Some(true));

        // Slot 0 arrives; no orphans remain.
        blockstore
            .insert_shreds(make_slot_shreds(&keypair, 0, 0, 1, true), None, false)
            .unwrap();
        assert_eq!(blockstore.orphan(0).unwrap(), None);
        assert!(blockstore.meta(0).unwrap().unwrap().is_connected());
    }

    #[test]
    fn test_merkle_root_conflict() {
        let ledger_path = get_tmp_ledger_path_auto_delete();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();
        let keypair = Keypair::new();
        let shredder = Shredder::new(2, 1, 0, 0).unwrap();
        let capacity = shred::data_shred_capacity(Some(false));
        let reed_solomon_cache = ReedSolomonCache::default();

        // Two competing versions of the same erasure set from the same leader.
        let batch_a = shredder
            .make_shreds_from_data(
                &keypair,
                &vec![1u8; 2 * capacity],
                false,
                None,
                0,
                &reed_solomon_cache,
                &mut ProcessShredsStats::default(),
            )
            .unwrap();
        let batch_b = shredder
            .make_shreds_from_data(
                &keypair,
                &vec![2u8; 2 * capacity],
                false,
                None,
                0,
                &reed_solomon_cache,
                &mut ProcessShredsStats::default(),
            )
            .unwrap();
        let c1 = batch_a
            .iter()
            .find(|s| s.is_code() && s.index() == 0)
            .cloned()
            .unwrap();
        let c2 = batch_b
            .iter()
            .find(|s| s.is_code() && s.index() == 1)
            .cloned()
            .unwrap();
        assert_ne!(c1.merkle_root().unwrap(), c2.merkle_root().unwrap());

        let insert_results = insert_for_results(&blockstore, vec![c1.clone()]);
        assert!(insert_results.duplicate_shreds.is_empty());
        let erasure_set = c1.erasure_set();
        let merkle_root_meta = blockstore.merkle_root_meta(erasure_set).unwrap().unwrap();
        assert_eq!(merkle_root_meta.merkle_root(), Some(c1.merkle_root().unwrap()));
        assert_eq!(merkle_root_meta.first_received_shred_index(), 0);
        assert_eq!(merkle_root_meta.first_received_shred_type(), ShredType::Code);

        // The conflicting shred is rejected, reported, and proven.
        let insert_results = insert_for_results(&blockstore, vec![c2.clone()]);
        assert_eq!(insert_results.duplicate_shreds.len(), 1);
        match &insert_results.duplicate_shreds[0] {
            PossibleDuplicateShred::MerkleRootConflict(original, conflict) => {
                assert_eq!(original, &c2);
                assert_eq!(conflict.as_ref(), c1.payload().as_ref());
            }
            other => panic!("unexpected duplicate: {other:?}"),
        }
        assert!(blockstore.get_coding_shred(2, 1).unwrap().is_none());
        assert!(blockstore.has_duplicate_shreds_in_slot(2));
        // The recorded merkle root is unchanged.
        assert_eq!(
            blockstore
                .merkle_root_meta(erasure_set)
                .unwrap()
                .unwrap()
                .merkle_root(),
            Some(c1.merkle_root().unwrap())
        );
    }

    #[test]
    fn test_erasure_config_conflict() {
        let ledger_path = get_tmp_ledger_path_auto_delete();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();
        let parity = vec![3u8; SIZE_OF_PAYLOAD];

        // Legacy coding shreds carry no merkle roots, so the conflict is
        // caught by the erasure config check.
        let ca = Shred::from(crate::shred::ShredCode::new_from_parity_shard(
            1, 0, &parity, 0, 2, 2, 0, 0,
        ));
        let cb = Shred::from(crate::shred::ShredCode::new_from_parity_shard(
            1, 1, &parity, 0, 4, 4, 1, 0,
        ));

        let insert_results = insert_for_results(&blockstore, vec![ca.clone()]);
        assert!(insert_results.duplicate_shreds.is_empty());

        let insert_results = insert_for_results(&blockstore, vec![cb.clone()]);
        assert_eq!(insert_results.duplicate_shreds.len(), 1);
        match &insert_results.duplicate_shreds[0] {
            PossibleDuplicateShred::ErasureConflict(original, conflict) => {
                assert_eq!(original, &cb);
                assert_eq!(conflict.as_ref(), ca.payload().as_ref());
            }
            other => panic!("unexpected duplicate: {other:?}"),
        }
        assert!(blockstore.get_coding_shred(1, 1).unwrap().is_none());
        // The equivocation proof landed in the duplicate slots column.
        assert!(blockstore.has_duplicate_shreds_in_slot(1));
        let proof = blockstore.get_duplicate_slot(1).unwrap();
        assert_eq!(proof.shred1.as_ref(), ca.payload().as_ref());
        assert_eq!(proof.shred2.as_ref(), cb.payload().as_ref());
        // The stored erasure config is the first arrival's.
        assert_eq!(
            blockstore.erasure_meta(ca.erasure_set()).unwrap().unwrap(),
            ErasureMeta::from_coding_shred(&ca).unwrap()
        );
    }

    #[test]
    fn test_recovery() {
        let ledger_path = get_tmp_ledger_path_auto_delete();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();
        let keypair = Keypair::new();
        let leader_schedule = LeaderScheduleCache::new_fixed(keypair.pubkey());
        let reed_solomon_cache = ReedSolomonCache::default();

        let shreds = make_slot_shreds(&keypair, 3, 2, 34, true);
        let (data_shreds, coding_shreds): (Vec<_>, Vec<_>) =
            shreds.into_iter().partition(|s| s.is_data());
        assert_eq!(data_shreds.len(), 34);
        assert_eq!(coding_shreds.len(), 34);

        let (retransmit_sender, retransmit_receiver) = crossbeam_channel::unbounded();
        let mut metrics = BlockstoreInsertionMetrics::default();
        let num_coding = coding_shreds.len();
        let insert_results = blockstore
            .do_insert_shreds(
                coding_shreds,
                vec![false; num_coding],
                Some(&leader_schedule),
                false,
                Some(&retransmit_sender),
                &reed_solomon_cache,
                &mut metrics,
            )
            .unwrap();

        assert_eq!(metrics.num_recovered, 34);
        assert_eq!(metrics.num_recovered_inserted, 34);
        assert_eq!(metrics.num_recovered_failed_sig, 0);
        assert_eq!(metrics.num_recovered_failed_invalid, 0);

        // Every data shred is reconstructed byte-identically.
        for shred in &data_shreds {
            assert_eq!(
                blockstore
                    .get_data_shred(3, u64::from(shred.index()))
                    .unwrap()
                    .unwrap()
                    .as_slice(),
                shred.payload().as_ref()
            );
        }
        assert_eq!(
            insert_results.completed_data_set_infos,
            vec![CompletedDataSetInfo {
                slot: 3,
                start_index: 0,
                end_index: 33,
            }]
        );
        assert!(blockstore.meta(3).unwrap().unwrap().is_full());

        // Recovered data shreds are queued for retransmit as one batch.
        let payloads = retransmit_receiver.try_recv().unwrap();
        assert_eq!(payloads.len(), 34);
        metrics.report_metrics();
    }

    #[test]
    fn test_recovery_fails_sig() {
        let ledger_path = get_tmp_ledger_path_auto_delete();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();
        let keypair = Keypair::new();
        // Schedule reports some other leader; recovered shreds fail
        // signature verification and are dropped.
        let leader_schedule =
            LeaderScheduleCache::new_fixed(Keypair::new().pubkey());

        let shreds = make_slot_shreds(&keypair, 3, 2, 8, true);
        let coding_shreds: Vec<_> = shreds.into_iter().filter(|s| s.is_code()).collect();
        let num_coding = coding_shreds.len();

        let mut metrics = BlockstoreInsertionMetrics::default();
        blockstore
            .do_insert_shreds(
                coding_shreds,
                vec![false; num_coding],
                Some(&leader_schedule),
                false,
                None,
                &ReedSolomonCache::default(),
                &mut metrics,
            )
            .unwrap();

        assert_eq!(metrics.num_recovered, 8);
        assert_eq!(metrics.num_recovered_failed_sig, 8);
        assert_eq!(metrics.num_recovered_inserted, 0);
        assert!(blockstore.get_data_shred(3, 0).unwrap().is_none());
    }

    #[test]
    fn test_dead_slot_detection() {
        let ledger_path = get_tmp_ledger_path_auto_delete();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        // Indices 0, 2, 3; index 1 is still missing.
        let shreds = vec![
            new_legacy_data_shred(5, 0, 1, ShredFlags::empty()),
            new_legacy_data_shred(5, 2, 1, ShredFlags::empty()),
            new_legacy_data_shred(5, 3, 1, ShredFlags::empty()),
        ];
        let insert_results = insert_for_results(&blockstore, shreds);
        assert!(insert_results.duplicate_shreds.is_empty());
        let meta = blockstore.meta(5).unwrap().unwrap();
        assert_eq!(meta.received, 4);
        assert!(!meta.is_full());

        // A last-in-slot shred below `received` reveals a shorter
        // alternative version: the slot is marked dead and the shred is
        // rejected with a last-index conflict.
        let last_shred = new_legacy_data_shred(5, 1, 1, ShredFlags::LAST_SHRED_IN_SLOT);
        let insert_results = insert_for_results(&blockstore, vec![last_shred.clone()]);
        assert!(blockstore.is_dead(5));
        assert_eq!(insert_results.duplicate_shreds.len(), 1);
        assert_matches!(
            insert_results.duplicate_shreds[0],
            PossibleDuplicateShred::LastIndexConflict(..)
        );
        assert_eq!(insert_results.duplicate_shreds[0].slot(), 5);
        assert!(blockstore.get_data_shred(5, 1).unwrap().is_none());
        assert_eq!(blockstore.meta(5).unwrap().unwrap().last_index, None);
        assert!(blockstore.has_duplicate_shreds_in_slot(5));
    }

    #[test]
    fn test_duplicate_last_index() {
        let ledger_path = get_tmp_ledger_path_auto_delete();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();

        let shreds = vec![
            new_legacy_data_shred(6, 0, 1, ShredFlags::empty()),
            new_legacy_data_shred(6, 1, 1, ShredFlags::LAST_SHRED_IN_SLOT),
        ];
        let insert_results = insert_for_results(&blockstore, shreds);
        assert!(insert_results.duplicate_shreds.is_empty());
        assert!(blockstore.meta(6).unwrap().unwrap().is_full());

        // A shred beyond the recorded last index proves equivocation.
        let late_shred = new_legacy_data_shred(6, 2, 1, ShredFlags::empty());
        let insert_results = insert_for_results(&blockstore, vec![late_shred.clone()]);
        assert_eq!(insert_results.duplicate_shreds.len(), 1);
        match &insert_results.duplicate_shreds[0] {
            PossibleDuplicateShred::LastIndexConflict(original, _conflict) => {
                assert_eq!(original, &late_shred);
            }
            other => panic!("unexpected duplicate: {other:?}"),
        }
        assert!(blockstore.get_data_shred(6, 2).unwrap().is_none());
        assert!(blockstore.has_duplicate_shreds_in_slot(6));
    }

    #[test]
    fn test_code_shred_at_or_below_root_rejected() {
        let ledger_path = get_tmp_ledger_path_auto_delete();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();
        blockstore.set_roots([3].iter()).unwrap();
        assert_eq!(blockstore.max_root(), 3);
        assert!(blockstore.is_root(3));

        let parity = vec![7u8; SIZE_OF_PAYLOAD];
        let rooted = Shred::from(crate::shred::ShredCode::new_from_parity_shard(
            3, 0, &parity, 0, 2, 2, 0, 0,
        ));
        let active = Shred::from(crate::shred::ShredCode::new_from_parity_shard(
            4, 0, &parity, 0, 2, 2, 0, 0,
        ));

        let mut metrics = BlockstoreInsertionMetrics::default();
        blockstore
            .do_insert_shreds(
                vec![rooted, active],
                vec![false; 2],
                None,
                false,
                None,
                &ReedSolomonCache::default(),
                &mut metrics,
            )
            .unwrap();
        assert_eq!(metrics.num_code_shreds_invalid, 1);
        assert!(blockstore.get_coding_shred(3, 0).unwrap().is_none());
        assert!(blockstore.get_coding_shred(4, 0).unwrap().is_some());
    }

    #[test]
    fn test_insert_shreds_commutative_for_disjoint_sets() {
        let keypair = Keypair::new();
        let shreds_a = make_slot_shreds(&keypair, 3, 2, 4, true);
        let shreds_b = make_slot_shreds(&keypair, 5, 4, 4, true);

        let path_1 = get_tmp_ledger_path_auto_delete();
        let blockstore_1 = Blockstore::open(path_1.path()).unwrap();
        blockstore_1.insert_shreds(shreds_a.clone(), None, false).unwrap();
        blockstore_1.insert_shreds(shreds_b.clone(), None, false).unwrap();

        let path_2 = get_tmp_ledger_path_auto_delete();
        let blockstore_2 = Blockstore::open(path_2.path()).unwrap();
        blockstore_2.insert_shreds(shreds_b, None, false).unwrap();
        blockstore_2.insert_shreds(shreds_a, None, false).unwrap();

        for slot in [2, 3, 4, 5] {
            // The first-shred timestamp is wall clock and not expected to
            // commute.
            let mut meta_1 = blockstore_1.meta(slot).unwrap();
            let mut meta_2 = blockstore_2.meta(slot).unwrap();
            for meta in meta_1.iter_mut().chain(meta_2.iter_mut()) {
                meta.first_shred_timestamp = 0;
            }
            assert_eq!(meta_1, meta_2);
            assert_eq!(
                blockstore_1.get_index(slot).unwrap(),
                blockstore_2.get_index(slot).unwrap()
            );
            let shreds_1: Vec<_> = blockstore_1.slot_data_iterator(slot, 0).unwrap().collect();
            let shreds_2: Vec<_> = blockstore_2.slot_data_iterator(slot, 0).unwrap().collect();
            assert_eq!(shreds_1, shreds_2);
        }
    }

    #[test]
    fn test_index_coherence_shuffled_insertion() {
        let ledger_path = get_tmp_ledger_path_auto_delete();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();
        let keypair = Keypair::new();
        let mut rng = StdRng::seed_from_u64(17);

        let mut shreds = Vec::new();
        for slot in 3..6 {
            shreds.extend(make_slot_shreds(&keypair, slot, slot - 1, 8, true));
        }
        shreds.shuffle(&mut rng);

        let mut last_received: HashMap<Slot, u64> = HashMap::new();
        for chunk in shreds.chunks(7) {
            blockstore.insert_shreds(chunk.to_vec(), None, false).unwrap();
            for slot in 3..6 {
                let received = blockstore
                    .meta(slot)
                    .unwrap()
                    .map(|meta| meta.received)
                    .unwrap_or(0);
                // `received` never decreases across calls.
                assert!(received >= last_received.get(&slot).copied().unwrap_or(0));
                last_received.insert(slot, received);
            }
        }

        for slot in 3..6 {
            let index = blockstore.get_index(slot).unwrap().unwrap();
            // Every stored data shred is recorded in the index, and vice versa.
            let stored: Vec<u64> = blockstore
                .slot_data_iterator(slot, 0)
                .unwrap()
                .map(|((_, shred_index), _)| shred_index)
                .collect();
            assert_eq!(stored, index.data().range(..).copied().collect::<Vec<_>>());
            let stored_coding: Vec<u64> = blockstore
                .slot_coding_iterator(slot, 0)
                .unwrap()
                .map(|((_, shred_index), _)| shred_index)
                .collect();
            assert_eq!(
                stored_coding,
                index.coding().range(..).copied().collect::<Vec<_>>()
            );
            // All shreds arrived, so the consecutive prefix covers the slot.
            let meta = blockstore.meta(slot).unwrap().unwrap();
            assert_eq!(meta.consumed, 8);
            assert_eq!(meta.received, 8);
            assert!(meta.is_full());
        }
    }

    #[test]
    fn test_bulk_ingest_round_trip() {
        let ledger_path = get_tmp_ledger_path_auto_delete();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();
        let keypair = Keypair::new();

        let shreds = make_slot_shreds(&keypair, 9, 8, 100, true);
        let data_shreds: Vec<_> = shreds.iter().filter(|s| s.is_data()).cloned().collect();
        assert_eq!(data_shreds.len(), 100);
        blockstore.insert_shreds(shreds, None, false).unwrap();

        for shred in &data_shreds {
            assert_eq!(
                blockstore
                    .get_data_shred(9, u64::from(shred.index()))
                    .unwrap()
                    .unwrap()
                    .as_slice(),
                shred.payload().as_ref()
            );
        }
        // 100 data shreds split into erasure sets of 32, 32 and 36.
        let index = blockstore.get_index(9).unwrap().unwrap();
        assert_eq!(index.data().num_shreds(), 100);
        assert_eq!(index.coding().num_shreds(), 100);
        assert!(blockstore.meta(9).unwrap().unwrap().is_full());
    }

    #[test]
    fn test_forward_chained_merkle_root_conflict() {
        let ledger_path = get_tmp_ledger_path_auto_delete();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();
        let keypair = Keypair::new();
        let shredder = Shredder::new(2, 1, 0, 0).unwrap();
        let capacity = shred::data_shred_capacity(Some(true));
        let reed_solomon_cache = ReedSolomonCache::default();

        // Honest chain: two erasure sets, the second commits to the first's
        // merkle root.
        let honest = shredder
            .make_shreds_from_data(
                &keypair,
                &vec![1u8; 40 * capacity],
                true,
                Some(Hash::new_unique()),
                0,
                &reed_solomon_cache,
                &mut ProcessShredsStats::default(),
            )
            .unwrap();
        // Alternative version of the first set with a different merkle root.
        let alternate = shredder
            .make_shreds_from_data(
                &keypair,
                &vec![2u8; 32 * capacity],
                false,
                Some(Hash::new_unique()),
                0,
                &reed_solomon_cache,
                &mut ProcessShredsStats::default(),
            )
            .unwrap();

        let honest_set_1_code = honest
            .iter()
            .find(|s| s.is_code() && s.fec_set_index() == 32)
            .cloned()
            .unwrap();
        let alternate_set_0_code = alternate
            .iter()
            .find(|s| s.is_code() && s.fec_set_index() == 0)
            .cloned()
            .unwrap();

        // The second set alone raises no conflict: its previous set is
        // simply missing.
        let insert_results = insert_for_results(&blockstore, vec![honest_set_1_code]);
        assert!(insert_results.duplicate_shreds.is_empty());

        // The alternate first set chains forward into a set that commits to
        // a different merkle root.
        let insert_results =
            insert_for_results(&blockstore, vec![alternate_set_0_code.clone()]);
        assert_eq!(insert_results.duplicate_shreds.len(), 1);
        match &insert_results.duplicate_shreds[0] {
            PossibleDuplicateShred::ChainedMerkleRootConflict(original, _conflict) => {
                assert_eq!(original, &alternate_set_0_code);
            }
            other => panic!("unexpected duplicate: {other:?}"),
        }
        assert!(blockstore.has_duplicate_shreds_in_slot(2));
        // Chained merkle conflicts never fail the insertion itself.
        assert!(blockstore
            .get_coding_shred(2, u64::from(alternate_set_0_code.index()))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_backwards_chained_merkle_root_conflict() {
        let keypair = Keypair::new();
        let shredder = Shredder::new(2, 1, 0, 0).unwrap();
        let capacity = shred::data_shred_capacity(Some(true));
        let reed_solomon_cache = ReedSolomonCache::default();

        let honest = shredder
            .make_shreds_from_data(
                &keypair,
                &vec![1u8; 40 * capacity],
                true,
                Some(Hash::new_unique()),
                0,
                &reed_solomon_cache,
                &mut ProcessShredsStats::default(),
            )
            .unwrap();
        let honest_set_0: Vec<_> = honest
            .iter()
            .filter(|s| s.fec_set_index() == 0)
            .cloned()
            .collect();
        let honest_set_1_code = honest
            .iter()
            .find(|s| s.is_code() && s.fec_set_index() == 32)
            .cloned()
            .unwrap();

        // Alternative second set chaining to the wrong merkle root.
        let alternate_set_1_code = shredder
            .make_shreds_from_data(
                &keypair,
                &vec![2u8; 4 * capacity],
                true,
                Some(Hash::new_unique()), // not the first set's root
                32,
                &reed_solomon_cache,
                &mut ProcessShredsStats::default(),
            )
            .unwrap()
            .into_iter()
            .find(|s| s.is_code())
            .unwrap();

        // The honest second set chains cleanly onto the first.
        let ledger_path = get_tmp_ledger_path_auto_delete();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();
        let insert_results = insert_for_results(&blockstore, honest_set_0.clone());
        assert!(insert_results.duplicate_shreds.is_empty());
        let insert_results = insert_for_results(&blockstore, vec![honest_set_1_code]);
        assert!(insert_results.duplicate_shreds.is_empty());
        assert!(!blockstore.has_duplicate_shreds_in_slot(2));

        // On a ledger holding only the first set, the alternate second set
        // conflicts backwards with the stored merkle root.
        let ledger_path = get_tmp_ledger_path_auto_delete();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();
        let insert_results = insert_for_results(&blockstore, honest_set_0);
        assert!(insert_results.duplicate_shreds.is_empty());

        let insert_results =
            insert_for_results(&blockstore, vec![alternate_set_1_code.clone()]);
        assert_eq!(insert_results.duplicate_shreds.len(), 1);
        match &insert_results.duplicate_shreds[0] {
            PossibleDuplicateShred::ChainedMerkleRootConflict(original, _conflict) => {
                assert_eq!(original, &alternate_set_1_code);
            }
            other => panic!("unexpected duplicate: {other:?}"),
        }
        assert!(blockstore.has_duplicate_shreds_in_slot(2));
    }

    #[test]
    fn test_signals() {
        let ledger_path = get_tmp_ledger_path_auto_delete();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();
        let keypair = Keypair::new();
        let (new_shreds_sender, new_shreds_receiver) = crossbeam_channel::unbounded();
        let (completed_sender, completed_receiver) = crossbeam_channel::unbounded();
        blockstore.add_new_shred_signal(new_shreds_sender);
        blockstore.add_completed_slots_signal(completed_sender);

        // Slot 1 completes but its parent is unknown: completed-slots fires,
        // the replay wake-up does not.
        blockstore
            .insert_shreds(make_slot_shreds(&keypair, 1, 0, 2, true), None, false)
            .unwrap();
        assert_eq!(completed_receiver.try_recv().unwrap(), vec![1]);
        assert!(new_shreds_receiver.try_recv().is_err());

        // Slot 0 starts with its parent deemed connected, so consecutive
        // shreds are immediately replayable.
        blockstore
            .insert_shreds(make_slot_shreds(&keypair, 0, 0, 2, true), None, false)
            .unwrap();
        assert_eq!(completed_receiver.try_recv().unwrap(), vec![0]);
        assert!(new_shreds_receiver.try_recv().unwrap());

        // After dropping the signals, further inserts are silent.
        blockstore.drop_signal();
        blockstore
            .insert_shreds(make_slot_shreds(&keypair, 3, 0, 2, true), None, false)
            .unwrap();
        assert!(completed_receiver.try_recv().is_err());
        assert!(new_shreds_receiver.try_recv().is_err());
    }

    #[test]
    fn test_open_destroy() {
        let ledger_path = get_tmp_ledger_path_auto_delete();
        {
            let blockstore = Blockstore::open(ledger_path.path()).unwrap();
            assert_eq!(blockstore.ledger_path(), &ledger_path.path().to_path_buf());
            blockstore
                .insert_shreds(
                    vec![new_legacy_data_shred(1, 0, 1, ShredFlags::empty())],
                    None,
                    false,
                )
                .unwrap();
        }
        Blockstore::destroy(ledger_path.path()).unwrap();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();
        assert!(blockstore.meta(1).unwrap().is_none());
    }

    #[test]
    fn test_clear_unconfirmed_slot() {
        let ledger_path = get_tmp_ledger_path_auto_delete();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();
        let keypair = Keypair::new();

        blockstore
            .insert_shreds(make_slot_shreds(&keypair, 1, 0, 2, true), None, false)
            .unwrap();
        blockstore
            .insert_shreds(make_slot_shreds(&keypair, 2, 1, 2, true), None, false)
            .unwrap();
        assert!(blockstore.get_data_shred(2, 0).unwrap().is_some());
        assert_eq!(blockstore.meta(1).unwrap().unwrap().next_slots, vec![2]);

        blockstore.clear_unconfirmed_slot(2);
        let meta = blockstore.meta(2).unwrap().unwrap();
        assert!(meta.is_orphan());
        assert_eq!(meta.received, 0);
        assert!(blockstore.get_data_shred(2, 0).unwrap().is_none());
        assert!(blockstore.get_index(2).unwrap().is_none());
        assert!(blockstore
            .erasure_meta(ErasureSetId::new(2, 0))
            .unwrap()
            .is_none());
        assert!(blockstore.meta(1).unwrap().unwrap().next_slots.is_empty());
    }

    #[test]
    fn test_set_and_chain_connected_on_root_and_next_slots() {
        let ledger_path = get_tmp_ledger_path_auto_delete();
        let blockstore = Blockstore::open(ledger_path.path()).unwrap();
        let keypair = Keypair::new();

        // Slots 2 and 3 are full but hang off the unknown slot 1.
        blockstore
            .insert_shreds(make_slot_shreds(&keypair, 2, 1, 2, true), None, false)
            .unwrap();
        blockstore
            .insert_shreds(make_slot_shreds(&keypair, 3, 2, 2, true), None, false)
            .unwrap();
        assert!(!blockstore.meta(2).unwrap().unwrap().is_connected());
        assert!(!blockstore.meta(3).unwrap().unwrap().is_connected());

        // Joining from a snapshot at slot 1: connect it and everything below.
        blockstore
            .set_and_chain_connected_on_root_and_next_slots(1)
            .unwrap();
        assert!(blockstore.meta(1).unwrap().unwrap().is_connected());
        assert!(blockstore.meta(2).unwrap().unwrap().is_connected());
        assert!(blockstore.meta(3).unwrap().unwrap().is_connected());
    }

    #[test]
    fn test_update_completed_data_indexes() {
        let mut completed_data_indexes = BTreeSet::default();
        let mut shred_index = ShredIndex::default();

        for i in 0..10 {
            shred_index.insert(i as u64);
            assert_eq!(
                update_completed_data_indexes(true, i, &shred_index, &mut completed_data_indexes),
                vec![(i, i)]
            );
            assert!(completed_data_indexes.iter().copied().eq(0..=i));
        }
    }

    #[test]
    fn test_update_completed_data_indexes_out_of_order() {
        let mut completed_data_indexes = BTreeSet::default();
        let mut shred_index = ShredIndex::default();

        shred_index.insert(4);
        assert!(
            update_completed_data_indexes(false, 4, &shred_index, &mut completed_data_indexes)
                .is_empty()
        );
        assert!(completed_data_indexes.is_empty());

        shred_index.insert(2);
        assert!(
            update_completed_data_indexes(false, 2, &shred_index, &mut completed_data_indexes)
                .is_empty()
        );
        assert!(completed_data_indexes.is_empty());

        shred_index.insert(3);
        assert!(
            update_completed_data_indexes(true, 3, &shred_index, &mut completed_data_indexes)
                .is_empty()
        );
        assert!(completed_data_indexes.iter().copied().eq([3]));

        // Inserting data complete shred 1 still cannot close anything: shred
        // zero is missing.
        shred_index.insert(1);
        assert!(
            update_completed_data_indexes(true, 1, &shred_index, &mut completed_data_indexes)
                .is_empty()
        );
        assert!(completed_data_indexes.iter().copied().eq([1, 3]));

        // Inserting shred zero closes both (0, 0) and (1, 1).
        shred_index.insert(0);
        assert_eq!(
            update_completed_data_indexes(true, 0, &shred_index, &mut completed_data_indexes),
            vec![(0, 0), (1, 1)]
        );
        assert!(completed_data_indexes.iter().copied().eq([0, 1, 3]));

        // And shred 2 closes the (2, 3) range.
        shred_index.insert(2);
        assert_eq!(
            update_completed_data_indexes(false, 2, &shred_index, &mut completed_data_indexes),
            vec![(2, 3)]
        );
        assert!(completed_data_indexes.iter().copied().eq([0, 1, 3]));
    }

    proptest! {
        // When every shred is data-complete, each index forms its own data
        // set and is emitted exactly once, no matter the arrival order.
        #[test]
        fn test_completed_data_indexes_arrival_order(seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut indexes: Vec<u32> = (0..32).collect();
            indexes.shuffle(&mut rng);

            let mut shred_index = ShredIndex::default();
            let mut completed_data_indexes = BTreeSet::default();
            let mut emitted = Vec::new();
            for i in indexes {
                shred_index.insert(u64::from(i));
                emitted.extend(update_completed_data_indexes(
                    true,
                    i,
                    &shred_index,
                    &mut completed_data_indexes,
                ));
            }
            emitted.sort_unstable();
            prop_assert_eq!(emitted, (0..32).map(|i| (i, i)).collect::<Vec<_>>());
        }
    }
}
