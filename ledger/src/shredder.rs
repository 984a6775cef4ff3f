use {
    crate::shred::{
        self, Error, Shred, ShredFlags, DATA_SHREDS_PER_FEC_BLOCK, MAX_DATA_SHREDS_PER_FEC_BLOCK,
        SIZE_OF_PAYLOAD,
    },
    lazy_lru::LruCache,
    reed_solomon_erasure::galois_8::ReedSolomon,
    std::sync::{Arc, OnceLock, RwLock},
    trellis_sdk::{clock::Slot, hash::Hash, signature::Keypair},
};

// Arc<...> wrapper so that cache entries can be initialized without locking
// the entire cache.
type LruCacheOnce<K, V> = RwLock<LruCache<K, Arc<OnceLock<V>>>>;

pub struct ReedSolomonCache(
    LruCacheOnce<
        (usize, usize), // number of {data,parity} shards
        Result<Arc<ReedSolomon>, reed_solomon_erasure::Error>,
    >,
);

impl ReedSolomonCache {
    const CAPACITY: usize = 4 * DATA_SHREDS_PER_FEC_BLOCK;

    pub(crate) fn get(
        &self,
        data_shards: usize,
        parity_shards: usize,
    ) -> Result<Arc<ReedSolomon>, reed_solomon_erasure::Error> {
        let key = (data_shards, parity_shards);
        // Read lock only in the common case that the entry already exists.
        let entry = self.0.read().unwrap().get(&key).cloned();
        let entry = match entry {
            Some(entry) => entry,
            None => {
                let mut cache = self.0.write().unwrap();
                match cache.get(&key).cloned() {
                    Some(entry) => entry,
                    None => {
                        let entry = Arc::<OnceLock<_>>::default();
                        cache.put(key, Arc::clone(&entry));
                        entry
                    }
                }
            }
        };
        entry
            .get_or_init(|| ReedSolomon::new(data_shards, parity_shards).map(Arc::new))
            .clone()
    }
}

impl Default for ReedSolomonCache {
    fn default() -> Self {
        Self(RwLock::new(LruCache::new(Self::CAPACITY)))
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProcessShredsStats {
    pub num_batches: usize,
    pub num_data_shreds: usize,
    pub num_coding_shreds: usize,
    pub sign_elapsed_us: u64,
}

#[derive(Debug)]
pub struct Shredder {
    slot: Slot,
    parent_slot: Slot,
    version: u16,
    reference_tick: u8,
}

impl Shredder {
    pub fn new(
        slot: Slot,
        parent_slot: Slot,
        reference_tick: u8,
        version: u16,
    ) -> Result<Self, Error> {
        if slot < parent_slot || slot - parent_slot > u64::from(u16::MAX) {
            Err(Error::InvalidParentSlot { slot, parent_slot })
        } else {
            Ok(Self {
                slot,
                parent_slot,
                version,
                reference_tick,
            })
        }
    }

    /// Slices `data` into erasure batches of signed Merkle shreds.
    ///
    /// Each batch carries as many coding shreds as data shreds. When
    /// `chained_merkle_root` is some, shreds are the chained Merkle
    /// variant and each batch commits to the Merkle root of the batch
    /// before it.
    pub fn make_shreds_from_data(
        &self,
        keypair: &Keypair,
        data: &[u8],
        is_last_in_slot: bool,
        chained_merkle_root: Option<Hash>,
        next_shred_index: u32,
        reed_solomon_cache: &ReedSolomonCache,
        stats: &mut ProcessShredsStats,
    ) -> Result<Vec<Shred>, Error> {
        let chained = chained_merkle_root.is_some();
        let capacity = shred::data_shred_capacity(Some(chained));
        // At least one (possibly empty) data shred is always emitted so
        // that an empty slot still closes its data range.
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(capacity).collect()
        };
        let batches = make_erasure_batches(&chunks);

        let mut shreds = Vec::new();
        let mut chained_root = chained_merkle_root;
        let mut shred_index = next_shred_index;
        let num_batches = batches.len();
        for (nth_batch, batch) in batches.into_iter().enumerate() {
            let is_last_batch = nth_batch + 1 == num_batches;
            let root = self.make_erasure_batch(
                keypair,
                batch,
                is_last_batch && is_last_in_slot,
                chained.then_some(chained_root).flatten(),
                chained,
                shred_index,
                reed_solomon_cache,
                &mut shreds,
                stats,
            )?;
            shred_index += batch.len() as u32;
            chained_root = Some(root);
            stats.num_batches += 1;
        }
        Ok(shreds)
    }

    /// Erasure encodes, Merkle-roots and signs a single batch; returns
    /// the batch's Merkle root.
    #[allow(clippy::too_many_arguments)]
    fn make_erasure_batch(
        &self,
        keypair: &Keypair,
        chunks: &[&[u8]],
        is_last_in_slot: bool,
        chained_merkle_root: Option<Hash>,
        chained: bool,
        fec_set_index: u32,
        reed_solomon_cache: &ReedSolomonCache,
        shreds: &mut Vec<Shred>,
        stats: &mut ProcessShredsStats,
    ) -> Result<Hash, Error> {
        let num_data = chunks.len();
        let num_coding = num_data;
        let parent_offset = u16::try_from(self.slot - self.parent_slot).unwrap();

        let mut payloads: Vec<Vec<u8>> = Vec::with_capacity(num_data + num_coding);
        for (i, chunk) in chunks.iter().enumerate() {
            let mut flags = ShredFlags::from_reference_tick(self.reference_tick);
            if i + 1 == num_data {
                flags |= ShredFlags::DATA_COMPLETE_SHRED;
                if is_last_in_slot {
                    flags |= ShredFlags::LAST_SHRED_IN_SLOT;
                }
            }
            payloads.push(make_data_payload(
                self.slot,
                fec_set_index + i as u32,
                self.version,
                fec_set_index,
                parent_offset,
                flags,
                chunk,
                chained,
                chained_merkle_root,
            )?);
        }

        // Parity covers whole data shred payloads.
        let mut parity = vec![vec![0u8; SIZE_OF_PAYLOAD]; num_coding];
        reed_solomon_cache
            .get(num_data, num_coding)?
            .encode_sep(&payloads, &mut parity)?;
        for (position, parity_shard) in parity.into_iter().enumerate() {
            payloads.push(make_coding_payload(
                self.slot,
                fec_set_index + position as u32,
                self.version,
                fec_set_index,
                num_data as u16,
                num_coding as u16,
                position as u16,
                parity_shard,
                chained,
                chained_merkle_root,
            )?);
        }

        // Compute the batch Merkle root, write it into every trailer and
        // sign it; all shreds of the batch share the signature.
        let tree = shred::make_merkle_tree(payloads.iter().map(|p| shred::merkle_node(p)).collect());
        let root = *tree.last().expect("merkle tree of a non-empty batch");
        let sign_start = std::time::Instant::now();
        let signature = keypair.sign_message(root.as_ref());
        stats.sign_elapsed_us += sign_start.elapsed().as_micros() as u64;
        for mut payload in payloads {
            let offset = payload.len() - root.as_ref().len();
            payload[offset..].copy_from_slice(root.as_ref());
            payload[..signature.as_ref().len()].copy_from_slice(signature.as_ref());
            let shred = Shred::new_from_serialized_shred(payload)?;
            if shred.is_data() {
                stats.num_data_shreds += 1;
            } else {
                stats.num_coding_shreds += 1;
            }
            shreds.push(shred);
        }
        Ok(root)
    }
}

// Partitions data chunks into erasure batches: full target-size batches
// while more than a maximum batch remains, then one final batch with the
// remainder.
fn make_erasure_batches<'a, 'b>(chunks: &'a [&'b [u8]]) -> Vec<&'a [&'b [u8]]> {
    let mut batches = Vec::new();
    let mut remaining = chunks;
    while remaining.len() > MAX_DATA_SHREDS_PER_FEC_BLOCK {
        let (batch, rest) = remaining.split_at(DATA_SHREDS_PER_FEC_BLOCK);
        batches.push(batch);
        remaining = rest;
    }
    batches.push(remaining);
    batches
}

#[allow(clippy::too_many_arguments)]
fn make_data_payload(
    slot: Slot,
    index: u32,
    version: u16,
    fec_set_index: u32,
    parent_offset: u16,
    flags: ShredFlags,
    chunk: &[u8],
    chained: bool,
    chained_merkle_root: Option<Hash>,
) -> Result<Vec<u8>, Error> {
    let mut payload = vec![0u8; SIZE_OF_PAYLOAD];
    let mut cursor = std::io::Cursor::new(&mut payload[..]);
    shred::write_data_shred_headers(
        &mut cursor,
        slot,
        index,
        version,
        fec_set_index,
        parent_offset,
        flags,
        (shred::SIZE_OF_DATA_SHRED_HEADERS + chunk.len()) as u16,
        chained,
    )?;
    payload[shred::SIZE_OF_DATA_SHRED_HEADERS..shred::SIZE_OF_DATA_SHRED_HEADERS + chunk.len()]
        .copy_from_slice(chunk);
    if let Some(root) = chained_merkle_root {
        let offset = payload.len() - 2 * root.as_ref().len();
        payload[offset..offset + root.as_ref().len()].copy_from_slice(root.as_ref());
    }
    Ok(payload)
}

#[allow(clippy::too_many_arguments)]
fn make_coding_payload(
    slot: Slot,
    index: u32,
    version: u16,
    fec_set_index: u32,
    num_data_shreds: u16,
    num_coding_shreds: u16,
    position: u16,
    parity_shard: Vec<u8>,
    chained: bool,
    chained_merkle_root: Option<Hash>,
) -> Result<Vec<u8>, Error> {
    let mut payload = Vec::with_capacity(shred::coding_shred_payload_size(Some(chained)));
    shred::write_coding_shred_headers(
        &mut payload,
        slot,
        index,
        version,
        fec_set_index,
        num_data_shreds,
        num_coding_shreds,
        position,
        chained,
    )?;
    payload.extend_from_slice(&parity_shard);
    if let Some(root) = chained_merkle_root {
        payload.extend_from_slice(root.as_ref());
    }
    // Trailer space for the batch Merkle root, filled in after the tree
    // is computed.
    payload.extend_from_slice(&[0u8; 32]);
    Ok(payload)
}
