//! The `shred` module defines data structures and methods to pull MTU sized data frames from the
//! network. There are two types of shreds: data and coding. Data shreds contain entry information
//! while coding shreds provide redundancy to protect against dropped network packets (erasures).
//!
//! +---------------------------------------------------------------------------------------------+
//! | Data Shred                                                                                  |
//! +---------------------------------------------------------------------------------------------+
//! | common       | data       | payload                                                         |
//! | header       | header     |                                                                 |
//! |+---+---+---  |+---+---+---|+------------------------------------------------------+-------+|
//! || s | s | .   || p | f | s || data (ie ledger entries)                             | merkle ||
//! || i | h | .   || a | l | i ||                                                      | trailer||
//! || g | r | .   || r | a | z ||                                                      |        ||
//! |+---+---+---  |+---+---+---+|------------------------------------------------------+-------+|
//! +---------------------------------------------------------------------------------------------+
//!
//! Coding shreds carry the same common header, a coding header
//! (`num_data_shreds | num_coding_shreds | position`), one parity shard
//! covering entire data shred payloads, and the same Merkle trailer.
//!
//! Merkle variants carry, at the very end of the payload, the Merkle root
//! of the erasure batch (and, for chained variants, the root of the
//! previous erasure batch immediately before it). The leader signs the
//! Merkle root, so all shreds of one erasure batch share a signature.
//! Legacy variants carry no trailer and sign the payload body instead.

pub use crate::shredder::{ProcessShredsStats, ReedSolomonCache, Shredder};
use {
    assert_matches::debug_assert_matches,
    bitflags::bitflags,
    num_enum::{IntoPrimitive, TryFromPrimitive},
    serde::{Deserialize, Serialize},
    static_assertions::const_assert_eq,
    std::{fmt, ops::Deref},
    thiserror::Error,
    trellis_sdk::{
        clock::Slot,
        hash::{hashv, Hash, HASH_BYTES},
        pubkey::Pubkey,
        signature::{Keypair, Signature, SIGNATURE_BYTES},
    },
};

/// The following constants are computed by hand, and hardcoded.
/// `test_shred_constants` ensures that the values are correct.
const SIZE_OF_COMMON_SHRED_HEADER: usize = 83;
pub const SIZE_OF_DATA_SHRED_HEADERS: usize = 88;
const SIZE_OF_CODING_SHRED_HEADERS: usize = 89;
const SIZE_OF_SIGNATURE: usize = SIGNATURE_BYTES;
const SIZE_OF_MERKLE_ROOT: usize = HASH_BYTES;

const OFFSET_OF_SHRED_VARIANT: usize = SIZE_OF_SIGNATURE;
const OFFSET_OF_SHRED_SLOT: usize = OFFSET_OF_SHRED_VARIANT + 1;
const OFFSET_OF_SHRED_INDEX: usize = OFFSET_OF_SHRED_SLOT + 8;
const OFFSET_OF_SHRED_VERSION: usize = OFFSET_OF_SHRED_INDEX + 4;
const OFFSET_OF_FEC_SET_INDEX: usize = OFFSET_OF_SHRED_VERSION + 2;
const OFFSET_OF_PARENT_OFFSET: usize = SIZE_OF_COMMON_SHRED_HEADER;
const OFFSET_OF_SHRED_FLAGS: usize = OFFSET_OF_PARENT_OFFSET + 2;

const_assert_eq!(OFFSET_OF_FEC_SET_INDEX + 4, SIZE_OF_COMMON_SHRED_HEADER);

/// Total size of one data shred payload.
pub const SIZE_OF_PAYLOAD: usize = 1228;

// Shreds are uniformly split into erasure batches with a "target" number of
// data shreds per each batch as below. The last batch of a slot may carry
// up to MAX_DATA_SHREDS_PER_FEC_BLOCK data shreds.
pub const DATA_SHREDS_PER_FEC_BLOCK: usize = 32;
pub const MAX_DATA_SHREDS_PER_FEC_BLOCK: usize = 64;

/// An upper bound on maximum number of data shreds we can handle in a slot
/// 32K shreds would allow ~320K peak TPS
/// (32K shreds per slot * 4 TX per shred * 2.5 slots per sec)
pub const MAX_DATA_SHREDS_PER_SLOT: usize = 32_768;
pub const MAX_CODE_SHREDS_PER_SLOT: usize = MAX_DATA_SHREDS_PER_SLOT;

const MERKLE_HASH_PREFIX_LEAF: &[u8] = b"\x00TRELLIS_MERKLE_SHREDS_LEAF";
const MERKLE_HASH_PREFIX_NODE: &[u8] = b"\x01TRELLIS_MERKLE_SHREDS_NODE";

// LAST_SHRED_IN_SLOT also implies DATA_COMPLETE_SHRED.
// So it cannot be LAST_SHRED_IN_SLOT if not also DATA_COMPLETE_SHRED.
bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
    pub struct ShredFlags:u8 {
        const SHRED_TICK_REFERENCE_MASK = 0b0011_1111;
        const DATA_COMPLETE_SHRED       = 0b0100_0000;
        const LAST_SHRED_IN_SLOT        = 0b1100_0000;
    }
}

impl ShredFlags {
    /// Creates a new ShredFlags from the given reference_tick
    ///
    /// SHRED_TICK_REFERENCE_MASK is comprised of only six bits whereas the
    /// reference_tick has 8 bits (u8). The reference_tick bits will saturate
    /// in the event that reference_tick > SHRED_TICK_REFERENCE_MASK
    pub(crate) fn from_reference_tick(reference_tick: u8) -> Self {
        Self::from_bits_retain(Self::SHRED_TICK_REFERENCE_MASK.bits().min(reference_tick))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Bincode(#[from] bincode::Error),
    #[error(transparent)]
    Erasure(#[from] reed_solomon_erasure::Error),
    #[error("Invalid data size: {size}, payload: {payload}")]
    InvalidDataSize { size: u16, payload: usize },
    #[error("Invalid erasure config")]
    InvalidErasureConfig,
    #[error("Invalid erasure shard index: {0}")]
    InvalidErasureShardIndex(/*shard index:*/ usize),
    #[error("Invalid Merkle root")]
    InvalidMerkleRoot,
    #[error("Invalid num coding shreds: {0}")]
    InvalidNumCodingShreds(u16),
    #[error("Invalid parent_offset: {parent_offset}, slot: {slot}")]
    InvalidParentOffset { slot: Slot, parent_offset: u16 },
    #[error("Invalid parent slot: {parent_slot}, slot: {slot}")]
    InvalidParentSlot { slot: Slot, parent_slot: Slot },
    #[error("Invalid payload size: {0}")]
    InvalidPayloadSize(/*payload size:*/ usize),
    #[error("Invalid recovered shred")]
    InvalidRecoveredShred,
    #[error("Invalid shred flags: {0}")]
    InvalidShredFlags(u8),
    #[error("Invalid {0:?} shred index: {1}")]
    InvalidShredIndex(ShredType, /*shred index:*/ u32),
    #[error("Invalid shred type")]
    InvalidShredType,
    #[error("Invalid shred variant")]
    InvalidShredVariant,
}

#[repr(u8)]
#[derive(
    Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, IntoPrimitive, Serialize, TryFromPrimitive,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum ShredType {
    Data = 0b1010_0101,
    Code = 0b0101_1010,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(into = "u8", try_from = "u8")]
enum ShredVariant {
    LegacyCode, // 0b0101_1010
    LegacyData, // 0b1010_0101
    // The first 4 bits identify the shred variant:
    //   0b0110_0000  MerkleCode
    //   0b0111_0000  MerkleCode chained
    //   0b1001_0000  MerkleData
    //   0b1011_0000  MerkleData chained
    MerkleCode { chained: bool },
    MerkleData { chained: bool },
}

/// A common header that is present in data and code shred headers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
struct ShredCommonHeader {
    signature: Signature,
    shred_variant: ShredVariant,
    slot: Slot,
    index: u32,
    version: u16,
    fec_set_index: u32,
}

/// The data shred header has parent offset and flags
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
struct DataShredHeader {
    parent_offset: u16,
    flags: ShredFlags,
    size: u16, // common shred header + data shred header + data
}

/// The coding shred header has FEC information
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
struct CodingShredHeader {
    num_data_shreds: u16,
    num_coding_shreds: u16,
    position: u16, // [0..num_coding_shreds)
}

/// Shred payload bytes, owned.
///
/// Working sets and duplicate proofs own their bytes through this type;
/// transient inspection of stored bytes goes through `&[u8]` /
/// [`std::borrow::Cow`] instead.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Payload(Vec<u8>);

impl From<Vec<u8>> for Payload {
    #[inline]
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Payload {
    #[inline]
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<Payload> for Vec<u8> {
    #[inline]
    fn from(payload: Payload) -> Self {
        payload.0
    }
}

impl AsRef<[u8]> for Payload {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Payload {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Serde helper to encode [`Payload`] as plain bytes.
pub mod serde_bytes_payload {
    use {
        super::Payload,
        serde::{Deserialize, Deserializer, Serializer},
    };

    pub fn serialize<S: Serializer>(payload: &Payload, serializer: S) -> Result<S::Ok, S::Error> {
        serde_bytes::serialize(payload.as_ref(), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Payload, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(Payload::from(bytes))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Shred {
    ShredCode(ShredCode),
    ShredData(ShredData),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShredData {
    common_header: ShredCommonHeader,
    data_header: DataShredHeader,
    payload: Payload,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShredCode {
    common_header: ShredCommonHeader,
    coding_header: CodingShredHeader,
    payload: Payload,
}

/// Tuple which uniquely identifies a shred should it exists.
#[derive(Clone, Copy, Eq, Debug, Hash, PartialEq)]
pub struct ShredId(Slot, /*shred index:*/ u32, ShredType);

impl ShredId {
    #[inline]
    pub fn new(slot: Slot, index: u32, shred_type: ShredType) -> ShredId {
        ShredId(slot, index, shred_type)
    }

    #[inline]
    pub fn slot(&self) -> Slot {
        self.0
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.1
    }

    #[inline]
    pub fn shred_type(&self) -> ShredType {
        self.2
    }
}

/// Tuple which identifies erasure coding set that the shred belongs to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ErasureSetId(Slot, /*fec_set_index:*/ u32);

impl ErasureSetId {
    pub(crate) fn new(slot: Slot, fec_set_index: u32) -> Self {
        Self(slot, fec_set_index)
    }

    pub(crate) fn slot(&self) -> Slot {
        self.0
    }

    // Storage key for ErasureMeta and MerkleRootMeta in blockstore db.
    pub(crate) fn store_key(&self) -> (Slot, /*fec_set_index:*/ u32) {
        (self.0, self.1)
    }
}

/// Payload bytes signed by the leader; either the erasure batch Merkle
/// root (Merkle variants) or the payload body (legacy variants).
pub enum SignedData<'a> {
    Chunk(&'a [u8]),
    MerkleRoot(Hash),
}

impl AsRef<[u8]> for SignedData<'_> {
    fn as_ref(&self) -> &[u8] {
        match self {
            Self::Chunk(chunk) => chunk,
            Self::MerkleRoot(root) => root.as_ref(),
        }
    }
}

/// To be used with the [`Shred`] enum.
///
/// Writes a function implementation that forwards the invocation to an
/// identically defined function in one of the two enum branches.
macro_rules! dispatch {
    ($vis:vis fn $name:ident(&self $(, $arg:ident : $ty:ty)?) $(-> $out:ty)?) => {
        #[inline]
        $vis fn $name(&self $(, $arg:$ty)?) $(-> $out)? {
            match self {
                Self::ShredCode(shred) => shred.$name($($arg, )?),
                Self::ShredData(shred) => shred.$name($($arg, )?),
            }
        }
    };
    ($vis:vis fn $name:ident(self $(, $arg:ident : $ty:ty)?) $(-> $out:ty)?) => {
        #[inline]
        $vis fn $name(self $(, $arg:$ty)?) $(-> $out)? {
            match self {
                Self::ShredCode(shred) => shred.$name($($arg, )?),
                Self::ShredData(shred) => shred.$name($($arg, )?),
            }
        }
    };
    ($vis:vis fn $name:ident(&mut self $(, $arg:ident : $ty:ty)?) $(-> $out:ty)?) => {
        #[inline]
        $vis fn $name(&mut self $(, $arg:$ty)?) $(-> $out)? {
            match self {
                Self::ShredCode(shred) => shred.$name($($arg, )?),
                Self::ShredData(shred) => shred.$name($($arg, )?),
            }
        }
    }
}

impl Shred {
    dispatch!(fn common_header(&self) -> &ShredCommonHeader);
    dispatch!(pub(crate) fn set_signature(&mut self, signature: Signature));
    dispatch!(fn signed_data(&self) -> Result<SignedData, Error>);

    dispatch!(pub fn chained_merkle_root(&self) -> Result<Hash, Error>);
    dispatch!(pub fn into_payload(self) -> Payload);
    dispatch!(pub fn merkle_root(&self) -> Result<Hash, Error>);
    dispatch!(pub fn payload(&self) -> &Payload);
    dispatch!(pub fn sanitize(&self) -> Result<(), Error>);

    pub fn new_from_serialized_shred<T>(shred: T) -> Result<Self, Error>
    where
        Payload: From<T>,
    {
        let shred = Payload::from(shred);
        Ok(match layout::get_shred_variant(&shred)? {
            ShredVariant::LegacyCode | ShredVariant::MerkleCode { .. } => {
                Self::from(ShredCode::from_payload(shred)?)
            }
            ShredVariant::LegacyData | ShredVariant::MerkleData { .. } => {
                Self::from(ShredData::from_payload(shred)?)
            }
        })
    }

    /// Unique identifier for each shred.
    pub fn id(&self) -> ShredId {
        ShredId(self.slot(), self.index(), self.shred_type())
    }

    pub fn slot(&self) -> Slot {
        self.common_header().slot
    }

    pub fn parent(&self) -> Result<Slot, Error> {
        match self {
            Self::ShredCode(_) => Err(Error::InvalidShredType),
            Self::ShredData(shred) => shred.parent(),
        }
    }

    pub fn index(&self) -> u32 {
        self.common_header().index
    }

    pub fn version(&self) -> u16 {
        self.common_header().version
    }

    pub fn fec_set_index(&self) -> u32 {
        self.common_header().fec_set_index
    }

    // Identifier for the erasure coding set that the shred belongs to.
    pub fn erasure_set(&self) -> ErasureSetId {
        ErasureSetId(self.slot(), self.fec_set_index())
    }

    pub(crate) fn erasure_shard_index(&self) -> Result<usize, Error> {
        match self {
            Self::ShredCode(shred) => shred.erasure_shard_index(),
            Self::ShredData(shred) => shred.erasure_shard_index(),
        }
    }

    pub(crate) fn erasure_shard(&self) -> Result<&[u8], Error> {
        match self {
            Self::ShredCode(shred) => shred.erasure_shard(),
            Self::ShredData(shred) => shred.erasure_shard(),
        }
    }

    pub fn signature(&self) -> &Signature {
        &self.common_header().signature
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        let data = self.signed_data().unwrap();
        let signature = keypair.sign_message(data.as_ref());
        self.set_signature(signature);
    }

    #[inline]
    pub fn shred_type(&self) -> ShredType {
        ShredType::from(self.common_header().shred_variant)
    }

    #[inline]
    pub fn is_data(&self) -> bool {
        self.shred_type() == ShredType::Data
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        self.shred_type() == ShredType::Code
    }

    pub fn last_in_slot(&self) -> bool {
        match self {
            Self::ShredCode(_) => false,
            Self::ShredData(shred) => shred.last_in_slot(),
        }
    }

    pub fn data_complete(&self) -> bool {
        match self {
            Self::ShredCode(_) => false,
            Self::ShredData(shred) => shred.data_complete(),
        }
    }

    pub(crate) fn reference_tick(&self) -> u8 {
        match self {
            Self::ShredCode(_) => ShredFlags::SHRED_TICK_REFERENCE_MASK.bits(),
            Self::ShredData(shred) => shred.reference_tick(),
        }
    }

    #[must_use]
    pub fn verify(&self, pubkey: &Pubkey) -> bool {
        match self.signed_data() {
            Ok(data) => self.signature().verify(pubkey, data.as_ref()),
            Err(_) => false,
        }
    }

    pub(crate) fn num_data_shreds(&self) -> Result<u16, Error> {
        match self {
            Self::ShredCode(shred) => Ok(shred.num_data_shreds()),
            Self::ShredData(_) => Err(Error::InvalidShredType),
        }
    }

    pub(crate) fn num_coding_shreds(&self) -> Result<u16, Error> {
        match self {
            Self::ShredCode(shred) => Ok(shred.num_coding_shreds()),
            Self::ShredData(_) => Err(Error::InvalidShredType),
        }
    }
}

impl From<ShredCode> for Shred {
    fn from(shred: ShredCode) -> Self {
        Self::ShredCode(shred)
    }
}

impl From<ShredData> for Shred {
    fn from(shred: ShredData) -> Self {
        Self::ShredData(shred)
    }
}

impl From<ShredVariant> for ShredType {
    #[inline]
    fn from(shred_variant: ShredVariant) -> Self {
        match shred_variant {
            ShredVariant::LegacyCode | ShredVariant::MerkleCode { .. } => ShredType::Code,
            ShredVariant::LegacyData | ShredVariant::MerkleData { .. } => ShredType::Data,
        }
    }
}

impl From<ShredVariant> for u8 {
    #[inline]
    fn from(shred_variant: ShredVariant) -> u8 {
        match shred_variant {
            ShredVariant::LegacyCode => u8::from(ShredType::Code),
            ShredVariant::LegacyData => u8::from(ShredType::Data),
            ShredVariant::MerkleCode { chained: false } => 0x60,
            ShredVariant::MerkleCode { chained: true } => 0x70,
            ShredVariant::MerkleData { chained: false } => 0x90,
            ShredVariant::MerkleData { chained: true } => 0xb0,
        }
    }
}

impl TryFrom<u8> for ShredVariant {
    type Error = Error;
    #[inline]
    fn try_from(shred_variant: u8) -> Result<Self, Self::Error> {
        if shred_variant == u8::from(ShredType::Code) {
            Ok(ShredVariant::LegacyCode)
        } else if shred_variant == u8::from(ShredType::Data) {
            Ok(ShredVariant::LegacyData)
        } else {
            match shred_variant {
                0x60 => Ok(ShredVariant::MerkleCode { chained: false }),
                0x70 => Ok(ShredVariant::MerkleCode { chained: true }),
                0x90 => Ok(ShredVariant::MerkleData { chained: false }),
                0xb0 => Ok(ShredVariant::MerkleData { chained: true }),
                _ => Err(Error::InvalidShredVariant),
            }
        }
    }
}

impl ShredVariant {
    // Size of the Merkle trailer at the end of the payload; zero for
    // legacy variants.
    fn trailer_size(&self) -> usize {
        match self {
            Self::LegacyCode | Self::LegacyData => 0,
            Self::MerkleCode { chained } | Self::MerkleData { chained } => {
                SIZE_OF_MERKLE_ROOT + if *chained { SIZE_OF_MERKLE_ROOT } else { 0 }
            }
        }
    }

    fn is_merkle(&self) -> bool {
        matches!(self, Self::MerkleCode { .. } | Self::MerkleData { .. })
    }
}

// Size of a whole coding shred payload for the given variant.
pub(crate) fn coding_shred_payload_size(chained: Option<bool>) -> usize {
    let trailer = match chained {
        None => 0,
        Some(false) => SIZE_OF_MERKLE_ROOT,
        Some(true) => 2 * SIZE_OF_MERKLE_ROOT,
    };
    SIZE_OF_CODING_SHRED_HEADERS + SIZE_OF_PAYLOAD + trailer
}

fn expected_payload_size(shred_variant: ShredVariant) -> usize {
    match shred_variant {
        ShredVariant::LegacyData | ShredVariant::MerkleData { .. } => SIZE_OF_PAYLOAD,
        ShredVariant::LegacyCode => coding_shred_payload_size(None),
        ShredVariant::MerkleCode { chained } => coding_shred_payload_size(Some(chained)),
    }
}

/// Capacity in bytes for ledger data within one data shred.
pub(crate) fn data_shred_capacity(chained: Option<bool>) -> usize {
    let trailer = match chained {
        None => 0,
        Some(false) => SIZE_OF_MERKLE_ROOT,
        Some(true) => 2 * SIZE_OF_MERKLE_ROOT,
    };
    SIZE_OF_PAYLOAD - SIZE_OF_DATA_SHRED_HEADERS - trailer
}

fn read_merkle_root(payload: &[u8], shred_variant: ShredVariant) -> Result<Hash, Error> {
    if !shred_variant.is_merkle() {
        return Err(Error::InvalidShredVariant);
    }
    let offset = payload
        .len()
        .checked_sub(SIZE_OF_MERKLE_ROOT)
        .ok_or(Error::InvalidPayloadSize(payload.len()))?;
    let root = <[u8; SIZE_OF_MERKLE_ROOT]>::try_from(&payload[offset..])
        .map_err(|_| Error::InvalidPayloadSize(payload.len()))?;
    Ok(Hash::from(root))
}

fn read_chained_merkle_root(payload: &[u8], shred_variant: ShredVariant) -> Result<Hash, Error> {
    let chained = match shred_variant {
        ShredVariant::MerkleCode { chained } | ShredVariant::MerkleData { chained } => chained,
        _ => false,
    };
    if !chained {
        return Err(Error::InvalidShredVariant);
    }
    let offset = payload
        .len()
        .checked_sub(2 * SIZE_OF_MERKLE_ROOT)
        .ok_or(Error::InvalidPayloadSize(payload.len()))?;
    let root = <[u8; SIZE_OF_MERKLE_ROOT]>::try_from(&payload[offset..offset + SIZE_OF_MERKLE_ROOT])
        .map_err(|_| Error::InvalidPayloadSize(payload.len()))?;
    Ok(Hash::from(root))
}

// Hash of the payload body bound into the erasure batch Merkle tree;
// excludes the signature (which signs the root) and the root itself.
pub(crate) fn merkle_node(payload: &[u8]) -> Hash {
    let offset = payload.len() - SIZE_OF_MERKLE_ROOT;
    hashv(&[MERKLE_HASH_PREFIX_LEAF, &payload[SIZE_OF_SIGNATURE..offset]])
}

fn join_nodes<S: AsRef<[u8]>, T: AsRef<[u8]>>(node: S, other: T) -> Hash {
    hashv(&[MERKLE_HASH_PREFIX_NODE, node.as_ref(), other.as_ref()])
}

// Binary Merkle tree, laid out level by level starting at the leaves.
// The last entry is the root.
pub(crate) fn make_merkle_tree(mut nodes: Vec<Hash>) -> Vec<Hash> {
    let mut size = nodes.len();
    while size > 1 {
        let offset = nodes.len() - size;
        for index in (offset..offset + size).step_by(2) {
            let node = &nodes[index];
            let other = &nodes[(index + 1).min(offset + size - 1)];
            let parent = join_nodes(node, other);
            nodes.push(parent);
        }
        size = nodes.len() - offset - size;
    }
    nodes
}

impl ShredData {
    #[inline]
    fn common_header(&self) -> &ShredCommonHeader {
        &self.common_header
    }

    #[inline]
    pub(crate) fn payload(&self) -> &Payload {
        &self.payload
    }

    pub(crate) fn into_payload(self) -> Payload {
        self.payload
    }

    pub(crate) fn from_payload(payload: Payload) -> Result<Self, Error> {
        let mut cursor = std::io::Cursor::new(payload.as_ref());
        let common_header: ShredCommonHeader = bincode::deserialize_from(&mut cursor)?;
        if !matches!(
            common_header.shred_variant,
            ShredVariant::LegacyData | ShredVariant::MerkleData { .. }
        ) {
            return Err(Error::InvalidShredVariant);
        }
        let data_header = bincode::deserialize_from(&mut cursor)?;
        let shred = Self {
            common_header,
            data_header,
            payload,
        };
        shred.sanitize().map(|_| shred)
    }

    pub(crate) fn new_from_data(
        slot: Slot,
        index: u32,
        parent_offset: u16,
        data: &[u8],
        flags: ShredFlags,
        reference_tick: u8,
        version: u16,
        fec_set_index: u32,
    ) -> Self {
        let mut payload = vec![0; SIZE_OF_PAYLOAD];
        let common_header = ShredCommonHeader {
            signature: Signature::default(),
            shred_variant: ShredVariant::LegacyData,
            slot,
            index,
            version,
            fec_set_index,
        };
        let size = (data.len() + SIZE_OF_DATA_SHRED_HEADERS) as u16;
        let flags = flags
            | ShredFlags::from_bits_retain(
                ShredFlags::SHRED_TICK_REFERENCE_MASK
                    .bits()
                    .min(reference_tick),
            );
        let data_header = DataShredHeader {
            parent_offset,
            flags,
            size,
        };
        let mut cursor = std::io::Cursor::new(&mut payload[..]);
        bincode::serialize_into(&mut cursor, &common_header).unwrap();
        bincode::serialize_into(&mut cursor, &data_header).unwrap();
        payload[SIZE_OF_DATA_SHRED_HEADERS..SIZE_OF_DATA_SHRED_HEADERS + data.len()]
            .copy_from_slice(data);
        Self {
            common_header,
            data_header,
            payload: Payload::from(payload),
        }
    }

    pub(crate) fn parent(&self) -> Result<Slot, Error> {
        let slot = self.common_header.slot;
        let parent_offset = self.data_header.parent_offset;
        if parent_offset == 0 && slot != 0 {
            return Err(Error::InvalidParentOffset {
                slot,
                parent_offset,
            });
        }
        slot.checked_sub(Slot::from(parent_offset))
            .ok_or(Error::InvalidParentOffset {
                slot,
                parent_offset,
            })
    }

    pub(crate) fn data(&self) -> Result<&[u8], Error> {
        let size = usize::from(self.data_header.size);
        self.payload
            .get(SIZE_OF_DATA_SHRED_HEADERS..size)
            .ok_or(Error::InvalidDataSize {
                size: self.data_header.size,
                payload: self.payload.len(),
            })
    }

    pub(crate) fn last_in_slot(&self) -> bool {
        self.data_header
            .flags
            .contains(ShredFlags::LAST_SHRED_IN_SLOT)
    }

    pub(crate) fn data_complete(&self) -> bool {
        self.data_header
            .flags
            .contains(ShredFlags::DATA_COMPLETE_SHRED)
    }

    pub(crate) fn reference_tick(&self) -> u8 {
        (self.data_header.flags & ShredFlags::SHRED_TICK_REFERENCE_MASK).bits()
    }

    fn merkle_root(&self) -> Result<Hash, Error> {
        read_merkle_root(&self.payload, self.common_header.shred_variant)
    }

    fn chained_merkle_root(&self) -> Result<Hash, Error> {
        read_chained_merkle_root(&self.payload, self.common_header.shred_variant)
    }

    fn signed_data(&self) -> Result<SignedData, Error> {
        if self.common_header.shred_variant.is_merkle() {
            self.merkle_root().map(SignedData::MerkleRoot)
        } else {
            Ok(SignedData::Chunk(&self.payload[SIZE_OF_SIGNATURE..]))
        }
    }

    fn set_signature(&mut self, signature: Signature) {
        self.payload.0[..SIZE_OF_SIGNATURE].copy_from_slice(signature.as_ref());
        self.common_header.signature = signature;
    }

    pub(crate) fn erasure_shard_index(&self) -> Result<usize, Error> {
        let index = self
            .common_header
            .index
            .checked_sub(self.common_header.fec_set_index)
            .ok_or(Error::InvalidErasureShardIndex(usize::MAX))?;
        Ok(index as usize)
    }

    // The erasure code covers whole data shred payloads, so the shard is
    // the payload itself.
    pub(crate) fn erasure_shard(&self) -> Result<&[u8], Error> {
        if self.payload.len() != SIZE_OF_PAYLOAD {
            return Err(Error::InvalidPayloadSize(self.payload.len()));
        }
        Ok(&self.payload)
    }

    pub(crate) fn sanitize(&self) -> Result<(), Error> {
        if self.payload.len() != expected_payload_size(self.common_header.shred_variant) {
            return Err(Error::InvalidPayloadSize(self.payload.len()));
        }
        let shred_index = self.common_header.index;
        if shred_index >= MAX_DATA_SHREDS_PER_SLOT as u32 {
            return Err(Error::InvalidShredIndex(ShredType::Data, shred_index));
        }
        if self.common_header.fec_set_index > shred_index {
            return Err(Error::InvalidErasureShardIndex(shred_index as usize));
        }
        let flags = self.data_header.flags;
        if flags.intersects(ShredFlags::LAST_SHRED_IN_SLOT)
            && !flags.contains(ShredFlags::DATA_COMPLETE_SHRED)
        {
            return Err(Error::InvalidShredFlags(self.data_header.flags.bits()));
        }
        let size = usize::from(self.data_header.size);
        let capacity = data_shred_capacity(match self.common_header.shred_variant {
            ShredVariant::LegacyData => None,
            ShredVariant::MerkleData { chained } => Some(chained),
            _ => return Err(Error::InvalidShredVariant),
        });
        if size < SIZE_OF_DATA_SHRED_HEADERS || size > SIZE_OF_DATA_SHRED_HEADERS + capacity {
            return Err(Error::InvalidDataSize {
                size: self.data_header.size,
                payload: self.payload.len(),
            });
        }
        let _parent = self.parent()?;
        Ok(())
    }
}

impl ShredCode {
    #[inline]
    fn common_header(&self) -> &ShredCommonHeader {
        &self.common_header
    }

    #[inline]
    pub(crate) fn payload(&self) -> &Payload {
        &self.payload
    }

    pub(crate) fn into_payload(self) -> Payload {
        self.payload
    }

    pub(crate) fn from_payload(payload: Payload) -> Result<Self, Error> {
        let mut cursor = std::io::Cursor::new(payload.as_ref());
        let common_header: ShredCommonHeader = bincode::deserialize_from(&mut cursor)?;
        if !matches!(
            common_header.shred_variant,
            ShredVariant::LegacyCode | ShredVariant::MerkleCode { .. }
        ) {
            return Err(Error::InvalidShredVariant);
        }
        let coding_header = bincode::deserialize_from(&mut cursor)?;
        let shred = Self {
            common_header,
            coding_header,
            payload,
        };
        shred.sanitize().map(|_| shred)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_from_parity_shard(
        slot: Slot,
        index: u32,
        parity_shard: &[u8],
        fec_set_index: u32,
        num_data_shreds: u16,
        num_coding_shreds: u16,
        position: u16,
        version: u16,
    ) -> Self {
        let common_header = ShredCommonHeader {
            signature: Signature::default(),
            shred_variant: ShredVariant::LegacyCode,
            slot,
            index,
            version,
            fec_set_index,
        };
        let coding_header = CodingShredHeader {
            num_data_shreds,
            num_coding_shreds,
            position,
        };
        let mut payload = vec![0; coding_shred_payload_size(None)];
        let mut cursor = std::io::Cursor::new(&mut payload[..]);
        bincode::serialize_into(&mut cursor, &common_header).unwrap();
        bincode::serialize_into(&mut cursor, &coding_header).unwrap();
        payload[SIZE_OF_CODING_SHRED_HEADERS..SIZE_OF_CODING_SHRED_HEADERS + parity_shard.len()]
            .copy_from_slice(parity_shard);
        Self {
            common_header,
            coding_header,
            payload: Payload::from(payload),
        }
    }

    pub(crate) fn num_data_shreds(&self) -> u16 {
        self.coding_header.num_data_shreds
    }

    pub(crate) fn num_coding_shreds(&self) -> u16 {
        self.coding_header.num_coding_shreds
    }

    fn merkle_root(&self) -> Result<Hash, Error> {
        read_merkle_root(&self.payload, self.common_header.shred_variant)
    }

    fn chained_merkle_root(&self) -> Result<Hash, Error> {
        read_chained_merkle_root(&self.payload, self.common_header.shred_variant)
    }

    fn signed_data(&self) -> Result<SignedData, Error> {
        if self.common_header.shred_variant.is_merkle() {
            self.merkle_root().map(SignedData::MerkleRoot)
        } else {
            Ok(SignedData::Chunk(&self.payload[SIZE_OF_SIGNATURE..]))
        }
    }

    fn set_signature(&mut self, signature: Signature) {
        self.payload.0[..SIZE_OF_SIGNATURE].copy_from_slice(signature.as_ref());
        self.common_header.signature = signature;
    }

    pub(crate) fn erasure_shard_index(&self) -> Result<usize, Error> {
        let position = usize::from(self.coding_header.position);
        let num_data_shreds = usize::from(self.coding_header.num_data_shreds);
        Ok(num_data_shreds + position)
    }

    // The parity shard protected by the erasure code; stored right after
    // the coding headers.
    pub(crate) fn erasure_shard(&self) -> Result<&[u8], Error> {
        self.payload
            .get(SIZE_OF_CODING_SHRED_HEADERS..SIZE_OF_CODING_SHRED_HEADERS + SIZE_OF_PAYLOAD)
            .ok_or(Error::InvalidPayloadSize(self.payload.len()))
    }

    pub(crate) fn sanitize(&self) -> Result<(), Error> {
        if self.payload.len() != expected_payload_size(self.common_header.shred_variant) {
            return Err(Error::InvalidPayloadSize(self.payload.len()));
        }
        let shred_index = self.common_header.index;
        if shred_index >= MAX_CODE_SHREDS_PER_SLOT as u32 {
            return Err(Error::InvalidShredIndex(ShredType::Code, shred_index));
        }
        let CodingShredHeader {
            num_data_shreds,
            num_coding_shreds,
            position,
        } = self.coding_header;
        if num_coding_shreds == 0 || num_data_shreds == 0 {
            return Err(Error::InvalidNumCodingShreds(num_coding_shreds));
        }
        if position >= num_coding_shreds {
            return Err(Error::InvalidNumCodingShreds(position));
        }
        // An erasure batch cannot exceed the Galois(8) field size.
        if usize::from(num_data_shreds) + usize::from(num_coding_shreds) > 256 {
            return Err(Error::InvalidNumCodingShreds(num_coding_shreds));
        }
        // Coding shred indices are anchored at the erasure set index.
        let expected_index = self
            .common_header
            .fec_set_index
            .checked_add(u32::from(position));
        if expected_index != Some(shred_index) {
            return Err(Error::InvalidErasureShardIndex(shred_index as usize));
        }
        Ok(())
    }
}

// Serializes the headers of a Merkle data shred into `writer`; the
// shredder owns payload assembly around them.
#[allow(clippy::too_many_arguments)]
pub(crate) fn write_data_shred_headers<W: std::io::Write>(
    writer: &mut W,
    slot: Slot,
    index: u32,
    version: u16,
    fec_set_index: u32,
    parent_offset: u16,
    flags: ShredFlags,
    size: u16,
    chained: bool,
) -> Result<(), Error> {
    let common_header = ShredCommonHeader {
        signature: Signature::default(),
        shred_variant: ShredVariant::MerkleData { chained },
        slot,
        index,
        version,
        fec_set_index,
    };
    let data_header = DataShredHeader {
        parent_offset,
        flags,
        size,
    };
    bincode::serialize_into(&mut *writer, &common_header)?;
    bincode::serialize_into(writer, &data_header)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn write_coding_shred_headers<W: std::io::Write>(
    writer: &mut W,
    slot: Slot,
    index: u32,
    version: u16,
    fec_set_index: u32,
    num_data_shreds: u16,
    num_coding_shreds: u16,
    position: u16,
    chained: bool,
) -> Result<(), Error> {
    let common_header = ShredCommonHeader {
        signature: Signature::default(),
        shred_variant: ShredVariant::MerkleCode { chained },
        slot,
        index,
        version,
        fec_set_index,
    };
    let coding_header = CodingShredHeader {
        num_data_shreds,
        num_coding_shreds,
        position,
    };
    bincode::serialize_into(&mut *writer, &common_header)?;
    bincode::serialize_into(writer, &coding_header)?;
    Ok(())
}

pub mod layout {
    //! Accessors into raw serialized shred payloads.
    use super::*;

    fn get_shred_size(shred: &[u8]) -> Option<usize> {
        (shred.len() >= SIZE_OF_COMMON_SHRED_HEADER).then_some(shred.len())
    }

    pub fn get_signature(shred: &[u8]) -> Option<Signature> {
        let bytes = shred.get(..SIZE_OF_SIGNATURE)?;
        Signature::try_from(bytes).ok()
    }

    pub(crate) fn get_shred_variant(shred: &[u8]) -> Result<ShredVariant, Error> {
        let Some(&shred_variant) = shred.get(OFFSET_OF_SHRED_VARIANT) else {
            return Err(Error::InvalidPayloadSize(shred.len()));
        };
        ShredVariant::try_from(shred_variant)
    }

    #[inline]
    pub fn get_shred_type(shred: &[u8]) -> Result<ShredType, Error> {
        get_shred_variant(shred).map(ShredType::from)
    }

    #[inline]
    pub fn get_slot(shred: &[u8]) -> Option<Slot> {
        let bytes = shred.get(OFFSET_OF_SHRED_SLOT..OFFSET_OF_SHRED_SLOT + 8)?;
        Some(Slot::from_le_bytes(bytes.try_into().unwrap()))
    }

    #[inline]
    pub fn get_index(shred: &[u8]) -> Option<u32> {
        let bytes = shred.get(OFFSET_OF_SHRED_INDEX..OFFSET_OF_SHRED_INDEX + 4)?;
        Some(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    #[inline]
    pub fn get_version(shred: &[u8]) -> Option<u16> {
        let bytes = shred.get(OFFSET_OF_SHRED_VERSION..OFFSET_OF_SHRED_VERSION + 2)?;
        Some(u16::from_le_bytes(bytes.try_into().unwrap()))
    }

    #[inline]
    pub fn get_fec_set_index(shred: &[u8]) -> Option<u32> {
        let bytes = shred.get(OFFSET_OF_FEC_SET_INDEX..OFFSET_OF_FEC_SET_INDEX + 4)?;
        Some(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn get_parent_offset(shred: &[u8]) -> Option<u16> {
        debug_assert_matches!(get_shred_type(shred), Ok(ShredType::Data));
        let bytes = shred.get(OFFSET_OF_PARENT_OFFSET..OFFSET_OF_PARENT_OFFSET + 2)?;
        Some(u16::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn get_flags(shred: &[u8]) -> Result<ShredFlags, Error> {
        debug_assert_matches!(get_shred_type(shred), Ok(ShredType::Data));
        let Some(&flags) = shred.get(OFFSET_OF_SHRED_FLAGS) else {
            return Err(Error::InvalidPayloadSize(shred.len()));
        };
        ShredFlags::from_bits(flags).ok_or(Error::InvalidShredFlags(flags))
    }

    pub fn get_shred_id(shred: &[u8]) -> Option<ShredId> {
        Some(ShredId(
            get_slot(shred)?,
            get_index(shred)?,
            get_shred_type(shred).ok()?,
        ))
    }

    pub fn get_merkle_root(shred: &[u8]) -> Option<Hash> {
        let variant = get_shred_variant(shred).ok()?;
        get_shred_size(shred)?;
        read_merkle_root(shred, variant).ok()
    }

    pub fn get_chained_merkle_root(shred: &[u8]) -> Option<Hash> {
        let variant = get_shred_variant(shred).ok()?;
        get_shred_size(shred)?;
        read_chained_merkle_root(shred, variant).ok()
    }
}

/// Recovers the missing shreds of an erasure set from the given subset
/// of its shreds.
///
/// Data shards cover whole data shred payloads, so recovered data shreds
/// are byte-identical to the originals. Missing coding shreds are rebuilt
/// for Merkle variants (whose signature is shared across the batch) so
/// they can be retransmitted; legacy coding shreds carry per-shred
/// signatures and cannot be reproduced.
pub fn recover(
    shreds: Vec<Shred>,
    reed_solomon_cache: &ReedSolomonCache,
) -> Result<Vec<Shred>, Error> {
    use reed_solomon_erasure::Error::TooFewParityShards;
    let Some(code) = shreds.iter().find_map(|shred| match shred {
        Shred::ShredCode(code) => Some(code),
        Shred::ShredData(_) => None,
    }) else {
        return Err(Error::from(TooFewParityShards));
    };
    let common_header = *code.common_header();
    let coding_header = code.coding_header;
    let chained = match common_header.shred_variant {
        ShredVariant::MerkleCode { chained } => Some(chained),
        ShredVariant::LegacyCode => None,
        _ => return Err(Error::InvalidShredVariant),
    };
    let merkle_root = code.merkle_root().ok();
    let chained_merkle_root = code.chained_merkle_root().ok();
    let num_data_shreds = usize::from(coding_header.num_data_shreds);
    let num_coding_shreds = usize::from(coding_header.num_coding_shreds);
    let num_shards = num_data_shreds + num_coding_shreds;
    let (slot, fec_set_index) = (common_header.slot, common_header.fec_set_index);

    let mut shards: Vec<Option<Vec<u8>>> = vec![None; num_shards];
    let mut payloads: Vec<Option<Payload>> = vec![None; num_shards];
    for shred in shreds {
        if shred.slot() != slot
            || shred.fec_set_index() != fec_set_index
            || shred.version() != common_header.version
        {
            return Err(Error::InvalidRecoveredShred);
        }
        if let Shred::ShredCode(code_shred) = &shred {
            if code_shred.num_data_shreds() != coding_header.num_data_shreds
                || code_shred.num_coding_shreds() != coding_header.num_coding_shreds
            {
                return Err(Error::InvalidErasureConfig);
            }
        }
        // The leader signs the Merkle root and shreds in the same erasure
        // batch have the same Merkle root. So the signatures are the same
        // or shreds are not from the same erasure batch.
        if chained.is_some() && shred.signature() != &common_header.signature {
            return Err(Error::InvalidMerkleRoot);
        }
        let index = shred.erasure_shard_index()?;
        if index >= num_shards {
            return Err(Error::InvalidErasureShardIndex(index));
        }
        if shards[index].is_some() {
            continue;
        }
        shards[index] = Some(shred.erasure_shard()?.to_vec());
        payloads[index] = Some(shred.into_payload());
    }
    reed_solomon_cache
        .get(num_data_shreds, num_coding_shreds)?
        .reconstruct(&mut shards)?;

    let mut recovered = Vec::new();
    for (index, shard) in shards.iter().enumerate() {
        if payloads[index].is_some() {
            continue;
        }
        let shard = shard.as_ref().ok_or(Error::InvalidRecoveredShred)?;
        if index < num_data_shreds {
            let shred = Shred::new_from_serialized_shred(shard.clone())?;
            if !shred.is_data()
                || shred.slot() != slot
                || shred.fec_set_index() != fec_set_index
                || shred.erasure_shard_index()? != index
            {
                return Err(Error::InvalidRecoveredShred);
            }
            payloads[index] = Some(shred.payload().clone());
            recovered.push(shred);
        } else if chained.is_some() {
            let position = u16::try_from(index - num_data_shreds).unwrap();
            let header = ShredCommonHeader {
                index: fec_set_index + u32::from(position),
                ..common_header
            };
            let mut payload = Vec::with_capacity(coding_shred_payload_size(chained));
            bincode::serialize_into(&mut payload, &header)?;
            bincode::serialize_into(
                &mut payload,
                &CodingShredHeader {
                    position,
                    ..coding_header
                },
            )?;
            payload.extend_from_slice(shard);
            if chained == Some(true) {
                let root = chained_merkle_root.ok_or(Error::InvalidMerkleRoot)?;
                payload.extend_from_slice(root.as_ref());
            }
            payload.extend_from_slice(merkle_root.ok_or(Error::InvalidMerkleRoot)?.as_ref());
            let shred = Shred::new_from_serialized_shred(payload)?;
            payloads[index] = Some(shred.payload().clone());
            recovered.push(shred);
        }
    }
    // For Merkle variants the reconstructed batch must reproduce the
    // Merkle root carried on the received shreds; the attached signature
    // then verifies for the recovered shreds as well.
    if let Some(root) = merkle_root {
        let nodes = payloads
            .iter()
            .map(|payload| payload.as_ref().map(|payload| merkle_node(payload)))
            .collect::<Option<Vec<Hash>>>()
            .ok_or(Error::InvalidRecoveredShred)?;
        let tree = make_merkle_tree(nodes);
        if tree.last() != Some(&root) {
            return Err(Error::InvalidMerkleRoot);
        }
    }
    Ok(recovered)
}

/// Helper to verify that the parent slot of a shred's slot is acceptable
/// with respect to the current root.
pub fn verify_shred_slots(slot: Slot, parent: Slot, root: Slot) -> bool {
    if slot == 0 && parent == 0 && root == 0 {
        return true; // valid write to slot zero.
    }
    // Ignore shreds that chain to slots before the root,
    // or have invalid parent >= slot.
    root <= parent && parent < slot
}

impl fmt::Display for ShredType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ShredType::Data => write!(f, "data"),
            ShredType::Code => write!(f, "code"),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        assert_matches::assert_matches,
        bincode::serialized_size,
        rand::Rng,
    };

    #[test]
    fn test_shred_constants() {
        let common_header = ShredCommonHeader {
            signature: Signature::default(),
            shred_variant: ShredVariant::LegacyData,
            slot: 0,
            index: 0,
            version: 0,
            fec_set_index: 0,
        };
        let data_header = DataShredHeader {
            parent_offset: 0,
            flags: ShredFlags::empty(),
            size: 0,
        };
        let coding_header = CodingShredHeader {
            num_data_shreds: 0,
            num_coding_shreds: 0,
            position: 0,
        };
        assert_eq!(
            SIZE_OF_COMMON_SHRED_HEADER,
            serialized_size(&common_header).unwrap() as usize
        );
        assert_eq!(
            SIZE_OF_DATA_SHRED_HEADERS - SIZE_OF_COMMON_SHRED_HEADER,
            serialized_size(&data_header).unwrap() as usize
        );
        assert_eq!(
            SIZE_OF_CODING_SHRED_HEADERS - SIZE_OF_COMMON_SHRED_HEADER,
            serialized_size(&coding_header).unwrap() as usize
        );
    }

    #[test]
    fn test_shred_variant_compat() {
        assert_matches!(ShredVariant::try_from(0x5a), Ok(ShredVariant::LegacyCode));
        assert_matches!(ShredVariant::try_from(0xa5), Ok(ShredVariant::LegacyData));
        assert_matches!(
            ShredVariant::try_from(0x60),
            Ok(ShredVariant::MerkleCode { chained: false })
        );
        assert_matches!(
            ShredVariant::try_from(0x70),
            Ok(ShredVariant::MerkleCode { chained: true })
        );
        assert_matches!(
            ShredVariant::try_from(0x90),
            Ok(ShredVariant::MerkleData { chained: false })
        );
        assert_matches!(
            ShredVariant::try_from(0xb0),
            Ok(ShredVariant::MerkleData { chained: true })
        );
        assert_matches!(ShredVariant::try_from(0x00), Err(Error::InvalidShredVariant));
        for variant in [
            ShredVariant::LegacyCode,
            ShredVariant::LegacyData,
            ShredVariant::MerkleCode { chained: false },
            ShredVariant::MerkleCode { chained: true },
            ShredVariant::MerkleData { chained: false },
            ShredVariant::MerkleData { chained: true },
        ] {
            assert_eq!(ShredVariant::try_from(u8::from(variant)).unwrap(), variant);
            assert_eq!(ShredType::from(variant), {
                if matches!(
                    variant,
                    ShredVariant::LegacyCode | ShredVariant::MerkleCode { .. }
                ) {
                    ShredType::Code
                } else {
                    ShredType::Data
                }
            });
        }
    }

    #[test]
    fn test_legacy_data_shred_round_trip() {
        let data: Vec<u8> = (0..100).collect();
        let shred = ShredData::new_from_data(
            7,   // slot
            3,   // index
            2,   // parent_offset
            &data,
            ShredFlags::DATA_COMPLETE_SHRED,
            5,  // reference_tick
            1,  // version
            3,  // fec_set_index
        );
        let shred = Shred::from(shred);
        assert_eq!(shred.slot(), 7);
        assert_eq!(shred.index(), 3);
        assert_eq!(shred.parent().unwrap(), 5);
        assert_eq!(shred.fec_set_index(), 3);
        assert_eq!(shred.reference_tick(), 5);
        assert!(shred.data_complete());
        assert!(!shred.last_in_slot());
        assert_matches!(shred.merkle_root(), Err(Error::InvalidShredVariant));

        let parsed = Shred::new_from_serialized_shred(shred.payload().clone()).unwrap();
        assert_eq!(parsed, shred);
        let Shred::ShredData(data_shred) = &parsed else {
            panic!("expected data shred");
        };
        assert_eq!(data_shred.data().unwrap(), &data[..]);
    }

    #[test]
    fn test_legacy_shred_verify() {
        let keypair = Keypair::new();
        let mut shred = Shred::from(ShredData::new_from_data(
            7,
            3,
            2,
            &[1, 2, 3],
            ShredFlags::empty(),
            0,
            0,
            3,
        ));
        assert!(!shred.verify(&keypair.pubkey()));
        shred.sign(&keypair);
        assert!(shred.verify(&keypair.pubkey()));
        assert!(!shred.verify(&Pubkey::new_unique()));
    }

    #[test]
    fn test_sanitize_data_shred() {
        let shred = ShredData::new_from_data(
            5,
            u32::try_from(MAX_DATA_SHREDS_PER_SLOT).unwrap(),
            1,
            &[],
            ShredFlags::empty(),
            0,
            0,
            0,
        );
        assert_matches!(
            shred.sanitize(),
            Err(Error::InvalidShredIndex(ShredType::Data, _))
        );

        // LAST_SHRED_IN_SLOT without DATA_COMPLETE_SHRED.
        let mut shred = ShredData::new_from_data(5, 3, 1, &[], ShredFlags::empty(), 0, 0, 2);
        shred.data_header.flags = ShredFlags::from_bits_retain(0b1000_0000);
        assert_matches!(shred.sanitize(), Err(Error::InvalidShredFlags(_)));

        // Non-zero slot requires non-zero parent offset.
        let shred = ShredData::new_from_data(5, 3, 0, &[], ShredFlags::empty(), 0, 0, 2);
        assert_matches!(shred.sanitize(), Err(Error::InvalidParentOffset { .. }));

        // Genesis: slot zero, parent offset zero is fine.
        let shred = ShredData::new_from_data(0, 0, 0, &[], ShredFlags::empty(), 0, 0, 0);
        assert_matches!(shred.sanitize(), Ok(()));
        assert_eq!(shred.parent().unwrap(), 0);
    }

    #[test]
    fn test_sanitize_coding_shred() {
        let parity = vec![0u8; SIZE_OF_PAYLOAD];
        let shred =
            ShredCode::new_from_parity_shard(1, 12, &parity, 10, 30, 4, 2, 0);
        assert_matches!(shred.sanitize(), Ok(()));
        assert_eq!(shred.erasure_shard_index().unwrap(), 32);

        // Index must equal fec_set_index + position.
        let shred = ShredCode::new_from_parity_shard(1, 13, &parity, 10, 30, 4, 2, 0);
        assert_matches!(shred.sanitize(), Err(Error::InvalidErasureShardIndex(_)));

        // Position must stay within num_coding_shreds.
        let shred = ShredCode::new_from_parity_shard(1, 14, &parity, 10, 30, 4, 4, 0);
        assert_matches!(shred.sanitize(), Err(Error::InvalidNumCodingShreds(4)));
    }

    #[test]
    fn test_merkle_tree_root_changes_with_leaves() {
        let mut rng = rand::thread_rng();
        let nodes: Vec<Hash> = (0..9).map(|_| Hash::new_unique()).collect();
        let tree = make_merkle_tree(nodes.clone());
        let root = *tree.last().unwrap();
        // Tamper with one leaf and the root must change.
        let k = rng.gen_range(0..nodes.len());
        let mut other = nodes;
        other[k] = Hash::new_unique();
        let other_tree = make_merkle_tree(other);
        assert_ne!(Some(&root), other_tree.last());
    }

    #[test]
    fn test_layout_accessors() {
        let shred = ShredData::new_from_data(
            42,
            11,
            3,
            &[17; 24],
            ShredFlags::LAST_SHRED_IN_SLOT,
            63,
            2,
            9,
        );
        let payload = shred.payload().clone();
        assert_eq!(layout::get_slot(&payload), Some(42));
        assert_eq!(layout::get_index(&payload), Some(11));
        assert_eq!(layout::get_version(&payload), Some(2));
        assert_eq!(layout::get_fec_set_index(&payload), Some(9));
        assert_eq!(layout::get_parent_offset(&payload), Some(3));
        assert_matches!(layout::get_shred_type(&payload), Ok(ShredType::Data));
        assert_eq!(
            layout::get_shred_id(&payload),
            Some(ShredId::new(42, 11, ShredType::Data))
        );
        let flags = layout::get_flags(&payload).unwrap();
        assert!(flags.contains(ShredFlags::LAST_SHRED_IN_SLOT));
        assert_eq!((flags & ShredFlags::SHRED_TICK_REFERENCE_MASK).bits(), 63);
        assert_eq!(layout::get_merkle_root(&payload), None);
        // Unsigned shreds carry a default signature.
        assert_eq!(layout::get_signature(&payload), Some(Signature::default()));
    }

    #[test]
    fn test_verify_shred_slots() {
        // verify_shred_slots(slot, parent, root)
        assert!(verify_shred_slots(0, 0, 0));
        assert!(verify_shred_slots(2, 1, 0));
        assert!(verify_shred_slots(2, 1, 1));
        assert!(!verify_shred_slots(2, 2, 0));
        assert!(!verify_shred_slots(2, 3, 0));
        assert!(!verify_shred_slots(2, 1, 2));
    }
}
