//! Chain timekeeping units.

/// The unit of time a given leader schedule is honored.
pub type Slot = u64;

/// An approximate measure of real-world time, expressed as Unix time
/// (i.e. seconds since the Unix epoch).
pub type UnixTimestamp = i64;

/// The number of ticks in a second.
pub const DEFAULT_TICKS_PER_SECOND: u64 = 160;

pub const DEFAULT_TICKS_PER_SLOT: u64 = 64;

pub const MS_PER_TICK: u64 = 1000 / DEFAULT_TICKS_PER_SECOND;

pub const DEFAULT_MS_PER_SLOT: u64 = 1000 * DEFAULT_TICKS_PER_SLOT / DEFAULT_TICKS_PER_SECOND;
