//! Slot to scheduled-leader lookup.
//!
//! Recovery verifies reconstructed shreds against the slot leader's key;
//! without a schedule the inserter skips recovery entirely.

use {
    std::collections::HashMap,
    trellis_sdk::{clock::Slot, pubkey::Pubkey},
};

#[derive(Clone, Debug, Default)]
pub struct LeaderScheduleCache {
    slot_leaders: HashMap<Slot, Pubkey>,
    // Fallback leader for slots absent from the map; primarily for tests
    // and single-node deployments.
    fixed_leader: Option<Pubkey>,
}

impl LeaderScheduleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A schedule that reports `leader` for every slot.
    pub fn new_fixed(leader: Pubkey) -> Self {
        Self {
            slot_leaders: HashMap::new(),
            fixed_leader: Some(leader),
        }
    }

    pub fn set_slot_leader(&mut self, slot: Slot, leader: Pubkey) {
        self.slot_leaders.insert(slot, leader);
    }

    pub fn slot_leader_at(&self, slot: Slot) -> Option<Pubkey> {
        self.slot_leaders
            .get(&slot)
            .copied()
            .or(self.fixed_leader)
    }
}
