// Arena-based storage for owner instances
//
// One global slab holds OwnerMetadata (slots, staged render, committed queue,
// flush phase). OwnerId is a lightweight (index, generation) pair that indexes
// into the slab and goes stale when the owner is destroyed.
//
// A second structure, the pending set, records which owners have committed
// work waiting for a flush so that flush_effects() only visits those.

pub mod owner_arena;

pub use owner_arena::{FlushPhase, OwnerId, pending_owners_count};

pub(crate) use owner_arena::{
    EffectSlot, OwnerMetadata, OwnerState, PhaseGuard, mark_owner_pending, owner_arena_insert,
    owner_arena_remove, remove_from_pending_set, take_pending_owners,
};
