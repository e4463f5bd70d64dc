// Owner arena - storage for owner instances and their effect slots
//
// Every owner lives in one global slab. An owner holds:
// - slots: the positional arena of EffectSlots, index = registration order
// - staged: registrations of the render currently in progress
// - queue: committed cleanup/run tasks waiting for a flush
// - phase: where the owner is in its flush cycle (Idle/CollectingCleanups/RunningEffects)
// - turn: a re-entrant lock that serialises flushes and destruction of one owner
//
// OwnerIds carry a generation so that a slab index reused by a newer owner is
// never reachable through a stale id.
//
// Lock order: OWNER_ARENA -> OwnerMetadata::state -> PENDING_OWNERS.
// User callbacks are never invoked while any of these is held, and user values
// (bodies, deps) are never dropped under them either: a dropped body may own
// an Owner, and Owner::drop takes the arena write lock.

use crate::deps::Deps;
use crate::effect::Cleanup;
use crate::error::ErrorHandler;
use crate::queue::{Discarded, EffectQueue, StagedEffect};
use foldhash::fast::FixedState;
use indexmap::IndexSet;
use parking_lot::{Mutex, MutexGuard, ReentrantMutex, RwLock};
use slab::Slab;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, LazyLock};

/// Position of an owner within its flush cycle.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushPhase {
    /// No flush is running.
    Idle = 0,
    /// Queued cleanups are being invoked.
    CollectingCleanups = 1,
    /// Queued effect bodies are being invoked.
    RunningEffects = 2,
}

impl FlushPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => FlushPhase::Idle,
            1 => FlushPhase::CollectingCleanups,
            _ => FlushPhase::RunningEffects,
        }
    }
}

/// One effect call site of one owner.
pub(crate) struct EffectSlot {
    /// Dependencies committed by the most recent render.
    pub(crate) deps: Deps,
    /// Cleanup returned by the last successful run.
    pub(crate) cleanup: Option<Cleanup>,
    /// A committed run for this slot has not been flushed yet.
    pub(crate) pending_run: bool,
}

impl EffectSlot {
    pub(crate) fn new(deps: Deps) -> Self {
        Self {
            deps,
            cleanup: None,
            pending_run: false,
        }
    }
}

/// Mutable per-owner bookkeeping, guarded by one mutex.
#[derive(Default)]
pub(crate) struct OwnerState {
    pub(crate) slots: Vec<EffectSlot>,
    pub(crate) staged: Vec<StagedEffect>,
    pub(crate) queue: EffectQueue,
    pub(crate) committed_renders: u64,
}

impl OwnerState {
    /// Move all work that has not run yet into `bin`.
    pub(crate) fn discard_pending(&mut self, bin: &mut Discarded) {
        bin.staged.append(&mut self.staged);
        bin.queues.push(std::mem::take(&mut self.queue));
        for slot in &mut self.slots {
            slot.pending_run = false;
        }
    }
}

/// Metadata for one owner instance stored in the arena.
pub(crate) struct OwnerMetadata {
    generation: u32,
    pub(crate) label: Option<Arc<str>>,
    pub(crate) on_error: Option<ErrorHandler>,
    pub(crate) turn: Arc<ReentrantMutex<()>>,
    phase: AtomicU8,
    halted: AtomicBool,
    pub(crate) state: Mutex<OwnerState>,
}

impl OwnerMetadata {
    pub(crate) fn new(label: Option<Arc<str>>, on_error: Option<ErrorHandler>) -> Self {
        Self {
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            label,
            on_error,
            turn: Arc::new(ReentrantMutex::new(())),
            phase: AtomicU8::new(FlushPhase::Idle as u8),
            halted: AtomicBool::new(false),
            state: Mutex::new(OwnerState::default()),
        }
    }

    pub(crate) fn phase(&self) -> FlushPhase {
        FlushPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: FlushPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub(crate) fn halt(&self) {
        self.halted.store(true, Ordering::Release);
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, OwnerState> {
        self.state.lock()
    }
}

/// Global owner arena
static OWNER_ARENA: RwLock<Slab<OwnerMetadata>> = RwLock::new(Slab::new());

// Owners with committed, unflushed work, in commit order.
static PENDING_OWNERS: LazyLock<Mutex<IndexSet<OwnerId, FixedState>>> =
    LazyLock::new(|| Mutex::new(IndexSet::default()));

// Generation 0 is never handed out.
static NEXT_GENERATION: AtomicU32 = AtomicU32::new(1);

/// Identifier of an owner instance.
///
/// Copyable and cheap. Once the owner is destroyed every operation on the id
/// becomes a no-op (or returns [`UsageError::UnknownOwner`](crate::UsageError)).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct OwnerId {
    index: u32,
    generation: u32,
}

impl OwnerId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    fn index(self) -> usize {
        self.index as usize
    }

    /// Access the owner metadata with a closure.
    ///
    /// Returns None if the owner was destroyed (stale access).
    pub(crate) fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&OwnerMetadata) -> R,
    {
        let arena = OWNER_ARENA.read();
        arena
            .get(self.index())
            .filter(|meta| meta.generation == self.generation)
            .map(f)
    }

    /// Access the locked owner state with a closure.
    pub(crate) fn with_state<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&mut OwnerState) -> R,
    {
        self.with(|meta| f(&mut meta.lock_state()))
    }

    /// Whether the owner still exists.
    pub fn is_alive(self) -> bool {
        self.with(|_| ()).is_some()
    }

    /// Current flush phase; `Idle` for destroyed owners.
    pub fn phase(self) -> FlushPhase {
        self.with(OwnerMetadata::phase).unwrap_or(FlushPhase::Idle)
    }

    /// Whether a usage error halted this owner.
    pub fn is_halted(self) -> bool {
        self.with(OwnerMetadata::is_halted).unwrap_or(false)
    }

    /// The turn lock of this owner, if it exists.
    pub(crate) fn turn(self) -> Option<Arc<ReentrantMutex<()>>> {
        self.with(|meta| meta.turn.clone())
    }

    pub(crate) fn error_handler(self) -> Option<ErrorHandler> {
        self.with(|meta| meta.on_error.clone()).flatten()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Insert owner metadata into the arena and return its ID
pub(crate) fn owner_arena_insert(metadata: OwnerMetadata) -> OwnerId {
    let generation = metadata.generation;
    let mut arena = OWNER_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(metadata);
    OwnerId::new(key as u32, generation)
}

/// Remove an owner from the arena. Stale ids return None.
pub(crate) fn owner_arena_remove(id: OwnerId) -> Option<OwnerMetadata> {
    let metadata = {
        let mut arena = OWNER_ARENA.write();
        let current = arena
            .get(id.index())
            .is_some_and(|meta| meta.generation == id.generation);
        current.then(|| arena.remove(id.index()))
    };
    if metadata.is_some() {
        remove_from_pending_set(id);
    }
    metadata
}

/// Mark an owner as having committed work. Returns true if newly inserted.
pub(crate) fn mark_owner_pending(id: OwnerId) -> bool {
    PENDING_OWNERS.lock().insert(id)
}

/// Remove an owner from the pending set.
pub(crate) fn remove_from_pending_set(id: OwnerId) {
    PENDING_OWNERS.lock().shift_remove(&id);
}

/// Take all pending owner IDs, in commit order.
pub(crate) fn take_pending_owners() -> Vec<OwnerId> {
    PENDING_OWNERS.lock().drain(..).collect()
}

/// Number of owners waiting for a flush.
pub fn pending_owners_count() -> usize {
    PENDING_OWNERS.lock().len()
}

/// RAII guard that moves an owner into a flush phase and back to `Idle` on drop.
pub(crate) struct PhaseGuard {
    owner: OwnerId,
}

impl PhaseGuard {
    pub(crate) fn enter(owner: OwnerId, phase: FlushPhase) -> Self {
        owner.with(|meta| meta.set_phase(phase));
        Self { owner }
    }

    pub(crate) fn advance(&self, phase: FlushPhase) {
        self.owner.with(|meta| meta.set_phase(phase));
    }
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        self.owner.with(|meta| meta.set_phase(FlushPhase::Idle));
    }
}
