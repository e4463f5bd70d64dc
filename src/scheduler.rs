use crate::arena::{
    FlushPhase, OwnerId, PhaseGuard, mark_owner_pending, owner_arena_remove,
    remove_from_pending_set, take_pending_owners,
};
use crate::effect::Cleanup;
use crate::error::{EffectError, ErrorHandler, UsageError, report};
use crate::queue::FlushBatch;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicBool, Ordering};

// Set when a commit queued work and no flush has happened since.
// Multiple commits only schedule one processing (automatic debouncing).
static PROCESSING_SCHEDULED: AtomicBool = AtomicBool::new(false);

/// Schedule effect processing without running anything yet
///
/// Called automatically when a render commits outside of a [`Commit`](crate::Commit).
/// Wakes the [`EffectLoop`](crate::EffectLoop) if one is running.
pub fn schedule_effect_processing() {
    PROCESSING_SCHEDULED.store(true, Ordering::Release);
    crate::executor::notify_effect_loop();
}

/// Check if effect processing is scheduled
///
/// Returns true if a render committed work after the last [`flush_effects`].
pub fn is_processing_scheduled() -> bool {
    PROCESSING_SCHEDULED.load(Ordering::Acquire)
}

pub(crate) fn clear_scheduled() {
    PROCESSING_SCHEDULED.store(false, Ordering::Release);
}

/// Counters describing what one or more flush cycles did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Cleanup callbacks invoked.
    pub cleanups: usize,
    /// Effect bodies invoked.
    pub runs: usize,
    /// Failures reported (bodies and cleanups).
    pub failures: usize,
    /// Owners skipped because they were already flushing on this thread.
    pub deferred: usize,
}

impl AddAssign for FlushStats {
    fn add_assign(&mut self, rhs: Self) {
        self.cleanups += rhs.cleanups;
        self.runs += rhs.runs;
        self.failures += rhs.failures;
        self.deferred += rhs.deferred;
    }
}

/// Result of flushing a single owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The committed queue was drained.
    Flushed(FlushStats),
    /// The owner is already flushing further up this thread's stack; its new
    /// work stays queued for the next cycle.
    Deferred,
}

/// Run one flush cycle for `owner`
///
/// Drains the committed queue: every queued cleanup in registration order,
/// then every queued body in registration order. Failures are isolated per
/// effect and delivered to the owner's error handler once the cycle ends.
///
/// Work queued while the cycle runs (an effect body re-rendering its own owner)
/// is left for the next cycle.
///
/// Blocks while another thread is flushing or destroying the same owner.
///
/// # Errors
/// [`UsageError::UnknownOwner`] if the owner does not exist.
pub fn flush_owner(owner: OwnerId) -> Result<FlushOutcome, UsageError> {
    let turn = owner.turn().ok_or(UsageError::UnknownOwner(owner))?;
    let _turn = turn.lock();

    let taken = owner.with(|meta| {
        if meta.phase() != FlushPhase::Idle {
            return None;
        }
        let mut state = meta.lock_state();
        let batch = state.queue.take();
        for (site, _) in &batch.runs {
            state.slots[*site].pending_run = false;
        }
        remove_from_pending_set(owner);
        Some((batch, meta.on_error.clone()))
    });

    match taken {
        None => Err(UsageError::UnknownOwner(owner)),
        Some(None) => {
            cov_mark::hit!(reentrant_flush_deferred);
            Ok(FlushOutcome::Deferred)
        }
        Some(Some((batch, _))) if batch.is_empty() => {
            Ok(FlushOutcome::Flushed(FlushStats::default()))
        }
        Some(Some((batch, handler))) => {
            Ok(FlushOutcome::Flushed(run_batch(owner, batch, handler)))
        }
    }
}

/// Execute one cycle: all cleanups, then all runs.
fn run_batch(owner: OwnerId, batch: FlushBatch, handler: Option<ErrorHandler>) -> FlushStats {
    let mut stats = FlushStats::default();
    let mut failures = Vec::new();

    let phase = PhaseGuard::enter(owner, FlushPhase::CollectingCleanups);
    for site in batch.cleanups {
        // Taking the cleanup out clears it before it runs
        let cleanup = owner
            .with_state(|state| state.slots.get_mut(site).and_then(|slot| slot.cleanup.take()))
            .flatten();
        let Some(cleanup) = cleanup else {
            continue;
        };
        stats.cleanups += 1;
        if let Err(failure) = cleanup.invoke() {
            failures.push(EffectError::Cleanup {
                owner,
                site,
                failure,
            });
        }
    }

    phase.advance(FlushPhase::RunningEffects);
    for (site, body) in batch.runs {
        if !owner.is_alive() {
            // Destroyed by an earlier body of this cycle
            cov_mark::hit!(runs_dropped_after_destroy);
            break;
        }
        stats.runs += 1;
        match body.invoke() {
            Ok(Some(cleanup)) => {
                if let Some(leftover) = store_cleanup(owner, site, cleanup) {
                    stats.cleanups += 1;
                    if let Err(failure) = leftover.invoke() {
                        failures.push(EffectError::Cleanup {
                            owner,
                            site,
                            failure,
                        });
                    }
                }
            }
            Ok(None) => {}
            Err(failure) => failures.push(EffectError::Body {
                owner,
                site,
                failure,
            }),
        }
    }
    drop(phase);

    stats.failures = failures.len();
    tracing::trace!(
        %owner,
        cleanups = stats.cleanups,
        runs = stats.runs,
        failures = stats.failures,
        "flush cycle complete"
    );
    report(handler.as_ref(), &failures);
    stats
}

/// Store a freshly returned cleanup on its slot.
///
/// Returns a cleanup the caller must run right away: the new one if the owner
/// is gone, or the one it displaced if the slot still held a cleanup.
fn store_cleanup(owner: OwnerId, site: usize, cleanup: Cleanup) -> Option<Cleanup> {
    let mut cleanup = Some(cleanup);
    let displaced = owner
        .with_state(|state| {
            let slot = state.slots.get_mut(site)?;
            std::mem::replace(&mut slot.cleanup, cleanup.take())
        })
        .flatten();
    match (cleanup, displaced) {
        (Some(orphan), _) => {
            cov_mark::hit!(orphan_cleanup_invoked);
            Some(orphan)
        }
        (None, Some(displaced)) => {
            cov_mark::hit!(displaced_cleanup_invoked);
            Some(displaced)
        }
        (None, None) => None,
    }
}

/// Process all pending effects immediately
///
/// Flushes every owner with committed work, in commit order, and repeats until
/// no owner has work left (fixed-point iteration), so effects that re-render
/// their owners are processed too. An effect that re-renders its owner on
/// every run therefore keeps this call busy; hosts that need a bound use
/// [`EffectLoop::max_cycles`](crate::EffectLoop::max_cycles).
///
/// # Example
///
/// ```
/// use hookflow::{deps, flush_effects, Owner};
///
/// let owner = Owner::new();
/// owner
///     .render(|scope| scope.use_effect(deps![], || println!("mounted")))
///     .unwrap();
///
/// let stats = flush_effects();
/// assert!(stats.runs >= 1);
/// ```
pub fn flush_effects() -> FlushStats {
    clear_scheduled();
    flush_cycles(None)
}

/// Fixed-point flush with an optional cap on the number of cycles.
pub(crate) fn flush_cycles(max_cycles: Option<usize>) -> FlushStats {
    let mut total = FlushStats::default();
    let mut deferred = Vec::new();
    let mut cycles = 0;

    loop {
        if max_cycles.is_some_and(|max| cycles >= max) {
            cov_mark::hit!(flush_cycle_limit_reached);
            break;
        }
        let pending = take_pending_owners();
        if pending.is_empty() {
            break;
        }

        let mut progressed = false;
        for owner in pending {
            match flush_owner(owner) {
                Ok(FlushOutcome::Flushed(stats)) => {
                    total += stats;
                    progressed = true;
                }
                Ok(FlushOutcome::Deferred) => {
                    total.deferred += 1;
                    deferred.push(owner);
                }
                // Destroyed after it was queued
                Err(_) => {}
            }
        }
        cycles += 1;
        if !progressed {
            break;
        }
    }

    for owner in deferred {
        mark_owner_pending(owner);
    }
    total
}

/// Terminal cleanup for an owner that is permanently removed
///
/// Runs every slot's current cleanup in registration order, with no run
/// phase; queued but unflushed bodies are dropped without running. Returns the
/// number of cleanups invoked. Calling it again, or with a stale id, does
/// nothing and returns 0.
pub fn notify_owner_destroyed(owner: OwnerId) -> usize {
    let Some(turn) = owner.turn() else {
        cov_mark::hit!(destroy_is_idempotent);
        return 0;
    };
    let _turn = turn.lock();

    let Some(metadata) = owner_arena_remove(owner) else {
        return 0;
    };
    let handler = metadata.on_error;
    let state = metadata.state.into_inner();
    drop(state.queue);

    let mut invoked = 0;
    let mut failures = Vec::new();
    for (site, slot) in state.slots.into_iter().enumerate() {
        let Some(cleanup) = slot.cleanup else {
            continue;
        };
        invoked += 1;
        if let Err(failure) = cleanup.invoke() {
            failures.push(EffectError::Cleanup {
                owner,
                site,
                failure,
            });
        }
    }

    tracing::trace!(%owner, cleanups = invoked, "owner destroyed");
    report(handler.as_ref(), &failures);
    invoked
}
