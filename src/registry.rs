//! Effect registry: staging registrations and committing renders.
//!
//! These are the raw, id-based entry points a host rendering system calls.
//! [`Owner`](crate::Owner) wraps them with automatic site numbering.

use crate::arena::{EffectSlot, OwnerId, OwnerMetadata, OwnerState, mark_owner_pending};
use crate::deps::{Deps, deps_changed};
use crate::effect::{EffectBody, IntoCleanup};
use crate::error::{EffectError, UsageError, report};
use crate::queue::{Discarded, StagedEffect};

/// Register the effect at `site` for the render of `owner` in progress.
///
/// Sites must be registered as `0, 1, 2, ...` in every render. Registering
/// site 0 while an uncommitted render is staged abandons that render.
///
/// The dependency comparison happens here, against the dependencies committed
/// by the previous render; the effect only becomes eligible to run once the
/// render is committed with [`notify_render_complete`].
///
/// # Errors
/// - [`UsageError::UnknownOwner`] if the owner was destroyed.
/// - [`UsageError::Halted`] if an earlier usage error halted the owner.
/// - [`UsageError::OutOfOrder`] / [`UsageError::SlotCountChanged`] if the
///   registration breaks the call-site order; this halts the owner.
pub fn register<F, C>(owner: OwnerId, site: usize, deps: Deps, body: F) -> Result<(), UsageError>
where
    F: FnOnce() -> C + Send + 'static,
    C: IntoCleanup,
{
    // Stays out here unless staged, so a rejected body is dropped unlocked
    let mut incoming = Some(StagedEffect {
        deps,
        body: Some(EffectBody::new(body)),
    });
    let mut discarded = Discarded::default();

    let result = owner
        .with(|meta| {
            if meta.is_halted() {
                return Err(UsageError::Halted(owner));
            }
            let mut state = meta.lock_state();
            stage(owner, &mut state, site, &mut incoming, &mut discarded).inspect_err(|err| {
                halt_locked(meta, &mut state, err, &mut discarded);
            })
        })
        .unwrap_or(Err(UsageError::UnknownOwner(owner)));

    drop(discarded);
    drop(incoming);
    report_halt(owner, &result);
    result
}

fn stage(
    owner: OwnerId,
    state: &mut OwnerState,
    site: usize,
    incoming: &mut Option<StagedEffect>,
    discarded: &mut Discarded,
) -> Result<(), UsageError> {
    if site == 0 && !state.staged.is_empty() {
        cov_mark::hit!(uncommitted_render_abandoned);
        discarded.staged.append(&mut state.staged);
    }

    let expected = state.staged.len();
    if site != expected {
        return Err(UsageError::OutOfOrder {
            owner,
            expected,
            got: site,
        });
    }
    if state.committed_renders > 0 && site >= state.slots.len() {
        return Err(UsageError::SlotCountChanged {
            owner,
            previous: state.slots.len(),
            rendered: site + 1,
        });
    }

    let Some(mut effect) = incoming.take() else {
        return Ok(());
    };
    let previous = state.slots.get(site).map(|slot| &slot.deps);
    if !deps_changed(previous, &effect.deps) {
        discarded.bodies.extend(effect.body.take());
    }
    state.staged.push(effect);
    Ok(())
}

/// Commit the staged render of `owner` and schedule its effects.
///
/// Called by the host once per committed render. The queued effects run on
/// the next flush: an explicit [`flush_effects`](crate::flush_effects) /
/// [`flush_owner`](crate::flush_owner), the end of the enclosing
/// [`Commit`](crate::Commit), or the [`EffectLoop`](crate::EffectLoop).
///
/// # Errors
/// - [`UsageError::UnknownOwner`] if the owner was destroyed.
/// - [`UsageError::Halted`] if an earlier usage error halted the owner.
/// - [`UsageError::SlotCountChanged`] if this render registered fewer effects
///   than the previous one; this halts the owner.
pub fn notify_render_complete(owner: OwnerId) -> Result<(), UsageError> {
    let mut discarded = Discarded::default();
    let result = owner
        .with(|meta| {
            if meta.is_halted() {
                return Err(UsageError::Halted(owner));
            }
            let mut state = meta.lock_state();
            commit_locked(owner, &mut state, &mut discarded).inspect_err(|err| {
                halt_locked(meta, &mut state, err, &mut discarded);
            })
        })
        .unwrap_or(Err(UsageError::UnknownOwner(owner)));

    drop(discarded);
    report_halt(owner, &result);
    if let Ok(true) = result {
        if crate::commit::is_commit_active() {
            crate::commit::record_committed_owner(owner);
        } else {
            crate::scheduler::schedule_effect_processing();
        }
    }
    result.map(|_| ())
}

/// Returns whether the owner now has queued work.
fn commit_locked(
    owner: OwnerId,
    state: &mut OwnerState,
    discarded: &mut Discarded,
) -> Result<bool, UsageError> {
    let staged = std::mem::take(&mut state.staged);

    if state.committed_renders == 0 {
        state.slots = staged
            .iter()
            .map(|staged| EffectSlot::new(staged.deps.clone()))
            .collect();
    } else if staged.len() != state.slots.len() {
        let err = UsageError::SlotCountChanged {
            owner,
            previous: state.slots.len(),
            rendered: staged.len(),
        };
        discarded.staged.extend(staged);
        return Err(err);
    }

    for (site, StagedEffect { deps, body }) in staged.into_iter().enumerate() {
        let slot = &mut state.slots[site];
        debug_assert_eq!(slot.pending_run, state.queue.has_run(site));
        discarded.deps.push(std::mem::replace(&mut slot.deps, deps));
        if let Some(body) = body {
            slot.pending_run = true;
            discarded.bodies.extend(state.queue.enqueue(site, body));
        }
    }
    state.committed_renders += 1;

    let has_work = !state.queue.is_empty();
    if has_work {
        mark_owner_pending(owner);
    }
    tracing::trace!(
        %owner,
        render = state.committed_renders,
        queued = state.queue.len(),
        "render committed"
    );
    Ok(has_work)
}

/// Discard the render being staged without committing it.
///
/// Slots keep the dependencies of the last committed render.
pub fn abandon_render(owner: OwnerId) {
    let staged = owner.with_state(|state| std::mem::take(&mut state.staged));
    drop(staged);
}

fn halt_locked(
    meta: &OwnerMetadata,
    state: &mut OwnerState,
    err: &UsageError,
    discarded: &mut Discarded,
) {
    if !err.halts_owner() {
        return;
    }
    meta.halt();
    state.discard_pending(discarded);
    tracing::debug!(
        label = meta.label.as_deref().unwrap_or(""),
        error = %err,
        "owner halted"
    );
}

fn report_halt<T>(owner: OwnerId, result: &Result<T, UsageError>) {
    let Err(err) = result else {
        return;
    };
    if !err.halts_owner() {
        return;
    }
    crate::arena::remove_from_pending_set(owner);
    let handler = owner.error_handler();
    report(handler.as_ref(), &[EffectError::Usage(err.clone())]);
}
