use crate::arena::{FlushPhase, OwnerId, OwnerMetadata, owner_arena_insert};
use crate::deps::Deps;
use crate::effect::IntoCleanup;
use crate::error::{EffectError, ErrorHandler, UsageError};
use crate::registry::{abandon_render, notify_render_complete, register};
use crate::scheduler::{FlushOutcome, FlushStats, flush_owner, notify_owner_destroyed};
use std::sync::Arc;
use thiserror::Error;

/// A stateful instance that owns an ordered set of effects
///
/// An `Owner` is the scheduler-side half of whatever the host renders (a
/// component instance, a widget, a view model). Each call to [`render`]
/// registers the owner's effects in call order and commits them; dropping the
/// owner runs every stored cleanup once.
///
/// # Example
/// ```
/// use hookflow::{deps, Cleanup, Owner};
///
/// let owner = Owner::new();
/// let user_id = 7;
///
/// owner
///     .render(|scope| {
///         scope.use_effect(deps![user_id], move || {
///             println!("subscribe {user_id}");
///             Cleanup::new(move || println!("unsubscribe {user_id}"))
///         });
///     })
///     .unwrap();
///
/// owner.flush(); // prints "subscribe 7"
/// drop(owner);   // prints "unsubscribe 7"
/// ```
///
/// [`render`]: Owner::render
pub struct Owner {
    id: OwnerId,
}

impl Owner {
    /// Create an owner with default settings
    ///
    /// Failures of its effects are logged through `tracing`.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Configure a new owner.
    pub fn builder() -> OwnerBuilder {
        OwnerBuilder::default()
    }

    /// The id used by the raw [`register`] / [`notify_render_complete`] API.
    pub fn id(&self) -> OwnerId {
        self.id
    }

    /// Run one render pass and commit it
    ///
    /// Effects registered through the [`RenderScope`] are numbered in call
    /// order. The render is committed when the closure returns; its effects
    /// run on the next flush. If the closure panics, the render is abandoned
    /// and the panic continues.
    ///
    /// # Errors
    /// The first [`UsageError`] raised by a registration or by the commit.
    pub fn render<F, R>(&self, f: F) -> Result<R, UsageError>
    where
        F: FnOnce(&mut RenderScope) -> R,
    {
        match self.try_render(|scope| Ok::<R, std::convert::Infallible>(f(scope))) {
            Ok(value) => Ok(value),
            Err(RenderError::Usage(err)) => Err(err),
            Err(RenderError::Aborted(never)) => match never {},
        }
    }

    /// Like [`render`](Owner::render), but the closure may abort the render
    ///
    /// When the closure returns `Err`, nothing is committed and the slots keep
    /// the dependencies of the previous render.
    pub fn try_render<F, R, E>(&self, f: F) -> Result<R, RenderError<E>>
    where
        F: FnOnce(&mut RenderScope) -> Result<R, E>,
    {
        let mut scope = RenderScope {
            owner: self.id,
            next_site: 0,
            error: None,
        };
        let guard = AbandonGuard { owner: self.id };

        let value = f(&mut scope);
        let value = match value {
            Ok(value) => value,
            Err(err) => return Err(RenderError::Aborted(err)),
        };
        if let Some(err) = scope.error {
            return Err(RenderError::Usage(err));
        }
        std::mem::forget(guard);
        notify_render_complete(self.id)?;
        Ok(value)
    }

    /// Flush this owner's committed effects now
    ///
    /// Returns what the cycle did. A re-entrant call from inside one of this
    /// owner's own effects does nothing and reports the owner as deferred.
    pub fn flush(&self) -> FlushStats {
        match flush_owner(self.id) {
            Ok(FlushOutcome::Flushed(stats)) => stats,
            Ok(FlushOutcome::Deferred) => FlushStats {
                deferred: 1,
                ..FlushStats::default()
            },
            Err(_) => FlushStats::default(),
        }
    }

    /// Destroy the owner now, running all stored cleanups
    ///
    /// Returns the number of cleanups invoked. Dropping the owner does the same.
    pub fn destroy(self) -> usize {
        notify_owner_destroyed(self.id)
    }

    /// Number of effect slots established by committed renders.
    pub fn slot_count(&self) -> usize {
        self.id.with_state(|state| state.slots.len()).unwrap_or(0)
    }

    /// Whether the effect at `site` currently holds a cleanup.
    pub fn has_cleanup(&self, site: usize) -> bool {
        self.id
            .with_state(|state| state.slots.get(site).is_some_and(|slot| slot.cleanup.is_some()))
            .unwrap_or(false)
    }

    /// Whether the effect at `site` has a committed run waiting for a flush.
    pub fn is_pending(&self, site: usize) -> bool {
        self.id
            .with_state(|state| state.slots.get(site).is_some_and(|slot| slot.pending_run))
            .unwrap_or(false)
    }

    /// Number of committed tasks (cleanups plus runs) waiting for a flush.
    pub fn pending_tasks(&self) -> usize {
        self.id
            .with_state(|state| state.queue.len())
            .unwrap_or(0)
    }

    /// Current flush phase.
    pub fn phase(&self) -> FlushPhase {
        self.id.phase()
    }

    /// Whether the owner still exists (it may be destroyed through its id).
    pub fn is_alive(&self) -> bool {
        self.id.is_alive()
    }

    /// Whether a usage error halted this owner.
    pub fn is_halted(&self) -> bool {
        self.id.is_halted()
    }
}

impl Default for Owner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Owner {
    fn drop(&mut self) {
        notify_owner_destroyed(self.id);
    }
}

// NOTE: Owner intentionally does NOT implement Clone. Dropping it destroys the
// owner; share the OwnerId for additional handles.

/// Builder for [`Owner`]
#[derive(Default)]
pub struct OwnerBuilder {
    label: Option<Arc<str>>,
    on_error: Option<ErrorHandler>,
}

impl OwnerBuilder {
    /// Name used in log events about this owner.
    pub fn label(mut self, label: impl Into<Arc<str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Receive every failure of this owner's effects and cleanups, and any
    /// usage error that halts it.
    ///
    /// Without a handler, failures are logged with `tracing::error!`.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&EffectError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Allocate the owner.
    pub fn build(self) -> Owner {
        let id = owner_arena_insert(OwnerMetadata::new(self.label, self.on_error));
        Owner { id }
    }
}

/// Why [`Owner::try_render`] did not commit.
#[derive(Debug, Error)]
pub enum RenderError<E> {
    /// Registration contract violation.
    #[error(transparent)]
    Usage(#[from] UsageError),
    /// The render closure returned an error.
    #[error("render aborted")]
    Aborted(E),
}

/// Registration handle passed to the render closure
pub struct RenderScope {
    owner: OwnerId,
    next_site: usize,
    error: Option<UsageError>,
}

impl RenderScope {
    /// Register an effect at the next call site
    ///
    /// The body runs after commit when `deps` differ from the previous
    /// render's (always on the first render). It may return `()`, a
    /// [`Cleanup`](crate::Cleanup), `Option<Cleanup>`, or a `Result` of those.
    ///
    /// After a usage error every further registration of the render is
    /// ignored and the error is returned from [`Owner::render`].
    pub fn use_effect<F, C>(&mut self, deps: impl Into<Deps>, body: F)
    where
        F: FnOnce() -> C + Send + 'static,
        C: IntoCleanup,
    {
        if self.error.is_some() {
            return;
        }
        let site = self.next_site;
        self.next_site += 1;
        if let Err(err) = register(self.owner, site, deps.into(), body) {
            self.error = Some(err);
        }
    }

    /// Register an effect that runs after every render.
    pub fn use_effect_always<F, C>(&mut self, body: F)
    where
        F: FnOnce() -> C + Send + 'static,
        C: IntoCleanup,
    {
        self.use_effect(Deps::Always, body);
    }

    /// The owner being rendered.
    pub fn owner(&self) -> OwnerId {
        self.owner
    }
}

/// RAII guard that discards staged registrations unless the render commits.
struct AbandonGuard {
    owner: OwnerId,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        abandon_render(self.owner);
    }
}
