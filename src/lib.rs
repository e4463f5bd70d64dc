#![deny(missing_docs)]

//! Dependency-tracked effect scheduling for render-driven systems.
//!
//! A host that re-renders stateful instances (components, widgets, view
//! models) registers side effects during each render. Every effect carries a
//! dependency list; after the render is committed, only effects whose
//! dependencies changed are re-run, each one after the cleanup its previous
//! run returned. Destroying an instance runs every outstanding cleanup once.
//!
//! # Quick Start
//!
//! ```
//! use hookflow::{deps, Cleanup, Owner};
//!
//! let owner = Owner::new();
//!
//! for room in ["general", "general", "random"] {
//!     owner
//!         .render(|scope| {
//!             scope.use_effect(deps![room], move || {
//!                 println!("join {room}");
//!                 Cleanup::new(move || println!("leave {room}"))
//!             });
//!         })
//!         .unwrap();
//!     owner.flush();
//! }
//! // join general, leave general, join random
//!
//! drop(owner); // leave random
//! ```
//!
//! # Core Types
//!
//! - [`Owner`] - An instance that owns an ordered set of effects.
//! - [`Deps`] / [`Dep`] - Dependency lists and their entries. Build them with [`deps!`].
//! - [`Cleanup`] - The teardown an effect body may return.
//! - [`Commit`] - Commit several renders and flush them as one unit.
//! - [`EffectLoop`] - Background thread that flushes committed work.
//!
//! # Dependencies
//!
//! ```ignore
//! scope.use_effect(deps![a, b], body);  // runs when a or b changed
//! scope.use_effect(deps![], body);      // runs after the first render only
//! scope.use_effect_always(body);        // runs after every render
//! ```
//!
//! # Flushing
//!
//! Committed effects never run synchronously inside the render. They run on
//! the next flush:
//!
//! ```ignore
//! owner.flush();                 // one cycle for one owner
//! flush_effects();               // every pending owner, until nothing is left
//! Commit::run(|| { ... });       // owners committed inside, at the end
//! EffectLoop::new().spawn();     // in the background, debounced
//! ```
//!
//! Within one flush of an owner, all cleanups run before any body, each group
//! in registration order.
//!
//! # Raw API
//!
//! Hosts with their own render machinery can skip [`Owner`] and drive the
//! registry directly with [`register`], [`notify_render_complete`],
//! [`flush_owner`] and [`notify_owner_destroyed`].

// Internal modules
pub(crate) mod arena;
mod commit;
mod deps;
mod effect;
mod error;
mod executor;
mod owner;
mod queue;
mod registry;
mod scheduler;

// Core types
pub use commit::{Commit, is_commit_active};
pub use deps::{Dep, Deps, deps_changed};
pub use effect::{Cleanup, IntoCleanup};
pub use owner::{Owner, OwnerBuilder, RenderError, RenderScope};

// Ids and introspection
pub use arena::{FlushPhase, OwnerId, pending_owners_count};

// Errors
pub use error::{EffectError, ErrorHandler, Failure, UsageError};

// Raw registry and scheduler entry points
pub use registry::{abandon_render, notify_render_complete, register};
pub use scheduler::{
    FlushOutcome, FlushStats, flush_effects, flush_owner, is_processing_scheduled,
    notify_owner_destroyed, schedule_effect_processing,
};

// Background processing
pub use executor::{
    DEFAULT_DEBOUNCE, DEFAULT_MAX_DEBOUNCE, EffectLoop, notify_effect_loop, spawn_effect_loop,
};

#[cfg(test)]
mod tests;
