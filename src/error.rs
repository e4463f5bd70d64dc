//! Error taxonomy and failure reporting.
//!
//! Two kinds of problems are surfaced by the scheduler:
//!
//! - [`UsageError`]: the host broke the registration contract (registration
//!   order or slot count changed between renders, or it talked to an owner that
//!   no longer exists). Returned eagerly from the call that detected it.
//! - [`EffectError::Body`] / [`EffectError::Cleanup`]: user code inside an
//!   effect failed. These are isolated per effect and handed to the owner's
//!   error handler after the flush, never returned to the caller of the flush.

use crate::arena::OwnerId;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// Misuse of the registration contract by the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    /// An effect was registered at a site index other than the next expected one.
    #[error("owner {owner} registered an effect at site {got}, expected site {expected}")]
    OutOfOrder {
        /// Owner that received the registration.
        owner: OwnerId,
        /// Site index the registry expected next.
        expected: usize,
        /// Site index the caller supplied.
        got: usize,
    },

    /// A render registered a different number of effects than the previous one.
    #[error("owner {owner} rendered {rendered} effects, the previous render had {previous}")]
    SlotCountChanged {
        /// Owner whose render was committed.
        owner: OwnerId,
        /// Slot count established by earlier renders.
        previous: usize,
        /// Registrations seen in the offending render.
        rendered: usize,
    },

    /// The owner was halted by an earlier usage error.
    #[error("owner {0} was halted by an earlier usage error")]
    Halted(OwnerId),

    /// The owner id is stale or was never allocated.
    #[error("owner {0} does not exist or was destroyed")]
    UnknownOwner(OwnerId),
}

impl UsageError {
    /// Whether this error leaves the owner permanently halted.
    pub fn halts_owner(&self) -> bool {
        matches!(
            self,
            UsageError::OutOfOrder { .. } | UsageError::SlotCountChanged { .. }
        )
    }
}

/// How a user callback failed.
#[derive(Debug, Error)]
pub enum Failure {
    /// The callback panicked; carries the panic message when it was a string.
    #[error("panicked: {0}")]
    Panicked(String),

    /// The body returned an `Err`.
    #[error("returned an error: {0}")]
    Returned(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Failure {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_owned()
        };
        Failure::Panicked(message)
    }
}

/// Any failure the scheduler reports through an owner's error channel.
#[derive(Debug, Error)]
pub enum EffectError {
    /// Registration contract violation.
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// An effect body failed. The slot keeps no cleanup for this run.
    #[error("effect body at site {site} of owner {owner} {failure}")]
    Body {
        /// Owning instance.
        owner: OwnerId,
        /// Registration index of the failing effect.
        site: usize,
        /// What went wrong.
        #[source]
        failure: Failure,
    },

    /// A cleanup callback failed. Later cleanups and the run phase still proceed.
    #[error("cleanup at site {site} of owner {owner} {failure}")]
    Cleanup {
        /// Owning instance.
        owner: OwnerId,
        /// Registration index of the failing effect.
        site: usize,
        /// What went wrong.
        #[source]
        failure: Failure,
    },
}

impl EffectError {
    /// The owner the failure belongs to.
    pub fn owner(&self) -> OwnerId {
        match self {
            EffectError::Usage(
                UsageError::OutOfOrder { owner, .. } | UsageError::SlotCountChanged { owner, .. },
            ) => *owner,
            EffectError::Usage(UsageError::Halted(owner) | UsageError::UnknownOwner(owner)) => {
                *owner
            }
            EffectError::Body { owner, .. } | EffectError::Cleanup { owner, .. } => *owner,
        }
    }
}

/// Callback that receives every failure of an owner.
pub type ErrorHandler = Arc<dyn Fn(&EffectError) + Send + Sync>;

/// Deliver failures to the handler, or to `tracing` when there is none.
pub(crate) fn report(handler: Option<&ErrorHandler>, errors: &[EffectError]) {
    for error in errors {
        match handler {
            Some(handler) => handler(error),
            None => tracing::error!(owner = %error.owner(), %error, "effect failure"),
        }
    }
}
