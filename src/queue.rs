//! Effect queue: pending cleanup and run tasks of one owner.
//!
//! A render first *stages* its registrations. Committing the render turns every
//! staged registration that must run into a cleanup task plus a run task. The
//! two kinds live in separate queues so a flush can invoke every cleanup before
//! any body, independent of how the tasks were interleaved when queued.
//! Whatever order several commits queued them in, a flush hands them out by
//! registration index.

use crate::deps::Deps;
use crate::effect::EffectBody;
use foldhash::fast::FixedState;
use indexmap::{IndexMap, IndexSet};

/// One registration made during the render in progress.
#[derive(Debug)]
pub(crate) struct StagedEffect {
    pub(crate) deps: Deps,
    /// `Some` when the comparator decided the effect must run.
    pub(crate) body: Option<EffectBody>,
}

/// Committed work of one owner, keyed by slot index.
///
/// A slot appears at most once in each queue.
#[derive(Debug, Default)]
pub(crate) struct EffectQueue {
    cleanups: IndexSet<usize, FixedState>,
    runs: IndexMap<usize, EffectBody, FixedState>,
}

impl EffectQueue {
    /// Queue the cleanup of `site` followed by a run of `body`.
    ///
    /// If `site` already has an unflushed run, the newer body replaces it and
    /// the old one is handed back. It never ran, so it owes no cleanup.
    pub(crate) fn enqueue(&mut self, site: usize, body: EffectBody) -> Option<EffectBody> {
        self.cleanups.insert(site);
        let replaced = self.runs.insert(site, body);
        if replaced.is_some() {
            cov_mark::hit!(queued_run_replaced);
        }
        replaced
    }

    /// Whether `site` has a queued run.
    pub(crate) fn has_run(&self, site: usize) -> bool {
        self.runs.contains_key(&site)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.cleanups.is_empty() && self.runs.is_empty()
    }

    /// Total number of queued tasks, cleanups and runs together.
    pub(crate) fn len(&self) -> usize {
        self.cleanups.len() + self.runs.len()
    }

    /// Move the queued work out in registration order, leaving this queue
    /// empty for the next cycle.
    pub(crate) fn take(&mut self) -> FlushBatch {
        self.cleanups.sort_unstable();
        self.runs.sort_unstable_keys();
        FlushBatch {
            cleanups: self.cleanups.drain(..).collect(),
            runs: self.runs.drain(..).collect(),
        }
    }
}

/// Snapshot of one flush cycle, in execution order.
#[derive(Debug, Default)]
pub(crate) struct FlushBatch {
    pub(crate) cleanups: Vec<usize>,
    pub(crate) runs: Vec<(usize, EffectBody)>,
}

impl FlushBatch {
    pub(crate) fn is_empty(&self) -> bool {
        self.cleanups.is_empty() && self.runs.is_empty()
    }
}

/// User-owned values taken out of an owner's state while it was locked.
///
/// Bodies and dependency lists can own anything, including another `Owner`
/// whose `Drop` needs the arena lock. Everything removed under the locks goes
/// in here and is dropped by the caller after they are released.
#[must_use]
#[derive(Default)]
pub(crate) struct Discarded {
    pub(crate) bodies: Vec<EffectBody>,
    pub(crate) staged: Vec<StagedEffect>,
    pub(crate) deps: Vec<Deps>,
    pub(crate) queues: Vec<EffectQueue>,
}
