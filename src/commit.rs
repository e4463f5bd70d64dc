use crate::arena::OwnerId;
use crate::scheduler::{FlushOutcome, FlushStats, flush_owner, schedule_effect_processing};
use parking_lot::{Condvar, Mutex};
use std::cell::{Cell, RefCell};

// Nesting depth of Commit::run on this thread, and the owners committed
// inside the outermost one (in commit order).
thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
    static COMMITTED: RefCell<Vec<OwnerId>> = const { RefCell::new(Vec::new()) };
}

/// Outermost commits currently open, across all threads. The effect loop
/// sleeps on `idle` until the count drops to zero.
struct OpenCommits {
    count: Mutex<usize>,
    idle: Condvar,
}

static OPEN_COMMITS: OpenCommits = OpenCommits {
    count: Mutex::new(0),
    idle: Condvar::new(),
};

impl OpenCommits {
    fn open(&self) {
        *self.count.lock() += 1;
    }

    fn close(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }
}

/// Block until no commit is open on any thread.
///
/// The effect loop calls this before flushing so that it never runs effects
/// while a host is half-way through committing a tree of owners.
pub(crate) fn wait_for_commits() {
    OPEN_COMMITS.wait_idle();
}

/// Check if currently inside a commit on this thread
pub fn is_commit_active() -> bool {
    DEPTH.get() > 0
}

/// Remember an owner whose render committed work inside the current commit.
pub(crate) fn record_committed_owner(owner: OwnerId) {
    COMMITTED.with_borrow_mut(|owners| {
        if !owners.contains(&owner) {
            owners.push(owner);
        }
    });
}

/// Ends the commit when dropped, so a panicking closure still flushes.
struct CommitScope;

impl CommitScope {
    fn enter() -> Self {
        let depth = DEPTH.get();
        if depth == 0 {
            OPEN_COMMITS.open();
        }
        DEPTH.set(depth + 1);
        CommitScope
    }
}

impl Drop for CommitScope {
    fn drop(&mut self) {
        let depth = DEPTH.get().saturating_sub(1);
        DEPTH.set(depth);
        if depth > 0 {
            return;
        }

        // Let the effect loop go first: a flush below may block on an owner
        // the loop is already flushing.
        OPEN_COMMITS.close();

        let owners = COMMITTED.take();
        let mut stats = FlushStats::default();
        for owner in owners {
            if let Ok(FlushOutcome::Flushed(owner_stats)) = flush_owner(owner) {
                stats += owner_stats;
            }
        }
        tracing::trace!(runs = stats.runs, cleanups = stats.cleanups, "commit flushed");

        // Re-renders queued by those effects
        if crate::arena::pending_owners_count() > 0 {
            schedule_effect_processing();
        }
    }
}

/// Commit several renders as one unit
///
/// Renders committed inside `Commit::run` don't schedule processing on their
/// own. When the outermost commit on this thread ends, the effects of every
/// owner it committed are flushed once, in commit order. While any commit is
/// active the [`EffectLoop`](crate::EffectLoop) holds off.
///
/// # Example
/// ```
/// use hookflow::{deps, Commit, Owner};
///
/// let parent = Owner::new();
/// let child = Owner::new();
///
/// Commit::run(|| {
///     parent.render(|scope| scope.use_effect(deps![], || println!("parent"))).unwrap();
///     child.render(|scope| scope.use_effect(deps![], || println!("child"))).unwrap();
/// }); // prints "parent" then "child"
/// ```
pub struct Commit;

impl Commit {
    /// Run `f` inside a commit and return its result.
    pub fn run<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _scope = CommitScope::enter();
        f()
    }
}
