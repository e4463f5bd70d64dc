//! Background flushing of committed renders
//!
//! A committed render only raises the "processing scheduled" flag. Hosts with
//! their own event loop call [`flush_effects`](crate::flush_effects) when it
//! suits them; everyone else spawns an [`EffectLoop`], a thread that sleeps on
//! a channel and flushes shortly after renders commit.
//!
//! Each wake-up goes through three steps:
//! 1. Quiet period: keep absorbing notifications until none arrived for
//!    `debounce`, or `max_debounce` passed since the first one
//! 2. Wait until no [`Commit`](crate::Commit) is active anywhere
//! 3. Flush pending owners, at most `max_cycles` cycles if configured
//!
//! ```ignore
//! EffectLoop::new()
//!     .debounce(Duration::from_millis(1))
//!     .max_cycles(32)
//!     .spawn_fn(|f| {
//!         std::thread::Builder::new()
//!             .name("effects".into())
//!             .spawn(f)
//!             .expect("failed to spawn effect loop")
//!     })
//!     .spawn();
//! ```

use std::sync::OnceLock;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// Wake-up channel of the running loop. Unset until the first spawn.
static EFFECT_NOTIFIER: OnceLock<Sender<()>> = OnceLock::new();

/// Wake the effect loop, if one was spawned. Never blocks.
pub fn notify_effect_loop() {
    if let Some(sender) = EFFECT_NOTIFIER.get() {
        // A closed channel means the loop thread is gone
        let _ = sender.send(());
    }
}

/// Quiet time the loop waits for after a notification.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(4);

/// Longest the loop postpones a flush while notifications keep coming.
pub const DEFAULT_MAX_DEBOUNCE: Duration = Duration::from_millis(16);

type SpawnFn = Box<dyn FnOnce(Box<dyn FnOnce() + Send>) -> JoinHandle<()> + Send>;

#[derive(Clone, Copy, Debug)]
struct LoopConfig {
    debounce: Duration,
    max_debounce: Duration,
    max_cycles: Option<usize>,
}

/// Configures and starts the background flush thread
///
/// Only one loop per process is wired to the notification channel; spawning
/// a second one logs a warning and the extra thread returns immediately.
pub struct EffectLoop {
    config: LoopConfig,
    spawn_fn: Option<SpawnFn>,
}

impl Default for EffectLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectLoop {
    /// [`DEFAULT_DEBOUNCE`], [`DEFAULT_MAX_DEBOUNCE`], no cycle cap, and
    /// `std::thread::spawn`.
    pub fn new() -> Self {
        Self {
            config: LoopConfig {
                debounce: DEFAULT_DEBOUNCE,
                max_debounce: DEFAULT_MAX_DEBOUNCE,
                max_cycles: None,
            },
            spawn_fn: None,
        }
    }

    /// Quiet time required before flushing.
    pub fn debounce(mut self, duration: Duration) -> Self {
        self.config.debounce = duration;
        self
    }

    /// Upper bound on how long a stream of notifications can postpone a flush.
    pub fn max_debounce(mut self, duration: Duration) -> Self {
        self.config.max_debounce = duration;
        self
    }

    /// Flush at most `cycles` cycles per wake-up
    ///
    /// An effect that re-renders its own owner every time it runs never lets
    /// an uncapped flush finish. With a cap the loop yields after `cycles`
    /// cycles and comes back for the rest on its next wake-up.
    pub fn max_cycles(mut self, cycles: usize) -> Self {
        self.config.max_cycles = Some(cycles.max(1));
        self
    }

    /// Start the loop through `f` instead of `std::thread::spawn`.
    pub fn spawn_fn<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Box<dyn FnOnce() + Send>) -> JoinHandle<()> + Send + 'static,
    {
        self.spawn_fn = Some(Box::new(f));
        self
    }

    /// Start the loop and return its thread handle.
    pub fn spawn(self) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel();
        if EFFECT_NOTIFIER.set(tx).is_err() {
            // tx went down with the error: the new thread sees a closed channel
            tracing::warn!("an effect loop is already running; the new loop will exit");
        }

        let config = self.config;
        let body: Box<dyn FnOnce() + Send> = Box::new(move || run_loop(rx, config));
        match self.spawn_fn {
            Some(spawn) => spawn(body),
            None => thread::spawn(body),
        }
    }
}

/// Start an [`EffectLoop`] with default settings.
pub fn spawn_effect_loop() -> JoinHandle<()> {
    EffectLoop::new().spawn()
}

fn run_loop(rx: Receiver<()>, config: LoopConfig) {
    tracing::debug!(?config, "effect loop started");
    while rx.recv().is_ok() {
        if !wait_for_quiet(&rx, config) {
            break;
        }

        crate::commit::wait_for_commits();
        crate::scheduler::clear_scheduled();
        let stats = crate::scheduler::flush_cycles(config.max_cycles);
        tracing::debug!(
            runs = stats.runs,
            cleanups = stats.cleanups,
            failures = stats.failures,
            "effect loop flushed"
        );

        // Cycle cap hit with work left
        if crate::arena::pending_owners_count() > 0 {
            crate::scheduler::schedule_effect_processing();
        }
    }
    tracing::debug!("effect loop stopped");
}

/// Absorb notifications until the channel stays silent for `debounce` or
/// `max_debounce` elapses. Returns false once the channel is closed.
fn wait_for_quiet(rx: &Receiver<()>, config: LoopConfig) -> bool {
    let deadline = Instant::now() + config.max_debounce;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        match rx.recv_timeout(config.debounce.min(left)) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => return false,
        }
    }

    // Past the deadline, more may have queued up; they are covered by this flush
    loop {
        match rx.try_recv() {
            Ok(()) => {}
            Err(TryRecvError::Empty) => return true,
            Err(TryRecvError::Disconnected) => return false,
        }
    }
}
