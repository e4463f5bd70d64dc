/// End-to-end scenarios for rendering, flushing and destroying owners
use crate::{
    Cleanup, Commit, Deps, EffectError, Failure, FlushOutcome, FlushPhase, Owner, OwnerId,
    UsageError, deps, flush_owner, notify_owner_destroyed, notify_render_complete, register,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

type Log = Arc<Mutex<Vec<String>>>;

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().clone()
}

/// Effect body that logs `run <name>:<tag>` and returns a cleanup logging
/// `cleanup <name>:<tag>`.
fn traced(log: &Log, name: &'static str, tag: i32) -> impl FnOnce() -> Cleanup + Send + use<> {
    let log = log.clone();
    move || {
        log.lock().push(format!("run {name}:{tag}"));
        Cleanup::new(move || log.lock().push(format!("cleanup {name}:{tag}")))
    }
}

/// Handler that collects every reported failure as a string.
fn collecting_handler() -> (Arc<Mutex<Vec<String>>>, impl Fn(&EffectError) + Send + Sync) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors_clone = errors.clone();
    (errors, move |err: &EffectError| {
        errors_clone.lock().push(err.to_string())
    })
}

#[test]
fn unchanged_deps_skip_the_body_and_keep_the_cleanup() {
    let log = new_log();
    let owner = Owner::new();

    for _ in 0..3 {
        owner
            .render(|scope| scope.use_effect(deps![42, "user"], traced(&log, "sub", 42)))
            .unwrap();
        owner.flush();
    }

    assert_eq!(entries(&log), vec!["run sub:42"]);
    assert!(owner.has_cleanup(0));

    drop(owner);
    assert_eq!(entries(&log), vec!["run sub:42", "cleanup sub:42"]);
}

#[test]
fn empty_deps_run_once_and_clean_up_on_destroy() {
    let log = new_log();
    let owner = Owner::new();

    for i in 0..5 {
        owner
            .render(|scope| scope.use_effect(deps![], traced(&log, "mount", i)))
            .unwrap();
        owner.flush();
    }
    assert_eq!(entries(&log), vec!["run mount:0"]);

    assert_eq!(owner.destroy(), 1);
    assert_eq!(entries(&log), vec!["run mount:0", "cleanup mount:0"]);
}

#[test]
fn sentinel_runs_after_every_render() {
    let log = new_log();
    let owner = Owner::new();

    for i in 0..3 {
        owner
            .render(|scope| scope.use_effect_always(traced(&log, "each", i)))
            .unwrap();
        owner.flush();
    }

    assert_eq!(
        entries(&log),
        vec![
            "run each:0",
            "cleanup each:0",
            "run each:1",
            "cleanup each:1",
            "run each:2",
        ]
    );
}

#[test]
fn all_cleanups_run_before_any_body() {
    let log = new_log();
    let owner = Owner::new();

    for tag in [1, 2] {
        owner
            .render(|scope| {
                scope.use_effect(deps![tag], traced(&log, "a", tag));
                scope.use_effect(deps![tag], traced(&log, "b", tag));
            })
            .unwrap();
        owner.flush();
    }

    assert_eq!(
        entries(&log),
        vec![
            "run a:1",
            "run b:1",
            "cleanup a:1",
            "cleanup b:1",
            "run a:2",
            "run b:2",
        ]
    );
}

#[test]
fn order_holds_across_several_commits_per_flush() {
    let log = new_log();
    let owner = Owner::new();

    let render = |a: i32, b: i32| {
        owner
            .render(|scope| {
                scope.use_effect(deps![a], traced(&log, "a", a));
                scope.use_effect(deps![b], traced(&log, "b", b));
            })
            .unwrap();
    };

    render(1, 1);
    owner.flush();
    log.lock().clear();

    // b is queued by an earlier commit than a
    render(1, 2);
    render(2, 2);
    owner.flush();

    assert_eq!(
        entries(&log),
        vec!["cleanup a:1", "cleanup b:1", "run a:2", "run b:2"]
    );
}

/// A child owner that logs `cleanup <name>:0` when it is destroyed.
fn child_owner(log: &Log, name: &'static str) -> Owner {
    let child = Owner::new();
    child
        .render(|scope| scope.use_effect(deps![], traced(log, name, 0)))
        .unwrap();
    child.flush();
    child
}

#[test]
fn bodies_dropped_unrun_may_own_owners() {
    let log = new_log();
    let worker_log = log.clone();
    let (done_tx, done_rx) = std::sync::mpsc::channel();

    std::thread::spawn(move || {
        let log = worker_log;
        let owner = Owner::new();
        owner
            .render(|scope| scope.use_effect(deps![1], || ()))
            .unwrap();
        owner.flush();

        // Queued body replaced by a second commit before the flush
        let child = child_owner(&log, "replaced");
        owner
            .render(|scope| scope.use_effect(deps![2], move || drop(child)))
            .unwrap();
        owner
            .render(|scope| scope.use_effect(deps![3], || ()))
            .unwrap();

        // Body skipped because the deps did not change
        let child = child_owner(&log, "skipped");
        owner
            .render(|scope| scope.use_effect(deps![3], move || drop(child)))
            .unwrap();

        // Body staged by a render that is abandoned
        let child = child_owner(&log, "abandoned");
        let _ = owner.try_render(|scope| {
            scope.use_effect(deps![4], move || drop(child));
            Err::<(), _>("not ready")
        });

        // Body staged and queued work discarded by a halting render
        let child = child_owner(&log, "halted");
        let err = owner
            .render(|scope| {
                scope.use_effect(deps![5], move || drop(child));
                scope.use_effect(deps![], || ());
            })
            .unwrap_err();
        assert!(matches!(err, UsageError::SlotCountChanged { .. }));

        drop(owner);
        let _ = done_tx.send(());
    });

    done_rx
        .recv_timeout(std::time::Duration::from_secs(5))
        .expect("dropping a body that owns an Owner must not block");
    assert_eq!(
        entries(&log),
        vec![
            "run replaced:0",
            "cleanup replaced:0",
            "run skipped:0",
            "cleanup skipped:0",
            "run abandoned:0",
            "cleanup abandoned:0",
            "run halted:0",
            "cleanup halted:0",
        ]
    );
}

#[test]
fn destroying_twice_runs_cleanups_once() {
    let log = new_log();
    let owner = Owner::new();
    let id = owner.id();

    owner
        .render(|scope| {
            scope.use_effect(deps![], traced(&log, "a", 0));
            scope.use_effect(deps![], traced(&log, "b", 0));
        })
        .unwrap();
    owner.flush();

    assert_eq!(notify_owner_destroyed(id), 2);
    assert_eq!(notify_owner_destroyed(id), 0);
    assert!(!owner.is_alive());
    drop(owner);

    assert_eq!(
        entries(&log),
        vec!["run a:0", "run b:0", "cleanup a:0", "cleanup b:0"]
    );
}

#[test]
fn only_the_changed_effect_reruns() {
    let log = new_log();
    let owner = Owner::new();

    owner
        .render(|scope| {
            scope.use_effect(deps![1], traced(&log, "first", 1));
            scope.use_effect(deps![], traced(&log, "second", 1));
        })
        .unwrap();
    owner.flush();

    owner
        .render(|scope| {
            scope.use_effect(deps![2], traced(&log, "first", 2));
            scope.use_effect(deps![], traced(&log, "second", 2));
        })
        .unwrap();
    let stats = owner.flush();

    assert_eq!(stats.cleanups, 1);
    assert_eq!(stats.runs, 1);
    assert_eq!(
        entries(&log),
        vec!["run first:1", "run second:1", "cleanup first:1", "run first:2"]
    );
    assert!(owner.has_cleanup(0));
    assert!(owner.has_cleanup(1));
}

#[test]
fn failing_body_is_isolated_and_leaves_no_cleanup() {
    let log = new_log();
    let (errors, handler) = collecting_handler();
    let owner = Owner::builder().on_error(handler).build();

    owner
        .render(|scope| {
            scope.use_effect(deps![1], traced(&log, "a", 1));
            scope.use_effect(deps![1], traced(&log, "b", 1));
        })
        .unwrap();
    owner.flush();

    let log_clone = log.clone();
    owner
        .render(|scope| {
            scope.use_effect(deps![2], move || -> Cleanup {
                log_clone.lock().push("run a:2".into());
                panic!("socket closed");
            });
            scope.use_effect(deps![2], traced(&log, "b", 2));
        })
        .unwrap();
    let stats = owner.flush();

    assert_eq!(stats.runs, 2);
    assert_eq!(stats.failures, 1);
    assert_eq!(
        entries(&log),
        vec![
            "run a:1",
            "run b:1",
            "cleanup a:1",
            "cleanup b:1",
            "run a:2",
            "run b:2",
        ]
    );
    assert_eq!(errors.lock().len(), 1);
    assert!(errors.lock()[0].contains("socket closed"));

    // The old cleanup already ran; the failed run recorded none.
    assert!(!owner.has_cleanup(0));
    assert!(owner.has_cleanup(1));

    drop(owner);
    assert_eq!(entries(&log).last().map(String::as_str), Some("cleanup b:2"));
}

#[test]
fn returned_error_is_reported_as_body_failure() {
    let reported = Arc::new(Mutex::new(None));
    let reported_clone = reported.clone();
    let owner = Owner::builder()
        .on_error(move |err| {
            if let EffectError::Body {
                site,
                failure: Failure::Returned(source),
                ..
            } = err
            {
                *reported_clone.lock() = Some((*site, source.to_string()));
            }
        })
        .build();

    owner
        .render(|scope| {
            scope.use_effect(deps![], || ());
            scope.use_effect(deps![], || -> Result<Cleanup, std::io::Error> {
                Err(std::io::Error::other("connection refused"))
            });
        })
        .unwrap();
    let stats = owner.flush();

    assert_eq!(stats.failures, 1);
    assert_eq!(
        reported.lock().clone(),
        Some((1, "connection refused".to_owned()))
    );
    assert!(!owner.has_cleanup(1));
}

#[test]
fn failing_cleanup_does_not_stop_the_flush() {
    let log = new_log();
    let (errors, handler) = collecting_handler();
    let owner = Owner::builder().on_error(handler).build();

    for tag in [1, 2] {
        let log_clone = log.clone();
        owner
            .render(|scope| {
                scope.use_effect(deps![tag], move || {
                    Cleanup::new(move || {
                        log_clone.lock().push(format!("cleanup a:{tag}"));
                        panic!("cleanup failed");
                    })
                });
                scope.use_effect(deps![tag], traced(&log, "b", tag));
            })
            .unwrap();
        owner.flush();
    }

    assert_eq!(
        entries(&log),
        vec!["run b:1", "cleanup a:1", "cleanup b:1", "run b:2"]
    );
    assert_eq!(errors.lock().len(), 1);
    assert!(errors.lock()[0].starts_with("cleanup at site 0"));
    // The new run of site 0 stored a fresh cleanup.
    assert!(owner.has_cleanup(0));
}

#[test]
fn nan_dependency_is_unchanged() {
    let runs = Arc::new(AtomicUsize::new(0));
    let owner = Owner::new();

    for _ in 0..3 {
        let runs_clone = runs.clone();
        owner
            .render(|scope| {
                scope.use_effect(deps![f64::NAN], move || {
                    runs_clone.fetch_add(1, Ordering::Relaxed);
                })
            })
            .unwrap();
        owner.flush();
    }

    assert_eq!(runs.load(Ordering::Relaxed), 1);
}

#[test]
fn effects_wait_for_the_flush() {
    let log = new_log();
    let owner = Owner::new();

    owner
        .render(|scope| scope.use_effect(deps![], traced(&log, "a", 0)))
        .unwrap();
    assert!(entries(&log).is_empty());
    assert!(owner.is_pending(0));
    assert_eq!(owner.pending_tasks(), 2);

    owner.flush();
    assert_eq!(entries(&log), vec!["run a:0"]);
    assert!(!owner.is_pending(0));
    assert_eq!(owner.phase(), FlushPhase::Idle);
}

#[test]
fn second_commit_before_flush_replaces_queued_body() {
    let log = new_log();
    let owner = Owner::new();

    owner
        .render(|scope| scope.use_effect(deps![1], traced(&log, "a", 1)))
        .unwrap();
    owner
        .render(|scope| scope.use_effect(deps![2], traced(&log, "a", 2)))
        .unwrap();
    let stats = owner.flush();

    assert_eq!(stats.runs, 1);
    assert_eq!(entries(&log), vec!["run a:2"]);
}

fn render_counter(id: OwnerId, runs: Arc<AtomicUsize>, outcomes: Arc<Mutex<Vec<FlushOutcome>>>) {
    register(id, 0, Deps::Always, move || {
        let run = runs.fetch_add(1, Ordering::SeqCst) + 1;
        if run == 1 {
            // Re-render the owner from inside its own effect, then try to flush it
            render_counter(id, runs.clone(), outcomes.clone());
            if let Ok(outcome) = flush_owner(id) {
                outcomes.lock().push(outcome);
            }
        }
    })
    .unwrap();
    notify_render_complete(id).unwrap();
}

#[test]
fn reentrant_render_is_deferred_to_next_cycle() {
    cov_mark::check!(reentrant_flush_deferred);

    let runs = Arc::new(AtomicUsize::new(0));
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let owner = Owner::new();

    render_counter(owner.id(), runs.clone(), outcomes.clone());
    owner.flush();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(outcomes.lock().clone(), vec![FlushOutcome::Deferred]);
    assert!(owner.is_pending(0));

    owner.flush();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(!owner.is_pending(0));
}

#[test]
fn cleanup_returned_after_destroy_runs_immediately() {
    cov_mark::check!(orphan_cleanup_invoked);
    cov_mark::check!(runs_dropped_after_destroy);

    let log = new_log();
    let owner = Owner::new();
    let id = owner.id();

    let log_clone = log.clone();
    owner
        .render(|scope| {
            scope.use_effect(deps![], move || {
                log_clone.lock().push("run a:0".into());
                notify_owner_destroyed(id);
                let log = log_clone.clone();
                Cleanup::new(move || log.lock().push("cleanup a:0".into()))
            });
            scope.use_effect(deps![], traced(&log, "b", 0));
        })
        .unwrap();
    owner.flush();

    assert!(!owner.is_alive());
    assert_eq!(entries(&log), vec!["run a:0", "cleanup a:0"]);
}

#[test]
fn halted_owner_still_cleans_up() {
    let log = new_log();
    let (errors, handler) = collecting_handler();
    let owner = Owner::builder().label("feed").on_error(handler).build();

    owner
        .render(|scope| scope.use_effect(deps![], traced(&log, "a", 0)))
        .unwrap();
    owner.flush();

    let err = owner
        .render(|scope| {
            scope.use_effect(deps![], traced(&log, "a", 1));
            scope.use_effect(deps![], traced(&log, "extra", 1));
        })
        .unwrap_err();
    assert!(matches!(err, UsageError::SlotCountChanged { .. }));
    assert!(owner.is_halted());
    assert_eq!(errors.lock().len(), 1);

    assert_eq!(
        owner.render(|scope| scope.use_effect(deps![], || ())),
        Err(UsageError::Halted(owner.id()))
    );

    assert_eq!(owner.destroy(), 1);
    assert_eq!(entries(&log), vec!["run a:0", "cleanup a:0"]);
}

#[test]
fn commit_flushes_its_owners_once_at_exit() {
    let log = new_log();
    let parent = Owner::new();
    let child = Owner::new();

    Commit::run(|| {
        parent
            .render(|scope| scope.use_effect(deps![], traced(&log, "parent", 0)))
            .unwrap();
        Commit::run(|| {
            child
                .render(|scope| scope.use_effect(deps![], traced(&log, "child", 0)))
                .unwrap();
        });
        assert!(entries(&log).is_empty());
    });

    assert_eq!(entries(&log), vec!["run parent:0", "run child:0"]);
    assert!(!parent.is_pending(0));
    assert!(!child.is_pending(0));
}

#[test]
fn owners_on_different_threads_are_independent() {
    let total = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let total = total.clone();
            std::thread::spawn(move || {
                let owner = Owner::new();
                for i in 0..10 {
                    let total = total.clone();
                    owner
                        .render(|scope| {
                            scope.use_effect(deps![i / 2], move || {
                                total.fetch_add(1, Ordering::Relaxed);
                            })
                        })
                        .unwrap();
                    owner.flush();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // deps change every second render: 5 runs per owner
    assert_eq!(total.load(Ordering::Relaxed), 20);
}
