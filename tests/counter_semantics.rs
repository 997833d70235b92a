use fibertask::{Counter, SchedulerConfig, TaskScheduler};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

fn config(threads: usize) -> SchedulerConfig {
    let mut config = SchedulerConfig::with_threads(threads);
    config.fibers_per_thread = 32;
    config.stack_size = 32 * 1024;
    config
}

#[test]
fn test_counter_tracks_spawned_tasks() {
    // A single worker that nobody drives yet: spawned tasks stay queued.
    let scheduler = TaskScheduler::with_config(config(1)).unwrap();
    let counter = Counter::new(0);

    for n in 0..25 {
        assert_eq!(counter.load(Ordering::SeqCst), n);
        scheduler.spawn(|| {}, Some(&counter));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 25);

    scheduler.wait_for_counter(&counter);
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn test_zero_tasks_wait_returns_immediately() {
    let scheduler = TaskScheduler::with_config(config(2)).unwrap();
    let counter = Counter::new(0);
    scheduler.wait_for_counter(&counter);
    assert!(counter.is_complete());
}

#[test]
fn test_ten_thousand_and_seven_increments() {
    let scheduler = TaskScheduler::with_config(config(4)).unwrap();
    scheduler.init_main_thread_worker().unwrap();
    let total = Arc::new(AtomicUsize::new(0));
    let counter = Counter::new(0);

    for _ in 0..10_007 {
        let total = total.clone();
        scheduler.spawn(
            move || {
                total.fetch_add(1, Ordering::Relaxed);
            },
            Some(&counter),
        );
    }

    scheduler.wait_for_counter(&counter);
    assert_eq!(total.load(Ordering::SeqCst), 10_007);
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    scheduler.shutdown().expect("Shutdown failed");
}

#[test]
fn test_root_wait_does_not_return_early() {
    let scheduler = TaskScheduler::with_config(config(2)).unwrap();
    let done = Arc::new(AtomicBool::new(false));
    let done_clone = done.clone();
    let counter = Counter::new(0);

    scheduler.spawn(
        move || {
            std::thread::sleep(Duration::from_millis(30));
            done_clone.store(true, Ordering::SeqCst);
        },
        Some(&counter),
    );

    scheduler.wait_for_counter(&counter);
    assert!(done.load(Ordering::SeqCst));
}

#[test]
fn test_fiber_wait_does_not_return_early() {
    let scheduler = TaskScheduler::with_config(config(4)).unwrap();
    let handle = scheduler.handle();
    let observed = Arc::new(AtomicBool::new(false));
    let observed_clone = observed.clone();
    let outer = Counter::new(0);

    scheduler.spawn(
        move || {
            let slow = Counter::new(0);
            let flag = Arc::new(AtomicBool::new(false));
            let flag_clone = flag.clone();
            handle.spawn(
                move || {
                    std::thread::sleep(Duration::from_millis(30));
                    flag_clone.store(true, Ordering::SeqCst);
                },
                Some(&slow),
            );
            handle.wait_for_counter(&slow);
            assert_eq!(slow.load(Ordering::SeqCst), 0);
            observed_clone.store(flag.load(Ordering::SeqCst), Ordering::SeqCst);
        },
        Some(&outer),
    );

    scheduler.wait_for_counter(&outer);
    assert!(observed.load(Ordering::SeqCst));
}

#[test]
fn test_many_waiters_on_one_counter() {
    let scheduler = TaskScheduler::with_config(config(4)).unwrap();
    let handle = scheduler.handle();
    let gate = Counter::new(0);
    let released = Arc::new(AtomicUsize::new(0));
    let waiters = Counter::new(0);

    // Hold the gate open with one slow task.
    scheduler.spawn(
        || std::thread::sleep(Duration::from_millis(20)),
        Some(&gate),
    );

    for _ in 0..50 {
        let handle = handle.clone();
        let gate = gate.clone();
        let released = released.clone();
        scheduler.spawn(
            move || {
                handle.wait_for_counter(&gate);
                released.fetch_add(1, Ordering::SeqCst);
            },
            Some(&waiters),
        );
    }

    scheduler.wait_for_counter(&waiters);
    assert_eq!(released.load(Ordering::SeqCst), 50);
    assert!(gate.is_complete());
}

#[test]
fn test_on_idle_runs_while_waiting() {
    let scheduler = TaskScheduler::with_config(config(2)).unwrap();
    let counter = Counter::new(0);
    scheduler.spawn(
        || std::thread::sleep(Duration::from_millis(20)),
        Some(&counter),
    );

    let mut idle_calls = 0usize;
    scheduler.wait_for_counter_with(&counter, || idle_calls += 1);
    assert!(counter.is_complete());
    assert!(idle_calls > 0);
}

#[test]
fn test_on_idle_runs_while_work_is_available() {
    // Nothing else drives the single worker, so every task runs inside the wait.
    let scheduler = TaskScheduler::with_config(config(1)).unwrap();
    let counter = Counter::new(0);
    for _ in 0..50 {
        scheduler.spawn(|| {}, Some(&counter));
    }

    let mut idle_calls = 0usize;
    scheduler.wait_for_counter_with(&counter, || idle_calls += 1);
    assert!(counter.is_complete());
    assert!(idle_calls >= 50, "on_idle ran only {idle_calls} times");
}
