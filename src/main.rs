use fibertask::{Counter, TaskScheduler};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("fibertask - Cooperative Fiber-Based Task Scheduler\n");

    let num_threads = 4;
    let scheduler = match TaskScheduler::new(num_threads) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            eprintln!("Failed to start scheduler: {e}");
            return;
        }
    };
    if let Err(e) = scheduler.init_main_thread_worker() {
        eprintln!("Failed to bind main thread: {e}");
        return;
    }
    println!("Initialized scheduler with {} workers\n", scheduler.thread_count());

    // Example 1: Nested spawn with a fiber wait
    println!("Example 1: Nested spawn");
    let frame = Counter::new(0);
    let handle = scheduler.handle();
    let result = Arc::new(AtomicUsize::new(0));
    let result_clone = result.clone();
    scheduler.spawn_named(
        "parent",
        move || {
            let children = Counter::new(0);
            for i in 0..4 {
                let result = result_clone.clone();
                handle.spawn(
                    move || {
                        result.fetch_add((i * 25..(i + 1) * 25).sum(), Ordering::SeqCst);
                    },
                    Some(&children),
                );
            }
            handle.wait_for_counter(&children);
        },
        Some(&frame),
    );
    scheduler.wait_for_counter(&frame);
    println!("  Sum 0..100 = {}\n", result.load(Ordering::SeqCst));

    // Example 2: Parallel for
    println!("Example 2: Parallel for");
    let start = Instant::now();
    let total = Arc::new(AtomicUsize::new(0));
    let total_clone = total.clone();
    let counter = Counter::new(0);
    scheduler.parallel_for(
        100_000,
        1_000,
        move |begin, end| {
            total_clone.fetch_add((begin..end).sum(), Ordering::Relaxed);
        },
        Some(&counter),
    );
    scheduler.wait_for_counter(&counter);
    println!(
        "  Summed {} indices in {:?}\n",
        total.load(Ordering::Relaxed),
        start.elapsed()
    );

    // Example 3: A frame loop pumping main-thread work
    println!("Example 3: Main-thread affinity");
    let main_id = std::thread::current().id();
    let handle = scheduler.handle();
    let counter = Counter::new(0);
    let loaded = Counter::new(0);
    let loaded_clone = loaded.clone();
    scheduler.spawn(
        move || {
            // Pretend to decode an asset, then hand the upload to the main thread.
            std::thread::sleep(Duration::from_millis(5));
            handle.submit_main_thread_task(
                move || {
                    assert_eq!(std::thread::current().id(), main_id);
                    println!("  Uploaded asset on the main thread");
                },
                Some(&loaded_clone),
            );
        },
        Some(&counter),
    );
    scheduler.wait_for_counter(&counter);
    let mut frames = 0;
    while !loaded.is_complete() {
        scheduler.pump_main_thread_tasks();
        frames += 1;
    }
    println!("  Asset ready after {frames} frame(s)\n");

    // Example 4: Throughput
    println!("Example 4: High-throughput benchmark");
    let num_tasks = 10_007;
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Counter::new(0);
    let start = Instant::now();
    for _ in 0..num_tasks {
        let hits = hits.clone();
        scheduler.spawn(
            move || {
                hits.fetch_add(1, Ordering::Relaxed);
            },
            Some(&counter),
        );
    }
    scheduler.wait_for_counter(&counter);
    let duration = start.elapsed();
    println!("  Executed {} tasks in {:?}", hits.load(Ordering::Relaxed), duration);
    println!(
        "  Throughput: {:.2} tasks/second",
        num_tasks as f64 / duration.as_secs_f64()
    );
    println!("  Pool: {:?}\n", scheduler.stats());

    println!("Shutting down scheduler...");
    match scheduler.shutdown() {
        Ok(()) => println!("Done!"),
        Err(e) => eprintln!("Shutdown error: {e}"),
    }
}
