//! `spindle count` — Run increment tasks and check the total.

use anyhow::{bail, Context};
use spindle_core::{LocalOrder, PoolConfig, ShutdownMode, WorkerPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub fn execute(tasks: usize, workers: usize, lifo: bool) -> anyhow::Result<()> {
    let order = if lifo {
        LocalOrder::Lifo
    } else {
        LocalOrder::Fifo
    };
    let pool = WorkerPool::with_config(PoolConfig::new(workers).with_local_order(order))
        .context("failed to start worker pool")?;

    let counter = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..tasks)
        .map(|_| {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect();

    let mut failures = 0usize;
    for handle in &handles {
        if let Err(e) = handle.wait() {
            tracing::error!(task = %handle.id(), error = %e, "task did not complete");
            failures += 1;
        }
    }

    pool.shutdown(ShutdownMode::GracefulDrain);
    let elapsed = start.elapsed();
    let total = counter.load(Ordering::SeqCst);
    let stats = pool.stats();

    println!("Workers:      {} ({:?})", workers, order);
    println!("Tasks:        {}", tasks);
    println!("Counter:      {}", total);
    println!("Elapsed:      {:.2?}", elapsed);
    println!(
        "Throughput:   {:.0} tasks/s",
        tasks as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!();
    println!("Local pops:   {}", stats.local_pops);
    println!("Global pops:  {}", stats.global_pops);
    println!("Steals:       {}", stats.steals);

    if failures > 0 || total != tasks {
        bail!(
            "expected {} increments, counted {} ({} tasks failed)",
            tasks,
            total,
            failures
        );
    }
    Ok(())
}
