//! `spindle queue` — Stress the lock-free queue.

use anyhow::{bail, ensure};
use spindle_core::hazard::reclaim_if_possible;
use spindle_core::{HazardDomain, LockFreeQueue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

pub fn execute(producers: usize, consumers: usize, items: usize) -> anyhow::Result<()> {
    ensure!(producers > 0, "need at least one producer");
    ensure!(consumers > 0, "need at least one consumer");

    let queue = Arc::new(LockFreeQueue::new());
    let barrier = Arc::new(Barrier::new(producers + consumers));
    let done = Arc::new(AtomicBool::new(false));
    let start = Instant::now();

    let producer_threads: Vec<_> = (0..producers)
        .map(|p| {
            let queue = queue.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for seq in 0..items {
                    queue.push((p, seq));
                }
            })
        })
        .collect();

    let consumer_threads: Vec<_> = (0..consumers)
        .map(|_| {
            let queue = queue.clone();
            let barrier = barrier.clone();
            let done = done.clone();
            thread::spawn(move || {
                barrier.wait();
                // Last sequence seen per producer; FIFO means strictly increasing
                let mut last: Vec<Option<usize>> = vec![None; producers];
                let mut taken = Vec::new();
                loop {
                    let Some((p, seq)) = queue.pop() else {
                        if done.load(Ordering::SeqCst) && queue.is_empty() {
                            break;
                        }
                        thread::yield_now();
                        continue;
                    };
                    if last[p].map_or(false, |prev| seq <= prev) {
                        return Err((p, seq));
                    }
                    last[p] = Some(seq);
                    taken.push((p, seq));
                }
                reclaim_if_possible();
                Ok(taken)
            })
        })
        .collect();

    for producer in producer_threads {
        if producer.join().is_err() {
            bail!("producer thread panicked");
        }
    }
    done.store(true, Ordering::SeqCst);

    let mut seen = vec![vec![false; items]; producers];
    for consumer in consumer_threads {
        let taken = match consumer.join() {
            Ok(Ok(taken)) => taken,
            Ok(Err((p, seq))) => bail!("producer {} item {} popped out of order", p, seq),
            Err(_) => bail!("consumer thread panicked"),
        };
        for (p, seq) in taken {
            if std::mem::replace(&mut seen[p][seq], true) {
                bail!("producer {} item {} delivered twice", p, seq);
            }
        }
    }

    let expected = producers * items;
    let delivered = seen.iter().flatten().filter(|&&s| s).count();
    let elapsed = start.elapsed();
    let reclaim = HazardDomain::global().stats();

    println!("Producers:    {}", producers);
    println!("Consumers:    {}", consumers);
    println!("Delivered:    {} / {}", delivered, expected);
    println!("Elapsed:      {:.2?}", elapsed);
    println!(
        "Throughput:   {:.0} items/s",
        delivered as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!();
    println!("Retired:      {}", reclaim.retired);
    println!("Reclaimed:    {}", reclaim.reclaimed);
    println!("Pending:      {}", reclaim.pending());

    if delivered != expected {
        bail!("lost {} items", expected - delivered);
    }
    Ok(())
}
