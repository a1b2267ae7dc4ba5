//! Mixed push/pop workload across thread counts and push ratios.
//!
//! Not a benchmark harness: a smoke demo that the containers keep their
//! books straight while every thread hammers them with a randomized mix.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use rand::Rng;

use seraph::{AdaptiveStack, MsQueue};

const OPS_PER_THREAD: usize = 100_000;

fn stack_round(threads: usize, push_ratio: f64) {
    let stack = Arc::new(AdaptiveStack::new());
    let pushes = Arc::new(AtomicU64::new(0));
    let pops = Arc::new(AtomicU64::new(0));

    let start = Instant::now();
    let workers: Vec<_> = (0..threads)
        .map(|tid| {
            let stack = Arc::clone(&stack);
            let pushes = Arc::clone(&pushes);
            let pops = Arc::clone(&pops);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for i in 0..OPS_PER_THREAD {
                    if rng.gen_bool(push_ratio) {
                        stack.push((tid * 1_000_000 + i) as u64);
                        pushes.fetch_add(1, Ordering::Relaxed);
                    } else if stack.pop().is_some() {
                        pops.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for handle in workers {
        handle.join().unwrap();
    }
    let elapsed = start.elapsed();

    let pushes = pushes.load(Ordering::Relaxed);
    let pops = pops.load(Ordering::Relaxed);
    assert_eq!(stack.len() as u64, pushes - pops);

    let total_ops = (threads * OPS_PER_THREAD) as f64;
    println!(
        "stack  threads={threads:2} push={:>3.0}% promoted={:5} {:>12.0} ops/s",
        push_ratio * 100.0,
        stack.is_using_cas(),
        total_ops / elapsed.as_secs_f64()
    );
}

fn queue_round(threads: usize, push_ratio: f64) {
    let queue = Arc::new(MsQueue::new());
    let pushes = Arc::new(AtomicU64::new(0));
    let pops = Arc::new(AtomicU64::new(0));

    let start = Instant::now();
    let workers: Vec<_> = (0..threads)
        .map(|tid| {
            let queue = Arc::clone(&queue);
            let pushes = Arc::clone(&pushes);
            let pops = Arc::clone(&pops);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for i in 0..OPS_PER_THREAD {
                    if rng.gen_bool(push_ratio) {
                        queue.push((tid * 1_000_000 + i) as u64);
                        pushes.fetch_add(1, Ordering::Relaxed);
                    } else if queue.pop().is_some() {
                        pops.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for handle in workers {
        handle.join().unwrap();
    }
    let elapsed = start.elapsed();

    let pushes = pushes.load(Ordering::Relaxed);
    let pops = pops.load(Ordering::Relaxed);
    assert_eq!(queue.len() as u64, pushes - pops);

    let total_ops = (threads * OPS_PER_THREAD) as f64;
    println!(
        "queue  threads={threads:2} push={:>3.0}% {:>12.0} ops/s",
        push_ratio * 100.0,
        total_ops / elapsed.as_secs_f64()
    );
}

fn main() {
    for &threads in &[2, 4, 8, 16] {
        for &push_ratio in &[0.2, 0.5, 0.8] {
            stack_round(threads, push_ratio);
            queue_round(threads, push_ratio);
        }
    }
}
