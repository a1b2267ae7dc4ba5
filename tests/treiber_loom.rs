// Run with: RUSTFLAGS="--cfg loom" cargo test --release --test treiber_loom
#![cfg(loom)]

use std::sync::Arc;

use seraph::{MsQueue, Spinlock, TreiberList};

#[test]
fn spinlock_excludes_writers() {
    loom::model(|| {
        let lock = Arc::new(Spinlock::new(0usize));
        let other = Arc::clone(&lock);

        let handle = loom::thread::spawn(move || {
            *other.lock() += 1;
        });

        *lock.lock() += 1;
        handle.join().unwrap();

        assert_eq!(*lock.lock(), 2);
    });
}

#[test]
fn treiber_delivers_every_value_once() {
    let mut model = loom::model::Builder::new();
    model.preemption_bound = Some(3);
    model.check(|| {
        let list = Arc::new(TreiberList::new());
        let remote = Arc::clone(&list);

        let handle = loom::thread::spawn(move || {
            remote.push(1);
            remote.pop()
        });

        list.push(2);
        let mine = list.pop();
        let theirs = handle.join().unwrap();

        // Two pushes, two pops: each pop finds something, and between them
        // they deliver both values exactly once.
        let mut seen: Vec<i32> = mine.into_iter().chain(theirs).collect();
        while let Some(value) = list.pop() {
            seen.push(value);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
    });
}

#[test]
fn queue_delivers_across_threads() {
    let mut model = loom::model::Builder::new();
    model.preemption_bound = Some(2);
    model.check(|| {
        let queue = Arc::new(MsQueue::new());
        let producer = Arc::clone(&queue);

        let handle = loom::thread::spawn(move || {
            producer.push(7);
        });

        let popped = queue.pop();
        handle.join().unwrap();

        match popped {
            Some(value) => assert_eq!(value, 7),
            None => assert_eq!(queue.pop(), Some(7)),
        }
    });
}
