//! Michael–Scott unbounded FIFO queue.
//!
//! `head` always points at a sentinel whose payload is absent; the real
//! elements hang off `head.next` through `tail`. `tail` may lag one node
//! behind the true end while a push is mid-flight, and whichever thread
//! notices helps it along. Dequeued sentinels are reclaimed through a
//! [`HazardDomain`]; pop and the read-only walks keep two hazard slots.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Arc;

use educe::Educe;

use crate::hazard::HazardDomain;
use crate::sync::{AtomicPtr, AtomicUsize, Ordering};

/// Hazard records for a private queue domain. Pop and the read-only walks
/// hold two slots per thread, so the table is twice the stack's.
const QUEUE_HAZARD_RECORDS: usize = 32;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    // Absent on the sentinel, present on live nodes. Taken (under the head
    // exchange win) when the node becomes the new sentinel.
    value: UnsafeCell<Option<T>>,
}

unsafe impl<T: Send> Send for Node<T> {}

impl<T> Node<T> {
    fn sentinel() -> Self {
        Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(None),
        }
    }

    fn with_value(value: T) -> Self {
        Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(Some(value)),
        }
    }
}

/// Lock-free unbounded FIFO.
#[derive(Educe)]
#[educe(Debug)]
pub struct MsQueue<T> {
    head: AtomicPtr<Node<T>>,
    tail: AtomicPtr<Node<T>>,
    len: AtomicUsize,
    domain: Arc<HazardDomain>,
}

unsafe impl<T: Send> Send for MsQueue<T> {}
unsafe impl<T: Send> Sync for MsQueue<T> {}

impl<T: Send> MsQueue<T> {
    pub fn new() -> Self {
        Self::in_domain(Arc::new(HazardDomain::with_records(QUEUE_HAZARD_RECORDS)))
    }

    /// Builds a queue that shares `domain` with other structures.
    pub fn in_domain(domain: Arc<HazardDomain>) -> Self {
        let sentinel = Box::into_raw(Box::new(Node::sentinel()));
        MsQueue {
            head: AtomicPtr::new(sentinel),
            tail: AtomicPtr::new(sentinel),
            len: AtomicUsize::new(0),
            domain,
        }
    }

    pub fn domain(&self) -> &Arc<HazardDomain> {
        &self.domain
    }

    pub fn push(&self, value: T) {
        self.enqueue_node(Box::into_raw(Box::new(Node::with_value(value))));
    }

    /// Constructs the payload inside the freshly allocated node.
    pub fn emplace_with<F: FnOnce() -> T>(&self, make: F) {
        self.enqueue_node(Box::into_raw(Box::new(Node::with_value(make()))));
    }

    pub fn push_range<I: IntoIterator<Item = T>>(&self, values: I) {
        for value in values {
            self.push(value);
        }
    }

    fn enqueue_node(&self, new_node: *mut Node<T>) {
        let hazard_tail = HazardDomain::acquire(&self.domain, 0);

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            hazard_tail.protect(tail);
            if self.tail.load(Ordering::Acquire) != tail {
                continue;
            }

            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if self.tail.load(Ordering::Acquire) != tail {
                continue;
            }

            if next.is_null() {
                let tail_next = unsafe { &(*tail).next };
                if tail_next
                    .compare_exchange_weak(
                        ptr::null_mut(),
                        new_node,
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // Best effort: another thread may already have helped the
                    // tail forward, in which case this fails harmlessly.
                    let _ = self.tail.compare_exchange(
                        tail,
                        new_node,
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    self.len.fetch_add(1, Ordering::Relaxed);
                    HazardDomain::clear_local(&self.domain);
                    return;
                }
            } else {
                // Lagging tail: help it along and retry.
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let hazard_head = HazardDomain::acquire(&self.domain, 0);
        let hazard_next = HazardDomain::acquire(&self.domain, 1);

        loop {
            let head = self.head.load(Ordering::Acquire);
            hazard_head.protect(head);
            if self.head.load(Ordering::Acquire) != head {
                continue;
            }

            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            hazard_next.protect(next);
            if self.head.load(Ordering::Acquire) != head {
                continue;
            }

            if next.is_null() {
                HazardDomain::clear_local(&self.domain);
                return None;
            }

            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                // Non-empty but the tail still points at the sentinel: a
                // push is mid-flight. Help and retry.
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                continue;
            }

            if self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.len.fetch_sub(1, Ordering::Relaxed);
                // `next` is the new sentinel; the exchange winner moves its
                // payload out while the hazard keeps the node itself alive.
                let value = unsafe { ptr::replace((*next).value.get(), None) };
                HazardDomain::clear_local(&self.domain);
                unsafe { HazardDomain::retire(&self.domain, head) };
                return value;
            }
        }
    }

    /// Relaxed count; may lag in-flight operations.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len.load(Ordering::Relaxed) == 0
    }
}

impl<T: Send + Clone> MsQueue<T> {
    /// Copies the value at the front without removing it.
    pub fn front(&self) -> Option<T> {
        let hazard_head = HazardDomain::acquire(&self.domain, 0);
        let hazard_next = HazardDomain::acquire(&self.domain, 1);

        loop {
            let head = self.head.load(Ordering::Acquire);
            hazard_head.protect(head);
            if self.head.load(Ordering::Acquire) != head {
                continue;
            }

            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            hazard_next.protect(next);
            if self.head.load(Ordering::Acquire) != head {
                continue;
            }

            if next.is_null() {
                HazardDomain::clear_local(&self.domain);
                return None;
            }

            let value = unsafe { (*(*next).value.get()).clone() };
            HazardDomain::clear_local(&self.domain);
            return value;
        }
    }

    /// Walks to the last node and copies its value, rotating the two hazard
    /// slots as it advances.
    ///
    /// O(n), and the answer is only guaranteed to have been the tail at some
    /// instant during the walk.
    pub fn back(&self) -> Option<T> {
        let hazard_curr = HazardDomain::acquire(&self.domain, 0);
        let hazard_next = HazardDomain::acquire(&self.domain, 1);

        loop {
            let head = self.head.load(Ordering::Acquire);
            hazard_curr.protect(head);
            if self.head.load(Ordering::Acquire) != head {
                continue;
            }

            let mut current = unsafe { (*head).next.load(Ordering::Acquire) };
            hazard_next.protect(current);
            if self.head.load(Ordering::Acquire) != head {
                continue;
            }

            if current.is_null() {
                HazardDomain::clear_local(&self.domain);
                return None;
            }

            // From here on `current` is protected by slot 0 and each
            // candidate `next` by slot 1 until it has been re-validated.
            hazard_curr.protect(current);
            hazard_next.clear();

            loop {
                let next = unsafe { (*current).next.load(Ordering::Acquire) };

                if next.is_null() {
                    let value = unsafe { (*(*current).value.get()).clone() };
                    HazardDomain::clear_local(&self.domain);
                    return value;
                }

                hazard_next.protect(next);
                if unsafe { (*current).next.load(Ordering::Acquire) } != next {
                    continue;
                }

                current = next;
                hazard_curr.protect(current);
                hazard_next.clear();
            }
        }
    }
}

impl<T: Send> Default for MsQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for MsQueue<T> {
    fn drop(&mut self) {
        let mut node = self.head.load(Ordering::Relaxed);
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Ordering::Relaxed);
        }
        self.head.store(ptr::null_mut(), Ordering::Relaxed);
        self.tail.store(ptr::null_mut(), Ordering::Relaxed);
        self.len.store(0, Ordering::Relaxed);

        HazardDomain::scan_local(&self.domain);
    }
}
