//! The adaptive stack.
//!
//! [`AdaptiveStack`] opens life as a spinlocked `Vec`, the cheapest possible
//! stack while one thread has it to itself, and watches how many operations
//! are in flight at once. A sustained streak of concurrent operations trips a
//! one-way promotion onto the lock-free [`TreiberList`]. The switch keeps
//! every element and the LIFO relation, and `using_cas` never goes back.

use std::mem;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use educe::Educe;

use crate::spinlock::Spinlock;
use crate::sync::{AtomicBool, AtomicUsize, Ordering};
use crate::treiber::TreiberList;

/// Concurrent in-flight operations that count as contention.
const DEFAULT_THREAD_THRESHOLD: usize = 3;
/// Consecutive contended observations before promotion is requested.
const DEFAULT_STREAK_THRESHOLD: usize = 64;

// Lock poisoning carries no information here: a panicking operation cannot
// leave either representation torn.
fn read_mode(lock: &RwLock<()>) -> RwLockReadGuard<'_, ()> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_mode(lock: &RwLock<()>) -> RwLockWriteGuard<'_, ()> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// A LIFO stack that adapts its representation to observed contention.
///
/// Mode A (initial): elements in a `Vec` behind a [`Spinlock`]; `top` is the
/// last element. Mode B (after promotion): elements in a [`TreiberList`].
/// Promotion is triggered by `promotion_streak_threshold` consecutive
/// operations that each saw at least `contention_thread_threshold`
/// operations in flight, happens at most once, and preserves LIFO order.
///
/// Readers (`top`, `len`, `is_empty`) dispatch on the current mode but never
/// trigger promotion.
#[derive(Educe)]
#[educe(Debug)]
pub struct AdaptiveStack<T> {
    /// Readers = operations, writer = the one promotion.
    mode_lock: RwLock<()>,
    #[educe(Debug(ignore))]
    spin_data: Spinlock<Vec<T>>,
    cas: TreiberList<T>,
    using_cas: AtomicBool,
    contention_thread_threshold: usize,
    promotion_streak_threshold: usize,
    active_ops: AtomicUsize,
    contention_streak: AtomicUsize,
    promotion_requested: AtomicBool,
}

/// Scope marker for one mutating operation: bumps `active_ops`, feeds the
/// contention observer, and always un-bumps on the way out.
struct ActiveOp<'a, T> {
    stack: &'a AdaptiveStack<T>,
}

impl<'a, T: Send> ActiveOp<'a, T> {
    fn enter(stack: &'a AdaptiveStack<T>) -> Self {
        let active_now = stack.active_ops.fetch_add(1, Ordering::Relaxed) + 1;
        stack.observe_contention(active_now);
        ActiveOp { stack }
    }
}

impl<T> Drop for ActiveOp<'_, T> {
    fn drop(&mut self) {
        self.stack.active_ops.fetch_sub(1, Ordering::Relaxed);
    }
}

impl<T: Send> AdaptiveStack<T> {
    pub fn new() -> Self {
        Self::with_thresholds(0, DEFAULT_THREAD_THRESHOLD, DEFAULT_STREAK_THRESHOLD)
    }

    /// Pre-sizes the spin-mode buffer.
    pub fn with_capacity(reserve_hint: usize) -> Self {
        Self::with_thresholds(reserve_hint, DEFAULT_THREAD_THRESHOLD, DEFAULT_STREAK_THRESHOLD)
    }

    /// Full control over the promotion tunables.
    ///
    /// `contention_thread_threshold` is clamped to at least 2 (a single
    /// in-flight operation is never contention) and `streak_threshold` to at
    /// least 1.
    pub fn with_thresholds(
        reserve_hint: usize,
        contention_thread_threshold: usize,
        streak_threshold: usize,
    ) -> Self {
        AdaptiveStack {
            mode_lock: RwLock::new(()),
            spin_data: Spinlock::new(Vec::with_capacity(reserve_hint)),
            cas: TreiberList::new(),
            using_cas: AtomicBool::new(false),
            contention_thread_threshold: contention_thread_threshold.max(2),
            promotion_streak_threshold: streak_threshold.max(1),
            active_ops: AtomicUsize::new(0),
            contention_streak: AtomicUsize::new(0),
            promotion_requested: AtomicBool::new(false),
        }
    }

    fn observe_contention(&self, active_now: usize) {
        if self.using_cas.load(Ordering::Relaxed) {
            return;
        }

        if active_now >= self.contention_thread_threshold {
            let streak = self.contention_streak.fetch_add(1, Ordering::Relaxed) + 1;
            if streak >= self.promotion_streak_threshold {
                self.promotion_requested.store(true, Ordering::Relaxed);
            }
        } else {
            self.contention_streak.store(0, Ordering::Relaxed);
        }
    }

    fn maybe_promote_to_cas(&self) {
        if self.using_cas.load(Ordering::Acquire)
            || !self.promotion_requested.load(Ordering::Relaxed)
        {
            return;
        }

        let _mode = write_mode(&self.mode_lock);

        if self.using_cas.load(Ordering::Relaxed) {
            return;
        }

        let transfer: Vec<T> = mem::take(&mut *self.spin_data.lock());

        // Oldest element first, so the pre-promotion top lands at the new
        // head and the pop order is unchanged.
        for value in transfer {
            self.cas.push(value);
        }

        self.using_cas.store(true, Ordering::Release);
    }

    pub fn push(&self, value: T) {
        let _op = ActiveOp::enter(self);
        self.maybe_promote_to_cas();

        let _mode = read_mode(&self.mode_lock);
        if self.using_cas.load(Ordering::Acquire) {
            self.cas.push(value);
        } else {
            self.spin_data.lock().push(value);
        }
    }

    /// Constructs the payload inside the operation; the spin-mode critical
    /// section stays a single `Vec` push.
    pub fn emplace_with<F: FnOnce() -> T>(&self, make: F) {
        let _op = ActiveOp::enter(self);
        self.maybe_promote_to_cas();

        let _mode = read_mode(&self.mode_lock);
        if self.using_cas.load(Ordering::Acquire) {
            self.cas.emplace_with(make);
        } else {
            let value = make();
            self.spin_data.lock().push(value);
        }
    }

    /// Capacity hint for the spin-mode buffer, in the sense of
    /// [`Vec::reserve`]. Advisory: after promotion there is nothing to
    /// reserve and the call does nothing. `len()` is never affected.
    pub fn reserve(&self, additional: usize) {
        let _op = ActiveOp::enter(self);
        self.maybe_promote_to_cas();

        let _mode = read_mode(&self.mode_lock);
        if self.using_cas.load(Ordering::Acquire) {
            return;
        }
        self.spin_data.lock().reserve(additional);
    }

    pub fn pop(&self) -> Option<T> {
        let _op = ActiveOp::enter(self);
        self.maybe_promote_to_cas();

        let _mode = read_mode(&self.mode_lock);
        if self.using_cas.load(Ordering::Acquire) {
            return self.cas.pop();
        }
        self.spin_data.lock().pop()
    }

    pub fn is_empty(&self) -> bool {
        let _mode = read_mode(&self.mode_lock);
        if self.using_cas.load(Ordering::Acquire) {
            return self.cas.is_empty();
        }
        self.spin_data.lock().is_empty()
    }

    /// Exact while in spin mode; relaxed (may lag in-flight operations)
    /// after promotion.
    pub fn len(&self) -> usize {
        let _mode = read_mode(&self.mode_lock);
        if self.using_cas.load(Ordering::Acquire) {
            return self.cas.len();
        }
        self.spin_data.lock().len()
    }

    /// Whether promotion has happened. Monotonic: once `true`, always
    /// `true`.
    pub fn is_using_cas(&self) -> bool {
        self.using_cas.load(Ordering::Acquire)
    }
}

impl<T: Send + Clone> AdaptiveStack<T> {
    /// Copies the top element without removing it. Never triggers
    /// promotion.
    pub fn top(&self) -> Option<T> {
        let _mode = read_mode(&self.mode_lock);
        if self.using_cas.load(Ordering::Acquire) {
            return self.cas.top();
        }
        self.spin_data.lock().last().cloned()
    }
}

impl<T: Send> Default for AdaptiveStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::AdaptiveStack;

    #[test]
    fn lifo_sequence() {
        let stack = AdaptiveStack::new();
        stack.push(1);
        stack.push(2);
        stack.push(3);

        assert_eq!(stack.top(), Some(3));
        assert_eq!(stack.pop(), Some(3));
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);
        assert!(stack.is_empty());
    }

    #[test]
    fn emplace_with_default_payload() {
        let stack: AdaptiveStack<u64> = AdaptiveStack::new();
        stack.emplace_with(u64::default);
        assert_eq!(stack.pop(), Some(0));
    }

    #[test]
    fn reserve_changes_nothing_observable() {
        let stack: AdaptiveStack<u32> = AdaptiveStack::new();
        stack.reserve(1024);
        assert_eq!(stack.len(), 0);
        assert!(!stack.is_using_cas());

        stack.push(7);
        stack.reserve(0);
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn single_thread_never_promotes() {
        let stack = AdaptiveStack::with_thresholds(0, 2, 1);
        for i in 0..10_000 {
            stack.push(i);
            let _ = stack.pop();
        }
        assert!(!stack.is_using_cas());
    }

    #[test]
    fn promotion_keeps_base_elements_in_order() {
        let stack = Arc::new(AdaptiveStack::with_thresholds(0, 2, 1));
        stack.push(1);
        stack.push(2);
        stack.push(3);

        // Each worker pushes a marker then pops; pops never outnumber pushes
        // at any instant, so the three base elements stay untouched while
        // the overlapping traffic trips the promotion.
        let barrier = Arc::new(Barrier::new(2));
        let workers: Vec<_> = (0..2u64)
            .map(|tid| {
                let stack = Arc::clone(&stack);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..200_000u64 {
                        if stack.is_using_cas() {
                            break;
                        }
                        stack.push(1_000_000 + tid * 1_000_000 + i);
                        let _ = stack.pop();
                    }
                })
            })
            .collect();

        for handle in workers {
            handle.join().unwrap();
        }

        assert!(stack.is_using_cas());
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.pop(), Some(3));
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);
    }
}
