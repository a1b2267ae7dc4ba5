use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

use crate::sync::{spin_loop, AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A test-and-test-and-set spinlock that owns the data it protects.
///
/// Meant for critical sections that are a handful of memory accesses; the
/// waiting path burns CPU instead of parking the thread. Unfair and not
/// reentrant. The whole lock sits on its own cache line so waiters polling
/// the state word do not collide with neighbouring data.
#[repr(align(128))]
pub struct Spinlock<U> {
    state: AtomicU32,
    data: UnsafeCell<U>,
}

unsafe impl<U: Send> Send for Spinlock<U> {}
unsafe impl<U: Send> Sync for Spinlock<U> {}

impl<U> Spinlock<U> {
    pub fn new(data: U) -> Self {
        Spinlock {
            state: AtomicU32::new(UNLOCKED),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock, spinning until it is free.
    pub fn lock(&self) -> SpinlockGuard<'_, U> {
        // Uncontended path: a single exchange.
        if self.state.swap(LOCKED, Ordering::Acquire) == UNLOCKED {
            return SpinlockGuard { lock: self };
        }

        loop {
            // Poll with plain loads so waiters share the line in read mode
            // until it actually changes.
            while self.state.load(Ordering::Relaxed) != UNLOCKED {
                spin_loop();
            }

            if self.state.swap(LOCKED, Ordering::Acquire) == UNLOCKED {
                return SpinlockGuard { lock: self };
            }
        }
    }

    /// One exchange attempt; `None` when the lock is held.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, U>> {
        if self.state.swap(LOCKED, Ordering::Acquire) == UNLOCKED {
            Some(SpinlockGuard { lock: self })
        } else {
            None
        }
    }

    /// Direct access through exclusive ownership, no locking involved.
    pub fn get_mut(&mut self) -> &mut U {
        unsafe { &mut *self.data.get() }
    }
}

pub struct SpinlockGuard<'a, U> {
    lock: &'a Spinlock<U>,
}

impl<U> Deref for SpinlockGuard<'_, U> {
    type Target = U;

    fn deref(&self) -> &U {
        // Holding the guard is exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<U> DerefMut for SpinlockGuard<'_, U> {
    fn deref_mut(&mut self) -> &mut U {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<U> Drop for SpinlockGuard<'_, U> {
    fn drop(&mut self) {
        self.lock.state.store(UNLOCKED, Ordering::Release);
    }
}
