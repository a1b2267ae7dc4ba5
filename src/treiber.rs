//! Lock-free LIFO list. This is the structure [`AdaptiveStack`] switches to
//! after promotion; it also stands on its own.
//!
//! [`AdaptiveStack`]: crate::AdaptiveStack

use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::Arc;

use educe::Educe;

use crate::hazard::HazardDomain;
use crate::sync::{AtomicPtr, AtomicUsize, Ordering};

/// Hazard records for a private stack domain. The pop/top protocol needs a
/// single slot per thread, so sixteen records cover more threads than this
/// structure is tuned for.
const STACK_HAZARD_RECORDS: usize = 16;

struct Node<T> {
    value: ManuallyDrop<T>,
    // Written only between allocation and the publishing exchange, read only
    // behind a hazard or by the exclusive unlinker; never racy, so plain.
    next: *mut Node<T>,
}

unsafe impl<T: Send> Send for Node<T> {}

/// Treiber's stack: a singly-linked LIFO where push and pop race on the head
/// pointer with compare-exchange, and reclamation goes through a
/// [`HazardDomain`].
#[derive(Educe)]
#[educe(Debug)]
pub struct TreiberList<T> {
    head: AtomicPtr<Node<T>>,
    len: AtomicUsize,
    domain: Arc<HazardDomain>,
}

unsafe impl<T: Send> Send for TreiberList<T> {}
unsafe impl<T: Send> Sync for TreiberList<T> {}

impl<T: Send> TreiberList<T> {
    pub fn new() -> Self {
        Self::in_domain(Arc::new(HazardDomain::with_records(STACK_HAZARD_RECORDS)))
    }

    /// Builds a list that shares `domain` with other structures.
    pub fn in_domain(domain: Arc<HazardDomain>) -> Self {
        TreiberList {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
            domain,
        }
    }

    pub fn domain(&self) -> &Arc<HazardDomain> {
        &self.domain
    }

    pub fn push(&self, value: T) {
        self.link_new_node(Box::into_raw(Box::new(Node {
            value: ManuallyDrop::new(value),
            next: ptr::null_mut(),
        })));
    }

    /// Constructs the payload inside the freshly allocated node.
    pub fn emplace_with<F: FnOnce() -> T>(&self, make: F) {
        self.link_new_node(Box::into_raw(Box::new(Node {
            value: ManuallyDrop::new(make()),
            next: ptr::null_mut(),
        })));
    }

    fn link_new_node(&self, new_node: *mut Node<T>) {
        let mut old_head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*new_node).next = old_head };
            match self.head.compare_exchange_weak(
                old_head,
                new_node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => old_head = current,
            }
        }
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pop(&self) -> Option<T> {
        let hazard = HazardDomain::acquire(&self.domain, 0);
        let mut old_head = self.head.load(Ordering::Acquire);

        while !old_head.is_null() {
            hazard.protect(old_head);

            // The head may have moved (and the node been reclaimed) between
            // the load and the publish; only a stable re-read makes the
            // protection count.
            let current = self.head.load(Ordering::Acquire);
            if current != old_head {
                old_head = current;
                continue;
            }

            let next = unsafe { (*old_head).next };

            match self.head.compare_exchange_weak(
                old_head,
                next,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    hazard.clear();
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    // The exchange made this thread the sole unlinker. Late
                    // readers still sit behind their hazards, and those only
                    // read, so moving the payload out is safe.
                    let value = unsafe { ManuallyDrop::take(&mut (*old_head).value) };
                    unsafe { HazardDomain::retire(&self.domain, old_head) };
                    return Some(value);
                }
                Err(current) => old_head = current,
            }
        }

        hazard.clear();
        None
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Relaxed count; may lag in-flight operations.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}

impl<T: Send + Clone> TreiberList<T> {
    /// Copies the value at the head without unlinking it.
    pub fn top(&self) -> Option<T> {
        let hazard = HazardDomain::acquire(&self.domain, 0);
        let mut old_head = self.head.load(Ordering::Acquire);

        while !old_head.is_null() {
            hazard.protect(old_head);

            let current = self.head.load(Ordering::Acquire);
            if current != old_head {
                old_head = current;
                continue;
            }

            let value = T::clone(unsafe { &(*old_head).value });
            hazard.clear();
            return Some(value);
        }

        hazard.clear();
        None
    }
}

impl<T: Send> Default for TreiberList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for TreiberList<T> {
    fn drop(&mut self) {
        let mut node = self.head.load(Ordering::Relaxed);
        while !node.is_null() {
            let mut boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
            unsafe { ManuallyDrop::drop(&mut boxed.value) };
        }
        self.head.store(ptr::null_mut(), Ordering::Relaxed);
        self.len.store(0, Ordering::Relaxed);

        HazardDomain::scan_local(&self.domain);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::TreiberList;

    #[test]
    fn lifo_order() {
        let list = TreiberList::new();
        list.push(1);
        list.push(2);
        list.push(3);

        assert_eq!(list.top(), Some(3));
        assert_eq!(list.pop(), Some(3));
        assert_eq!(list.pop(), Some(2));
        assert_eq!(list.pop(), Some(1));
        assert_eq!(list.pop(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn top_does_not_remove() {
        let list = TreiberList::new();
        list.push(9);
        assert_eq!(list.top(), Some(9));
        assert_eq!(list.len(), 1);
        assert_eq!(list.pop(), Some(9));
    }

    #[test]
    fn emplace_with_constructs_in_place() {
        let list: TreiberList<String> = TreiberList::new();
        list.emplace_with(|| "built".to_string());
        list.emplace_with(String::default);
        assert_eq!(list.pop(), Some(String::new()));
        assert_eq!(list.pop(), Some("built".to_string()));
    }

    #[test]
    fn drop_frees_remaining_payloads() {
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let list = TreiberList::new();
            for _ in 0..10 {
                list.push(Counted(Arc::clone(&drops)));
            }
            let _ = list.pop();
        }
        assert_eq!(drops.load(Ordering::Relaxed), 10);
    }
}
