//! Hazard-pointer reclamation.
//!
//! A [`HazardDomain`] owns a fixed table of [`HazardRecord`]s. Before a
//! thread dereferences a pointer it loaded from a shared atomic, it claims a
//! record, publishes the pointer into it, and re-reads the source to confirm
//! the pointer is still current. Unlinked nodes go through
//! [`HazardDomain::retire`] onto a thread-local list; once the list reaches
//! the scan threshold, the retiring thread snapshots every record and frees
//! the nodes no record mentions.
//!
//! The domain is deliberately type-erased: it stores raw addresses plus a
//! per-node drop thunk, so a single domain (and a single thread-local
//! registry) serves containers of any element type.

use std::cell::{Cell, RefCell};
use std::mem;
use std::process;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use educe::Educe;

use crate::spinlock::Spinlock;
use crate::sync::{lazy_static, thread_local, AtomicPtr, AtomicU64, Ordering};

/// Retire-list length at which a scan is triggered.
///
/// Keep this at least twice the record count of the domains it serves, or
/// scans may run before they can possibly free anything.
pub const DEFAULT_SCAN_THRESHOLD: usize = 64;

lazy_static! {
    static ref NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);
    static ref NEXT_DOMAIN_ID: AtomicU64 = AtomicU64::new(1);
}

thread_local! {
    static THREAD_TOKEN: Cell<u64> = Cell::new(0);
    static LOCAL_DOMAINS: RefCell<Vec<DomainMembership>> = RefCell::new(Vec::new());
}

// `std::thread::ThreadId` has no stable integer form, so threads get a small
// nonzero token of their own on first contact with any domain.
fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|token| {
        let cached = token.get();
        if cached != 0 {
            return cached;
        }
        let fresh = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
        token.set(fresh);
        fresh
    })
}

/// One slot of a domain's hazard table.
///
/// `owner` holds the claiming thread's token (0 = vacant), `pointer` the
/// address that thread may currently dereference. The record fills a cache
/// line of its own so scanners and owners do not false-share.
#[repr(align(128))]
#[derive(Debug)]
pub struct HazardRecord {
    owner: AtomicU64,
    pointer: AtomicPtr<u8>,
}

impl HazardRecord {
    fn vacant() -> Self {
        HazardRecord {
            owner: AtomicU64::new(0),
            pointer: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Publishes `ptr` as protected.
    ///
    /// Protection only counts once the caller has re-read the atomic the
    /// pointer came from and seen it unchanged; without that validation the
    /// node may already sit on someone's retire list.
    pub fn protect<N>(&self, ptr: *mut N) {
        self.pointer.store(ptr.cast(), Ordering::Release);
    }

    /// Withdraws protection, keeping ownership of the record.
    pub fn clear(&self) {
        self.pointer.store(ptr::null_mut(), Ordering::Release);
    }
}

/// A retired node: erased address plus the thunk that frees it.
struct Retired {
    ptr: NonNull<u8>,
    drop_fn: unsafe fn(*mut u8),
}

// Retired nodes may be freed by another thread than the one that allocated
// them (orphan adoption); `retire` bounds the payload by `Send` to match.
unsafe impl Send for Retired {}

impl Retired {
    /// # Safety
    /// `ptr` must be non-null and come from `Box::into_raw`.
    unsafe fn new<N: Send>(ptr: *mut N) -> Self {
        unsafe fn drop_boxed<N>(erased: *mut u8) {
            drop(Box::from_raw(erased.cast::<N>()));
        }
        Retired {
            ptr: NonNull::new_unchecked(ptr.cast()),
            drop_fn: drop_boxed::<N>,
        }
    }

    fn address(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    unsafe fn reclaim(self) {
        (self.drop_fn)(self.ptr.as_ptr());
    }
}

/// This thread's stake in one domain: which records it has claimed (by local
/// slot index) and the nodes it has retired. Dropped at thread exit, which
/// releases the records and hands any still-protected garbage to the
/// domain's orphan list.
struct DomainMembership {
    domain: Arc<HazardDomain>,
    slots: Vec<Option<usize>>,
    retired: Vec<Retired>,
}

impl Drop for DomainMembership {
    fn drop(&mut self) {
        for slot in self.slots.iter().flatten() {
            let record = &self.domain.records[*slot];
            record.pointer.store(ptr::null_mut(), Ordering::Release);
            record.owner.store(0, Ordering::Release);
        }

        let mut retired = mem::take(&mut self.retired);
        self.domain.scan_list(&mut retired);
        if !retired.is_empty() {
            self.domain.orphans.lock().append(&mut retired);
        }
    }
}

fn membership_mut<'a>(
    registry: &'a mut Vec<DomainMembership>,
    domain: &Arc<HazardDomain>,
) -> &'a mut DomainMembership {
    let position = match registry.iter().position(|m| m.domain.id == domain.id) {
        Some(position) => position,
        None => {
            registry.push(DomainMembership {
                domain: Arc::clone(domain),
                slots: Vec::new(),
                retired: Vec::new(),
            });
            registry.len() - 1
        }
    };
    &mut registry[position]
}

/// A hazard-pointer domain: the shared record table, the scan threshold, and
/// an orphan list for garbage left behind by exited threads.
///
/// Containers create a private domain by default; several structures may
/// share one (see [`default_domain`](crate::default_domain)), which trades
/// slightly longer scans for a single table.
///
/// All per-domain methods that involve the calling thread's state take the
/// domain as `&Arc<Self>`, because the thread-local registry keeps a clone
/// alive until the thread exits.
#[derive(Educe)]
#[educe(Debug)]
pub struct HazardDomain {
    id: u64,
    records: Box<[HazardRecord]>,
    scan_threshold: usize,
    #[educe(Debug(ignore))]
    orphans: Spinlock<Vec<Retired>>,
}

impl HazardDomain {
    pub fn new() -> Self {
        Self::with_records(64)
    }

    pub fn with_records(record_count: usize) -> Self {
        Self::with_config(record_count, DEFAULT_SCAN_THRESHOLD)
    }

    pub fn with_config(record_count: usize, scan_threshold: usize) -> Self {
        let records: Box<[HazardRecord]> = (0..record_count.max(1))
            .map(|_| HazardRecord::vacant())
            .collect();
        HazardDomain {
            id: NEXT_DOMAIN_ID.fetch_add(1, Ordering::Relaxed),
            records,
            scan_threshold: scan_threshold.max(1),
            orphans: Spinlock::new(Vec::new()),
        }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Returns the calling thread's record for `local_index`, claiming one
    /// from the table on first use and caching it until thread exit.
    ///
    /// Aborts the process when every record is owned: the table was sized
    /// for fewer concurrent threads than are present, which is a
    /// configuration bug, not a recoverable condition.
    pub fn acquire(this: &Arc<Self>, local_index: usize) -> &HazardRecord {
        let slot = LOCAL_DOMAINS.with(|registry| {
            let mut registry = registry.borrow_mut();
            let entry = membership_mut(&mut registry, this);
            if local_index >= entry.slots.len() {
                entry.slots.resize(local_index + 1, None);
            }
            match entry.slots[local_index] {
                Some(slot) => slot,
                None => {
                    let slot = this.claim_record();
                    entry.slots[local_index] = Some(slot);
                    slot
                }
            }
        });
        &this.records[slot]
    }

    fn claim_record(&self) -> usize {
        let token = current_thread_token();
        for (index, record) in self.records.iter().enumerate() {
            if record
                .owner
                .compare_exchange(0, token, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return index;
            }
        }
        process::abort();
    }

    /// Nulls every record the calling thread owns in this domain, keeping
    /// ownership. Called at the end of each protected operation.
    pub fn clear_local(this: &Arc<Self>) {
        LOCAL_DOMAINS.with(|registry| {
            let mut registry = registry.borrow_mut();
            let entry = membership_mut(&mut registry, this);
            for slot in entry.slots.iter().flatten() {
                this.records[*slot].clear();
            }
        });
    }

    /// Hands an unlinked node to the domain for deferred reclamation.
    ///
    /// # Safety
    /// `ptr` must come from `Box::into_raw`, be unreachable from every
    /// shared location, and not be retired twice.
    pub unsafe fn retire<N: Send>(this: &Arc<Self>, ptr: *mut N) {
        Self::retire_erased(this, Retired::new(ptr));
    }

    fn retire_erased(this: &Arc<Self>, retired: Retired) {
        // During thread teardown the registry may already be gone; park the
        // node on the orphan list for the next scan to adopt.
        #[cfg(not(loom))]
        if LOCAL_DOMAINS.try_with(|_| ()).is_err() {
            this.orphans.lock().push(retired);
            return;
        }

        let pending = LOCAL_DOMAINS.with(|registry| {
            let mut registry = registry.borrow_mut();
            let entry = membership_mut(&mut registry, this);
            entry.retired.push(retired);
            if entry.retired.len() >= this.scan_threshold {
                Some(mem::take(&mut entry.retired))
            } else {
                None
            }
        });

        // Reclamation runs with the registry borrow released: a payload's
        // drop may itself retire into this domain.
        if let Some(mut list) = pending {
            this.scan_list(&mut list);
            if !list.is_empty() {
                LOCAL_DOMAINS.with(|registry| {
                    let mut registry = registry.borrow_mut();
                    membership_mut(&mut registry, this).retired.append(&mut list);
                });
            }
        }
    }

    /// Scans the calling thread's retire list immediately, regardless of the
    /// threshold. Container destructors use this to settle accounts.
    pub fn scan_local(this: &Arc<Self>) {
        #[cfg(not(loom))]
        if LOCAL_DOMAINS.try_with(|_| ()).is_err() {
            return;
        }

        let mut list = LOCAL_DOMAINS.with(|registry| {
            let mut registry = registry.borrow_mut();
            mem::take(&mut membership_mut(&mut registry, this).retired)
        });
        this.scan_list(&mut list);
        if !list.is_empty() {
            LOCAL_DOMAINS.with(|registry| {
                let mut registry = registry.borrow_mut();
                membership_mut(&mut registry, this).retired.append(&mut list);
            });
        }
    }

    /// Number of nodes the calling thread has retired into this domain and
    /// not yet freed.
    pub fn local_retired_len(this: &Arc<Self>) -> usize {
        LOCAL_DOMAINS.with(|registry| {
            let mut registry = registry.borrow_mut();
            membership_mut(&mut registry, this).retired.len()
        })
    }

    /// Frees every node in `retired` that no record currently protects,
    /// after adopting whatever exited threads left on the orphan list.
    fn scan_list(&self, retired: &mut Vec<Retired>) {
        {
            let mut orphans = self.orphans.lock();
            retired.append(&mut orphans);
        }

        let snapshot: Vec<*mut u8> = self
            .records
            .iter()
            .map(|record| record.pointer.load(Ordering::Acquire))
            .collect();

        let mut kept = Vec::with_capacity(retired.len());
        for node in retired.drain(..) {
            if snapshot.contains(&node.address()) {
                kept.push(node);
            } else {
                // The node was unlinked before retirement and the snapshot
                // was taken after; a record published later would have
                // failed its validation re-read. Nobody holds this address.
                unsafe { node.reclaim() };
            }
        }
        *retired = kept;
    }
}

impl Default for HazardDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HazardDomain {
    fn drop(&mut self) {
        // Every membership holds an Arc, so reaching this point means no
        // thread can publish into these records anymore.
        let orphans = mem::take(self.orphans.get_mut());
        for node in orphans {
            unsafe { node.reclaim() };
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::HazardDomain;

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn acquire_caches_the_record() {
        let domain = Arc::new(HazardDomain::with_records(4));
        let first = HazardDomain::acquire(&domain, 0) as *const _;
        let second = HazardDomain::acquire(&domain, 0) as *const _;
        let other = HazardDomain::acquire(&domain, 1) as *const _;
        assert_eq!(first, second);
        assert_ne!(first, other);
    }

    #[test]
    fn retire_scans_at_threshold() {
        let drops = Arc::new(AtomicUsize::new(0));
        let domain = Arc::new(HazardDomain::with_config(2, 4));

        for _ in 0..4 {
            let node = Box::into_raw(Box::new(Counted(Arc::clone(&drops))));
            unsafe { HazardDomain::retire(&domain, node) };
        }

        assert_eq!(drops.load(Ordering::Relaxed), 4);
        assert_eq!(HazardDomain::local_retired_len(&domain), 0);
    }

    #[test]
    fn protection_blocks_reclaim() {
        let drops = Arc::new(AtomicUsize::new(0));
        let domain = Arc::new(HazardDomain::with_config(4, 1));

        let node = Box::into_raw(Box::new(Counted(Arc::clone(&drops))));
        HazardDomain::acquire(&domain, 0).protect(node);

        unsafe { HazardDomain::retire(&domain, node) };
        assert_eq!(drops.load(Ordering::Relaxed), 0);

        HazardDomain::acquire(&domain, 0).clear();
        HazardDomain::scan_local(&domain);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn retire_list_stays_bounded() {
        let drops = Arc::new(AtomicUsize::new(0));
        let domain = Arc::new(HazardDomain::with_config(4, 8));

        for _ in 0..100 {
            let node = Box::into_raw(Box::new(Counted(Arc::clone(&drops))));
            unsafe { HazardDomain::retire(&domain, node) };
            assert!(HazardDomain::local_retired_len(&domain) <= 8 + domain.record_count());
        }
        HazardDomain::scan_local(&domain);
        assert_eq!(drops.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn thread_exit_releases_records() {
        let domain = Arc::new(HazardDomain::with_records(1));

        let remote = Arc::clone(&domain);
        thread::spawn(move || {
            HazardDomain::acquire(&remote, 0);
        })
        .join()
        .unwrap();

        // The single record must be claimable again or this aborts.
        HazardDomain::acquire(&domain, 0);
    }

    #[test]
    fn exiting_thread_hands_protected_garbage_over() {
        let drops = Arc::new(AtomicUsize::new(0));
        let domain = Arc::new(HazardDomain::with_config(4, 1));

        let node = Box::into_raw(Box::new(Counted(Arc::clone(&drops))));
        HazardDomain::acquire(&domain, 0).protect(node);

        let remote = Arc::clone(&domain);
        let address = node as usize;
        thread::spawn(move || unsafe {
            HazardDomain::retire(&remote, address as *mut Counted);
        })
        .join()
        .unwrap();

        // The retiring thread scanned at exit, saw the protection, and
        // orphaned the node instead of freeing it.
        assert_eq!(drops.load(Ordering::Relaxed), 0);

        HazardDomain::acquire(&domain, 0).clear();
        HazardDomain::scan_local(&domain);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }
}
