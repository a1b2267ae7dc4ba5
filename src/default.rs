//! The process-wide default hazard domain.
//!
//! Containers build private domains by default; this one exists for callers
//! wiring several of their own lock-free structures onto a single shared
//! hazard table via the `in_domain` constructors.

use std::sync::Arc;

use crate::hazard::HazardDomain;
use crate::sync::lazy_static;

const DEFAULT_DOMAIN_RECORDS: usize = 64;

lazy_static! {
    static ref DOMAIN: Arc<HazardDomain> =
        Arc::new(HazardDomain::with_config(DEFAULT_DOMAIN_RECORDS, 2 * DEFAULT_DOMAIN_RECORDS));
}

/// Returns the default global domain.
pub fn default_domain() -> &'static Arc<HazardDomain> {
    &DOMAIN
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::default_domain;
    use crate::hazard::HazardDomain;

    #[test]
    fn shared_across_threads() {
        assert_eq!(default_domain().record_count(), 64);

        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let payload = Arc::clone(&drops);
        thread::spawn(move || {
            let node = Box::into_raw(Box::new(Counted(payload)));
            unsafe { HazardDomain::retire(default_domain(), node) };
            // Below the scan threshold; the thread-exit scan frees it.
        })
        .join()
        .unwrap();

        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }
}
