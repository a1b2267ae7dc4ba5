//! Concurrent LIFO and FIFO containers that stay cheap when uncontended.
//!
//! [`AdaptiveStack`] starts as a spinlocked vector, since that is the
//! fastest stack while one thread has it to itself, and promotes itself,
//! once and irreversibly, to a lock-free Treiber list when it keeps
//! observing concurrent callers.
//! [`MsQueue`] is a Michael–Scott unbounded queue. Both reclaim unlinked
//! nodes safely through hazard pointers ([`HazardDomain`]): a thread
//! publishes the pointer it is about to dereference, re-validates the
//! source, and retired nodes are only freed once a scan proves no thread
//! still advertises them.

pub mod default;
pub use self::default::default_domain;
pub mod hazard;
pub mod queue;
pub mod spinlock;
pub mod stack;
pub(crate) mod sync;
pub mod treiber;

pub use self::hazard::{HazardDomain, HazardRecord};
pub use self::queue::MsQueue;
pub use self::spinlock::{Spinlock, SpinlockGuard};
pub use self::stack::AdaptiveStack;
pub use self::treiber::TreiberList;
