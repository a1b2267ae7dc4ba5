#[cfg(loom)]
pub(crate) use {
    loom::hint::spin_loop,
    loom::lazy_static,
    loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    loom::thread_local,
};

#[cfg(not(loom))]
pub(crate) use {
    lazy_static::lazy_static,
    std::hint::spin_loop,
    std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    std::thread_local,
};
