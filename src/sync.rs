#[cfg(feature = "loom")]
mod imp {
    pub(crate) use loom::sync::{
        Mutex,
        atomic::{AtomicI32, AtomicPtr, AtomicU8, AtomicUsize, Ordering, fence},
    };

    pub(crate) fn spawn_work(work: impl FnOnce() + Send + 'static) {
        let _ = loom::thread::spawn(work);
    }
}

#[cfg(not(feature = "loom"))]
mod imp {
    pub(crate) use core::sync::atomic::{
        AtomicI32, AtomicPtr, AtomicU8, AtomicUsize, Ordering, fence,
    };
    pub(crate) use std::sync::Mutex;

    pub(crate) fn spawn_work(work: impl FnOnce() + Send + 'static) {
        rayon::spawn(work);
    }
}

pub(crate) use imp::*;
