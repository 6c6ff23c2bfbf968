use crate::sync::{AtomicPtr, Ordering, spawn_work};
use crate::value::{AsyncValue, AsyncValueRef, ExecError};
use core::ptr;
use std::sync::Arc;

/// Process-wide services backing executions: the cancellation sentinel and
/// dispatch onto the worker pool.
#[derive(Debug)]
pub struct HostContext {
    /// Error-state sentinel installed by `cancel_execution`, null while the
    /// host is not cancelled. The host owns one reference on it.
    cancel_value: AtomicPtr<AsyncValue>,
}

impl HostContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cancel_value: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Run `work` on the worker pool, detached from the caller.
    pub fn enqueue_work(&self, work: impl FnOnce() + Send + 'static) {
        spawn_work(work);
    }

    /// The cancel sentinel, or null while execution is not cancelled. The
    /// returned pointer is backed by the host's own reference.
    #[must_use]
    pub fn cancel_async_value(&self) -> *const AsyncValue {
        self.cancel_value.load(Ordering::Acquire)
    }

    /// Request cancellation of everything executing under this host. Kernels
    /// that have not fired yet resolve their results to the sentinel instead
    /// of running.
    pub fn cancel_execution(&self, message: impl Into<Arc<str>>) {
        let sentinel = AsyncValueRef::error(ExecError::new(message));
        let raw = sentinel.into_raw().cast_mut();
        if self
            .cancel_value
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Lost to an earlier cancellation; this sentinel is unused.
            // SAFETY: `raw` carries the reference we failed to install.
            drop(unsafe { AsyncValueRef::from_raw(raw) });
        }
    }

    /// Clear a previous cancellation so new executions can proceed.
    pub fn clear_cancel(&self) {
        let raw = self.cancel_value.swap(ptr::null_mut(), Ordering::AcqRel);
        if !raw.is_null() {
            // SAFETY: the host owned one reference on the installed sentinel.
            drop(unsafe { AsyncValueRef::from_raw(raw) });
        }
    }
}

impl Default for HostContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HostContext {
    fn drop(&mut self) {
        self.clear_cancel();
    }
}

/// Per-invocation context handed to kernels; cheap to clone.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    host: Arc<HostContext>,
}

impl ExecutionContext {
    #[must_use]
    pub fn new(host: Arc<HostContext>) -> Self {
        Self { host }
    }

    #[must_use]
    pub fn host(&self) -> &Arc<HostContext> {
        &self.host
    }
}
