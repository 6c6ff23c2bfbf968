use crate::location::DecodedLocation;
use crate::sync::{AtomicU8, AtomicUsize, Mutex, Ordering, fence};
use core::any::Any;
use core::fmt;
use core::mem;
use core::ops::Deref;
use core::ptr::NonNull;
use std::sync::Arc;
use thiserror::Error;

/// Error payload carried by an [`AsyncValue`] in the `Error` state.
///
/// Cheap to clone; clones share the message, so two clones of the same error
/// stay distinguishable from an equal-looking error minted elsewhere.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ExecError {
    message: Arc<str>,
    location: Option<DecodedLocation>,
}

impl ExecError {
    #[must_use]
    pub fn new(message: impl Into<Arc<str>>) -> Self {
        Self {
            message: message.into(),
            location: None,
        }
    }

    #[must_use]
    pub fn with_location(message: impl Into<Arc<str>>, location: DecodedLocation) -> Self {
        Self {
            message: message.into(),
            location: Some(location),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn location(&self) -> Option<&DecodedLocation> {
        self.location.as_ref()
    }
}

/// State of an [`AsyncValue`]. Once available (`Concrete` or `Error`) a value
/// never changes state again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueState {
    Unavailable = 0,
    Concrete = 1,
    Error = 2,
}

impl ValueState {
    #[must_use]
    pub fn is_available(self) -> bool {
        !matches!(self, Self::Unavailable)
    }

    #[must_use]
    pub fn is_concrete(self) -> bool {
        matches!(self, Self::Concrete)
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        matches!(self, Self::Error)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Unavailable,
            1 => Self::Concrete,
            2 => Self::Error,
            _ => unreachable!("ValueState::from_u8: corrupt state"),
        }
    }
}

enum Payload {
    Empty,
    Concrete(Box<dyn Any + Send + Sync>),
    Error(ExecError),
    /// An indirect value resolved to `target`; reads chain through it.
    Forwarded(AsyncValueRef),
}

type Waiter = Box<dyn FnOnce() + Send>;

struct Inner {
    payload: Payload,
    waiters: Vec<Waiter>,
}

/// A shared, reference-counted cell holding an asynchronous value.
///
/// The cell is in exactly one of three states: unavailable, concrete, or
/// error. Completion is one-shot; `and_then` subscriptions run inline when
/// the value is already available and on the completing thread otherwise.
///
/// Values allocated with [`AsyncValueRef::indirect`] additionally support
/// [`forward_to`](Self::forward_to): a single transition that adopts another
/// value's state and payload. An unresolved indirect is the only occupant a
/// register may hold before its producer publishes.
///
/// Reference counting is explicit. [`AsyncValueRef`] owns exactly one
/// reference; the executor additionally moves counted batches with
/// `add_ref`/`drop_ref` to pay each register's user-count debt up front.
#[derive(derive_more::Debug)]
pub struct AsyncValue {
    refs: AtomicUsize,
    state: AtomicU8,
    indirect: bool,
    #[debug(skip)]
    inner: Mutex<Inner>,
}

impl AsyncValue {
    #[must_use]
    pub fn state(&self) -> ValueState {
        ValueState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.state().is_available()
    }

    /// Whether this is an indirect value that has not been forwarded yet.
    #[must_use]
    pub fn is_unresolved_indirect(&self) -> bool {
        self.indirect && !self.is_available()
    }

    /// Complete this value with a concrete payload.
    ///
    /// # Panics
    /// If the value was already completed.
    pub fn emplace<T: Any + Send + Sync>(&self, value: T) {
        self.complete(Payload::Concrete(Box::new(value)), ValueState::Concrete);
    }

    /// Complete this value with an error.
    ///
    /// # Panics
    /// If the value was already completed.
    pub fn set_error(&self, error: ExecError) {
        self.complete(Payload::Error(error), ValueState::Error);
    }

    fn complete(&self, payload: Payload, state: ValueState) {
        debug_assert!(state.is_available(), "AsyncValue::complete: bad state");
        let waiters = {
            let mut inner = self.inner.lock().expect("AsyncValue::complete: poisoned");
            assert!(
                matches!(inner.payload, Payload::Empty),
                "AsyncValue::complete: completed twice"
            );
            inner.payload = payload;
            self.state.store(state as u8, Ordering::Release);
            mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            waiter();
        }
    }

    /// Run `waiter` exactly once: inline if the value is already available,
    /// otherwise on whatever thread completes it.
    pub fn and_then<F>(&self, waiter: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.state().is_available() {
            waiter();
            return;
        }
        let mut inner = self.inner.lock().expect("AsyncValue::and_then: poisoned");
        // The completion may have won the lock in between; its waiters are
        // already drained, so run inline.
        if self.state().is_available() {
            drop(inner);
            waiter();
        } else {
            inner.waiters.push(Box::new(waiter));
        }
    }

    /// Resolve this indirect value by pointing it at `target`, adopting the
    /// target's state and payload. `target` may itself still be pending.
    ///
    /// # Panics
    /// If this value is not indirect, or is resolved twice.
    pub fn forward_to(&self, target: AsyncValueRef) {
        assert!(self.indirect, "AsyncValue::forward_to: not an indirect value");
        if target.state().is_available() {
            self.adopt(target);
        } else {
            // The target is still pending; finish the handoff on its
            // completion thread. The extra reference keeps this value alive
            // until then.
            let this = self.clone_ref();
            let observed = target.clone();
            observed.and_then(move || this.adopt(target));
        }
    }

    fn adopt(&self, target: AsyncValueRef) {
        let state = target.state();
        debug_assert!(state.is_available(), "AsyncValue::adopt: target pending");
        self.complete(Payload::Forwarded(target), state);
    }

    /// The concrete payload, cloned out.
    ///
    /// # Panics
    /// If the value is not concrete or holds a different payload type.
    #[must_use]
    pub fn get<T: Any + Clone>(&self) -> T {
        assert!(
            self.state().is_concrete(),
            "AsyncValue::get: value is not concrete"
        );
        let inner = self.inner.lock().expect("AsyncValue::get: poisoned");
        match &inner.payload {
            Payload::Concrete(payload) => payload
                .downcast_ref::<T>()
                .expect("AsyncValue::get: payload type mismatch")
                .clone(),
            Payload::Forwarded(target) => {
                let target = target.clone();
                drop(inner);
                target.get()
            }
            Payload::Empty | Payload::Error(_) => {
                unreachable!("AsyncValue::get: state and payload disagree")
            }
        }
    }

    /// The error payload, if the value is in the error state.
    #[must_use]
    pub fn error(&self) -> Option<ExecError> {
        if !self.state().is_error() {
            return None;
        }
        let inner = self.inner.lock().expect("AsyncValue::error: poisoned");
        match &inner.payload {
            Payload::Error(error) => Some(error.clone()),
            Payload::Forwarded(target) => {
                let target = target.clone();
                drop(inner);
                target.error()
            }
            Payload::Empty | Payload::Concrete(_) => {
                unreachable!("AsyncValue::error: state and payload disagree")
            }
        }
    }

    /// Take an additional owning reference to this value.
    #[must_use]
    pub fn clone_ref(&self) -> AsyncValueRef {
        self.add_ref(1);
        // SAFETY: every `AsyncValue` is heap-allocated by `AsyncValueRef` and
        // the reference minted above is the one this handle will own.
        unsafe { AsyncValueRef::from_raw(self) }
    }

    /// Current reference count. Diagnostic only: concurrent owners may change
    /// it at any time.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Relaxed)
    }

    /// Add `count` references. `count == 0` is a no-op.
    pub(crate) fn add_ref(&self, count: usize) {
        if count == 0 {
            return;
        }
        let previous = self.refs.fetch_add(count, Ordering::Relaxed);
        debug_assert!(previous > 0, "AsyncValue::add_ref: resurrecting a dead value");
    }

    /// Drop `count` references, destroying the value when the count reaches
    /// zero. `count == 0` is a no-op.
    ///
    /// # Safety
    /// The caller must own `count` references to `value`.
    pub(crate) unsafe fn drop_ref(value: *const AsyncValue, count: usize) {
        if count == 0 {
            return;
        }
        // SAFETY: the caller owns references, so the value is alive.
        let previous = unsafe { &*value }.refs.fetch_sub(count, Ordering::Release);
        assert!(
            previous >= count,
            "AsyncValue::drop_ref: more drops than references"
        );
        if previous == count {
            fence(Ordering::Acquire);
            // SAFETY: the last reference is gone; nobody else can reach the
            // value any more.
            drop(unsafe { Box::from_raw(value.cast_mut()) });
        }
    }
}

/// Owning handle to an [`AsyncValue`]; holds exactly one reference.
pub struct AsyncValueRef(NonNull<AsyncValue>);

// SAFETY: the pointee's interior mutability is guarded by atomics and a
// mutex, and the reference count itself is atomic.
unsafe impl Send for AsyncValueRef {}
unsafe impl Sync for AsyncValueRef {}

impl AsyncValueRef {
    fn alloc(indirect: bool, payload: Payload, state: ValueState) -> Self {
        let value = Box::new(AsyncValue {
            refs: AtomicUsize::new(1),
            state: AtomicU8::new(state as u8),
            indirect,
            inner: Mutex::new(Inner {
                payload,
                waiters: Vec::new(),
            }),
        });
        // SAFETY: `Box::into_raw` never returns null.
        Self(unsafe { NonNull::new_unchecked(Box::into_raw(value)) })
    }

    /// A value that a producer will later `emplace` or `set_error`.
    #[must_use]
    pub fn unavailable() -> Self {
        Self::alloc(false, Payload::Empty, ValueState::Unavailable)
    }

    /// An indirect placeholder, to be resolved once with `forward_to`.
    #[must_use]
    pub fn indirect() -> Self {
        Self::alloc(true, Payload::Empty, ValueState::Unavailable)
    }

    /// An already-available concrete value.
    #[must_use]
    pub fn concrete<T: Any + Send + Sync>(value: T) -> Self {
        Self::alloc(false, Payload::Concrete(Box::new(value)), ValueState::Concrete)
    }

    /// An already-available error value.
    #[must_use]
    pub fn error(error: ExecError) -> Self {
        Self::alloc(false, Payload::Error(error), ValueState::Error)
    }

    #[must_use]
    pub fn as_ptr(&self) -> *const AsyncValue {
        self.0.as_ptr()
    }

    /// Adopt one existing reference as an owning handle.
    ///
    /// # Safety
    /// The caller must transfer ownership of one reference to `value`.
    pub(crate) unsafe fn from_raw(value: *const AsyncValue) -> Self {
        debug_assert!(!value.is_null(), "AsyncValueRef::from_raw: null value");
        // SAFETY: non-null per the debug assert; ownership per the contract.
        Self(unsafe { NonNull::new_unchecked(value.cast_mut()) })
    }

    /// Release the handle without dropping its reference; the caller takes
    /// over the reference's accounting.
    pub(crate) fn into_raw(self) -> *const AsyncValue {
        let value = self.0.as_ptr();
        mem::forget(self);
        value
    }
}

impl Deref for AsyncValueRef {
    type Target = AsyncValue;

    fn deref(&self) -> &AsyncValue {
        // SAFETY: the handle owns a reference, so the pointee is alive.
        unsafe { self.0.as_ref() }
    }
}

impl Clone for AsyncValueRef {
    fn clone(&self) -> Self {
        self.clone_ref()
    }
}

impl Drop for AsyncValueRef {
    fn drop(&mut self) {
        // SAFETY: dropping the single reference this handle owns.
        unsafe { AsyncValue::drop_ref(self.0.as_ptr(), 1) };
    }
}

impl fmt::Debug for AsyncValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AsyncValueRef").field(&**self).finish()
    }
}
