use crate::function::Function;
use crate::host::ExecutionContext;
use crate::location::{DecodedLocation, LocationHandler};
use crate::value::{AsyncValue, AsyncValueRef, ExecError};
use core::any::Any;

/// Mutable view of one kernel invocation.
///
/// Arguments, attributes and subfunctions are read-only; every result slot
/// must hold a value before the kernel returns. Arguments may still be
/// pending, or unresolved indirects, when the kernel is non-strict.
pub struct KernelFrame<'a> {
    exec_ctx: &'a ExecutionContext,
    location_handler: &'a LocationHandler,
    location_token: u32,
    arguments: Vec<*const AsyncValue>,
    attributes: Vec<&'a [u8]>,
    functions: Vec<Function>,
    results: Vec<Option<AsyncValueRef>>,
}

impl<'a> KernelFrame<'a> {
    pub(crate) fn new(
        exec_ctx: &'a ExecutionContext,
        location_handler: &'a LocationHandler,
        location_token: u32,
        num_results: usize,
    ) -> Self {
        Self {
            exec_ctx,
            location_handler,
            location_token,
            arguments: Vec::new(),
            attributes: Vec::new(),
            functions: Vec::new(),
            results: (0..num_results).map(|_| None).collect(),
        }
    }

    pub(crate) fn push_argument(&mut self, value: *const AsyncValue) {
        self.arguments.push(value);
    }

    pub(crate) fn push_attribute(&mut self, bytes: &'a [u8]) {
        self.attributes.push(bytes);
    }

    pub(crate) fn push_function(&mut self, function: Function) {
        self.functions.push(function);
    }

    /// Pay back the one reference owed per argument use. Ends argument
    /// access; must run exactly once, after the kernel has seen its frame.
    pub(crate) fn release_arguments(&mut self) {
        for &argument in &self.arguments {
            // SAFETY: the register accounting owes one reference per use and
            // this frame is that use.
            unsafe { AsyncValue::drop_ref(argument, 1) };
        }
        self.arguments.clear();
    }

    pub(crate) fn take_result(&mut self, index: usize) -> Option<AsyncValueRef> {
        self.results[index].take()
    }

    #[must_use]
    pub fn execution_context(&self) -> &ExecutionContext {
        self.exec_ctx
    }

    #[must_use]
    pub fn num_arguments(&self) -> usize {
        self.arguments.len()
    }

    #[must_use]
    pub fn argument(&self, index: usize) -> &AsyncValue {
        // SAFETY: the pointer is backed by the register accounting until
        // `release_arguments` pays the use back.
        unsafe { &*self.arguments[index] }
    }

    pub fn arguments(&self) -> impl Iterator<Item = &AsyncValue> + '_ {
        self.arguments.iter().map(|&argument| {
            // SAFETY: as in `argument`.
            unsafe { &*argument }
        })
    }

    #[must_use]
    pub fn num_attributes(&self) -> usize {
        self.attributes.len()
    }

    /// Raw attribute bytes, from the recorded blob offset to the end of the
    /// blob. May be empty for zero-sized attributes.
    #[must_use]
    pub fn attribute(&self, index: usize) -> &'a [u8] {
        self.attributes[index]
    }

    /// The little-endian `i32` at attribute `index`.
    #[must_use]
    pub fn attribute_i32(&self, index: usize) -> i32 {
        let bytes = self.attributes[index];
        i32::from_le_bytes(
            bytes[..4]
                .try_into()
                .expect("KernelFrame::attribute_i32: truncated attribute"),
        )
    }

    #[must_use]
    pub fn num_functions(&self) -> usize {
        self.functions.len()
    }

    #[must_use]
    pub fn function(&self, index: usize) -> &Function {
        &self.functions[index]
    }

    #[must_use]
    pub fn num_results(&self) -> usize {
        self.results.len()
    }

    /// Install `value` as result `index`, transferring one reference to the
    /// executor.
    pub fn set_result(&mut self, index: usize, value: AsyncValueRef) {
        debug_assert!(
            self.results[index].is_none(),
            "KernelFrame::set_result: result already set"
        );
        self.results[index] = Some(value);
    }

    /// Allocate a concrete value and install it as result `index`.
    pub fn emplace_result<T: Any + Send + Sync>(&mut self, index: usize, value: T) {
        self.set_result(index, AsyncValueRef::concrete(value));
    }

    /// The decoded location of the running kernel.
    #[must_use]
    pub fn location(&self) -> DecodedLocation {
        self.location_handler.decode(self.location_token)
    }

    /// Build an error value tagged with the kernel's location.
    #[must_use]
    pub fn make_error(&self, message: &str) -> AsyncValueRef {
        AsyncValueRef::error(ExecError::with_location(message, self.location()))
    }

    /// Fill every still-empty result slot with an error tagged with the
    /// kernel's location.
    pub fn report_error(&mut self, message: &str) {
        let error = self.make_error(message);
        for slot in &mut self.results {
            if slot.is_none() {
                *slot = Some(error.clone());
            }
        }
    }
}
