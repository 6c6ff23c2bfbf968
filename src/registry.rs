use crate::frame::KernelFrame;
use crate::types::HashMap;
use std::sync::Arc;

/// A kernel implementation.
///
/// Contract: on return, every result slot of the frame holds a value carrying
/// at least the one reference the executor is owed. A kernel that completes
/// asynchronously still installs (pending) values synchronously.
pub type KernelFn = Arc<dyn Fn(&mut KernelFrame<'_>) + Send + Sync>;

/// Registry of kernel implementations, consulted while building function
/// files. Execution never touches the registry; the file carries the
/// resolved kernel table.
#[derive(Default, derive_more::Debug)]
pub struct KernelRegistry {
    #[debug(skip)]
    kernels: HashMap<Box<str>, KernelFn>,
}

impl KernelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `kernel` under `name`, replacing any previous entry.
    pub fn register(
        &mut self,
        name: &str,
        kernel: impl Fn(&mut KernelFrame<'_>) + Send + Sync + 'static,
    ) {
        self.kernels.insert(name.into(), Arc::new(kernel));
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&KernelFn> {
        self.kernels.get(name)
    }
}
