//! Worklist-driven executor for compiled dataflow functions.
//!
//! A function is a static graph of kernels (opaque callable units) connected
//! by registers (single-assignment slots holding asynchronous values). The
//! executor fires kernels whose operands have all arrived, threads results
//! into consumer kernels, and propagates errors and cancellation, while any
//! individual kernel may complete synchronously in the calling thread or
//! asynchronously on a worker. It:
//! - Runs a LIFO worklist to a fixpoint on the calling thread, handing work
//!   to completion callbacks only when a consumed result is still pending.
//! - Coordinates the firing thread and completion callbacks lock-free
//!   through per-register atomic pointers and per-kernel readiness counters.
//! - Accounts reference counts exactly across the speculative write-wins
//!   races on the register file, so values die the moment their last
//!   consumer is done.
//!
//! Key modules:
//! - `value`: the reference-counted asynchronous value, its one-shot
//!   completion notification, and the indirect forwarding protocol.
//! - `registry` and `frame`: kernel implementations and the invocation
//!   frame they receive.
//! - `builder` and `function`: construction and the packed encoding of
//!   function files.
//! - `host`: cancellation and worker dispatch shared by executions.
//!
//! Quick start:
//! 1. Register kernel implementations in a `KernelRegistry`.
//! 2. Build a `FunctionFile` with `FunctionFileBuilder`: emit kernels,
//!    declare results, `finish` each function, `build` the file.
//! 3. Call `Function::execute` with argument values and empty result slots.
//!    Every slot comes back holding a value that eventually becomes concrete
//!    or an error, synchronously when every kernel involved is.
//!
//! The executor never blocks: a kernel whose operands are pending is
//! suspended simply by not being fired, and resumes on whatever thread
//! resolves the operand.

/// Construction of function files: kernel emission, attribute and location
/// interning, validation, and packing.
pub mod builder;
mod executor;
/// The invocation frame handed to kernel implementations.
pub mod frame;
/// Compiled function files: the packed kernel stream, per-function metadata,
/// and the `Function` execution handle.
pub mod function;
/// Host-wide services: the cancellation sentinel and worker dispatch.
pub mod host;
/// Decoding of diagnostic location tokens.
pub mod location;
/// The registry mapping opcode names to kernel implementations.
pub mod registry;
mod sync;
mod types;
/// Reference-counted asynchronous values and the indirect forwarding
/// protocol.
pub mod value;
