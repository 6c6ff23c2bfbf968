mod fire;
mod regs;

use crate::function::{Function, KernelInfo, RegisterInfo};
use crate::host::ExecutionContext;
use crate::location::LocationHandler;
use crate::sync::Ordering;
use crate::value::AsyncValueRef;
use self::regs::get_or_create_register_value;
use std::sync::Arc;
use tracing::trace;

/// Live state of one function invocation.
///
/// The registers and kernel descriptors live exactly as long as the
/// executor. Every completion armed on a pending result holds one `Arc`
/// reference, so the executor survives from bootstrap until the last
/// asynchronous continuation has run, then deallocates itself.
pub(crate) struct Executor {
    exec_ctx: ExecutionContext,
    /// Also keeps the function file alive across asynchronous completions.
    function: Function,
    /// Per-kernel descriptors, indexed by kernel id.
    kernel_infos: Box<[KernelInfo]>,
    /// The register file, indexed by register number.
    register_infos: Box<[RegisterInfo]>,
    /// Kept alive by every pending result so late diagnostics can still be
    /// decoded.
    location_handler: Arc<LocationHandler>,
}

/// Drive `function` to its synchronous fixpoint and export its results.
///
/// The calling thread runs the initial firing loop; kernels whose operands
/// are pending are picked up later by completion callbacks on whatever
/// thread resolves the operand.
pub(crate) fn execute_function(
    exec_ctx: &ExecutionContext,
    function: &Function,
    arguments: &[AsyncValueRef],
    results: &mut [Option<AsyncValueRef>],
) {
    assert_eq!(
        arguments.len(),
        function.num_arguments(),
        "execute: wrong number of arguments"
    );
    assert_eq!(
        results.len(),
        function.num_results(),
        "execute: wrong number of results"
    );
    trace!(function = function.name(), "execute start");

    if function.kernel_words().is_empty() {
        return;
    }

    let register_infos = function.make_register_infos();
    let kernel_infos = function.make_kernel_infos();
    initialize_argument_registers(arguments, &register_infos);

    let executor = Arc::new(Executor {
        exec_ctx: exec_ctx.clone(),
        function: function.clone(),
        kernel_infos,
        register_infos,
        location_handler: Arc::new(LocationHandler::new(function.file().clone())),
    });

    // Seed every kernel id in reverse so the LIFO loop visits id 0 first.
    // Any sync kernel that completes immediately unblocks its consumers on
    // this same thread: no hops, top-down order, the counters stay in this
    // core's cache. Used-by dispatch appends consumer ids, so leave headroom.
    let num_kernels = executor.kernel_infos.len();
    let mut worklist = Vec::with_capacity(num_kernels + 4);
    worklist.extend((0..num_kernels as u32).rev());

    if function.has_argument_pseudo_kernel() {
        Executor::process_arguments_pseudo_kernel(&executor, &mut worklist);
    }
    Executor::decrement_ready_counts(&executor, &mut worklist);

    // Export the results. A register still empty here belongs to an
    // asynchronous producer; the placeholder installed now is forwarded when
    // that producer publishes.
    for (slot, &result_reg) in results.iter_mut().zip(&executor.function.spec().result_regs) {
        assert!(slot.is_none(), "execute: result slot already populated");
        let value = get_or_create_register_value(&executor.register_infos[result_reg as usize]);
        // SAFETY: the export is one of the register's counted uses; the
        // handle adopts that reference.
        *slot = Some(unsafe { AsyncValueRef::from_raw(value) });
    }

    trace!(function = function.name(), "execute end");
    // The bootstrap `Arc` drops here; armed continuations keep the executor
    // alive until the last pending result completes.
}

/// Install the caller's argument values into the leading registers, paying
/// each register's per-use reference debt up front.
fn initialize_argument_registers(arguments: &[AsyncValueRef], register_infos: &[RegisterInfo]) {
    for (value, register) in arguments.iter().zip(register_infos) {
        value.add_ref(register.user_count as usize);
        register
            .value
            .store(value.as_ptr().cast_mut(), Ordering::Release);
    }
}
