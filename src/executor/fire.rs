use super::Executor;
use super::regs::{
    get_or_create_register_value, get_register_value, set_kernels_with_error_input_ready,
    set_register_value,
};
use crate::frame::KernelFrame;
use crate::function::{KERNEL_ENTRY_BYTES, KernelRecord};
use crate::sync::Ordering;
use crate::value::AsyncValue;
use std::sync::Arc;
use tracing::trace;

impl Executor {
    /// Dispatch the consumers of the argument pseudo-kernel's results, i.e.
    /// the caller-installed function arguments. Its record holds only
    /// results and used-by lists, and its worklist token is consumed without
    /// touching a readiness counter.
    pub(super) fn process_arguments_pseudo_kernel(this: &Arc<Self>, worklist: &mut Vec<u32>) {
        assert_eq!(
            worklist.pop(),
            Some(0),
            "pseudo-kernel: kernel id 0 must be on top of the worklist"
        );

        let kernel = KernelRecord::new(this.function.kernel_words());
        assert_eq!(kernel.num_arguments(), 0, "pseudo-kernel: has arguments");
        assert_eq!(kernel.num_attributes(), 0, "pseudo-kernel: has attributes");
        assert_eq!(kernel.num_functions(), 0, "pseudo-kernel: has functions");
        assert_ne!(kernel.num_results(), 0, "pseudo-kernel: has no results");

        let results = kernel.entries(0, kernel.num_results());
        let mut entry_offset = results.len();
        for (result_number, &result_reg) in results.iter().enumerate() {
            let register = &this.register_infos[result_reg as usize];
            // The front-end may leave an argument unused; nothing to
            // dispatch then.
            if register.user_count == 0 {
                continue;
            }
            let result = get_register_value(register);
            assert!(!result.is_null(), "pseudo-kernel: argument register is empty");
            Self::process_used_bys(this, &kernel, result_number, result, &mut entry_offset, worklist);
        }
    }

    /// Decrement the readiness counter of every kernel on the worklist,
    /// firing each kernel whose counter reaches zero. The worklist drains
    /// back to front; used-by dispatch pushes follow-on work onto it.
    ///
    /// Entered once from bootstrap on the calling thread and again from
    /// every completion armed on a pending result, possibly concurrently on
    /// disjoint kernel ids.
    pub(super) fn decrement_ready_counts(this: &Arc<Self>, worklist: &mut Vec<u32>) {
        let words = this.function.kernel_words();
        let file = this.function.file().data();

        while let Some(kernel_id) = worklist.pop() {
            let kernel_info = &this.kernel_infos[kernel_id as usize];
            // The 1 -> 0 transition is the linearisation point: exactly one
            // decrement observes it and takes the kernel.
            if kernel_info
                .arguments_not_ready
                .fetch_sub(1, Ordering::AcqRel)
                != 1
            {
                continue;
            }

            debug_assert_eq!(
                kernel_info.offset % KERNEL_ENTRY_BYTES,
                0,
                "firing loop: misaligned kernel record"
            );
            let kernel =
                KernelRecord::new(&words[(kernel_info.offset / KERNEL_ENTRY_BYTES) as usize..]);
            let kernel_fn = file.kernel_fns[kernel.opcode() as usize].as_ref();
            let is_non_strict = kernel.is_non_strict();
            trace!(
                kernel_id,
                opcode = file.kernel_name(kernel.opcode()),
                is_non_strict,
                "firing kernel"
            );

            // An error argument makes a strict kernel propagate instead of
            // run; a cancelled host poisons every kernel the same way.
            let mut any_error_argument: *const AsyncValue =
                this.exec_ctx.host().cancel_async_value();

            let mut frame = KernelFrame::new(
                &this.exec_ctx,
                &this.location_handler,
                kernel.location(),
                kernel.num_results(),
            );

            let mut entry_offset = 0;
            let arguments = kernel.entries(entry_offset, kernel.num_arguments());
            for &argument_reg in arguments {
                let register = &this.register_infos[argument_reg as usize];
                // A non-strict kernel may fire before every operand has been
                // produced; installing a placeholder makes such operands
                // observable anyway.
                let value = get_or_create_register_value(register);
                // SAFETY: `value` is backed by the register accounting and
                // this frame is one of its counted uses.
                if unsafe { &*value }.state().is_error() {
                    any_error_argument = value;
                }
                frame.push_argument(value);
            }
            entry_offset += arguments.len();

            let attributes = kernel.entries(entry_offset, kernel.num_attributes());
            for &attribute_offset in attributes {
                // Tail slice: the attribute itself encodes its extent and
                // may be zero-sized.
                frame.push_attribute(&file.attributes[attribute_offset as usize..]);
            }
            entry_offset += attributes.len();

            let functions = kernel.entries(entry_offset, kernel.num_functions());
            for &function_index in functions {
                frame.push_function(this.function.subfunction(function_index));
            }
            entry_offset += functions.len();

            if any_error_argument.is_null() || is_non_strict {
                kernel_fn(&mut frame);
            } else {
                // Short-circuit: every result becomes a reference to the
                // offending argument.
                // SAFETY: either the host's sentinel (backed by the host's
                // reference) or an argument this frame still holds a use of.
                let error = unsafe { &*any_error_argument };
                for result_number in 0..kernel.num_results() {
                    frame.set_result(result_number, error.clone_ref());
                }
            }

            // The kernel has seen its arguments; pay one use back each.
            frame.release_arguments();

            let results = kernel.entries(entry_offset, kernel.num_results());
            entry_offset += results.len();
            for (result_number, &result_reg) in results.iter().enumerate() {
                let register = &this.register_infos[result_reg as usize];
                {
                    let current = get_register_value(register);
                    // SAFETY: a non-null occupant carries its consumers'
                    // references and is alive.
                    debug_assert!(
                        current.is_null() || unsafe { &*current }.is_unresolved_indirect(),
                        "firing loop: result register written twice"
                    );
                }
                let result = frame.take_result(result_number).unwrap_or_else(|| {
                    panic!(
                        "kernel `{}` did not set result {result_number}",
                        file.kernel_name(kernel.opcode())
                    )
                });
                if register.user_count == 0 {
                    // Nobody consumes this result. Keep diagnostics
                    // decodable while it is pending and drop the producer's
                    // reference instead of storing it.
                    this.extend_location_lifetime(&result);
                    continue;
                }
                let (register_value, register_already_set) = set_register_value(register, result);
                Self::process_used_bys(
                    this,
                    &kernel,
                    result_number,
                    register_value,
                    &mut entry_offset,
                    worklist,
                );
                if register_already_set {
                    // The occupancy reference of the resolved placeholder is
                    // no longer needed.
                    // SAFETY: `set_register_value` left that reference to us.
                    unsafe { AsyncValue::drop_ref(register_value, 1) };
                }
            }
        }
    }

    /// Route a just-published result to its consumers: accelerate them when
    /// the result is an error, enqueue them when it is available, otherwise
    /// arm a completion that re-enters the firing loop.
    fn process_used_bys(
        this: &Arc<Self>,
        kernel: &KernelRecord<'_>,
        result_number: usize,
        result: *const AsyncValue,
        entry_offset: &mut usize,
        worklist: &mut Vec<u32>,
    ) {
        let num_used_bys = kernel.num_used_bys(result_number);
        if num_used_bys == 0 {
            // Consumed only by the function's result export, or not at all.
            // SAFETY: backed by the register accounting.
            this.extend_location_lifetime(unsafe { &*result });
            return;
        }

        let used_bys = kernel.entries(*entry_offset, num_used_bys);
        *entry_offset += num_used_bys;

        // SAFETY: backed by the register accounting; the consumers named in
        // `used_bys` each own one of its uses.
        let result = unsafe { &*result };

        // One state read serves both branches on the hot path.
        let state = result.state();

        // Consumers of an error must already be within one decrement of
        // firing when they are enqueued below; running this afterwards would
        // let a consumer fire its implementation instead of propagating.
        if state.is_error() {
            set_kernels_with_error_input_ready(&this.kernel_infos, used_bys);
        }

        if state.is_available() {
            // Completed synchronously, or the worker beat this thread to it:
            // the consumers run as part of this visit, no thread hop.
            worklist.extend_from_slice(used_bys);
            return;
        }

        // Pending: the consumers run wherever the producer completes. The
        // executor reference keeps the register and kernel arrays alive
        // until then.
        let executor = Arc::clone(this);
        let mut using_kernel_ids = Vec::with_capacity(used_bys.len() + 4);
        using_kernel_ids.extend_from_slice(used_bys);
        result.and_then(move || {
            Self::decrement_ready_counts(&executor, &mut using_kernel_ids);
        });
    }

    /// Any pending result may still need to decode a diagnostic location
    /// after the executor quiesces; tie the handler's lifetime to it.
    fn extend_location_lifetime(&self, result: &AsyncValue) {
        if !result.is_available() {
            let location_handler = Arc::clone(&self.location_handler);
            result.and_then(move || drop(location_handler));
        }
    }
}
