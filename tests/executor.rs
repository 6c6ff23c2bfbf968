#![cfg(not(feature = "loom"))]

mod common;

use common::{base_registry, counted, run, wait_available};
use dataflow_executor::builder::{BuildError, FunctionFileBuilder, KernelCall};
use dataflow_executor::frame::KernelFrame;
use dataflow_executor::host::{ExecutionContext, HostContext};
use dataflow_executor::location::DecodedLocation;
use dataflow_executor::registry::KernelRegistry;
use dataflow_executor::value::{AsyncValueRef, ExecError};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

fn ctx() -> ExecutionContext {
    ExecutionContext::new(Arc::new(HostContext::new()))
}

#[test]
fn synchronous_chain_completes_inline() {
    let (registry, _) = base_registry();
    let mut builder = FunctionFileBuilder::new(&registry);
    let mut chain = builder.function("chain", 2);
    let a0 = chain.argument(0);
    let a1 = chain.argument(1);
    let sum = chain.emit("test.add", &[a0, a1], 1).unwrap();
    let negated = chain.emit("test.neg", &[sum[0]], 1).unwrap();
    chain.ret(&negated);
    chain.finish().unwrap();
    let file = builder.build();

    let function = file.function("chain").unwrap();
    let arguments = [AsyncValueRef::concrete(3i32), AsyncValueRef::concrete(4i32)];
    let results = run(&function, &ctx(), &arguments, 1);

    assert!(results[0].state().is_concrete());
    assert_eq!(results[0].get::<i32>(), -7);
}

#[test]
fn asynchronous_producer_resumes_consumers_off_thread() {
    let (mut registry, handles) = base_registry();

    let neg_runs = Arc::new(AtomicUsize::new(0));
    let neg_thread = Arc::new(Mutex::new(None));
    {
        let neg_runs = Arc::clone(&neg_runs);
        let neg_thread = Arc::clone(&neg_thread);
        registry.register("test.neg", move |frame: &mut KernelFrame<'_>| {
            neg_runs.fetch_add(1, Ordering::Relaxed);
            *neg_thread.lock().unwrap() = Some(thread::current().id());
            let value = frame.argument(0).get::<i32>();
            frame.emplace_result(0, -value);
        });
    }

    let mut builder = FunctionFileBuilder::new(&registry);
    let mut chain = builder.function("chain", 2);
    let a0 = chain.argument(0);
    let a1 = chain.argument(1);
    let sum = chain.emit("test.add", &[a0, a1], 1).unwrap();
    let delayed = chain.emit("test.copy.delayed", &[sum[0]], 1).unwrap();
    let negated = chain.emit("test.neg", &[delayed[0]], 1).unwrap();
    chain.ret(&negated);
    chain.finish().unwrap();
    let file = builder.build();

    let function = file.function("chain").unwrap();
    let arguments = [AsyncValueRef::concrete(3i32), AsyncValueRef::concrete(4i32)];
    let results = run(&function, &ctx(), &arguments, 1);

    // The copy is stalled on the gate, so the chain is suspended and nothing
    // downstream has fired.
    assert!(!results[0].is_available());
    assert_eq!(neg_runs.load(Ordering::Relaxed), 0);

    handles.release.send(()).unwrap();
    wait_available(&results[0]);

    assert_eq!(results[0].get::<i32>(), -7);
    assert_eq!(neg_runs.load(Ordering::Relaxed), 1);
    let worker = neg_thread
        .lock()
        .unwrap()
        .expect("neg never recorded its thread");
    assert_ne!(worker, thread::current().id());
}

#[test]
fn errors_short_circuit_downstream_kernels() {
    let (mut registry, _) = base_registry();
    let add_runs = Arc::new(AtomicUsize::new(0));
    let mul_runs = Arc::new(AtomicUsize::new(0));
    registry.register(
        "test.add",
        counted(Arc::clone(&add_runs), |frame: &mut KernelFrame<'_>| {
            let sum = frame.argument(0).get::<i32>() + frame.argument(1).get::<i32>();
            frame.emplace_result(0, sum);
        }),
    );
    registry.register(
        "test.mul",
        counted(Arc::clone(&mul_runs), |frame: &mut KernelFrame<'_>| {
            let product = frame.argument(0).get::<i32>() * frame.argument(1).get::<i32>();
            frame.emplace_result(0, product);
        }),
    );

    let mut builder = FunctionFileBuilder::new(&registry);
    let five = builder.add_i32_attribute(5);
    let two = builder.add_i32_attribute(2);
    let mut chain = builder.function("poisoned", 0);
    let failed = chain
        .emit_call(KernelCall {
            opcode: "test.fail",
            num_results: 1,
            location: Some("demo.dfg:3:7"),
            ..KernelCall::default()
        })
        .unwrap();
    let c5 = chain
        .emit_call(KernelCall {
            opcode: "test.constant",
            attributes: &[five],
            num_results: 1,
            ..KernelCall::default()
        })
        .unwrap();
    let sum = chain.emit("test.add", &[failed[0], c5[0]], 1).unwrap();
    let c2 = chain
        .emit_call(KernelCall {
            opcode: "test.constant",
            attributes: &[two],
            num_results: 1,
            ..KernelCall::default()
        })
        .unwrap();
    let product = chain.emit("test.mul", &[sum[0], c2[0]], 1).unwrap();
    chain.ret(&product);
    chain.finish().unwrap();
    let file = builder.build();

    let function = file.function("poisoned").unwrap();
    let results = run(&function, &ctx(), &[], 1);

    assert!(results[0].state().is_error());
    let error = results[0].error().unwrap();
    assert_eq!(error.message(), "intentional failure");
    assert_eq!(
        error.location(),
        Some(&DecodedLocation(Arc::from("demo.dfg:3:7")))
    );
    assert_eq!(add_runs.load(Ordering::Relaxed), 0);
    assert_eq!(mul_runs.load(Ordering::Relaxed), 0);
}

#[test]
fn non_strict_kernel_runs_with_error_argument() {
    let (mut registry, _) = base_registry();
    let select_runs = Arc::new(AtomicUsize::new(0));
    registry.register(
        "test.select",
        counted(Arc::clone(&select_runs), |frame: &mut KernelFrame<'_>| {
            let condition = frame.argument(0).get::<bool>();
            let chosen = if condition { 1 } else { 2 };
            frame.set_result(0, frame.argument(chosen).clone_ref());
        }),
    );

    let mut builder = FunctionFileBuilder::new(&registry);
    let mut select_fn = builder.function("select_fn", 3);
    let condition = select_fn.argument(0);
    let on_true = select_fn.argument(1);
    let on_false = select_fn.argument(2);
    let chosen = select_fn
        .emit_call(KernelCall {
            opcode: "test.select",
            arguments: &[condition, on_true, on_false],
            num_results: 1,
            non_strict: true,
            ..KernelCall::default()
        })
        .unwrap();
    select_fn.ret(&chosen);
    select_fn.finish().unwrap();
    let file = builder.build();

    let function = file.function("select_fn").unwrap();
    let arguments = [
        AsyncValueRef::concrete(false),
        AsyncValueRef::error(ExecError::new("left branch failed")),
        AsyncValueRef::concrete(7i32),
    ];
    let results = run(&function, &ctx(), &arguments, 1);

    assert!(results[0].state().is_concrete());
    assert_eq!(results[0].get::<i32>(), 7);
    assert_eq!(select_runs.load(Ordering::Relaxed), 1);
}

#[test]
fn fan_out_shares_one_value_and_settles_refs() {
    let (mut registry, handles) = base_registry();
    let observed = Arc::new(Mutex::new(Vec::new()));
    {
        let observed = Arc::clone(&observed);
        registry.register("test.observe", move |frame: &mut KernelFrame<'_>| {
            observed
                .lock()
                .unwrap()
                .push(ptr::from_ref(frame.argument(0)) as usize);
        });
    }

    let mut builder = FunctionFileBuilder::new(&registry);
    let mut fan_out = builder.function("fan_out", 0);
    let produced = fan_out.emit("test.produce.tracked", &[], 1).unwrap();
    for _ in 0..10 {
        fan_out.emit("test.observe", &[produced[0]], 0).unwrap();
    }
    fan_out.ret(&[]);
    fan_out.finish().unwrap();
    let file = builder.build();

    let function = file.function("fan_out").unwrap();
    let results = run(&function, &ctx(), &[], 0);
    assert!(results.is_empty());

    assert_eq!(handles.produce_runs.load(Ordering::Relaxed), 1);
    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), 10);
    assert!(observed.iter().all(|&pointer| pointer == observed[0]));
    // Every consumer paid its use back, so the produced value is gone.
    assert_eq!(handles.drops.load(Ordering::Relaxed), 1);
}

#[test]
fn cancellation_resolves_results_without_running_kernels() {
    let (mut registry, _) = base_registry();
    let constant_runs = Arc::new(AtomicUsize::new(0));
    let add_runs = Arc::new(AtomicUsize::new(0));
    registry.register(
        "test.constant",
        counted(Arc::clone(&constant_runs), |frame: &mut KernelFrame<'_>| {
            let value = frame.attribute_i32(0);
            frame.emplace_result(0, value);
        }),
    );
    registry.register(
        "test.add",
        counted(Arc::clone(&add_runs), |frame: &mut KernelFrame<'_>| {
            let sum = frame.argument(0).get::<i32>() + frame.argument(1).get::<i32>();
            frame.emplace_result(0, sum);
        }),
    );

    let mut builder = FunctionFileBuilder::new(&registry);
    let one = builder.add_i32_attribute(1);
    let two = builder.add_i32_attribute(2);
    let mut sum_fn = builder.function("sum", 0);
    let c1 = sum_fn
        .emit_call(KernelCall {
            opcode: "test.constant",
            attributes: &[one],
            num_results: 1,
            ..KernelCall::default()
        })
        .unwrap();
    let c2 = sum_fn
        .emit_call(KernelCall {
            opcode: "test.constant",
            attributes: &[two],
            num_results: 1,
            ..KernelCall::default()
        })
        .unwrap();
    let sum = sum_fn.emit("test.add", &[c1[0], c2[0]], 1).unwrap();
    sum_fn.ret(&sum);
    sum_fn.finish().unwrap();
    let file = builder.build();

    let host = Arc::new(HostContext::new());
    host.cancel_execution("execution cancelled");
    let exec_ctx = ExecutionContext::new(host);

    let function = file.function("sum").unwrap();
    let results = run(&function, &exec_ctx, &[], 1);

    assert!(results[0].state().is_error());
    assert_eq!(results[0].error().unwrap().message(), "execution cancelled");
    assert_eq!(constant_runs.load(Ordering::Relaxed), 0);
    assert_eq!(add_runs.load(Ordering::Relaxed), 0);
}

#[test]
fn identity_function_hands_back_the_caller_argument() {
    let registry = KernelRegistry::new();
    let mut builder = FunctionFileBuilder::new(&registry);
    let mut identity = builder.function("identity", 1);
    let argument_reg = identity.argument(0);
    identity.ret(&[argument_reg]);
    identity.finish().unwrap();
    let file = builder.build();

    let argument = AsyncValueRef::concrete(41i32);
    let baseline = argument.ref_count();

    let function = file.function("identity").unwrap();
    let results = run(&function, &ctx(), &[argument.clone()], 1);

    assert_eq!(results[0].as_ptr(), argument.as_ptr());
    assert_eq!(results[0].get::<i32>(), 41);

    drop(results);
    assert_eq!(argument.ref_count(), baseline);
}

#[test]
fn error_argument_poisons_every_result() {
    let (mut registry, _) = base_registry();
    let neg_runs = Arc::new(AtomicUsize::new(0));
    registry.register(
        "test.neg",
        counted(Arc::clone(&neg_runs), |frame: &mut KernelFrame<'_>| {
            let value = frame.argument(0).get::<i32>();
            frame.emplace_result(0, -value);
        }),
    );

    let mut builder = FunctionFileBuilder::new(&registry);
    let mut through = builder.function("through", 1);
    let a0 = through.argument(0);
    let negated = through.emit("test.neg", &[a0], 1).unwrap();
    through.ret(&negated);
    through.finish().unwrap();
    let file = builder.build();

    let function = file.function("through").unwrap();
    let arguments = [AsyncValueRef::error(ExecError::new("bad input"))];
    let results = run(&function, &ctx(), &arguments, 1);

    assert!(results[0].state().is_error());
    assert_eq!(results[0].error().unwrap().message(), "bad input");
    assert_eq!(neg_runs.load(Ordering::Relaxed), 0);
}

#[test]
fn unused_arguments_are_tolerated() {
    let (registry, _) = base_registry();
    let mut builder = FunctionFileBuilder::new(&registry);
    let mut first_only = builder.function("first_only", 2);
    let a0 = first_only.argument(0);
    let negated = first_only.emit("test.neg", &[a0], 1).unwrap();
    first_only.ret(&negated);
    first_only.finish().unwrap();
    let file = builder.build();

    let unused = AsyncValueRef::concrete(9i32);
    let baseline = unused.ref_count();

    let function = file.function("first_only").unwrap();
    let arguments = [AsyncValueRef::concrete(3i32), unused.clone()];
    let results = run(&function, &ctx(), &arguments, 1);

    assert_eq!(results[0].get::<i32>(), -3);
    assert_eq!(unused.ref_count(), baseline);
}

#[test]
fn aliased_result_registers_share_the_value() {
    let (registry, _) = base_registry();
    let mut builder = FunctionFileBuilder::new(&registry);
    let mut twice = builder.function("twice", 1);
    let a0 = twice.argument(0);
    twice.ret(&[a0, a0]);
    twice.finish().unwrap();
    let file = builder.build();

    let function = file.function("twice").unwrap();
    let arguments = [AsyncValueRef::concrete(5i32)];
    let results = run(&function, &ctx(), &arguments, 2);

    assert_eq!(results[0].as_ptr(), results[1].as_ptr());
    assert_eq!(results[0].get::<i32>(), 5);
    assert_eq!(results[1].get::<i32>(), 5);
}

#[test]
fn call_kernel_drives_a_subfunction() {
    let (registry, _) = base_registry();
    let mut builder = FunctionFileBuilder::new(&registry);

    let mut double = builder.function("double", 1);
    let x = double.argument(0);
    let doubled = double.emit("test.add", &[x, x], 1).unwrap();
    double.ret(&doubled);
    let double_id = double.finish().unwrap();

    let mut caller = builder.function("caller", 1);
    let a0 = caller.argument(0);
    let called = caller
        .emit_call(KernelCall {
            opcode: "test.call",
            arguments: &[a0],
            functions: &[double_id],
            num_results: 1,
            ..KernelCall::default()
        })
        .unwrap();
    caller.ret(&called);
    caller.finish().unwrap();
    let file = builder.build();

    let function = file.function("caller").unwrap();
    let arguments = [AsyncValueRef::concrete(5i32)];
    let results = run(&function, &ctx(), &arguments, 1);

    assert_eq!(results[0].get::<i32>(), 10);
}

#[test]
fn late_error_reaches_the_result() {
    let (mut registry, handles) = base_registry();
    let neg_runs = Arc::new(AtomicUsize::new(0));
    registry.register(
        "test.neg",
        counted(Arc::clone(&neg_runs), |frame: &mut KernelFrame<'_>| {
            let value = frame.argument(0).get::<i32>();
            frame.emplace_result(0, -value);
        }),
    );

    let mut builder = FunctionFileBuilder::new(&registry);
    let mut chain = builder.function("late_error", 0);
    let failed = chain
        .emit_call(KernelCall {
            opcode: "test.fail",
            num_results: 1,
            ..KernelCall::default()
        })
        .unwrap();
    // Non-strict so the copy runs and carries the error to its consumers
    // only after the gate opens.
    let delayed = chain
        .emit_call(KernelCall {
            opcode: "test.copy.delayed",
            arguments: &[failed[0]],
            num_results: 1,
            non_strict: true,
            ..KernelCall::default()
        })
        .unwrap();
    let negated = chain.emit("test.neg", &[delayed[0]], 1).unwrap();
    chain.ret(&negated);
    chain.finish().unwrap();
    let file = builder.build();

    let function = file.function("late_error").unwrap();
    let results = run(&function, &ctx(), &[], 1);

    assert!(!results[0].is_available());
    assert_eq!(neg_runs.load(Ordering::Relaxed), 0);

    handles.release.send(()).unwrap();
    wait_available(&results[0]);

    assert!(results[0].state().is_error());
    assert_eq!(results[0].error().unwrap().message(), "intentional failure");
    assert_eq!(neg_runs.load(Ordering::Relaxed), 0);
}

#[test]
fn producers_may_follow_their_consumers_in_the_stream() {
    let (registry, _) = base_registry();
    let mut builder = FunctionFileBuilder::new(&registry);
    let mut reordered = builder.function("reordered", 1);
    let a0 = reordered.argument(0);
    // The negation is emitted before the addition that feeds it.
    let sum = reordered.forward_register();
    let negated = reordered.emit("test.neg", &[sum], 1).unwrap();
    reordered
        .emit_into(
            KernelCall {
                opcode: "test.add",
                arguments: &[a0, a0],
                ..KernelCall::default()
            },
            &[sum],
        )
        .unwrap();
    reordered.ret(&negated);
    reordered.finish().unwrap();
    let file = builder.build();

    let function = file.function("reordered").unwrap();
    let arguments = [AsyncValueRef::concrete(3i32)];
    let results = run(&function, &ctx(), &arguments, 1);
    assert_eq!(results[0].get::<i32>(), -6);
}

#[test]
fn cyclic_functions_are_rejected_at_build_time() {
    let (registry, _) = base_registry();
    let mut builder = FunctionFileBuilder::new(&registry);
    let mut cyclic = builder.function("cyclic", 0);
    let first = cyclic.forward_register();
    let second = cyclic.forward_register();
    cyclic
        .emit_into(
            KernelCall {
                opcode: "test.neg",
                arguments: &[second],
                ..KernelCall::default()
            },
            &[first],
        )
        .unwrap();
    cyclic
        .emit_into(
            KernelCall {
                opcode: "test.neg",
                arguments: &[first],
                ..KernelCall::default()
            },
            &[second],
        )
        .unwrap();
    cyclic.ret(&[first]);
    assert_eq!(cyclic.finish(), Err(BuildError::Cycle("cyclic".into())));
}

#[test]
fn unproduced_registers_are_rejected_at_build_time() {
    let (registry, _) = base_registry();
    let mut builder = FunctionFileBuilder::new(&registry);
    let mut dangling = builder.function("dangling", 0);
    let never_produced = dangling.forward_register();
    let negated = dangling.emit("test.neg", &[never_produced], 1).unwrap();
    dangling.ret(&negated);
    assert!(matches!(
        dangling.finish(),
        Err(BuildError::UndefinedRegister(_))
    ));
}
