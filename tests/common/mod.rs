#![allow(dead_code)]

use dataflow_executor::frame::KernelFrame;
use dataflow_executor::function::Function;
use dataflow_executor::host::ExecutionContext;
use dataflow_executor::registry::KernelRegistry;
use dataflow_executor::value::{AsyncValue, AsyncValueRef};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

/// Control handles shared with the kernels of [`base_registry`].
pub struct TestHandles {
    /// Lets one pending `test.copy.delayed` resolution proceed per message.
    pub release: mpsc::Sender<()>,
    /// Destructions of payloads produced by `test.produce.tracked`.
    pub drops: Arc<AtomicUsize>,
    /// Invocations of `test.produce.tracked`.
    pub produce_runs: Arc<AtomicUsize>,
}

/// Registry with the standard test kernels, plus the handles the stateful
/// ones report through.
pub fn base_registry() -> (KernelRegistry, TestHandles) {
    let mut registry = KernelRegistry::new();
    registry.register("test.constant", |frame: &mut KernelFrame<'_>| {
        let value = frame.attribute_i32(0);
        frame.emplace_result(0, value);
    });
    registry.register("test.add", |frame: &mut KernelFrame<'_>| {
        let sum = frame.argument(0).get::<i32>() + frame.argument(1).get::<i32>();
        frame.emplace_result(0, sum);
    });
    registry.register("test.neg", |frame: &mut KernelFrame<'_>| {
        let value = frame.argument(0).get::<i32>();
        frame.emplace_result(0, -value);
    });
    registry.register("test.mul", |frame: &mut KernelFrame<'_>| {
        let product = frame.argument(0).get::<i32>() * frame.argument(1).get::<i32>();
        frame.emplace_result(0, product);
    });
    registry.register("test.fail", |frame: &mut KernelFrame<'_>| {
        frame.report_error("intentional failure");
    });
    // Non-strict by design: picks one branch without touching the other, so
    // it must be emitted with the non-strict bit to be useful.
    registry.register("test.select", |frame: &mut KernelFrame<'_>| {
        let condition = frame.argument(0).get::<bool>();
        let chosen = if condition { 1 } else { 2 };
        frame.set_result(0, frame.argument(chosen).clone_ref());
    });
    registry.register("test.call", |frame: &mut KernelFrame<'_>| {
        let callee = frame.function(0).clone();
        let arguments: Vec<AsyncValueRef> = frame.arguments().map(AsyncValue::clone_ref).collect();
        let mut results: Vec<Option<AsyncValueRef>> =
            (0..frame.num_results()).map(|_| None).collect();
        callee.execute(frame.execution_context(), &arguments, &mut results);
        for (index, result) in results.into_iter().enumerate() {
            frame.set_result(index, result.expect("subfunction result missing"));
        }
    });

    // Copies its input into a placeholder that a worker resolves once the
    // test opens the gate, one message per invocation. Emit non-strict to
    // copy an erroneous input.
    let (release, gate) = mpsc::channel::<()>();
    let gate = Arc::new(Mutex::new(gate));
    registry.register("test.copy.delayed", move |frame: &mut KernelFrame<'_>| {
        let source = frame.argument(0).clone_ref();
        let result = AsyncValueRef::indirect();
        frame.set_result(0, result.clone());
        let gate = Arc::clone(&gate);
        frame.execution_context().host().enqueue_work(move || {
            gate.lock().unwrap().recv().unwrap();
            result.forward_to(source);
        });
    });

    // Produces a payload whose destruction the test can observe.
    let drops = Arc::new(AtomicUsize::new(0));
    let produce_runs = Arc::new(AtomicUsize::new(0));
    {
        let drops = Arc::clone(&drops);
        registry.register(
            "test.produce.tracked",
            counted(
                Arc::clone(&produce_runs),
                move |frame: &mut KernelFrame<'_>| {
                    frame.emplace_result(0, Tracked::new(11, Arc::clone(&drops)));
                },
            ),
        );
    }

    (
        registry,
        TestHandles {
            release,
            drops,
            produce_runs,
        },
    )
}

/// Wrap `kernel` so every invocation bumps `runs`.
pub fn counted(
    runs: Arc<AtomicUsize>,
    kernel: impl Fn(&mut KernelFrame<'_>) + Send + Sync + 'static,
) -> impl Fn(&mut KernelFrame<'_>) + Send + Sync + 'static {
    move |frame: &mut KernelFrame<'_>| {
        runs.fetch_add(1, Ordering::Relaxed);
        kernel(frame);
    }
}

/// Execute `function` and unwrap every result slot.
pub fn run(
    function: &Function,
    exec_ctx: &ExecutionContext,
    arguments: &[AsyncValueRef],
    num_results: usize,
) -> Vec<AsyncValueRef> {
    let mut results: Vec<Option<AsyncValueRef>> = (0..num_results).map(|_| None).collect();
    function.execute(exec_ctx, arguments, &mut results);
    results
        .into_iter()
        .map(|slot| slot.expect("result slot left empty"))
        .collect()
}

/// Block until `value` becomes available.
pub fn wait_available(value: &AsyncValueRef) {
    let (notify, notified) = mpsc::channel();
    value.and_then(move || {
        let _ = notify.send(());
    });
    notified
        .recv_timeout(Duration::from_secs(10))
        .expect("value did not become available in time");
}

/// Payload that records its destruction, for lifetime assertions.
#[derive(Debug)]
pub struct Tracked {
    pub value: i32,
    drops: Arc<AtomicUsize>,
}

impl Tracked {
    pub fn new(value: i32, drops: Arc<AtomicUsize>) -> Self {
        Self { value, drops }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}
