use crate::function::{
    FLAG_NON_STRICT, FileData, FunctionFile, FunctionSpec, KERNEL_ENTRY_BYTES, KernelTemplate,
    PSEUDO_KERNEL_OPCODE,
};
use crate::registry::{KernelFn, KernelRegistry};
use crate::types::{IndexMap, IndexSet};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

/// Error produced while building a function file.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BuildError {
    /// The opcode has no implementation in the registry.
    #[error("unknown kernel opcode `{0}`")]
    UnknownOpcode(String),
    /// Two kernels claim the same result register.
    #[error("register r{0} is produced more than once")]
    DoubleAssignment(u32),
    /// A consumed or exported register has no producer.
    #[error("register r{0} is consumed but never produced")]
    UndefinedRegister(u32),
    /// The kernel dependency graph can never run to completion.
    #[error("function `{0}` contains a kernel dependency cycle")]
    Cycle(String),
}

/// A register of the function under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register(u32);

/// Identifier of a finished function within its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(u32);

impl FunctionId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// One kernel invocation to append to a function.
///
/// `attributes` holds blob offsets as returned by
/// [`FunctionFileBuilder::add_attribute`]; `functions` holds ids of functions
/// already finished into the same file.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelCall<'a> {
    pub opcode: &'a str,
    pub arguments: &'a [Register],
    pub attributes: &'a [u32],
    pub functions: &'a [FunctionId],
    pub num_results: usize,
    pub non_strict: bool,
    pub location: Option<&'a str>,
}

struct PendingKernel {
    opcode: u32,
    location: u32,
    flags: u32,
    arguments: Vec<u32>,
    attributes: Vec<u32>,
    functions: Vec<u32>,
    results: Vec<u32>,
}

/// Accumulates attributes, locations and functions, then freezes everything
/// into an immutable [`FunctionFile`].
///
/// Opcode names are resolved against the registry when first emitted; the
/// file carries the resolved kernel table, so it outlives the registry.
#[derive(derive_more::Debug)]
pub struct FunctionFileBuilder<'r> {
    #[debug(skip)]
    registry: &'r KernelRegistry,
    stream: Vec<u32>,
    attributes: Vec<u8>,
    locations: IndexSet<Arc<str>>,
    #[debug(skip)]
    kernels: IndexMap<Arc<str>, KernelFn>,
    functions: Vec<FunctionSpec>,
}

impl<'r> FunctionFileBuilder<'r> {
    #[must_use]
    pub fn new(registry: &'r KernelRegistry) -> Self {
        let mut locations = IndexSet::default();
        // Token 0 is the unknown location.
        locations.insert(Arc::from("<unknown>"));
        Self {
            registry,
            stream: Vec::new(),
            attributes: Vec::new(),
            locations,
            kernels: IndexMap::default(),
            functions: Vec::new(),
        }
    }

    /// Append raw attribute bytes, returning their offset in the blob.
    pub fn add_attribute(&mut self, bytes: &[u8]) -> u32 {
        let offset = self
            .attributes
            .len()
            .try_into()
            .expect("FunctionFileBuilder::add_attribute: blob too large");
        self.attributes.extend_from_slice(bytes);
        offset
    }

    /// Convenience for the common little-endian `i32` attribute.
    pub fn add_i32_attribute(&mut self, value: i32) -> u32 {
        self.add_attribute(&value.to_le_bytes())
    }

    /// Start a function taking `num_arguments` arguments.
    pub fn function(&mut self, name: &str, num_arguments: usize) -> FunctionBuilder<'_, 'r> {
        FunctionBuilder {
            name: Arc::from(name),
            num_arguments,
            next_register: num_arguments as u32,
            kernels: Vec::new(),
            result_regs: Vec::new(),
            file: self,
        }
    }

    /// Freeze the accumulated contents into an immutable file.
    #[must_use]
    pub fn build(self) -> FunctionFile {
        let (kernel_names, kernel_fns): (Vec<Arc<str>>, Vec<KernelFn>) =
            self.kernels.into_iter().unzip();
        FunctionFile::new(FileData {
            stream: self.stream,
            attributes: self.attributes,
            locations: self.locations.into_iter().collect(),
            kernel_names,
            kernel_fns,
            functions: self.functions,
        })
    }

    fn intern_location(&mut self, location: Option<&str>) -> u32 {
        match location {
            None => 0,
            Some(location) => {
                let (index, _) = self.locations.insert_full(Arc::from(location));
                index
                    .try_into()
                    .expect("FunctionFileBuilder::intern_location: too many locations")
            }
        }
    }

    fn intern_kernel(&mut self, opcode: &str) -> Result<u32, BuildError> {
        if let Some(index) = self.kernels.get_index_of(opcode) {
            return Ok(index as u32);
        }
        let Some(kernel_fn) = self.registry.get(opcode) else {
            return Err(BuildError::UnknownOpcode(opcode.to_owned()));
        };
        let (index, _) = self.kernels.insert_full(Arc::from(opcode), kernel_fn.clone());
        Ok(index as u32)
    }
}

/// Builds one function: kernels are appended with [`emit`](Self::emit) or
/// [`emit_call`](Self::emit_call), the exported results declared with
/// [`ret`](Self::ret), and the whole function validated and packed by
/// [`finish`](Self::finish).
#[must_use = "call `finish` to add the function to the file"]
pub struct FunctionBuilder<'a, 'r> {
    file: &'a mut FunctionFileBuilder<'r>,
    name: Arc<str>,
    num_arguments: usize,
    next_register: u32,
    kernels: Vec<PendingKernel>,
    result_regs: Vec<u32>,
}

impl FunctionBuilder<'_, '_> {
    /// The register holding argument `index`.
    #[must_use]
    pub fn argument(&self, index: usize) -> Register {
        assert!(
            index < self.num_arguments,
            "FunctionBuilder::argument: out of range"
        );
        Register(index as u32)
    }

    /// Append a strict kernel with no attributes, subfunctions or location.
    pub fn emit(
        &mut self,
        opcode: &str,
        arguments: &[Register],
        num_results: usize,
    ) -> Result<Vec<Register>, BuildError> {
        self.emit_call(KernelCall {
            opcode,
            arguments,
            num_results,
            ..KernelCall::default()
        })
    }

    /// Append the kernel described by `call`, returning its freshly allocated
    /// result registers.
    pub fn emit_call(&mut self, call: KernelCall<'_>) -> Result<Vec<Register>, BuildError> {
        let results: Vec<Register> = (0..call.num_results)
            .map(|_| self.fresh_register())
            .collect();
        self.emit_into(call, &results)?;
        Ok(results)
    }

    /// Allocate a register whose producer is emitted later with
    /// [`emit_into`](Self::emit_into). The executor does not require
    /// producers to precede their consumers in the stream, and neither does
    /// the builder.
    pub fn forward_register(&mut self) -> Register {
        self.fresh_register()
    }

    /// Append the kernel described by `call`, writing into the pre-allocated
    /// `results` registers. `call.num_results` is ignored.
    pub fn emit_into(
        &mut self,
        call: KernelCall<'_>,
        results: &[Register],
    ) -> Result<(), BuildError> {
        let opcode = self.file.intern_kernel(call.opcode)?;
        let location = self.file.intern_location(call.location);
        self.kernels.push(PendingKernel {
            opcode,
            location,
            flags: if call.non_strict { FLAG_NON_STRICT } else { 0 },
            arguments: call.arguments.iter().map(|register| register.0).collect(),
            attributes: call.attributes.to_vec(),
            functions: call.functions.iter().map(|id| id.0).collect(),
            results: results.iter().map(|register| register.0).collect(),
        });
        Ok(())
    }

    /// Declare the function's exported results. A register may be exported
    /// more than once.
    pub fn ret(&mut self, results: &[Register]) {
        self.result_regs = results.iter().map(|register| register.0).collect();
    }

    /// Validate the function, pack its kernel records, and add it to the
    /// file.
    pub fn finish(self) -> Result<FunctionId, BuildError> {
        let Self {
            file,
            name,
            num_arguments,
            next_register,
            kernels,
            result_regs,
        } = self;

        let num_registers = next_register as usize;
        let has_pseudo = num_arguments > 0;
        let id_base = usize::from(has_pseudo);
        let argument_regs: Vec<u32> = (0..num_arguments as u32).collect();

        // Every use of a register as a kernel argument, and every export as a
        // function result, owes one reference on whatever value ends up
        // occupying it.
        let mut register_users = vec![0u32; num_registers];
        for kernel in &kernels {
            for &argument in &kernel.arguments {
                register_users[argument as usize] += 1;
            }
        }
        for &result_reg in &result_regs {
            register_users[result_reg as usize] += 1;
        }

        // Single assignment: arguments are produced by the pseudo kernel,
        // every other register by exactly one kernel result.
        let mut produced = vec![false; num_registers];
        for &argument_reg in &argument_regs {
            produced[argument_reg as usize] = true;
        }
        for kernel in &kernels {
            for &result_reg in &kernel.results {
                if produced[result_reg as usize] {
                    return Err(BuildError::DoubleAssignment(result_reg));
                }
                produced[result_reg as usize] = true;
            }
        }
        for (register, &users) in register_users.iter().enumerate() {
            if users > 0 && !produced[register] {
                return Err(BuildError::UndefinedRegister(register as u32));
            }
        }

        // Consumers of each register, in kernel-id order; these become the
        // per-result used-by lists. A kernel reading the same register twice
        // appears twice: one enqueue and one decrement per use.
        let mut used_bys: Vec<Vec<u32>> = vec![Vec::new(); num_registers];
        for (index, kernel) in kernels.iter().enumerate() {
            let kernel_id = (index + id_base) as u32;
            for &argument in &kernel.arguments {
                used_bys[argument as usize].push(kernel_id);
            }
        }

        // Readiness pass: the same worklist-and-counter scheme the executor
        // runs live, driven to a fixpoint here. A kernel never reached has an
        // argument that is never produced, which at execution time would
        // strand the firing loop short of its fixpoint.
        let total = kernels.len() + id_base;
        let mut pending_args: Vec<usize> = vec![0; total];
        for (index, kernel) in kernels.iter().enumerate() {
            pending_args[index + id_base] = kernel.arguments.len();
        }
        let mut queue: VecDeque<usize> =
            (0..total).filter(|&id| pending_args[id] == 0).collect();
        let mut reached = 0usize;
        while let Some(kernel_id) = queue.pop_front() {
            reached += 1;
            let produced_regs: &[u32] = if has_pseudo && kernel_id == 0 {
                &argument_regs
            } else {
                &kernels[kernel_id - id_base].results
            };
            for &register in produced_regs {
                for &consumer in &used_bys[register as usize] {
                    let consumer = consumer as usize;
                    pending_args[consumer] -= 1;
                    if pending_args[consumer] == 0 {
                        queue.push_back(consumer);
                    }
                }
            }
        }
        if reached != total {
            return Err(BuildError::Cycle(String::from(&*name)));
        }

        // Pack the records. The pseudo kernel, when present, sits at the
        // function's offset 0 and holds only results and used-by lists.
        let stream_start = file.stream.len();
        let mut templates = Vec::with_capacity(total);
        if has_pseudo {
            let lists: Vec<&[u32]> = argument_regs
                .iter()
                .map(|&register| used_bys[register as usize].as_slice())
                .collect();
            templates.push(pack_record(
                &mut file.stream,
                stream_start,
                PSEUDO_KERNEL_OPCODE,
                0,
                0,
                &[],
                &[],
                &[],
                &argument_regs,
                &lists,
            ));
        }
        for kernel in &kernels {
            let lists: Vec<&[u32]> = kernel
                .results
                .iter()
                .map(|&register| used_bys[register as usize].as_slice())
                .collect();
            templates.push(pack_record(
                &mut file.stream,
                stream_start,
                kernel.opcode,
                kernel.location,
                kernel.flags,
                &kernel.arguments,
                &kernel.attributes,
                &kernel.functions,
                &kernel.results,
                &lists,
            ));
        }
        let stream_end = file.stream.len();

        let id = FunctionId(file.functions.len() as u32);
        file.functions.push(FunctionSpec {
            name,
            stream: stream_start..stream_end,
            num_arguments,
            register_users,
            kernels: templates,
            result_regs,
        });
        Ok(id)
    }

    fn fresh_register(&mut self) -> Register {
        let register = Register(self.next_register);
        self.next_register += 1;
        register
    }
}

#[allow(clippy::too_many_arguments)]
fn pack_record(
    stream: &mut Vec<u32>,
    stream_start: usize,
    opcode: u32,
    location: u32,
    flags: u32,
    arguments: &[u32],
    attributes: &[u32],
    functions: &[u32],
    results: &[u32],
    used_bys: &[&[u32]],
) -> KernelTemplate {
    debug_assert_eq!(results.len(), used_bys.len(), "pack_record: list mismatch");
    let offset_words = stream.len() - stream_start;
    stream.push(opcode);
    stream.push(location);
    stream.push(flags);
    stream.push(arguments.len() as u32);
    stream.push(attributes.len() as u32);
    stream.push(functions.len() as u32);
    stream.push(results.len() as u32);
    for list in used_bys {
        stream.push(list.len() as u32);
    }
    stream.extend_from_slice(arguments);
    stream.extend_from_slice(attributes);
    stream.extend_from_slice(functions);
    stream.extend_from_slice(results);
    for list in used_bys {
        stream.extend_from_slice(list);
    }
    KernelTemplate {
        offset: (offset_words as u32) * KERNEL_ENTRY_BYTES,
        num_arguments: arguments.len() as u32,
    }
}
