use crate::builder::FunctionId;
use crate::host::ExecutionContext;
use crate::location::DecodedLocation;
use crate::registry::KernelFn;
use crate::sync::{AtomicI32, AtomicPtr};
use crate::value::{AsyncValue, AsyncValueRef};
use core::ops::Range;
use core::ptr;
use std::sync::Arc;

/// Kernel-entry granularity of the packed stream, in bytes. Record offsets
/// are multiples of this.
pub(crate) const KERNEL_ENTRY_BYTES: u32 = 4;

/// Bit 0 of a record's flags word: the kernel fires even when some of its
/// arguments are erroneous or still pending.
pub(crate) const FLAG_NON_STRICT: u32 = 1;

/// Opcode of the argument pseudo-kernel. Never dispatched; its record is
/// consumed before the firing loop runs.
pub(crate) const PSEUDO_KERNEL_OPCODE: u32 = u32::MAX;

/// Fixed header words of a record, before the per-result used-by counts.
pub(crate) const HEADER_WORDS: usize = 7;

/// Decoded view of one kernel record inside the packed stream.
///
/// Layout, in words: opcode, location token, flags, argument count,
/// attribute count, function count, result count, one used-by count per
/// result, then the body entries: argument registers, attribute offsets,
/// function indices, result registers, and the concatenated used-by lists.
pub(crate) struct KernelRecord<'a> {
    words: &'a [u32],
}

impl<'a> KernelRecord<'a> {
    pub(crate) fn new(words: &'a [u32]) -> Self {
        Self { words }
    }

    pub(crate) fn opcode(&self) -> u32 {
        self.words[0]
    }

    pub(crate) fn location(&self) -> u32 {
        self.words[1]
    }

    pub(crate) fn is_non_strict(&self) -> bool {
        self.words[2] & FLAG_NON_STRICT != 0
    }

    pub(crate) fn num_arguments(&self) -> usize {
        self.words[3] as usize
    }

    pub(crate) fn num_attributes(&self) -> usize {
        self.words[4] as usize
    }

    pub(crate) fn num_functions(&self) -> usize {
        self.words[5] as usize
    }

    pub(crate) fn num_results(&self) -> usize {
        self.words[6] as usize
    }

    /// Number of consumer kernels of result `result_number`.
    pub(crate) fn num_used_bys(&self, result_number: usize) -> usize {
        self.words[HEADER_WORDS + result_number] as usize
    }

    /// Body entries `[entry_offset, entry_offset + len)`, counted from the
    /// end of the header.
    pub(crate) fn entries(&self, entry_offset: usize, len: usize) -> &'a [u32] {
        let body = HEADER_WORDS + self.num_results();
        &self.words[body + entry_offset..body + entry_offset + len]
    }
}

/// One single-assignment slot of the register file.
#[derive(Debug)]
pub(crate) struct RegisterInfo {
    /// The occupant; null until a producer, or a speculating consumer,
    /// installs one. Never nulled again, and replaced at most by nothing:
    /// an indirect occupant is forwarded in place.
    pub(crate) value: AtomicPtr<AsyncValue>,
    /// Static number of uses of this register as a kernel argument plus
    /// function-result exports.
    pub(crate) user_count: u32,
}

impl RegisterInfo {
    pub(crate) fn new(user_count: u32) -> Self {
        Self {
            value: AtomicPtr::new(ptr::null_mut()),
            user_count,
        }
    }
}

/// Per-kernel descriptor: where its record lives and how far the kernel is
/// from firing.
#[derive(Debug)]
pub(crate) struct KernelInfo {
    /// Byte offset of the kernel's record in the function's stream.
    pub(crate) offset: u32,
    /// Starts at `#arguments + 1`; the extra token is consumed by the
    /// bootstrap visit. Signed: decrements that arrive after error
    /// acceleration fired the kernel early push it below zero harmlessly.
    pub(crate) arguments_not_ready: AtomicI32,
}

impl KernelInfo {
    pub(crate) fn new(offset: u32, num_arguments: u32) -> Self {
        Self {
            offset,
            arguments_not_ready: AtomicI32::new(num_arguments as i32 + 1),
        }
    }
}

/// Byte offset and argument count of one kernel, enough to materialize a
/// fresh [`KernelInfo`] per execution.
#[derive(Debug, Clone, Copy)]
pub(crate) struct KernelTemplate {
    pub(crate) offset: u32,
    pub(crate) num_arguments: u32,
}

/// Metadata of one function inside a file.
#[derive(Debug)]
pub(crate) struct FunctionSpec {
    pub(crate) name: Arc<str>,
    /// Word range of this function's records inside the file stream.
    pub(crate) stream: Range<usize>,
    pub(crate) num_arguments: usize,
    /// Static user count per register.
    pub(crate) register_users: Vec<u32>,
    /// Per-kernel templates, in kernel-id order.
    pub(crate) kernels: Vec<KernelTemplate>,
    /// Register indices of the exported results.
    pub(crate) result_regs: Vec<u32>,
}

/// Frozen contents of a function file.
#[derive(derive_more::Debug)]
pub(crate) struct FileData {
    pub(crate) stream: Vec<u32>,
    pub(crate) attributes: Vec<u8>,
    pub(crate) locations: Vec<Arc<str>>,
    pub(crate) kernel_names: Vec<Arc<str>>,
    #[debug(skip)]
    pub(crate) kernel_fns: Vec<KernelFn>,
    pub(crate) functions: Vec<FunctionSpec>,
}

impl FileData {
    pub(crate) fn kernel_name(&self, opcode: u32) -> &str {
        &self.kernel_names[opcode as usize]
    }

    pub(crate) fn decode_location(&self, token: u32) -> DecodedLocation {
        DecodedLocation(
            self.locations
                .get(token as usize)
                .cloned()
                .unwrap_or_else(|| Arc::from("<unknown>")),
        )
    }
}

/// An immutable compiled function file: the packed kernel stream, the
/// attribute blob, the interned location table, the resolved kernel table,
/// and the functions defined in it. Cheap to clone; clones share the
/// contents.
#[derive(Debug, Clone)]
pub struct FunctionFile {
    data: Arc<FileData>,
}

impl FunctionFile {
    pub(crate) fn new(data: FileData) -> Self {
        Self {
            data: Arc::new(data),
        }
    }

    pub(crate) fn data(&self) -> &FileData {
        &self.data
    }

    /// Look up a function by name.
    #[must_use]
    pub fn function(&self, name: &str) -> Option<Function> {
        let index = self
            .data
            .functions
            .iter()
            .position(|spec| &*spec.name == name)?;
        Some(Function {
            file: self.clone(),
            index,
        })
    }

    /// The function a `FunctionBuilder::finish` call returned `id` for.
    ///
    /// # Panics
    /// If `id` does not belong to this file.
    #[must_use]
    pub fn function_at(&self, id: FunctionId) -> Function {
        let index = id.index();
        assert!(
            index < self.data.functions.len(),
            "FunctionFile::function_at: unknown function"
        );
        Function {
            file: self.clone(),
            index,
        }
    }
}

/// Handle to one function of a [`FunctionFile`]; cheap to clone.
#[derive(Debug, Clone)]
pub struct Function {
    pub(crate) file: FunctionFile,
    pub(crate) index: usize,
}

impl Function {
    pub(crate) fn spec(&self) -> &FunctionSpec {
        &self.file.data().functions[self.index]
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec().name
    }

    #[must_use]
    pub fn num_arguments(&self) -> usize {
        self.spec().num_arguments
    }

    #[must_use]
    pub fn num_results(&self) -> usize {
        self.spec().result_regs.len()
    }

    #[must_use]
    pub fn file(&self) -> &FunctionFile {
        &self.file
    }

    pub(crate) fn kernel_words(&self) -> &[u32] {
        &self.file.data().stream[self.spec().stream.clone()]
    }

    pub(crate) fn make_register_infos(&self) -> Box<[RegisterInfo]> {
        self.spec()
            .register_users
            .iter()
            .map(|&user_count| RegisterInfo::new(user_count))
            .collect()
    }

    pub(crate) fn make_kernel_infos(&self) -> Box<[KernelInfo]> {
        self.spec()
            .kernels
            .iter()
            .map(|template| KernelInfo::new(template.offset, template.num_arguments))
            .collect()
    }

    /// Kernel 0 is the argument pseudo-kernel whenever the function takes
    /// arguments.
    pub(crate) fn has_argument_pseudo_kernel(&self) -> bool {
        self.spec().num_arguments > 0
    }

    /// A sibling function referenced from a kernel record.
    pub(crate) fn subfunction(&self, index: u32) -> Function {
        Function {
            file: self.file.clone(),
            index: index as usize,
        }
    }

    /// Run this function.
    ///
    /// `arguments` must match the function's argument count and `results` its
    /// result count, with every result slot initially `None`. On return every
    /// slot holds a strong reference to a value that eventually becomes
    /// concrete or an error; with asynchronous kernels that may happen after
    /// this call returns, on a worker thread.
    ///
    /// Reentrant: kernels may call back into `execute` to drive subfunctions.
    pub fn execute(
        &self,
        exec_ctx: &ExecutionContext,
        arguments: &[AsyncValueRef],
        results: &mut [Option<AsyncValueRef>],
    ) {
        crate::executor::execute_function(exec_ctx, self, arguments, results);
    }
}
