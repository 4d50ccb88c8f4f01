//! Stack-based interpreter for compiled BASIC procedures.
//!
//! Every procedure call gets an [`Instance`] on the VM's call chain. The
//! instance owns the four stacks and the error state; the VM owns what is
//! shared across calls: module variables, static tables, the surfaced error
//! and the host collaborators.

mod call;
mod channels;
mod dispatch;
mod fault;
mod scope;
mod stack;

pub use scope::SymbolTable;

use crate::builtins::Builtins;
use crate::config::VmConfig;
use crate::host::{BufferIo, DebugHook, DebugMode, ExtendedSearch, ForeignCall, IoChannels};
use crate::pattern::EngineContext;
use fault::ErrorState;
use kestrel_core::image::{Image, ImageError, Procedure};
use kestrel_core::{ArgVec, BasicError, ErrorInfo, NativeContext, ObjectRef, Value, VarRef};
use stack::{ForFrame, GosubFrame};
use std::cell::Cell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub procedure: String,
    pub line: u32,
    pub offset: usize,
}

/// Fatal interpreter errors. These abort the run; script-level faults are
/// [`BasicError`]s and go through `ON ERROR` handling first.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("unknown opcode 0x{op:02x} at offset {offset}")]
    UnknownOpcode { op: u8, offset: usize },
    #[error("expression stack underflow at offset {0}")]
    StackUnderflow(usize),
    #[error("malformed call: {0}")]
    MalformedCall(String),
    #[error("stack overflow: {0}")]
    StackOverflow(String),
    #[error("variable not defined: {0}")]
    UndeclaredVariable(String),
    #[error("unhandled error {code} at line {line}: {message}")]
    Unhandled { code: u32, message: String, line: u32 },
    #[error("no procedure is executing")]
    NoActiveInstance,
    #[error("no procedure named {0}")]
    UndefinedEntry(String),
    #[error("jump target {0} outside the current procedure")]
    BadJump(u32),
    #[error("constant pool index {0} out of range")]
    BadPoolRef(u32),
    #[error("invalid operand 0x{0:08x}")]
    BadOperand(u32),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("{inner}\nStack trace (most recent call last):{stack_trace}")]
    WithStackTrace {
        inner: Box<VmError>,
        stack_trace: String,
        frames: Vec<StackFrame>,
    },
}

impl VmError {
    /// Attach the call chain to the error. Already wrapped errors and empty
    /// chains are returned unchanged.
    pub fn with_stack_trace(self, frames: Vec<StackFrame>) -> Self {
        if frames.is_empty() || matches!(self, VmError::WithStackTrace { .. }) {
            return self;
        }
        VmError::WithStackTrace {
            stack_trace: Self::format_stack_trace(&frames),
            inner: Box::new(self),
            frames,
        }
    }

    pub fn format_stack_trace(frames: &[StackFrame]) -> String {
        let mut trace = String::new();
        for (i, frame) in frames.iter().rev().enumerate() {
            trace.push_str(&format!(
                "\n  #{}: {} line {} (offset {})",
                i, frame.procedure, frame.line, frame.offset
            ));
        }
        trace
    }

    /// The error beneath any stack trace wrapper.
    pub fn root(&self) -> &VmError {
        match self {
            VmError::WithStackTrace { inner, .. } => inner.root(),
            other => other,
        }
    }

    pub fn frames(&self) -> &[StackFrame] {
        match self {
            VmError::WithStackTrace { frames, .. } => frames,
            _ => &[],
        }
    }
}

/// Why a handler stopped early.
#[derive(Debug)]
pub(crate) enum Flow {
    /// Script-level fault, subject to `ON ERROR` handling.
    Fault(BasicError),
    /// Instances are being abandoned: a fault was transferred to an ancestor
    /// or the host stopped the run.
    Unwind,
    Fatal(VmError),
}

impl From<BasicError> for Flow {
    fn from(err: BasicError) -> Self {
        Flow::Fault(err)
    }
}

impl From<VmError> for Flow {
    fn from(err: VmError) -> Self {
        Flow::Fatal(err)
    }
}

impl From<ImageError> for Flow {
    fn from(err: ImageError) -> Self {
        Flow::Fatal(err.into())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Value),
    /// The host stopped the run before the entry procedure finished.
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Running,
    Blocked,
    Stopping,
}

/// Shared run-state switch. Clones observe and drive the same state, so a
/// host can hold one while the VM runs.
#[derive(Debug, Clone, Default)]
pub struct ExecControl(Rc<Cell<RunState>>);

impl ExecControl {
    pub fn state(&self) -> RunState {
        self.0.get()
    }

    pub fn stop(&self) {
        self.0.set(RunState::Stopping);
    }

    /// Hold the interpreter at its next instruction until released.
    pub fn block(&self) {
        self.0.set(RunState::Blocked);
    }

    pub fn release(&self) {
        if self.0.get() == RunState::Blocked {
            self.0.set(RunState::Running);
        }
    }

    pub fn reset(&self) {
        self.0.set(RunState::Running);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstanceState {
    Running,
    Returned,
    /// Abandoned while a fault or stop request travels up the chain.
    Unwinding,
}

/// Activation record of one procedure call.
pub(crate) struct Instance {
    pub(crate) proc_idx: u32,
    pub(crate) name: Rc<str>,
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) pc: usize,
    /// Offset of the instruction being executed.
    pub(crate) op_pc: usize,
    /// Offset of the current statement marker.
    pub(crate) stmt_pc: usize,
    pub(crate) line: u32,
    pub(crate) col: u32,
    pub(crate) state: InstanceState,
    pub(crate) expr: Vec<VarRef>,
    pub(crate) argv: Option<ArgVec>,
    pub(crate) argv_stack: Vec<Option<ArgVec>>,
    pub(crate) gosubs: Vec<GosubFrame>,
    pub(crate) fors: Vec<ForFrame>,
    pub(crate) locals: SymbolTable,
    pub(crate) params: ArgVec,
    pub(crate) errors: ErrorState,
    /// Objects whose members are referenced from the expression stack.
    pub(crate) retained: Vec<ObjectRef>,
}

impl Instance {
    pub(crate) fn new(proc_idx: u32, proc: &Procedure, end: usize, params: ArgVec) -> Self {
        let entry = proc.entry as usize;
        Self {
            proc_idx,
            name: Rc::from(proc.name.as_str()),
            start: entry,
            end,
            pc: entry,
            op_pc: entry,
            stmt_pc: entry,
            line: 0,
            col: 0,
            state: InstanceState::Running,
            expr: Vec::new(),
            argv: None,
            argv_stack: Vec::new(),
            gosubs: Vec::new(),
            fors: Vec::new(),
            locals: SymbolTable::new(),
            params,
            errors: ErrorState::default(),
            retained: Vec::new(),
        }
    }

    /// Drop partially evaluated expressions and argument lists.
    pub(crate) fn clear_transient(&mut self) {
        self.expr.clear();
        self.argv = None;
        self.argv_stack.clear();
    }
}

type YieldHook = Box<dyn FnMut(&mut Vm)>;

pub struct Vm {
    pub(crate) image: Rc<Image>,
    pub(crate) config: VmConfig,
    pub(crate) chain: Vec<Instance>,
    /// Chain length when the innermost host call entered. Faults never
    /// escalate below it.
    pub(crate) barrier: usize,
    pub(crate) module: SymbolTable,
    pub(crate) statics: HashMap<u32, SymbolTable>,
    pub(crate) error_info: Option<ErrorInfo>,
    pub(crate) ctx: EngineContext,
    pub(crate) io: Box<dyn IoChannels>,
    pub(crate) foreign: Option<Box<dyn ForeignCall>>,
    pub(crate) extended: Option<Box<dyn ExtendedSearch>>,
    pub(crate) builtins: Builtins,
    debug: Option<Box<dyn DebugHook>>,
    breakpoints: BTreeSet<u32>,
    /// Deepest call level at which the debug hook fires on every statement.
    break_level: Option<usize>,
    yield_hook: Option<YieldHook>,
    control: ExecControl,
    ticks: u64,
}

impl Vm {
    pub fn new(image: impl Into<Rc<Image>>, config: VmConfig) -> Self {
        Self {
            image: image.into(),
            config,
            chain: Vec::new(),
            barrier: 0,
            module: SymbolTable::new(),
            statics: HashMap::new(),
            error_info: None,
            ctx: EngineContext::new(),
            io: Box::new(BufferIo::new()),
            foreign: None,
            extended: None,
            builtins: Builtins::standard(),
            debug: None,
            breakpoints: BTreeSet::new(),
            break_level: None,
            yield_hook: None,
            control: ExecControl::default(),
            ticks: 0,
        }
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Call a procedure by name. May be re-entered from a yield hook; the
    /// nested call runs on top of the current chain.
    pub fn call(&mut self, name: &str, args: ArgVec) -> Result<Outcome, VmError> {
        let image = Rc::clone(&self.image);
        let (idx, _) = image
            .find_procedure(name)
            .ok_or_else(|| VmError::UndefinedEntry(name.to_string()))?;

        let saved = std::mem::replace(&mut self.barrier, self.chain.len());
        let result = self.call_procedure(idx, args);
        self.barrier = saved;

        let outcome = match result {
            Ok(value) => Ok(Outcome::Completed(value)),
            Err(Flow::Unwind) => Ok(Outcome::Stopped),
            Err(Flow::Fault(err)) => {
                warn!(procedure = name, error = %err, "entry call rejected");
                let info = ErrorInfo::new(&err, 0, 0);
                let fatal = VmError::Unhandled {
                    code: info.code,
                    message: info.message.clone(),
                    line: 0,
                };
                self.error_info = Some(info);
                Err(fatal)
            }
            Err(Flow::Fatal(err)) => Err(err),
        };
        if self.chain.is_empty() && self.control.state() == RunState::Stopping {
            self.control.reset();
        }
        outcome
    }

    pub fn call_values(
        &mut self,
        name: &str,
        values: impl IntoIterator<Item = Value>,
    ) -> Result<Outcome, VmError> {
        self.call(name, ArgVec::from_values(values))
    }

    pub fn run(&mut self, entry: &str) -> Result<Outcome, VmError> {
        self.call(entry, ArgVec::new())
    }

    /// Error surfaced to scripts and to the host while a fault is unresolved.
    pub fn error_info(&self) -> Option<&ErrorInfo> {
        self.error_info.as_ref()
    }

    pub fn control(&self) -> ExecControl {
        self.control.clone()
    }

    pub fn set_io(&mut self, io: impl IoChannels + 'static) {
        self.io = Box::new(io);
    }

    pub fn set_foreign(&mut self, bridge: impl ForeignCall + 'static) {
        self.foreign = Some(Box::new(bridge));
    }

    pub fn set_extended(&mut self, search: impl ExtendedSearch + 'static) {
        self.extended = Some(Box::new(search));
    }

    pub fn set_debug_hook(&mut self, hook: impl DebugHook + 'static) {
        self.debug = Some(Box::new(hook));
    }

    /// Called every `yield_interval` instructions, and repeatedly while the
    /// run is blocked.
    pub fn set_yield_hook(&mut self, hook: impl FnMut(&mut Vm) + 'static) {
        self.yield_hook = Some(Box::new(hook));
    }

    pub fn add_breakpoint(&mut self, line: u32) {
        self.breakpoints.insert(line);
    }

    pub fn remove_breakpoint(&mut self, line: u32) -> bool {
        self.breakpoints.remove(&line)
    }

    /// Break at the next statement executed at any depth.
    pub fn break_next(&mut self) {
        self.break_level = Some(usize::MAX);
    }

    pub fn module_var(&self, name: &str) -> Option<VarRef> {
        self.module.get(name)
    }

    /// Number of active procedure instances.
    pub fn depth(&self) -> usize {
        self.chain.len()
    }

    /// A collection was modified outside the script. Loops iterating it end
    /// at their next test.
    pub fn notify_collection_changed(&mut self, collection: &ObjectRef) {
        for inst in &mut self.chain {
            for frame in inst.fors.iter_mut().filter(|f| f.iterates(collection)) {
                frame.kind = stack::ForKind::Error;
            }
        }
    }

    pub fn capture_stack_trace(&self) -> Vec<StackFrame> {
        self.chain
            .iter()
            .map(|inst| StackFrame {
                procedure: inst.name.to_string(),
                line: inst.line,
                offset: inst.op_pc,
            })
            .collect()
    }

    pub(crate) fn top(&self) -> Result<&Instance, VmError> {
        self.chain.last().ok_or(VmError::NoActiveInstance)
    }

    pub(crate) fn top_mut(&mut self) -> Result<&mut Instance, VmError> {
        self.chain.last_mut().ok_or(VmError::NoActiveInstance)
    }

    /// Move the current instance's code pointer, staying inside its
    /// procedure.
    pub(crate) fn jump(&mut self, target: u32) -> Result<(), Flow> {
        let inst = self.top_mut()?;
        let to = target as usize;
        if to < inst.start || to > inst.end {
            return Err(VmError::BadJump(target).into());
        }
        inst.pc = to;
        Ok(())
    }

    /// Run the top instance until it returns.
    pub(crate) fn execute(&mut self) -> Result<(), Flow> {
        loop {
            self.tick()?;
            let inst = self.top()?;
            match inst.state {
                InstanceState::Returned => return Ok(()),
                InstanceState::Unwinding => return Err(Flow::Unwind),
                InstanceState::Running => {}
            }
            let pc = inst.pc;
            let result = if pc >= inst.end {
                dispatch::op_leave(self)
            } else {
                dispatch::step(self, pc)
            };
            match result {
                Ok(()) => {}
                Err(Flow::Fault(err)) => self.top_mut()?.errors.pending = Some(err),
                // A fault transferred here from a callee arrives as `Unwind`
                // with this instance still running.
                Err(Flow::Unwind) if self.top()?.state == InstanceState::Running => {}
                Err(other) => return Err(other),
            }
            if self.top()?.errors.pending.is_some() {
                self.handle_fault()?;
            }
        }
    }

    fn tick(&mut self) -> Result<(), Flow> {
        self.ticks = self.ticks.wrapping_add(1);
        let interval = self.config.yield_interval;
        if interval > 0 && self.ticks % u64::from(interval) == 0 {
            self.yield_to_host();
        }
        loop {
            match self.control.state() {
                RunState::Running => return Ok(()),
                RunState::Stopping => {
                    self.abandon_all();
                    return Err(Flow::Unwind);
                }
                RunState::Blocked if self.yield_hook.is_none() => {
                    warn!("run blocked without a yield hook; releasing");
                    self.control.release();
                }
                RunState::Blocked => self.yield_to_host(),
            }
        }
    }

    fn yield_to_host(&mut self) {
        if let Some(mut hook) = self.yield_hook.take() {
            hook(self);
            if self.yield_hook.is_none() {
                self.yield_hook = Some(hook);
            }
        }
    }

    pub(crate) fn abandon_all(&mut self) {
        for inst in &mut self.chain {
            inst.state = InstanceState::Unwinding;
        }
    }

    fn debug_statement(&mut self, line: u32, start_col: u16, end_col: u16) {
        let depth = self.chain.len();
        let hit = self.breakpoints.contains(&line)
            || self.break_level.is_some_and(|level| depth <= level);
        if !hit {
            return;
        }
        let Some(hook) = self.debug.as_mut() else {
            return;
        };
        self.break_level = match hook.on_statement(line, start_col, end_col) {
            DebugMode::Continue => None,
            DebugMode::StepInto => Some(usize::MAX),
            DebugMode::StepOver => Some(depth),
            DebugMode::StepOut => Some(depth.saturating_sub(1)),
        };
    }

    pub(crate) fn compare_text(&self) -> bool {
        self.config.compare_text || self.image.compare_text
    }
}

impl NativeContext for Vm {
    fn error_info(&self) -> Option<&ErrorInfo> {
        self.error_info.as_ref()
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("image", &self.image.name)
            .field("depth", &self.chain.len())
            .field("state", &self.control.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_trace_wraps_once() {
        let frames = vec![
            StackFrame {
                procedure: "Main".into(),
                line: 3,
                offset: 10,
            },
            StackFrame {
                procedure: "Helper".into(),
                line: 9,
                offset: 42,
            },
        ];
        let err = VmError::StackUnderflow(42).with_stack_trace(frames.clone());
        let text = err.to_string();
        assert!(text.contains("#0: Helper line 9"));
        assert!(text.contains("#1: Main line 3"));
        let again = err.with_stack_trace(frames);
        assert!(matches!(again.root(), VmError::StackUnderflow(42)));
        assert_eq!(again.frames().len(), 2);
    }

    #[test]
    fn exec_control_is_shared() {
        let control = ExecControl::default();
        let handle = control.clone();
        handle.block();
        assert_eq!(control.state(), RunState::Blocked);
        handle.release();
        assert_eq!(control.state(), RunState::Running);
        handle.stop();
        control.release();
        assert_eq!(control.state(), RunState::Stopping);
        control.reset();
        assert_eq!(handle.state(), RunState::Running);
    }
}
