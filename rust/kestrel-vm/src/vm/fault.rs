//! `ON ERROR` handling.
//!
//! A fault raised by an instruction is parked in the instance's
//! [`ErrorState`] and resolved by [`Vm::handle_fault`] before the next
//! instruction: swallowed (`ON ERROR RESUME NEXT`), delivered to the
//! instance's handler, or escalated to the nearest caller able to take it.

use super::{Flow, InstanceState, Vm};
use kestrel_core::image::opcode::{Opcode, RESUME_BARE, RESUME_NEXT};
use kestrel_core::{BasicError, ErrorInfo};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum Handler {
    /// No handler: faults go to the caller.
    #[default]
    Abort,
    Goto(u32),
    ResumeNext,
}

/// Where `RESUME` and `RESUME NEXT` continue from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResumePoint {
    pub(crate) stmt: usize,
    pub(crate) op: usize,
}

#[derive(Debug, Default)]
pub(crate) struct ErrorState {
    pub(crate) pending: Option<BasicError>,
    pub(crate) in_handler: bool,
    pub(crate) handler: Handler,
    pub(crate) resume: Option<ResumePoint>,
}

impl ErrorState {
    /// Whether a fault escalated from a callee can be delivered here.
    pub(crate) fn can_accept(&self) -> bool {
        self.handler != Handler::Abort && !self.in_handler
    }

    fn disarm(&mut self) {
        self.handler = Handler::Abort;
        self.in_handler = false;
        self.resume = None;
    }
}

impl Vm {
    /// Resolve the top instance's pending fault.
    pub(crate) fn handle_fault(&mut self) -> Result<(), Flow> {
        let inst = self.top_mut()?;
        let Some(err) = inst.errors.pending.take() else {
            return Ok(());
        };
        if inst.errors.in_handler {
            // Never re-entered: a fault inside the handler goes to the caller.
            inst.errors.disarm();
            return self.escalate(err);
        }
        let handler = inst.errors.handler;
        match handler {
            Handler::Abort => self.escalate(err),
            Handler::ResumeNext => {
                let op = inst.op_pc;
                debug!(procedure = %inst.name, error = %err, "fault skipped");
                inst.clear_transient();
                self.error_info = None;
                self.continue_after(op)
            }
            Handler::Goto(target) => {
                inst.errors.resume = Some(ResumePoint {
                    stmt: inst.stmt_pc,
                    op: inst.op_pc,
                });
                inst.errors.in_handler = true;
                inst.clear_transient();
                let (line, col) = (inst.line, inst.col);
                debug!(procedure = %inst.name, error = %err, line, target, "entering handler");
                self.error_info = Some(ErrorInfo::new(&err, line, col));
                self.jump(target)
            }
        }
    }

    /// Hand the fault to the nearest caller that can accept it, abandoning
    /// every instance above that caller. Callers below the current host
    /// entry are never considered.
    fn escalate(&mut self, err: BasicError) -> Result<(), Flow> {
        let top = self.chain.len().saturating_sub(1);
        let target = (self.barrier..top)
            .rev()
            .find(|&j| self.chain[j].errors.can_accept());
        match target {
            Some(j) => {
                warn!(
                    from = %self.chain[top].name,
                    to = %self.chain[j].name,
                    error = %err,
                    "escalating fault"
                );
                for inst in &mut self.chain[j + 1..] {
                    inst.state = InstanceState::Unwinding;
                }
                self.chain[j].errors.pending = Some(err);
                Err(Flow::Unwind)
            }
            None => {
                let inst = self.top()?;
                let info = ErrorInfo::new(&err, inst.line, inst.col);
                warn!(procedure = %inst.name, error = %err, line = inst.line, "unhandled fault");
                let fatal = super::VmError::Unhandled {
                    code: info.code,
                    message: info.message.clone(),
                    line: info.line,
                };
                self.error_info = Some(info);
                Err(fatal.into())
            }
        }
    }

    /// Continue at the first statement after the instruction at `op`, or
    /// leave the procedure when there is none.
    pub(crate) fn continue_after(&mut self, op: usize) -> Result<(), Flow> {
        let image = std::rc::Rc::clone(&self.image);
        let ins = image.decode(op)?;
        // A statement marker faults only while finishing the statement
        // before it, so the marker itself is the next statement.
        let after = if ins.op == Opcode::Stmnt { op } else { op + ins.len };
        let inst = self.top_mut()?;
        inst.pc = match image.next_statement(after) {
            Some(stmt) if stmt.offset < inst.end => stmt.offset,
            _ => inst.end,
        };
        Ok(())
    }
}

/// `ON ERROR GOTO label`.
pub(super) fn op_errhdl(vm: &mut Vm, target: u32) -> Result<(), Flow> {
    vm.top_mut()?.errors.handler = Handler::Goto(target);
    vm.error_info = None;
    Ok(())
}

/// `ON ERROR GOTO 0`.
pub(super) fn op_stderror(vm: &mut Vm) -> Result<(), Flow> {
    vm.top_mut()?.errors.handler = Handler::Abort;
    vm.error_info = None;
    Ok(())
}

/// `ON ERROR RESUME NEXT`.
pub(super) fn op_noerror(vm: &mut Vm) -> Result<(), Flow> {
    vm.top_mut()?.errors.handler = Handler::ResumeNext;
    vm.error_info = None;
    Ok(())
}

/// `RESUME`, `RESUME NEXT` or `RESUME label`, by operand.
pub(super) fn op_resume(vm: &mut Vm, target: u32) -> Result<(), Flow> {
    let inst = vm.top_mut()?;
    if !inst.errors.in_handler {
        return Err(BasicError::ResumeWithoutError.into());
    }
    let point = inst
        .errors
        .resume
        .take()
        .ok_or(BasicError::ResumeWithoutError)?;
    inst.errors.in_handler = false;
    inst.clear_transient();
    vm.error_info = None;
    match target {
        RESUME_BARE => {
            vm.top_mut()?.pc = point.stmt;
            Ok(())
        }
        RESUME_NEXT => vm.continue_after(point.op),
        label => vm.jump(label),
    }
}

/// `ERROR n`: raise a fault by code.
pub(super) fn op_error(vm: &mut Vm) -> Result<(), Flow> {
    let code = vm.pop_value()?.to_i64()?;
    match u32::try_from(code) {
        Ok(code @ 1..=65535) => Err(BasicError::from_code(code).into()),
        _ => Err(BasicError::InvalidProcedureCall.into()),
    }
}
