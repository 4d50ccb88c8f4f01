//! Evaluating variables and invoking callees.

use super::scope::bind_arguments;
use super::{Flow, Instance, Vm, VmError};
use kestrel_core::{ArgVec, BasicError, Callee, Value, VarFlags, VarKind, VarRef};
use std::rc::Rc;
use tracing::debug;

/// Native stack left when a nested activation grows a new segment.
const STACK_RED_ZONE: usize = 128 * 1024;
const STACK_GROW_SIZE: usize = 2 * 1024 * 1024;

impl Vm {
    /// The value a variable stands for. Methods are called with `args`,
    /// properties are read through their parent object.
    pub(crate) fn eval_with(&mut self, var: &VarRef, args: Option<ArgVec>) -> Result<Value, Flow> {
        let kind = var.kind().clone();
        match kind {
            VarKind::Plain => {
                if var.has_flag(VarFlags::MISSING) && var.with_value(Value::is_empty) {
                    return Err(BasicError::ArgumentNotOptional.into());
                }
                Ok(var.value())
            }
            VarKind::Method(callee) => {
                let value = self.invoke(&callee, args.unwrap_or_default())?;
                var.put(value.clone());
                Ok(value)
            }
            VarKind::Property { parent, member } => {
                let obj = parent.upgrade().ok_or(BasicError::ObjectNotSet)?;
                let index = args.map(|a| a.values()).unwrap_or_default();
                Ok(obj.get_property(&member, &index)?)
            }
        }
    }

    /// Pop the top of the expression stack and evaluate it.
    pub(crate) fn pop_value(&mut self) -> Result<Value, Flow> {
        let (var, args) = self.top_mut()?.pop_with_args()?;
        self.eval_with(&var, args)
    }

    /// Pop a variable, evaluating it first when it is a call or property.
    pub(crate) fn pop_operand(&mut self) -> Result<VarRef, Flow> {
        let (var, args) = self.top_mut()?.pop_with_args()?;
        if var.is_method() || var.is_property() {
            Ok(VarRef::temp(self.eval_with(&var, args)?))
        } else {
            Ok(var)
        }
    }

    pub(crate) fn invoke(&mut self, callee: &Callee, args: ArgVec) -> Result<Value, Flow> {
        match callee {
            Callee::Procedure(idx) => self.call_procedure(*idx, args),
            Callee::Native(func) => {
                let vars = positional(&args)?;
                let func = Rc::clone(func);
                Ok(func.call(self, &vars)?)
            }
            Callee::HostMethod { object, name } => {
                let vars = positional(&args)?;
                Ok(object.call_method(name, &vars)?)
            }
        }
    }

    /// Activate procedure `idx` on top of the call chain and run it to
    /// completion. Binding faults belong to the caller.
    pub(crate) fn call_procedure(&mut self, idx: u32, args: ArgVec) -> Result<Value, Flow> {
        if self.chain.len() >= self.config.max_call_depth {
            return Err(VmError::StackOverflow(format!(
                "call depth {}",
                self.config.max_call_depth
            ))
            .into());
        }
        let image = Rc::clone(&self.image);
        let proc = image
            .procedures
            .get(idx as usize)
            .ok_or_else(|| VmError::MalformedCall(format!("procedure index {idx}")))?;
        let mut params = bind_arguments(&image, proc, args)?;
        params.set_ret(VarRef::declared(proc.name.as_str(), proc.ret));

        self.chain
            .push(Instance::new(idx, proc, image.procedure_end(idx), params));
        debug!(procedure = %proc.name, depth = self.chain.len(), "enter");

        // Nested activations recurse natively; `max_call_depth` is the only
        // bound on script recursion.
        let run = stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || self.execute());
        let result = match run {
            Err(Flow::Fatal(err)) => {
                let frames = self.capture_stack_trace();
                Err(Flow::Fatal(err.with_stack_trace(frames)))
            }
            other => other,
        };
        let finished = self.chain.pop();
        debug!(procedure = %proc.name, ok = result.is_ok(), "exit");
        result?;

        let Some(inst) = finished else {
            return Err(VmError::MalformedCall("call chain emptied during call".into()).into());
        };
        if inst.errors.in_handler {
            // Leaving the procedure resolves the fault it was handling.
            self.error_info = None;
        }
        Ok(if proc.is_function {
            inst.params.ret().value()
        } else {
            Value::Empty
        })
    }

    /// End of statement: run any call left on the stack for its side effects
    /// and drop the rest.
    pub(crate) fn flush_statement(&mut self) -> Result<(), Flow> {
        let pending = std::mem::take(&mut self.top_mut()?.expr);
        for var in pending {
            if var.is_method() {
                let args = var.take_params();
                self.eval_with(&var, args)?;
            }
        }
        let inst = self.top_mut()?;
        inst.argv = None;
        inst.argv_stack.clear();
        inst.retained.clear();
        Ok(())
    }
}

fn positional(args: &ArgVec) -> Result<Vec<VarRef>, BasicError> {
    args.args()
        .iter()
        .map(|a| match &a.name {
            Some(name) => Err(BasicError::NamedArgumentNotFound(name.to_string())),
            None => Ok(a.var.clone()),
        })
        .collect()
}
