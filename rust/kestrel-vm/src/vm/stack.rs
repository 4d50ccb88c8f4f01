//! The per-instance stacks: expression values, argument vectors under
//! construction, GOSUB return frames and active FOR loops.

use super::{Flow, Instance, Vm, VmError};
use kestrel_core::array::advance;
use kestrel_core::image::opcode::{GOSUB_FLAG, RETURN_PLAIN};
use kestrel_core::image::ImageError;
use kestrel_core::ops::{self, BinOp};
use kestrel_core::{ArgVec, ArrayRef, BasicError, HostEnumerator, ObjectRef, Value, VarRef};
use std::cmp::Ordering;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GosubFrame {
    pub(crate) ret: usize,
    /// FOR depth when the subroutine was entered.
    pub(crate) for_depth: usize,
}

pub(crate) enum ForKind {
    /// Current value lives in the loop variable.
    Counted { limit: Value, step: Value },
    EachArray {
        array: ArrayRef,
        bounds: Vec<(i32, i32)>,
        index: Vec<i32>,
        started: bool,
    },
    EachCollection {
        collection: ObjectRef,
        cursor: usize,
        generation: u64,
    },
    EachHostEnumeration {
        object: ObjectRef,
        cursor: Box<dyn HostEnumerator>,
    },
    EachHostIndexed { object: ObjectRef, cursor: usize },
    /// Initialisation failed with the fault suppressed; the next test ends
    /// the loop.
    Error,
}

pub(crate) struct ForFrame {
    pub(crate) var: VarRef,
    /// GOSUB depth when the loop was entered.
    pub(crate) gosub_depth: usize,
    pub(crate) kind: ForKind,
}

impl ForFrame {
    pub(crate) fn iterates(&self, obj: &ObjectRef) -> bool {
        let source = match &self.kind {
            ForKind::EachCollection { collection, .. } => collection,
            ForKind::EachHostEnumeration { object, .. } => object,
            ForKind::EachHostIndexed { object, .. } => object,
            _ => return false,
        };
        std::ptr::addr_eq(Rc::as_ptr(source), Rc::as_ptr(obj))
    }

    /// Produce the next iteration: assign the loop variable and return
    /// `true`, or return `false` when the loop is finished.
    fn test(&mut self) -> Result<bool, BasicError> {
        let mut stale = false;
        let next = match &mut self.kind {
            ForKind::Counted { limit, step } => {
                let current = self.var.value();
                let ord = ops::compare(&current, limit, false)?;
                let descending = ops::compare(step, &Value::Integer(0), false)? == Ordering::Less;
                let done = if descending {
                    ord == Ordering::Less
                } else {
                    ord == Ordering::Greater
                };
                return Ok(!done);
            }
            ForKind::EachArray {
                array,
                bounds,
                index,
                started,
            } => {
                let more = if *started {
                    advance(index, bounds)
                } else {
                    *started = true;
                    !bounds.is_empty()
                };
                if !more {
                    return Ok(false);
                }
                Some(array.borrow().get(index)?)
            }
            ForKind::EachCollection {
                collection,
                cursor,
                generation,
            } => {
                let Some(coll) = collection.as_collection() else {
                    return Ok(false);
                };
                if coll.generation() != *generation {
                    stale = true;
                    None
                } else {
                    let item = coll.get(*cursor);
                    *cursor += 1;
                    item
                }
            }
            ForKind::EachHostEnumeration { cursor, .. } => cursor.next_item()?,
            ForKind::EachHostIndexed { object, cursor } => {
                if *cursor >= object.indexed_count().unwrap_or(0) {
                    None
                } else {
                    let item = object.indexed_item(*cursor)?;
                    *cursor += 1;
                    Some(item)
                }
            }
            ForKind::Error => None,
        };
        if stale {
            self.kind = ForKind::Error;
        }
        match next {
            Some(value) => {
                self.var.assign(value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// `NEXT`: advance a counted loop. FOR EACH frames advance in `test`.
    fn step(&self) -> Result<(), BasicError> {
        if let ForKind::Counted { step, .. } = &self.kind {
            let next = ops::binary(BinOp::Add, &self.var.value(), step, false)?;
            self.var.assign(next)?;
        }
        Ok(())
    }
}

impl Instance {
    pub(crate) fn push(&mut self, var: VarRef) {
        self.expr.push(var);
    }

    /// Pop a variable together with the argument list it carried. Only
    /// methods and properties carry one; the list is detached by the pop.
    pub(crate) fn pop_with_args(&mut self) -> Result<(VarRef, Option<ArgVec>), VmError> {
        let var = self.expr.pop().ok_or(VmError::StackUnderflow(self.op_pc))?;
        let args = if var.is_method() || var.is_property() {
            var.take_params()
        } else {
            None
        };
        Ok((var, args))
    }

    pub(crate) fn pop(&mut self) -> Result<VarRef, VmError> {
        self.pop_with_args().map(|(var, _)| var)
    }

    pub(crate) fn begin_args(&mut self) {
        let saved = self.argv.replace(ArgVec::new());
        self.argv_stack.push(saved);
    }

    pub(crate) fn add_arg(&mut self, name: Option<Rc<str>>, var: VarRef) -> Result<(), VmError> {
        let argv = self
            .argv
            .as_mut()
            .ok_or_else(|| VmError::MalformedCall("argument outside an argument list".into()))?;
        match name {
            Some(name) => argv.push_named(name, var),
            None => argv.push(var),
        }
        Ok(())
    }

    pub(crate) fn last_arg_mut(&mut self) -> Result<&mut kestrel_core::Arg, VmError> {
        self.argv
            .as_mut()
            .and_then(ArgVec::last_mut)
            .ok_or_else(|| VmError::MalformedCall("no argument to qualify".into()))
    }

    /// Take the finished vector and restore the one it interrupted.
    pub(crate) fn end_args(&mut self) -> Result<ArgVec, VmError> {
        let built = self
            .argv
            .take()
            .ok_or_else(|| VmError::MalformedCall("no argument list to consume".into()))?;
        self.argv = self.argv_stack.pop().flatten();
        Ok(built)
    }

    pub(crate) fn push_gosub(&mut self, ret: usize, limit: usize) -> Result<(), VmError> {
        if self.gosubs.len() >= limit {
            return Err(VmError::StackOverflow(format!("GOSUB depth {limit}")));
        }
        self.gosubs.push(GosubFrame {
            ret,
            for_depth: self.fors.len(),
        });
        Ok(())
    }

    /// Pop a GOSUB frame, discarding loops entered inside the subroutine.
    pub(crate) fn pop_gosub(&mut self) -> Result<GosubFrame, BasicError> {
        let frame = self.gosubs.pop().ok_or(BasicError::ReturnWithoutGosub)?;
        self.fors.truncate(frame.for_depth);
        Ok(frame)
    }

    pub(crate) fn push_for(&mut self, var: VarRef, kind: ForKind) {
        self.fors.push(ForFrame {
            var,
            gosub_depth: self.gosubs.len(),
            kind,
        });
    }

    pub(crate) fn pop_for(&mut self) -> Result<ForFrame, BasicError> {
        self.fors.pop().ok_or(BasicError::ForLoopNotInitialized)
    }

    pub(crate) fn top_for(&mut self) -> Result<&mut ForFrame, BasicError> {
        self.fors.last_mut().ok_or(BasicError::ForLoopNotInitialized)
    }
}

/// `INITFOR`: pops step, limit, start and the loop variable.
pub(super) fn op_initfor(vm: &mut Vm) -> Result<(), Flow> {
    let step = vm.pop_value()?;
    let limit = vm.pop_value()?;
    let start = vm.pop_value()?;
    let var = vm.top_mut()?.pop()?;
    for v in [&step, &limit, &start] {
        v.to_f64()?;
    }
    var.assign(start)?;
    vm.top_mut()?.push_for(var, ForKind::Counted { limit, step });
    Ok(())
}

/// `INITFOREACH`: pops the iterated value and the loop variable. A value
/// that cannot be iterated leaves an `Error` frame behind before faulting.
pub(super) fn op_initforeach(vm: &mut Vm) -> Result<(), Flow> {
    let source = vm.pop_value()?;
    let var = vm.top_mut()?.pop()?;
    let kind = match each_kind(&source) {
        Ok(kind) => kind,
        Err(err) => {
            vm.top_mut()?.push_for(var, ForKind::Error);
            return Err(err.into());
        }
    };
    vm.top_mut()?.push_for(var, kind);
    Ok(())
}

fn each_kind(source: &Value) -> Result<ForKind, BasicError> {
    match source {
        Value::Array(array) => {
            let bounds = array.borrow().bounds().to_vec();
            let index = bounds.iter().map(|&(lo, _)| lo).collect();
            Ok(ForKind::EachArray {
                array: array.clone(),
                bounds,
                index,
                started: false,
            })
        }
        Value::Object(Some(obj)) => {
            if let Some(coll) = obj.as_collection() {
                return Ok(ForKind::EachCollection {
                    collection: obj.clone(),
                    cursor: 0,
                    generation: coll.generation(),
                });
            }
            if obj.indexed_count().is_some() {
                return Ok(ForKind::EachHostIndexed {
                    object: obj.clone(),
                    cursor: 0,
                });
            }
            match obj.enumerate() {
                Some(cursor) => Ok(ForKind::EachHostEnumeration {
                    object: obj.clone(),
                    cursor,
                }),
                None => Err(BasicError::NotSupported(obj.class_name().to_string())),
            }
        }
        Value::Object(None) => Err(BasicError::ObjectNotSet),
        _ => Err(BasicError::TypeMismatch),
    }
}

/// `TESTFOR target`: assign the next iteration or leave the loop.
pub(super) fn op_testfor(vm: &mut Vm, target: u32) -> Result<(), Flow> {
    let inst = vm.top_mut()?;
    let frame = inst.top_for()?;
    let gosub_depth = frame.gosub_depth;
    let more = frame.test()?;
    // GOSUBs entered inside the loop body and never returned from.
    inst.gosubs.truncate(gosub_depth);
    if !more {
        inst.pop_for()?;
        vm.jump(target)?;
    }
    Ok(())
}

pub(super) fn op_next(vm: &mut Vm) -> Result<(), Flow> {
    vm.top_mut()?.top_for()?.step()?;
    Ok(())
}

/// `POPFOR`: `EXIT FOR`.
pub(super) fn op_popfor(vm: &mut Vm) -> Result<(), Flow> {
    vm.top_mut()?.pop_for()?;
    Ok(())
}

pub(super) fn op_gosub(vm: &mut Vm, target: u32) -> Result<(), Flow> {
    let limit = vm.config.max_gosub_depth;
    let inst = vm.top_mut()?;
    let ret = inst.pc;
    inst.push_gosub(ret, limit)?;
    vm.jump(target)
}

/// `RETURN`: back to the saved address, or to an explicit label.
pub(super) fn op_return(vm: &mut Vm, target: u32) -> Result<(), Flow> {
    let frame = vm.top_mut()?.pop_gosub()?;
    if target == RETURN_PLAIN {
        vm.top_mut()?.pc = frame.ret;
        Ok(())
    } else {
        vm.jump(target)
    }
}

/// `ON n GOTO` / `ON n GOSUB`: the jump table follows the instruction.
pub(super) fn op_onjump(vm: &mut Vm, word: u32) -> Result<(), Flow> {
    let count = (word & !GOSUB_FLAG) as usize;
    let op_pc = vm.top()?.op_pc;
    let after = op_pc + 5 + 4 * count;
    vm.top_mut()?.pc = after;
    let selector = vm.pop_value()?.to_i64()?;
    if !(0..=255).contains(&selector) {
        return Err(BasicError::InvalidProcedureCall.into());
    }
    if selector == 0 || selector as usize > count {
        return Ok(());
    }
    let target = vm
        .image
        .read_u32(op_pc + 5 + 4 * (selector as usize - 1))
        .ok_or(ImageError::Truncated(op_pc))?;
    if word & GOSUB_FLAG != 0 {
        let limit = vm.config.max_gosub_depth;
        vm.top_mut()?.push_gosub(after, limit)?;
    }
    vm.jump(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{ArrayValue, Callee, Collection, VarType};

    fn counted(start: i32, limit: i32, step: i32) -> Vec<Value> {
        let var = VarRef::declared("i", VarType::Variant);
        var.assign(Value::Long(start)).unwrap();
        let mut frame = ForFrame {
            var: var.clone(),
            gosub_depth: 0,
            kind: ForKind::Counted {
                limit: Value::Long(limit),
                step: Value::Long(step),
            },
        };
        let mut seen = Vec::new();
        while frame.test().unwrap() {
            seen.push(var.value());
            frame.step().unwrap();
        }
        seen
    }

    #[test]
    fn counted_sequences() {
        let longs = |v: &[i32]| v.iter().copied().map(Value::Long).collect::<Vec<_>>();
        assert_eq!(counted(1, 5, 1), longs(&[1, 2, 3, 4, 5]));
        assert_eq!(counted(5, 1, -1), longs(&[5, 4, 3, 2, 1]));
        assert!(counted(5, 1, 1).is_empty());
        assert_eq!(counted(0, 10, 5), longs(&[0, 5, 10]));
    }

    #[test]
    fn each_array_visits_first_index_fastest() {
        let arr = ArrayValue::new(vec![(0, 1), (0, 1)], VarType::Variant, true).unwrap();
        for (n, (i, j)) in [(0, 0), (1, 0), (0, 1), (1, 1)].into_iter().enumerate() {
            arr.set(&[i, j], Value::Long(n as i32)).unwrap();
        }
        let var = VarRef::declared("x", VarType::Variant);
        let mut frame = ForFrame {
            var: var.clone(),
            gosub_depth: 0,
            kind: each_kind(&Value::Array(arr.into_ref())).unwrap(),
        };
        let mut seen = Vec::new();
        while frame.test().unwrap() {
            seen.push(var.value());
        }
        assert_eq!(seen, (0..4).map(Value::Long).collect::<Vec<_>>());
    }

    #[test]
    fn collection_change_ends_iteration() {
        let coll = Collection::new();
        coll.add(Value::Long(1), None).unwrap();
        coll.add(Value::Long(2), None).unwrap();
        let obj = coll.into_object();
        let var = VarRef::declared("x", VarType::Variant);
        let mut frame = ForFrame {
            var: var.clone(),
            gosub_depth: 0,
            kind: each_kind(&Value::Object(Some(obj.clone()))).unwrap(),
        };
        assert!(frame.iterates(&obj));
        assert!(frame.test().unwrap());
        obj.as_collection().unwrap().add(Value::Long(3), None).unwrap();
        assert!(!frame.test().unwrap());
        assert!(matches!(frame.kind, ForKind::Error));
    }

    #[test]
    fn non_iterables_are_rejected() {
        assert!(matches!(each_kind(&Value::Long(3)), Err(BasicError::TypeMismatch)));
        assert!(matches!(each_kind(&Value::Object(None)), Err(BasicError::ObjectNotSet)));
    }

    #[test]
    fn pop_detaches_method_arguments() {
        let image = kestrel_core::image::ImageBuilder::new("t").finish().unwrap();
        let proc = kestrel_core::image::Procedure {
            name: "p".into(),
            entry: 0,
            params: vec![],
            ret: VarType::Empty,
            is_function: false,
        };
        let mut inst = Instance::new(0, &proc, image.code_len(), ArgVec::new());

        inst.push(VarRef::temp(Value::string("kept")));
        assert_eq!(inst.pop().unwrap().value(), Value::string("kept"));

        let method = VarRef::method("m", Callee::Procedure(0), VarType::Variant);
        method.set_params(Some(ArgVec::from_values([Value::Long(1)])));
        inst.push(method.clone());
        let (popped, args) = inst.pop_with_args().unwrap();
        assert!(VarRef::ptr_eq(&popped, &method));
        assert_eq!(args.map(|a| a.count()), Some(1));
        assert!(!method.has_params());
        assert!(matches!(inst.pop(), Err(VmError::StackUnderflow(_))));
    }

    #[test]
    fn nested_argument_vectors() {
        let proc = kestrel_core::image::Procedure {
            name: "p".into(),
            entry: 0,
            params: vec![],
            ret: VarType::Empty,
            is_function: false,
        };
        let mut inst = Instance::new(0, &proc, 0, ArgVec::new());
        inst.begin_args();
        inst.add_arg(None, VarRef::temp(Value::Long(1))).unwrap();
        inst.begin_args();
        inst.add_arg(Some("x".into()), VarRef::temp(Value::Long(2))).unwrap();
        let inner = inst.end_args().unwrap();
        assert!(inner.has_named());
        let outer = inst.end_args().unwrap();
        assert_eq!(outer.values(), vec![Value::Long(1)]);
        assert!(inst.end_args().is_err());
    }

    #[test]
    fn gosub_stack_is_bounded_and_resyncs_loops() {
        let proc = kestrel_core::image::Procedure {
            name: "p".into(),
            entry: 0,
            params: vec![],
            ret: VarType::Empty,
            is_function: false,
        };
        let mut inst = Instance::new(0, &proc, 0, ArgVec::new());
        assert_eq!(inst.pop_gosub(), Err(BasicError::ReturnWithoutGosub));
        inst.push_gosub(10, 2).unwrap();
        inst.push_for(VarRef::temp(Value::Empty), ForKind::Error);
        inst.push_gosub(20, 2).unwrap();
        assert!(matches!(inst.push_gosub(30, 2), Err(VmError::StackOverflow(_))));
        assert_eq!(inst.pop_gosub().map(|f| f.ret), Ok(20));
        assert_eq!(inst.fors.len(), 1);
        assert_eq!(inst.pop_gosub().map(|f| f.ret), Ok(10));
        assert!(inst.fors.is_empty());
    }
}
