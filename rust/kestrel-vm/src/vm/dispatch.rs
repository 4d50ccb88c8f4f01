//! Instruction decoding and the opcode handler tables.
//!
//! Each operand count has its own table indexed by `byte - base`. The
//! dispatcher advances the code pointer past the instruction before the
//! handler runs, so jumps simply overwrite it.

use super::scope::decode_type;
use super::{channels, fault, stack, Flow, InstanceState, Vm, VmError};
use kestrel_core::array::element_count;
use kestrel_core::image::opcode::{
    arity_of, BYVAL_FLAG, ONE_BASE, ONE_COUNT, TWO_BASE, TWO_COUNT, ZERO_BASE, ZERO_COUNT,
};
use kestrel_core::image::ImageError;
use kestrel_core::ops::{self, BinOp, UnOp};
use kestrel_core::{ArgVec, ArrayValue, BasicError, Value, VarKind, VarRef, VarType};
use std::rc::Rc;
use tracing::{debug, trace};

type Op0 = fn(&mut Vm) -> Result<(), Flow>;
type Op1 = fn(&mut Vm, u32) -> Result<(), Flow>;
type Op2 = fn(&mut Vm, u32, u32) -> Result<(), Flow>;

const OPS0: [Op0; ZERO_COUNT] = [
    op_nop,
    op_exp,
    op_mul,
    op_div,
    op_mod,
    op_plus,
    op_minus,
    op_neg,
    op_eq,
    op_ne,
    op_lt,
    op_gt,
    op_le,
    op_ge,
    op_idiv,
    op_and,
    op_or,
    op_xor,
    op_eqv,
    op_imp,
    op_not,
    op_cat,
    op_like,
    op_is,
    op_argc,
    op_argv,
    op_get,
    op_set,
    op_setref,
    op_empty,
    op_leave,
    op_stop,
    stack::op_initfor,
    stack::op_initforeach,
    stack::op_next,
    stack::op_popfor,
    op_dim,
    op_redim,
    op_redim_preserve,
    op_erase,
    fault::op_error,
    fault::op_stderror,
    fault::op_noerror,
    channels::op_channel,
    channels::op_chan0,
    channels::op_print,
    channels::op_printf,
    channels::op_write,
    channels::op_lineinput,
    channels::op_input,
];

const OPS1: [Op1; ONE_COUNT] = [
    op_number,
    op_string,
    op_const,
    op_argn,
    op_argtyp,
    op_jump,
    op_jumpt,
    op_jumpf,
    stack::op_onjump,
    stack::op_gosub,
    stack::op_return,
    stack::op_testfor,
    fault::op_errhdl,
    fault::op_resume,
    channels::op_close,
    channels::op_prchar,
];

const OPS2: [Op2; TWO_COUNT] = [
    Vm::op_rtl,
    Vm::op_find,
    Vm::op_elem,
    Vm::op_param,
    op_call,
    op_stmnt,
    channels::op_open,
    Vm::op_local,
    Vm::op_public,
    Vm::op_static,
];

/// Decode and execute the instruction at `pc` in the top instance.
pub(super) fn step(vm: &mut Vm, pc: usize) -> Result<(), Flow> {
    let byte = *vm.image.code.get(pc).ok_or(ImageError::Truncated(pc))?;
    let unknown = || VmError::UnknownOpcode {
        op: byte,
        offset: pc,
    };
    let arity = arity_of(byte).ok_or_else(unknown)?;
    let mut operands = [0u32; 2];
    for (i, slot) in operands.iter_mut().enumerate().take(arity) {
        *slot = vm
            .image
            .read_u32(pc + 1 + 4 * i)
            .ok_or(ImageError::Truncated(pc))?;
    }
    let inst = vm.top_mut()?;
    inst.op_pc = pc;
    inst.pc = pc + 1 + 4 * arity;
    let [a, b] = operands;
    match arity {
        0 => {
            let handler = OPS0.get(usize::from(byte - ZERO_BASE)).ok_or_else(unknown)?;
            handler(vm)
        }
        1 => {
            let handler = OPS1.get(usize::from(byte - ONE_BASE)).ok_or_else(unknown)?;
            handler(vm, a)
        }
        _ => {
            let handler = OPS2.get(usize::from(byte - TWO_BASE)).ok_or_else(unknown)?;
            handler(vm, a, b)
        }
    }
}

fn push_value(vm: &mut Vm, value: Value) -> Result<(), Flow> {
    vm.top_mut()?.push(VarRef::temp(value));
    Ok(())
}

fn op_nop(_: &mut Vm) -> Result<(), Flow> {
    Ok(())
}

fn binary(vm: &mut Vm, op: BinOp) -> Result<(), Flow> {
    let rhs = vm.pop_value()?;
    let lhs = vm.pop_value()?;
    let result = ops::binary(op, &lhs, &rhs, vm.compare_text())?;
    push_value(vm, result)
}

macro_rules! binary_ops {
    ($($name:ident => $op:ident),* $(,)?) => {
        $(
            fn $name(vm: &mut Vm) -> Result<(), Flow> {
                binary(vm, BinOp::$op)
            }
        )*
    };
}

binary_ops! {
    op_exp => Pow,
    op_mul => Mul,
    op_div => Div,
    op_mod => Mod,
    op_plus => Add,
    op_minus => Sub,
    op_eq => Eq,
    op_ne => Ne,
    op_lt => Lt,
    op_gt => Gt,
    op_le => Le,
    op_ge => Ge,
    op_idiv => IDiv,
    op_and => And,
    op_or => Or,
    op_xor => Xor,
    op_eqv => Eqv,
    op_imp => Imp,
    op_cat => Concat,
}

fn op_neg(vm: &mut Vm) -> Result<(), Flow> {
    let v = vm.pop_value()?;
    push_value(vm, ops::unary(UnOp::Neg, &v)?)
}

fn op_not(vm: &mut Vm) -> Result<(), Flow> {
    let v = vm.pop_value()?;
    push_value(vm, ops::unary(UnOp::Not, &v)?)
}

fn op_like(vm: &mut Vm) -> Result<(), Flow> {
    let pattern = vm.pop_value()?.to_basic_string()?;
    let text = vm.pop_value()?.to_basic_string()?;
    let compare_text = vm.compare_text();
    let matched = vm.ctx.like(&text, &pattern, compare_text)?;
    push_value(vm, Value::Bool(matched))
}

/// `a IS b`: object identity. `Nothing Is Nothing` holds.
fn op_is(vm: &mut Vm) -> Result<(), Flow> {
    let rhs = vm.pop_value()?;
    let lhs = vm.pop_value()?;
    let same = match (&lhs, &rhs) {
        (Value::Object(None), Value::Object(None)) => true,
        (Value::Object(Some(a)), Value::Object(Some(b))) => {
            std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
        }
        (Value::Object(_), Value::Object(_)) => false,
        _ => return Err(BasicError::ObjectRequired.into()),
    };
    push_value(vm, Value::Bool(same))
}

fn op_argc(vm: &mut Vm) -> Result<(), Flow> {
    vm.top_mut()?.begin_args();
    Ok(())
}

fn op_argv(vm: &mut Vm) -> Result<(), Flow> {
    let var = vm.pop_operand()?;
    vm.top_mut()?.add_arg(None, var)?;
    Ok(())
}

fn op_argn(vm: &mut Vm, name_id: u32) -> Result<(), Flow> {
    let name = vm.pool_str(name_id)?;
    let var = vm.pop_operand()?;
    vm.top_mut()?.add_arg(Some(name), var)?;
    Ok(())
}

/// `ARGTYP`: coerce the last argument to a declared type, or detach it for
/// a by-value pass.
fn op_argtyp(vm: &mut Vm, word: u32) -> Result<(), Flow> {
    let ty = decode_type(word & 0xFF)?;
    let arg = vm.top_mut()?.last_arg_mut()?;
    let mismatched = ty.is_fixed() && arg.var.ty() != ty;
    if word & BYVAL_FLAG != 0 || mismatched {
        let value = arg.var.value();
        let value = if ty.is_fixed() { value.convert(ty)? } else { value };
        arg.var = VarRef::temp(value);
    }
    Ok(())
}

fn op_get(vm: &mut Vm) -> Result<(), Flow> {
    let value = vm.pop_value()?;
    push_value(vm, value)
}

fn store(target: &VarRef, mut value: Value) -> Result<(), Flow> {
    let kind = target.kind().clone();
    match kind {
        VarKind::Plain => {
            // Arrays are assigned by value.
            value.make_exclusive();
            target.assign(value)?;
        }
        VarKind::Property { parent, member } => {
            let obj = parent.upgrade().ok_or(BasicError::ObjectNotSet)?;
            obj.set_property(&member, value)?;
        }
        VarKind::Method(_) => {
            let name = target.name().map(|n| n.to_string()).unwrap_or_default();
            return Err(BasicError::ReadOnly(name).into());
        }
    }
    Ok(())
}

/// `var = value`.
fn op_set(vm: &mut Vm) -> Result<(), Flow> {
    let value = vm.pop_value()?;
    let target = vm.top_mut()?.pop()?;
    store(&target, value)
}

/// `SET var = object`.
fn op_setref(vm: &mut Vm) -> Result<(), Flow> {
    let value = vm.pop_value()?;
    if !matches!(value, Value::Object(_)) {
        return Err(BasicError::ObjectRequired.into());
    }
    let target = vm.top_mut()?.pop()?;
    store(&target, value)
}

fn op_empty(vm: &mut Vm) -> Result<(), Flow> {
    vm.top_mut()?.push(VarRef::missing("", None));
    Ok(())
}

pub(super) fn op_leave(vm: &mut Vm) -> Result<(), Flow> {
    vm.flush_statement()?;
    vm.top_mut()?.state = InstanceState::Returned;
    Ok(())
}

fn op_stop(vm: &mut Vm) -> Result<(), Flow> {
    debug!(depth = vm.chain.len(), "stop requested by script");
    vm.control.stop();
    vm.abandon_all();
    Err(Flow::Unwind)
}

/// Pair up `lower, upper` arguments. The array they describe must fit the
/// configured element limit.
fn bounds_of(vm: &Vm, args: &ArgVec) -> Result<Vec<(i32, i32)>, Flow> {
    let values = args.values();
    if values.len() % 2 != 0 {
        return Err(VmError::MalformedCall(format!("{} array bound values", values.len())).into());
    }
    let mut bounds = Vec::with_capacity(values.len() / 2);
    for pair in values.chunks_exact(2) {
        bounds.push((pair[0].to_i32()?, pair[1].to_i32()?));
    }
    if !bounds.is_empty() && element_count(&bounds)? > vm.config.max_array_elements {
        return Err(BasicError::OutOfMemory.into());
    }
    Ok(bounds)
}

fn elem_type(var: &VarRef) -> VarType {
    match var.ty() {
        VarType::Empty => VarType::Variant,
        ty => ty,
    }
}

/// `DIM var(bounds)`. With no bounds the array is declared but unallocated.
fn op_dim(vm: &mut Vm) -> Result<(), Flow> {
    let args = vm.top_mut()?.end_args()?;
    let bounds = bounds_of(vm, &args)?;
    let var = vm.top_mut()?.pop()?;
    let elem = elem_type(&var);
    let array = if bounds.is_empty() {
        ArrayValue::unallocated(elem)
    } else {
        ArrayValue::new(bounds, elem, true)?
    };
    var.set_type(VarType::Variant);
    var.put(Value::Array(array.into_ref()));
    Ok(())
}

fn redim(vm: &mut Vm, preserve: bool) -> Result<(), Flow> {
    let args = vm.top_mut()?.end_args()?;
    let bounds = bounds_of(vm, &args)?;
    if bounds.is_empty() {
        return Err(VmError::MalformedCall("REDIM without bounds".into()).into());
    }
    let var = vm.top_mut()?.pop()?;
    let existing = var.with_value(|v| v.as_array().cloned());
    match existing {
        Some(array) => array.borrow_mut().redim(bounds, preserve)?,
        None => {
            let array = ArrayValue::new(bounds, elem_type(&var), false)?;
            var.set_type(VarType::Variant);
            var.put(Value::Array(array.into_ref()));
        }
    }
    Ok(())
}

fn op_redim(vm: &mut Vm) -> Result<(), Flow> {
    redim(vm, false)
}

fn op_redim_preserve(vm: &mut Vm) -> Result<(), Flow> {
    redim(vm, true)
}

fn op_erase(vm: &mut Vm) -> Result<(), Flow> {
    let var = vm.top_mut()?.pop()?;
    let array = var
        .with_value(|v| v.as_array().cloned())
        .ok_or(BasicError::TypeMismatch)?;
    array.borrow_mut().erase();
    Ok(())
}

fn op_number(vm: &mut Vm, id: u32) -> Result<(), Flow> {
    let value = vm
        .image
        .literal(id)
        .and_then(|entry| entry.value())
        .ok_or(VmError::BadPoolRef(id))?;
    push_value(vm, value)
}

fn op_string(vm: &mut Vm, id: u32) -> Result<(), Flow> {
    let text = vm.pool_str(id)?;
    push_value(vm, Value::String(text))
}

/// Inline integer constant: Integer when it fits, Long otherwise.
fn op_const(vm: &mut Vm, word: u32) -> Result<(), Flow> {
    let n = word as i32;
    let value = match i16::try_from(n) {
        Ok(small) => Value::Integer(small),
        Err(_) => Value::Long(n),
    };
    push_value(vm, value)
}

fn op_jump(vm: &mut Vm, target: u32) -> Result<(), Flow> {
    vm.jump(target)
}

fn op_jumpt(vm: &mut Vm, target: u32) -> Result<(), Flow> {
    if vm.pop_value()?.to_bool()? {
        vm.jump(target)?;
    }
    Ok(())
}

fn op_jumpf(vm: &mut Vm, target: u32) -> Result<(), Flow> {
    if !vm.pop_value()?.to_bool()? {
        vm.jump(target)?;
    }
    Ok(())
}

/// `CALL declare, _`: invoke a `DECLARE`d external procedure with the
/// argument vector just built. The second operand is unused.
fn op_call(vm: &mut Vm, index: u32, _: u32) -> Result<(), Flow> {
    let mut args = vm.top_mut()?.end_args()?;
    let image = Rc::clone(&vm.image);
    let decl = image
        .declares
        .get(index as usize)
        .ok_or(VmError::BadOperand(index))?;
    let bridge = vm
        .foreign
        .as_mut()
        .ok_or_else(|| BasicError::NotSupported(decl.symbol().to_string()))?;
    debug!(function = decl.symbol(), library = %decl.library, args = args.count(), "foreign call");
    let code = bridge.call(decl.symbol(), &decl.library, &mut args, decl.ret, decl.convention);
    if code != 0 {
        return Err(BasicError::from_code(code).into());
    }
    let result = args.ret().value().convert(decl.ret)?;
    push_value(vm, result)
}

/// `STMNT line, cols`: statement boundary. Leftover values of the previous
/// statement are discarded here.
fn op_stmnt(vm: &mut Vm, line: u32, cols: u32) -> Result<(), Flow> {
    vm.flush_statement()?;
    let start_col = (cols & 0xFFFF) as u16;
    let end_col = (cols >> 16) as u16;
    let inst = vm.top_mut()?;
    inst.stmt_pc = inst.op_pc;
    inst.line = line;
    inst.col = u32::from(start_col);
    trace!(procedure = %inst.name, line, "statement");
    vm.debug_statement(line, start_col, end_col);
    Ok(())
}
