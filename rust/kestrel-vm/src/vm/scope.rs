//! Name resolution and call-argument binding.
//!
//! `FIND` searches, in order: the procedure's static table (when the
//! reference is flagged static), its locals, its own name (the function
//! return slot), its parameters, module publics and procedures, and finally
//! the host's extended search followed by the builtin runtime functions.

use super::{Flow, Vm, VmError};
use crate::config::DefaultMemberPolicy;
use crate::host::HostSymbol;
use kestrel_core::image::opcode::{ARGS_FLAG, STATIC_FLAG};
use kestrel_core::image::{Image, ParamDecl, Procedure};
use kestrel_core::{
    ArgVec, BasicError, Callee, MemberKind, ObjectRef, Value, VarFlags, VarRef, VarType,
};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

/// Case-insensitive name table.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    vars: HashMap<String, VarRef>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<VarRef> {
        self.vars.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Insert unless the name is taken; returns the variable now bound.
    pub fn declare(&mut self, name: &str, ty: VarType) -> VarRef {
        self.vars
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| VarRef::declared(name, ty))
            .clone()
    }

    pub fn insert(&mut self, name: &str, var: VarRef) {
        self.vars.insert(name.to_ascii_lowercase(), var);
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// What a name resolved to before it is materialized as a variable.
enum Found {
    Var(VarRef),
    Call(Callee, VarType),
}

pub(crate) fn decode_type(word: u32) -> Result<VarType, VmError> {
    VarType::from_repr((word & 0xFF) as u8).ok_or(VmError::BadOperand(word))
}

impl Vm {
    pub(crate) fn pool_str(&self, id: u32) -> Result<Rc<str>, VmError> {
        self.image
            .string(id)
            .map(Rc::from)
            .ok_or(VmError::BadPoolRef(id))
    }

    /// Name operand plus the argument vector it consumes, if flagged.
    fn name_and_args(&mut self, word: u32) -> Result<(Rc<str>, Option<ArgVec>), Flow> {
        let name = self.pool_str(word & !ARGS_FLAG)?;
        let args = if word & ARGS_FLAG != 0 {
            Some(self.top_mut()?.end_args()?)
        } else {
            None
        };
        Ok((name, args))
    }

    fn lookup_script(&self, name: &str, is_static: bool, has_args: bool) -> Option<Found> {
        let inst = self.top().ok()?;
        if is_static {
            if let Some(var) = self.statics.get(&inst.proc_idx).and_then(|t| t.get(name)) {
                return Some(Found::Var(var));
            }
        }
        if let Some(var) = inst.locals.get(name) {
            return Some(Found::Var(var));
        }
        let proc = self.image.procedures.get(inst.proc_idx as usize)?;
        if !has_args && proc.is_function && proc.name.eq_ignore_ascii_case(name) {
            return Some(Found::Var(inst.params.ret().clone()));
        }
        if let Some(arg) = inst.params.args().iter().find(|a| {
            a.name
                .as_deref()
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
        }) {
            return Some(Found::Var(arg.var.clone()));
        }
        if let Some(var) = self.module.get(name) {
            return Some(Found::Var(var));
        }
        self.image
            .find_procedure(name)
            .map(|(idx, p)| Found::Call(Callee::Procedure(idx), p.ret))
    }

    fn lookup_extended(&self, name: &str) -> Option<Found> {
        if let Some(sym) = self.extended.as_ref().and_then(|x| x.lookup(name)) {
            return Some(match sym {
                HostSymbol::Constant(v) => Found::Var(VarRef::constant(name, v)),
                HostSymbol::Variable(var) => Found::Var(var),
                HostSymbol::Function(f) => Found::Call(Callee::Native(f), VarType::Variant),
                HostSymbol::Object(obj) => {
                    Found::Var(VarRef::constant(name, Value::Object(Some(obj))))
                }
            });
        }
        self.builtins
            .get(name)
            .map(|f| Found::Call(Callee::Native(f), VarType::Variant))
    }

    fn materialize(&mut self, name: &str, found: Found, args: Option<ArgVec>) -> Result<VarRef, Flow> {
        match found {
            Found::Call(callee, ret) => {
                let var = VarRef::method(name, callee, ret);
                var.set_params(args);
                Ok(var)
            }
            Found::Var(var) => match args {
                Some(args) => self.index_into(&var, args),
                None => Ok(var),
            },
        }
    }

    /// `FIND`: unqualified lookup through every scope.
    pub(crate) fn op_find(&mut self, name_word: u32, type_word: u32) -> Result<(), Flow> {
        let (name, args) = self.name_and_args(name_word)?;
        let ty = decode_type(type_word)?;
        let is_static = type_word & STATIC_FLAG != 0;
        let found = match self.lookup_script(&name, is_static, args.is_some()) {
            Some(found) => Some(found),
            None => self.lookup_extended(&name),
        };
        let var = match found {
            Some(found) => self.materialize(&name, found, args)?,
            None if args.is_some() => {
                return Err(BasicError::UndefinedProcedure(name.to_string()).into())
            }
            None if self.image.explicit => {
                return Err(VmError::UndeclaredVariable(name.to_string()).into())
            }
            None => {
                debug!(name = %name, ty = %ty, "implicit local");
                self.top_mut()?.locals.declare(&name, ty)
            }
        };
        self.top_mut()?.push(var);
        Ok(())
    }

    /// `RTL`: runtime library lookup, skipping script scopes.
    pub(crate) fn op_rtl(&mut self, name_word: u32, _type_word: u32) -> Result<(), Flow> {
        let (name, args) = self.name_and_args(name_word)?;
        let found = self
            .lookup_extended(&name)
            .ok_or_else(|| BasicError::UndefinedProcedure(name.to_string()))?;
        let var = self.materialize(&name, found, args)?;
        self.top_mut()?.push(var);
        Ok(())
    }

    /// `ELEM`: member of the object on top of the stack.
    pub(crate) fn op_elem(&mut self, name_word: u32, _type_word: u32) -> Result<(), Flow> {
        let (name, args) = self.name_and_args(name_word)?;
        let target = self.pop_value()?;
        let obj = object_of(&target)?;
        // Keep the parent alive while member variables refer to it weakly.
        self.top_mut()?.retained.push(obj.clone());
        let var = member_var(&obj, &name, args)?;
        self.top_mut()?.push(var);
        Ok(())
    }

    /// `PARAM`: push a bound parameter by 1-based position.
    pub(crate) fn op_param(&mut self, index: u32, _type_word: u32) -> Result<(), Flow> {
        let inst = self.top_mut()?;
        let var = inst
            .params
            .get(index as usize)
            .map(|a| a.var.clone())
            .ok_or_else(|| VmError::MalformedCall(format!("no parameter {index}")))?;
        inst.push(var);
        Ok(())
    }

    pub(crate) fn op_local(&mut self, name_id: u32, type_word: u32) -> Result<(), Flow> {
        let name = self.pool_str(name_id)?;
        let ty = decode_type(type_word)?;
        self.top_mut()?.locals.declare(&name, ty);
        Ok(())
    }

    pub(crate) fn op_static(&mut self, name_id: u32, type_word: u32) -> Result<(), Flow> {
        let name = self.pool_str(name_id)?;
        let ty = decode_type(type_word)?;
        let proc_idx = self.top()?.proc_idx;
        self.statics.entry(proc_idx).or_default().declare(&name, ty);
        Ok(())
    }

    pub(crate) fn op_public(&mut self, name_id: u32, type_word: u32) -> Result<(), Flow> {
        let name = self.pool_str(name_id)?;
        let ty = decode_type(type_word)?;
        self.module.declare(&name, ty);
        Ok(())
    }

    /// `var(args)`: array element or indexed access on an object.
    fn index_into(&mut self, var: &VarRef, args: ArgVec) -> Result<VarRef, Flow> {
        match var.value() {
            Value::Array(arr) => {
                let index = args
                    .values()
                    .iter()
                    .map(Value::to_i32)
                    .collect::<Result<Vec<_>, _>>()?;
                let el = arr.borrow().element(&index)?;
                Ok(el)
            }
            Value::Object(Some(obj)) => {
                self.top_mut()?.retained.push(obj.clone());
                self.default_access(&obj, args)
            }
            Value::Object(None) => Err(BasicError::ObjectNotSet.into()),
            _ => Err(BasicError::TypeMismatch.into()),
        }
    }

    fn default_access(&mut self, obj: &ObjectRef, args: ArgVec) -> Result<VarRef, Flow> {
        let member = obj.default_member().map(str::to_string);
        let indexed = obj.indexed_count().is_some() && args.count() == 1;
        let policy = self.config.default_member_policy;
        if member.is_some() && indexed {
            debug!(class = obj.class_name(), ?policy, "ambiguous indexed access");
        }
        let positional = match policy {
            DefaultMemberPolicy::Indexed => indexed,
            DefaultMemberPolicy::DefaultMember => indexed && member.is_none(),
        };
        if positional {
            let pos = args.values()[0].to_i64()?;
            let pos = usize::try_from(pos).map_err(|_| BasicError::SubscriptOutOfRange)?;
            return Ok(VarRef::temp(obj.indexed_item(pos)?));
        }
        match member {
            Some(m) => member_var(obj, &m, Some(args)),
            None => Err(BasicError::NotSupported(obj.class_name().to_string()).into()),
        }
    }
}

fn object_of(value: &Value) -> Result<ObjectRef, BasicError> {
    match value {
        Value::Object(Some(obj)) => Ok(obj.clone()),
        Value::Object(None) => Err(BasicError::ObjectNotSet),
        _ => Err(BasicError::ObjectRequired),
    }
}

fn member_var(obj: &ObjectRef, name: &str, args: Option<ArgVec>) -> Result<VarRef, Flow> {
    let var = match obj.member(name) {
        Some(MemberKind::Property) => VarRef::property(obj, name),
        Some(MemberKind::Method) => VarRef::method(
            name,
            Callee::HostMethod {
                object: obj.clone(),
                name: Rc::from(name),
            },
            VarType::Variant,
        ),
        None => return Err(BasicError::MemberNotFound(name.to_string()).into()),
    };
    var.set_params(args);
    Ok(var)
}

/// Bind a call's arguments against a procedure's parameter list.
///
/// Named arguments are reordered to their declared positions. Omitted
/// optional parameters get a missing placeholder carrying the declared
/// default. By-reference parameters share the caller's variable when it has
/// a compatible type; everything else is copied into a fresh variable of the
/// declared type.
pub(crate) fn bind_arguments(image: &Image, proc: &Procedure, args: ArgVec) -> Result<ArgVec, BasicError> {
    let mut slots: Vec<Option<VarRef>> = vec![None; proc.params.len()];
    let mut seen_named = false;
    for (pos, arg) in args.into_args().into_iter().enumerate() {
        let idx = match &arg.name {
            None if seen_named => return Err(BasicError::InvalidProcedureCall),
            None => pos,
            Some(name) => {
                seen_named = true;
                proc.params
                    .iter()
                    .position(|p| p.name.eq_ignore_ascii_case(name))
                    .ok_or_else(|| BasicError::NamedArgumentNotFound(name.to_string()))?
            }
        };
        let slot = slots.get_mut(idx).ok_or(BasicError::WrongArgumentCount)?;
        if slot.is_some() {
            return Err(BasicError::InvalidProcedureCall);
        }
        *slot = Some(arg.var);
    }

    let mut bound = ArgVec::new();
    for (decl, slot) in proc.params.iter().zip(slots) {
        let var = match slot.filter(|v| !v.has_flag(VarFlags::MISSING)) {
            Some(var) => pass(decl, var)?,
            None if decl.optional => VarRef::missing(decl.name.as_str(), default_of(image, decl)?),
            None => return Err(BasicError::ArgumentNotOptional),
        };
        bound.push_named(decl.name.as_str(), var);
    }
    Ok(bound)
}

fn pass(decl: &ParamDecl, var: VarRef) -> Result<VarRef, BasicError> {
    let shareable = var.strong_count() > 1
        && !var.is_method()
        && !var.is_property()
        && (decl.ty == VarType::Variant || var.ty() == decl.ty);
    if !decl.by_val && shareable {
        return Ok(var);
    }
    let mut value = var.value();
    value.make_exclusive();
    let copy = VarRef::declared(decl.name.as_str(), decl.ty);
    copy.assign(value)?;
    Ok(copy)
}

fn default_of(image: &Image, decl: &ParamDecl) -> Result<Option<Value>, BasicError> {
    let Some(id) = decl.default else {
        return Ok(None);
    };
    let value = image
        .literal(id)
        .and_then(|entry| entry.value())
        .ok_or(BasicError::InvalidProcedureCall)?;
    value.convert(decl.ty).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::image::ImageBuilder;

    fn proc_with(b: &mut ImageBuilder) -> Procedure {
        let dflt = b.literal("7", None);
        Procedure {
            name: "f".into(),
            entry: 0,
            params: vec![
                ParamDecl::new("a", VarType::Variant),
                ParamDecl::new("b", VarType::Integer),
                ParamDecl::new("c", VarType::Variant).with_default(dflt),
                ParamDecl::new("d", VarType::Variant).optional(),
            ],
            ret: VarType::Variant,
            is_function: true,
        }
    }

    fn named(pairs: &[(&str, Value)]) -> ArgVec {
        let mut argv = ArgVec::new();
        for (n, v) in pairs {
            argv.push_named(*n, VarRef::temp(v.clone()));
        }
        argv
    }

    #[test]
    fn named_arguments_reorder_and_fill_defaults() {
        let mut b = ImageBuilder::new("t");
        let proc = proc_with(&mut b);
        let image = b.finish().unwrap();
        let args = named(&[("B", Value::Long(2)), ("a", Value::Long(1))]);
        let bound = bind_arguments(&image, &proc, args).unwrap();
        assert_eq!(bound.values()[..3], [Value::Long(1), Value::Integer(2), Value::Integer(7)]);
        let c = &bound.get(3).unwrap().var;
        let d = &bound.get(4).unwrap().var;
        assert!(c.has_flag(VarFlags::MISSING));
        assert!(d.has_flag(VarFlags::MISSING));
        assert_eq!(d.value(), Value::Empty);
    }

    #[test]
    fn binding_faults() {
        let mut b = ImageBuilder::new("t");
        let proc = proc_with(&mut b);
        let image = b.finish().unwrap();
        let unknown = named(&[("a", Value::Empty), ("b", Value::Empty), ("zz", Value::Empty)]);
        assert_eq!(
            bind_arguments(&image, &proc, unknown).unwrap_err(),
            BasicError::NamedArgumentNotFound("zz".into())
        );
        let missing = named(&[("a", Value::Empty)]);
        assert_eq!(
            bind_arguments(&image, &proc, missing).unwrap_err(),
            BasicError::ArgumentNotOptional
        );
        let surplus = ArgVec::from_values((0..5).map(Value::Long));
        assert_eq!(
            bind_arguments(&image, &proc, surplus).unwrap_err(),
            BasicError::WrongArgumentCount
        );
    }

    #[test]
    fn by_ref_shares_named_variables_only() {
        let mut b = ImageBuilder::new("t");
        let proc = proc_with(&mut b);
        let image = b.finish().unwrap();
        let caller_var = VarRef::declared("x", VarType::Variant);
        let caller_int = VarRef::declared("n", VarType::Integer);
        let mut args = ArgVec::new();
        args.push(caller_var.clone());
        args.push(caller_int.clone());
        let bound = bind_arguments(&image, &proc, args).unwrap();
        assert!(VarRef::ptr_eq(&bound.get(1).unwrap().var, &caller_var));
        assert!(VarRef::ptr_eq(&bound.get(2).unwrap().var, &caller_int));

        let mut args = ArgVec::new();
        args.push(caller_var.clone());
        args.push(VarRef::temp(Value::Double(3.7)));
        let bound = bind_arguments(&image, &proc, args).unwrap();
        assert_eq!(bound.get(2).unwrap().var.value(), Value::Integer(4));
    }

    #[test]
    fn symbol_table_ignores_case() {
        let mut t = SymbolTable::new();
        let a = t.declare("Total", VarType::Long);
        let again = t.declare("TOTAL", VarType::String);
        assert!(VarRef::ptr_eq(&a, &again));
        assert_eq!(again.ty(), VarType::Long);
        assert_eq!(t.len(), 1);
    }
}
