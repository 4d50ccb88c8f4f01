//! Variables: reference-counted slots holding a [`Value`] plus the metadata
//! the interpreter needs to bind, assign and call through them.

use crate::error::BasicError;
use crate::object::{HostObject, NativeFunction, ObjectRef};
use crate::value::{Value, VarType};
use std::cell::{Ref, RefCell};
use std::fmt;
use std::ops::BitOr;
use std::rc::{Rc, Weak};

/// Attribute bits carried by a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VarFlags(u8);

impl VarFlags {
    pub const NONE: VarFlags = VarFlags(0);
    /// `CONST` or otherwise not assignable.
    pub const READ_ONLY: VarFlags = VarFlags(1);
    /// Placeholder for an omitted optional parameter.
    pub const MISSING: VarFlags = VarFlags(1 << 2);
    /// Assignments convert to the declared type.
    pub const FIXED: VarFlags = VarFlags(1 << 3);

    pub fn contains(self, other: VarFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: VarFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: VarFlags) {
        self.0 &= !other.0;
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for VarFlags {
    type Output = VarFlags;

    fn bitor(self, rhs: VarFlags) -> VarFlags {
        VarFlags(self.0 | rhs.0)
    }
}

/// Target of a bound call.
#[derive(Clone)]
pub enum Callee {
    /// Procedure in the loaded image, by index into its procedure table.
    Procedure(u32),
    /// Runtime function provided by the host.
    Native(Rc<dyn NativeFunction>),
    /// Method on a host object.
    HostMethod { object: ObjectRef, name: Rc<str> },
}

impl fmt::Debug for Callee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callee::Procedure(idx) => write!(f, "Procedure({idx})"),
            Callee::Native(func) => write!(f, "Native({})", func.name()),
            Callee::HostMethod { object, name } => {
                write!(f, "HostMethod({}.{name})", object.class_name())
            }
        }
    }
}

/// What reading or writing the variable does.
#[derive(Clone, Default)]
pub enum VarKind {
    /// Holds its value directly.
    #[default]
    Plain,
    /// Reading invokes the callee with the pending argument list.
    Method(Callee),
    /// Reading and writing go through a host object's property. The parent is
    /// held weakly; it is only used to find the object again.
    Property {
        parent: Weak<dyn HostObject>,
        member: Rc<str>,
    },
}

impl fmt::Debug for VarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarKind::Plain => write!(f, "Plain"),
            VarKind::Method(callee) => write!(f, "Method({callee:?})"),
            VarKind::Property { member, .. } => write!(f, "Property({member})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Variable {
    name: Option<Rc<str>>,
    value: Value,
    ty: VarType,
    flags: VarFlags,
    kind: VarKind,
    params: Option<ArgVec>,
}

/// Shared handle to a [`Variable`].
#[derive(Debug, Clone)]
pub struct VarRef(Rc<RefCell<Variable>>);

impl VarRef {
    fn from_variable(var: Variable) -> Self {
        VarRef(Rc::new(RefCell::new(var)))
    }

    /// A declared variable initialised to its type's default.
    pub fn declared(name: impl Into<Rc<str>>, ty: VarType) -> Self {
        let mut flags = VarFlags::NONE;
        if ty.is_fixed() {
            flags.insert(VarFlags::FIXED);
        }
        Self::from_variable(Variable {
            name: Some(name.into()),
            value: ty.default_value(),
            ty,
            flags,
            kind: VarKind::Plain,
            params: None,
        })
    }

    /// An anonymous expression temporary.
    pub fn temp(value: Value) -> Self {
        Self::from_variable(Variable {
            name: None,
            value,
            ty: VarType::Variant,
            flags: VarFlags::NONE,
            kind: VarKind::Plain,
            params: None,
        })
    }

    /// A named, read-only constant.
    pub fn constant(name: impl Into<Rc<str>>, value: Value) -> Self {
        let var = Self::temp(value);
        {
            let mut inner = var.0.borrow_mut();
            inner.name = Some(name.into());
            inner.flags = VarFlags::READ_ONLY;
        }
        var
    }

    pub(crate) fn element(ty: VarType) -> Self {
        let mut flags = VarFlags::NONE;
        if ty.is_fixed() {
            flags.insert(VarFlags::FIXED);
        }
        Self::from_variable(Variable {
            name: None,
            value: ty.default_value(),
            ty,
            flags,
            kind: VarKind::Plain,
            params: None,
        })
    }

    /// A bound call. Its value is produced when the interpreter evaluates it.
    pub fn method(name: impl Into<Rc<str>>, callee: Callee, ret: VarType) -> Self {
        Self::from_variable(Variable {
            name: Some(name.into()),
            value: Value::Empty,
            ty: ret,
            flags: VarFlags::NONE,
            kind: VarKind::Method(callee),
            params: None,
        })
    }

    pub fn property(parent: &ObjectRef, member: impl Into<Rc<str>>) -> Self {
        let member = member.into();
        Self::from_variable(Variable {
            name: Some(member.clone()),
            value: Value::Empty,
            ty: VarType::Variant,
            flags: VarFlags::NONE,
            kind: VarKind::Property {
                parent: Rc::downgrade(parent),
                member,
            },
            params: None,
        })
    }

    /// Placeholder bound to an omitted optional parameter.
    pub fn missing(name: impl Into<Rc<str>>, default: Option<Value>) -> Self {
        let var = Self::temp(default.unwrap_or_default());
        {
            let mut inner = var.0.borrow_mut();
            inner.name = Some(name.into());
            inner.flags = VarFlags::MISSING;
        }
        var
    }

    pub fn name(&self) -> Option<Rc<str>> {
        self.0.borrow().name.clone()
    }

    /// Stored value. For a method this is the result of its last call.
    pub fn value(&self) -> Value {
        self.0.borrow().value.clone()
    }

    pub fn with_value<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        f(&self.0.borrow().value)
    }

    pub fn ty(&self) -> VarType {
        self.0.borrow().ty
    }

    pub fn flags(&self) -> VarFlags {
        self.0.borrow().flags
    }

    pub fn has_flag(&self, flag: VarFlags) -> bool {
        self.0.borrow().flags.contains(flag)
    }

    pub fn set_flag(&self, flag: VarFlags) {
        self.0.borrow_mut().flags.insert(flag);
    }

    pub fn clear_flag(&self, flag: VarFlags) {
        self.0.borrow_mut().flags.remove(flag);
    }

    /// Change the declared type, keeping the current value.
    pub fn set_type(&self, ty: VarType) {
        let mut inner = self.0.borrow_mut();
        inner.ty = ty;
        if ty.is_fixed() {
            inner.flags.insert(VarFlags::FIXED);
        } else {
            inner.flags.remove(VarFlags::FIXED);
        }
    }

    pub fn kind(&self) -> Ref<'_, VarKind> {
        Ref::map(self.0.borrow(), |v| &v.kind)
    }

    pub fn is_method(&self) -> bool {
        matches!(self.0.borrow().kind, VarKind::Method(_))
    }

    pub fn is_property(&self) -> bool {
        matches!(self.0.borrow().kind, VarKind::Property { .. })
    }

    /// Store a value, honouring read-only and fixed-type attributes.
    pub fn assign(&self, value: Value) -> Result<(), BasicError> {
        let mut inner = self.0.borrow_mut();
        if inner.flags.contains(VarFlags::READ_ONLY) {
            let name = inner.name.as_deref().unwrap_or("<temp>").to_string();
            return Err(BasicError::ReadOnly(name));
        }
        let value = if inner.flags.contains(VarFlags::FIXED) {
            value.convert(inner.ty)?
        } else {
            value
        };
        inner.value = value;
        inner.flags.remove(VarFlags::MISSING);
        Ok(())
    }

    /// Store without attribute checks: method results and return slots.
    pub fn put(&self, value: Value) {
        self.0.borrow_mut().value = value;
    }

    pub fn reset(&self) {
        let mut inner = self.0.borrow_mut();
        inner.value = inner.ty.default_value();
    }

    pub fn set_params(&self, params: Option<ArgVec>) {
        self.0.borrow_mut().params = params;
    }

    pub fn take_params(&self) -> Option<ArgVec> {
        self.0.borrow_mut().params.take()
    }

    pub fn has_params(&self) -> bool {
        self.0.borrow().params.is_some()
    }

    pub fn ptr_eq(a: &VarRef, b: &VarRef) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    pub fn strong_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// An independent variable with the same contents.
    pub fn detached(&self) -> VarRef {
        Self::from_variable(self.0.borrow().clone())
    }

    /// Ensure this handle is the only owner before mutating in place. An
    /// array held by the variable is made exclusive as well.
    pub fn make_exclusive(&mut self) {
        if Rc::strong_count(&self.0) > 1 {
            *self = self.detached();
        }
        self.0.borrow_mut().value.make_exclusive();
    }
}

/// One argument-list entry.
#[derive(Debug, Clone)]
pub struct Arg {
    pub name: Option<Rc<str>>,
    pub var: VarRef,
}

/// Argument vector of a call. Slot 0 is reserved for the return value;
/// arguments proper start at index 1.
#[derive(Debug, Clone)]
pub struct ArgVec {
    slots: Vec<Arg>,
}

impl Default for ArgVec {
    fn default() -> Self {
        Self::new()
    }
}

impl ArgVec {
    pub fn new() -> Self {
        Self {
            slots: vec![Arg {
                name: None,
                var: VarRef::temp(Value::Empty),
            }],
        }
    }

    pub fn push(&mut self, var: VarRef) {
        self.slots.push(Arg { name: None, var });
    }

    pub fn push_named(&mut self, name: impl Into<Rc<str>>, var: VarRef) {
        self.slots.push(Arg {
            name: Some(name.into()),
            var,
        });
    }

    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        let mut argv = Self::new();
        for v in values {
            argv.push(VarRef::temp(v));
        }
        argv
    }

    /// Number of arguments, not counting the return slot.
    pub fn count(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Argument `i`, 1-based.
    pub fn get(&self, i: usize) -> Option<&Arg> {
        if i == 0 {
            return None;
        }
        self.slots.get(i)
    }

    pub fn last_mut(&mut self) -> Option<&mut Arg> {
        if self.slots.len() > 1 {
            self.slots.last_mut()
        } else {
            None
        }
    }

    pub fn args(&self) -> &[Arg] {
        &self.slots[1..]
    }

    pub fn ret(&self) -> &VarRef {
        &self.slots[0].var
    }

    pub fn set_ret(&mut self, var: VarRef) {
        self.slots[0].var = var;
    }

    pub fn has_named(&self) -> bool {
        self.args().iter().any(|a| a.name.is_some())
    }

    pub fn values(&self) -> Vec<Value> {
        self.args().iter().map(|a| a.var.value()).collect()
    }

    /// The arguments by value, leaving the return slot behind.
    pub fn into_args(self) -> Vec<Arg> {
        self.slots.into_iter().skip(1).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_type_converts_on_assign() {
        let v = VarRef::declared("n", VarType::Integer);
        v.assign(Value::Double(2.5)).unwrap();
        assert_eq!(v.value(), Value::Integer(2));
        assert_eq!(v.assign(Value::string("x")), Err(BasicError::TypeMismatch));
    }

    #[test]
    fn constants_reject_assignment() {
        let c = VarRef::constant("PI", Value::Double(2.5));
        assert!(matches!(c.assign(Value::Empty), Err(BasicError::ReadOnly(n)) if n == "PI"));
    }

    #[test]
    fn make_exclusive_copies_shared_variable() {
        let a = VarRef::temp(Value::Long(1));
        let mut b = a.clone();
        b.make_exclusive();
        assert!(!VarRef::ptr_eq(&a, &b));
        b.put(Value::Long(2));
        assert_eq!(a.value(), Value::Long(1));

        let mut solo = VarRef::temp(Value::Long(5));
        let before = solo.clone();
        drop(before);
        let raw = Rc::as_ptr(&solo.0);
        solo.make_exclusive();
        assert_eq!(raw, Rc::as_ptr(&solo.0));
    }

    #[test]
    fn argvec_reserves_return_slot() {
        let mut argv = ArgVec::new();
        assert_eq!(argv.count(), 0);
        argv.push(VarRef::temp(Value::Long(1)));
        argv.push_named("b", VarRef::temp(Value::Long(2)));
        assert_eq!(argv.count(), 2);
        assert!(argv.has_named());
        assert!(argv.get(0).is_none());
        assert_eq!(argv.get(2).and_then(|a| a.name.clone()).as_deref(), Some("b"));
    }

    #[test]
    fn missing_placeholder_cleared_by_assignment() {
        let m = VarRef::missing("c", Some(Value::Long(9)));
        assert!(m.has_flag(VarFlags::MISSING));
        assert_eq!(m.value(), Value::Long(9));
        m.assign(Value::Long(1)).unwrap();
        assert!(!m.has_flag(VarFlags::MISSING));
    }
}
