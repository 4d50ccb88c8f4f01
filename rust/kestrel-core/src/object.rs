//! Host object model seen from the engine: the narrow traits external
//! objects implement, plus the script-level `Collection`.

use crate::error::{BasicError, ErrorInfo};
use crate::value::Value;
use crate::variable::VarRef;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

pub type ObjectRef = Rc<dyn HostObject>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Property,
    Method,
}

/// An object living outside the engine.
///
/// Only `class_name` is required; every capability defaults to "not
/// supported" so hosts implement just the parts they expose.
pub trait HostObject: fmt::Debug {
    fn class_name(&self) -> &str;

    fn member(&self, _name: &str) -> Option<MemberKind> {
        None
    }

    fn get_property(&self, name: &str, _args: &[Value]) -> Result<Value, BasicError> {
        Err(BasicError::MemberNotFound(name.to_string()))
    }

    fn set_property(&self, name: &str, _value: Value) -> Result<(), BasicError> {
        Err(BasicError::NotSupported(name.to_string()))
    }

    fn call_method(&self, name: &str, _args: &[VarRef]) -> Result<Value, BasicError> {
        Err(BasicError::NotSupported(name.to_string()))
    }

    /// Member used when the object itself is indexed or read as a value.
    fn default_member(&self) -> Option<&str> {
        None
    }

    fn as_collection(&self) -> Option<&Collection> {
        None
    }

    /// Forward-only enumeration for `FOR EACH`.
    fn enumerate(&self) -> Option<Box<dyn HostEnumerator>> {
        None
    }

    /// Item count when the object supports positional `FOR EACH` access.
    fn indexed_count(&self) -> Option<usize> {
        None
    }

    /// Item at a 0-based position.
    fn indexed_item(&self, _index: usize) -> Result<Value, BasicError> {
        Err(BasicError::SubscriptOutOfRange)
    }
}

pub trait HostEnumerator {
    fn next_item(&mut self) -> Result<Option<Value>, BasicError>;
}

/// What a native function may ask of the running engine.
pub trait NativeContext {
    /// Most recent unresolved fault.
    fn error_info(&self) -> Option<&ErrorInfo>;
}

/// A runtime library function reachable by name.
pub trait NativeFunction {
    fn name(&self) -> &str;
    fn call(&self, ctx: &mut dyn NativeContext, args: &[VarRef]) -> Result<Value, BasicError>;
}

/// Ordered, optionally keyed item list. Positions are 1-based and keys
/// compare case-insensitively.
#[derive(Debug, Default)]
pub struct Collection {
    items: RefCell<Vec<(Option<String>, Value)>>,
    generation: Cell<u64>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_object(self) -> ObjectRef {
        Rc::new(self)
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    /// Bumped on every structural change.
    pub fn generation(&self) -> u64 {
        self.generation.get()
    }

    fn touch(&self) {
        self.generation.set(self.generation.get().wrapping_add(1));
    }

    pub fn add(&self, value: Value, key: Option<&str>) -> Result<(), BasicError> {
        if let Some(k) = key {
            if self.position(k).is_some() {
                return Err(BasicError::InvalidProcedureCall);
            }
        }
        self.items
            .borrow_mut()
            .push((key.map(str::to_string), value));
        self.touch();
        Ok(())
    }

    /// Item at a 0-based position.
    pub fn get(&self, pos: usize) -> Option<Value> {
        self.items.borrow().get(pos).map(|(_, v)| v.clone())
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.items
            .borrow()
            .iter()
            .position(|(k, _)| k.as_deref().is_some_and(|k| k.eq_ignore_ascii_case(key)))
    }

    fn resolve(&self, index: &Value) -> Result<usize, BasicError> {
        match index {
            Value::String(key) => self.position(key).ok_or(BasicError::InvalidProcedureCall),
            other => {
                let n = other.to_i64()?;
                if n < 1 || n as usize > self.len() {
                    return Err(BasicError::SubscriptOutOfRange);
                }
                Ok(n as usize - 1)
            }
        }
    }

    pub fn item(&self, index: &Value) -> Result<Value, BasicError> {
        let pos = self.resolve(index)?;
        self.get(pos).ok_or(BasicError::SubscriptOutOfRange)
    }

    pub fn remove(&self, index: &Value) -> Result<(), BasicError> {
        let pos = self.resolve(index)?;
        self.items.borrow_mut().remove(pos);
        self.touch();
        Ok(())
    }
}

impl HostObject for Collection {
    fn class_name(&self) -> &str {
        "Collection"
    }

    fn member(&self, name: &str) -> Option<MemberKind> {
        match name.to_ascii_lowercase().as_str() {
            "count" => Some(MemberKind::Property),
            "add" | "item" | "remove" => Some(MemberKind::Method),
            _ => None,
        }
    }

    fn get_property(&self, name: &str, _args: &[Value]) -> Result<Value, BasicError> {
        if name.eq_ignore_ascii_case("count") {
            Ok(Value::Long(self.len() as i32))
        } else {
            Err(BasicError::MemberNotFound(name.to_string()))
        }
    }

    fn call_method(&self, name: &str, args: &[VarRef]) -> Result<Value, BasicError> {
        let arg = |i: usize| args.get(i).map(VarRef::value);
        match name.to_ascii_lowercase().as_str() {
            "add" => {
                let value = arg(0).ok_or(BasicError::ArgumentNotOptional)?;
                let key = match arg(1) {
                    Some(Value::Empty) | None => None,
                    Some(k) => Some(k.to_basic_string()?),
                };
                self.add(value, key.as_deref())?;
                Ok(Value::Empty)
            }
            "item" => self.item(&arg(0).ok_or(BasicError::ArgumentNotOptional)?),
            "remove" => {
                self.remove(&arg(0).ok_or(BasicError::ArgumentNotOptional)?)?;
                Ok(Value::Empty)
            }
            "count" => Ok(Value::Long(self.len() as i32)),
            _ => Err(BasicError::NotSupported(name.to_string())),
        }
    }

    fn default_member(&self) -> Option<&str> {
        Some("Item")
    }

    fn as_collection(&self) -> Option<&Collection> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed_and_positional_access() {
        let c = Collection::new();
        c.add(Value::Long(10), Some("ten")).unwrap();
        c.add(Value::Long(20), None).unwrap();
        assert_eq!(c.item(&Value::string("TEN")), Ok(Value::Long(10)));
        assert_eq!(c.item(&Value::Integer(2)), Ok(Value::Long(20)));
        assert_eq!(c.item(&Value::Integer(3)), Err(BasicError::SubscriptOutOfRange));
        assert_eq!(
            c.add(Value::Empty, Some("ten")),
            Err(BasicError::InvalidProcedureCall)
        );
    }

    #[test]
    fn mutations_bump_generation() {
        let c = Collection::new();
        let g0 = c.generation();
        c.add(Value::Long(1), None).unwrap();
        c.remove(&Value::Integer(1)).unwrap();
        assert_eq!(c.generation(), g0 + 2);
        assert!(c.is_empty());
    }

    #[test]
    fn methods_through_host_interface() {
        let obj = Collection::new().into_object();
        obj.call_method("Add", &[VarRef::temp(Value::string("a"))]).unwrap();
        assert_eq!(obj.get_property("Count", &[]), Ok(Value::Long(1)));
        assert_eq!(obj.member("remove"), Some(MemberKind::Method));
        assert!(obj.as_collection().is_some());
    }
}
