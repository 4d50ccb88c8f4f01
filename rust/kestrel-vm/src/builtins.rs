//! Runtime functions reachable from scripts by name.

use kestrel_core::{BasicError, NativeContext, NativeFunction, Value, VarFlags, VarRef, VarType};
use std::collections::HashMap;
use std::rc::Rc;

type BuiltinFn = fn(&mut dyn NativeContext, &[VarRef]) -> Result<Value, BasicError>;

struct Builtin {
    name: &'static str,
    min_args: usize,
    max_args: usize,
    func: BuiltinFn,
}

impl NativeFunction for Builtin {
    fn name(&self) -> &str {
        self.name
    }

    fn call(&self, ctx: &mut dyn NativeContext, args: &[VarRef]) -> Result<Value, BasicError> {
        if args.len() < self.min_args || args.len() > self.max_args {
            return Err(BasicError::WrongArgumentCount);
        }
        (self.func)(ctx, args)
    }
}

const TABLE: &[(&str, usize, usize, BuiltinFn)] = &[
    ("Err", 0, 0, err_number),
    ("Erl", 0, 0, err_line),
    ("Error", 0, 1, error_message),
    ("IsMissing", 1, 1, is_missing),
    ("IsArray", 1, 1, is_array),
    ("LBound", 1, 2, lbound),
    ("UBound", 1, 2, ubound),
    ("Len", 1, 1, len),
    ("CInt", 1, 1, cint),
    ("CLng", 1, 1, clng),
    ("CDbl", 1, 1, cdbl),
    ("CStr", 1, 1, cstr),
];

/// Name table of the standard runtime functions. Lookup ignores case.
pub struct Builtins {
    by_name: HashMap<String, Rc<dyn NativeFunction>>,
}

impl Builtins {
    pub fn standard() -> Self {
        let by_name = TABLE
            .iter()
            .map(|&(name, min_args, max_args, func)| {
                let f: Rc<dyn NativeFunction> = Rc::new(Builtin {
                    name,
                    min_args,
                    max_args,
                    func,
                });
                (name.to_ascii_lowercase(), f)
            })
            .collect();
        Self { by_name }
    }

    pub fn get(&self, name: &str) -> Option<Rc<dyn NativeFunction>> {
        self.by_name.get(&name.to_ascii_lowercase()).cloned()
    }
}

fn err_number(ctx: &mut dyn NativeContext, _: &[VarRef]) -> Result<Value, BasicError> {
    Ok(Value::Long(ctx.error_info().map_or(0, |e| e.code as i32)))
}

fn err_line(ctx: &mut dyn NativeContext, _: &[VarRef]) -> Result<Value, BasicError> {
    Ok(Value::Long(ctx.error_info().map_or(0, |e| e.line as i32)))
}

fn error_message(ctx: &mut dyn NativeContext, args: &[VarRef]) -> Result<Value, BasicError> {
    let Some(arg) = args.first() else {
        let msg = ctx.error_info().map(|e| e.message.clone()).unwrap_or_default();
        return Ok(Value::string(msg));
    };
    match arg.value().to_i64()? {
        0 => Ok(Value::string("")),
        n if !(0..=65535).contains(&n) => Err(BasicError::InvalidProcedureCall),
        n => Ok(Value::string(BasicError::from_code(n as u32).to_string())),
    }
}

fn is_missing(_: &mut dyn NativeContext, args: &[VarRef]) -> Result<Value, BasicError> {
    Ok(Value::Bool(args[0].has_flag(VarFlags::MISSING)))
}

fn is_array(_: &mut dyn NativeContext, args: &[VarRef]) -> Result<Value, BasicError> {
    Ok(Value::Bool(args[0].with_value(Value::is_array)))
}

fn bound(args: &[VarRef], upper: bool) -> Result<Value, BasicError> {
    let value = args[0].value();
    let arr = value.as_array().ok_or(BasicError::TypeMismatch)?;
    let dim = match args.get(1) {
        Some(d) => d.value().to_i64()?.max(0) as usize,
        None => 1,
    };
    let (lo, hi) = arr.borrow().dim_bounds(dim)?;
    Ok(Value::Long(if upper { hi } else { lo }))
}

fn lbound(_: &mut dyn NativeContext, args: &[VarRef]) -> Result<Value, BasicError> {
    bound(args, false)
}

fn ubound(_: &mut dyn NativeContext, args: &[VarRef]) -> Result<Value, BasicError> {
    bound(args, true)
}

fn len(_: &mut dyn NativeContext, args: &[VarRef]) -> Result<Value, BasicError> {
    let s = args[0].value().to_basic_string()?;
    Ok(Value::Long(s.chars().count() as i32))
}

fn cint(_: &mut dyn NativeContext, args: &[VarRef]) -> Result<Value, BasicError> {
    args[0].value().convert(VarType::Integer)
}

fn clng(_: &mut dyn NativeContext, args: &[VarRef]) -> Result<Value, BasicError> {
    args[0].value().convert(VarType::Long)
}

fn cdbl(_: &mut dyn NativeContext, args: &[VarRef]) -> Result<Value, BasicError> {
    args[0].value().convert(VarType::Double)
}

fn cstr(_: &mut dyn NativeContext, args: &[VarRef]) -> Result<Value, BasicError> {
    args[0].value().convert(VarType::String)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{ArrayValue, ErrorInfo};

    struct Ctx(Option<ErrorInfo>);

    impl NativeContext for Ctx {
        fn error_info(&self) -> Option<&ErrorInfo> {
            self.0.as_ref()
        }
    }

    fn call(name: &str, args: &[Value]) -> Result<Value, BasicError> {
        let f = Builtins::standard().get(name).unwrap();
        let vars: Vec<VarRef> = args.iter().cloned().map(VarRef::temp).collect();
        f.call(&mut Ctx(None), &vars)
    }

    #[test]
    fn error_functions_read_context() {
        let f = Builtins::standard().get("ERR").unwrap();
        let mut ctx = Ctx(Some(ErrorInfo::new(&BasicError::DivisionByZero, 40, 1)));
        assert_eq!(f.call(&mut ctx, &[]), Ok(Value::Long(11)));
        let erl = Builtins::standard().get("erl").unwrap();
        assert_eq!(erl.call(&mut ctx, &[]), Ok(Value::Long(40)));
        assert_eq!(f.call(&mut Ctx(None), &[]), Ok(Value::Long(0)));
        assert_eq!(
            call("Error", &[Value::Integer(13)]),
            Ok(Value::string("Type mismatch"))
        );
    }

    #[test]
    fn bounds_of_array() {
        let arr = ArrayValue::new(vec![(1, 3), (0, 9)], VarType::Variant, true)
            .unwrap()
            .into_ref();
        let v = Value::Array(arr);
        assert_eq!(call("LBound", &[v.clone()]), Ok(Value::Long(1)));
        assert_eq!(call("UBound", &[v.clone(), Value::Integer(2)]), Ok(Value::Long(9)));
        assert_eq!(
            call("UBound", &[v, Value::Integer(3)]),
            Err(BasicError::SubscriptOutOfRange)
        );
        assert_eq!(call("UBound", &[Value::Integer(1)]), Err(BasicError::TypeMismatch));
    }

    #[test]
    fn conversions_and_arity() {
        assert_eq!(call("CInt", &[Value::Double(2.5)]), Ok(Value::Integer(2)));
        assert_eq!(call("CStr", &[Value::Long(7)]), Ok(Value::string("7")));
        assert_eq!(call("Len", &[Value::string("héllo")]), Ok(Value::Long(5)));
        assert_eq!(call("Len", &[]), Err(BasicError::WrongArgumentCount));
        assert!(Builtins::standard().get("NoSuchThing").is_none());
    }

    #[test]
    fn is_missing_checks_the_flag() {
        let f = Builtins::standard().get("IsMissing").unwrap();
        let missing = VarRef::missing("x", None);
        assert_eq!(f.call(&mut Ctx(None), &[missing]), Ok(Value::Bool(true)));
        let given = VarRef::temp(Value::Empty);
        assert_eq!(f.call(&mut Ctx(None), &[given]), Ok(Value::Bool(false)));
    }
}
