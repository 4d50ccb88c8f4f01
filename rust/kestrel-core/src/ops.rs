//! Operators over variant values: the fixed operator enumeration the
//! interpreter dispatches arithmetic, logical and comparison opcodes to.

use crate::error::BasicError;
use crate::value::{Currency, Value};
use std::cmp::Ordering;
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Concat,
    And,
    Or,
    Xor,
    Eqv,
    Imp,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum UnOp {
    Neg,
    Not,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge
        )
    }
}

/// Numeric class used to pick the result type of arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Class {
    Integer,
    Long,
    Int64,
    Currency,
    Single,
    Double,
    Date,
}

fn class_of(v: &Value) -> Result<Class, BasicError> {
    Ok(match v {
        Value::Empty | Value::Bool(_) | Value::Integer(_) => Class::Integer,
        Value::Long(_) => Class::Long,
        Value::Int64(_) => Class::Int64,
        Value::Currency(_) => Class::Currency,
        Value::Single(_) => Class::Single,
        Value::Double(_) | Value::String(_) => Class::Double,
        Value::Date(_) => Class::Date,
        Value::Object(_) | Value::Array(_) => return Err(BasicError::TypeMismatch),
    })
}

fn combine(a: Class, b: Class) -> Class {
    match (a, b) {
        (Class::Currency, Class::Single) | (Class::Single, Class::Currency) => Class::Double,
        _ => a.max(b),
    }
}

fn fit_int(n: i64, class: Class) -> Result<Value, BasicError> {
    match class {
        Class::Integer => i16::try_from(n)
            .map(Value::Integer)
            .map_err(|_| BasicError::Overflow),
        Class::Long => i32::try_from(n)
            .map(Value::Long)
            .map_err(|_| BasicError::Overflow),
        _ => Ok(Value::Int64(n)),
    }
}

fn finite(f: f64) -> Result<f64, BasicError> {
    if f.is_finite() {
        Ok(f)
    } else {
        Err(BasicError::Overflow)
    }
}

/// Currency operands are Currency or whole numbers, both exact.
fn currency_of(v: &Value) -> Result<Currency, BasicError> {
    match v {
        Value::Currency(c) => Ok(*c),
        other => Currency::from_i64(other.to_i64()?),
    }
}

fn int_class(a: Class, b: Class) -> Class {
    match a.max(b) {
        Class::Integer => Class::Integer,
        Class::Int64 => Class::Int64,
        _ => Class::Long,
    }
}

fn arith(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, BasicError> {
    let class = combine(class_of(lhs)?, class_of(rhs)?);
    match class {
        Class::Integer | Class::Long | Class::Int64 => {
            let (a, b) = (lhs.to_i64()?, rhs.to_i64()?);
            let r = match op {
                BinOp::Add => a.checked_add(b),
                BinOp::Sub => a.checked_sub(b),
                _ => a.checked_mul(b),
            };
            fit_int(r.ok_or(BasicError::Overflow)?, class)
        }
        Class::Currency => {
            let (a, b) = (currency_of(lhs)?, currency_of(rhs)?);
            let r = match op {
                BinOp::Add => a.checked_add(b),
                BinOp::Sub => a.checked_sub(b),
                _ => a.checked_mul(b),
            };
            Ok(Value::Currency(r?))
        }
        Class::Single | Class::Double | Class::Date => {
            let (a, b) = (lhs.to_f64()?, rhs.to_f64()?);
            let r = finite(match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                _ => a * b,
            })?;
            Ok(match class {
                Class::Single => Value::Single(r as f32),
                Class::Date if op == BinOp::Sub && matches!(rhs, Value::Date(_)) => Value::Double(r),
                Class::Date if op != BinOp::Mul => Value::Date(r),
                _ => Value::Double(r),
            })
        }
    }
}

fn bitwise(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, BasicError> {
    if let (Value::Bool(a), Value::Bool(b)) = (lhs, rhs) {
        let (a, b) = (*a, *b);
        return Ok(Value::Bool(match op {
            BinOp::And => a && b,
            BinOp::Or => a || b,
            BinOp::Xor => a ^ b,
            BinOp::Eqv => a == b,
            _ => !a || b,
        }));
    }
    let class = int_class(class_of(lhs)?, class_of(rhs)?);
    let (a, b) = (lhs.to_i64()?, rhs.to_i64()?);
    let r = match op {
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Eqv => !(a ^ b),
        _ => !a | b,
    };
    fit_int(r, class)
}

/// Compare two values. `text` selects case-insensitive string comparison.
pub fn compare(lhs: &Value, rhs: &Value, text: bool) -> Result<Ordering, BasicError> {
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => Ok(if text {
            a.to_lowercase().cmp(&b.to_lowercase())
        } else {
            a.as_ref().cmp(b.as_ref())
        }),
        (Value::Empty, Value::String(s)) => Ok("".cmp(s.as_ref())),
        (Value::String(s), Value::Empty) => Ok(s.as_ref().cmp("")),
        (Value::String(s), other) if other.is_numeric() || matches!(other, Value::Bool(_) | Value::Date(_)) => {
            match crate::value::parse_number(s) {
                Some(n) => Ok(n.partial_cmp(&other.to_f64()?).unwrap_or(Ordering::Equal)),
                None => Ok(Ordering::Greater),
            }
        }
        (other, Value::String(_)) if !matches!(other, Value::Object(_) | Value::Array(_)) => {
            compare(rhs, lhs, text).map(Ordering::reverse)
        }
        (Value::Object(_), _) | (_, Value::Object(_)) | (Value::Array(_), _) | (_, Value::Array(_)) => {
            Err(BasicError::TypeMismatch)
        }
        _ => {
            let integral = |v: &Value| {
                matches!(
                    v,
                    Value::Empty | Value::Bool(_) | Value::Integer(_) | Value::Long(_) | Value::Int64(_)
                )
            };
            if integral(lhs) && integral(rhs) {
                Ok(lhs.to_i64()?.cmp(&rhs.to_i64()?))
            } else {
                Ok(lhs
                    .to_f64()?
                    .partial_cmp(&rhs.to_f64()?)
                    .unwrap_or(Ordering::Equal))
            }
        }
    }
}

/// Apply a binary operator.
pub fn binary(op: BinOp, lhs: &Value, rhs: &Value, text: bool) -> Result<Value, BasicError> {
    match op {
        BinOp::Add => match (lhs, rhs) {
            (Value::String(a), Value::String(b)) => Ok(Value::string(format!("{a}{b}"))),
            (Value::String(s), Value::Empty) | (Value::Empty, Value::String(s)) => {
                Ok(Value::String(s.clone()))
            }
            _ => arith(op, lhs, rhs),
        },
        BinOp::Sub | BinOp::Mul => arith(op, lhs, rhs),
        BinOp::Div => {
            let b = rhs.to_f64()?;
            if b == 0.0 {
                return Err(BasicError::DivisionByZero);
            }
            let r = finite(lhs.to_f64()? / b)?;
            Ok(match combine(class_of(lhs)?, class_of(rhs)?) {
                Class::Single => Value::Single(r as f32),
                Class::Currency => Value::Currency(Currency::from_f64(r)?),
                _ => Value::Double(r),
            })
        }
        BinOp::IDiv | BinOp::Mod => {
            let class = int_class(class_of(lhs)?, class_of(rhs)?);
            let (a, b) = (lhs.to_i64()?, rhs.to_i64()?);
            if b == 0 {
                return Err(BasicError::DivisionByZero);
            }
            let r = if op == BinOp::IDiv {
                a.checked_div(b)
            } else {
                a.checked_rem(b)
            };
            fit_int(r.ok_or(BasicError::Overflow)?, class)
        }
        BinOp::Pow => Ok(Value::Double(finite(lhs.to_f64()?.powf(rhs.to_f64()?))?)),
        BinOp::Concat => Ok(Value::string(format!(
            "{}{}",
            lhs.to_basic_string()?,
            rhs.to_basic_string()?
        ))),
        BinOp::And | BinOp::Or | BinOp::Xor | BinOp::Eqv | BinOp::Imp => bitwise(op, lhs, rhs),
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
            let ord = compare(lhs, rhs, text)?;
            Ok(Value::Bool(match op {
                BinOp::Eq => ord == Ordering::Equal,
                BinOp::Ne => ord != Ordering::Equal,
                BinOp::Lt => ord == Ordering::Less,
                BinOp::Gt => ord == Ordering::Greater,
                BinOp::Le => ord != Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }
    }
}

/// Apply a unary operator.
pub fn unary(op: UnOp, v: &Value) -> Result<Value, BasicError> {
    match (op, v) {
        (UnOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnOp::Neg, Value::Empty) => Ok(Value::Integer(0)),
        (UnOp::Neg, Value::Bool(b)) => Ok(Value::Integer(if *b { 1 } else { 0 })),
        (UnOp::Neg, Value::Integer(n)) => n.checked_neg().map(Value::Integer).ok_or(BasicError::Overflow),
        (UnOp::Neg, Value::Long(n)) => n.checked_neg().map(Value::Long).ok_or(BasicError::Overflow),
        (UnOp::Neg, Value::Int64(n)) => n.checked_neg().map(Value::Int64).ok_or(BasicError::Overflow),
        (UnOp::Neg, Value::Single(f)) => Ok(Value::Single(-f)),
        (UnOp::Neg, Value::Currency(c)) => c
            .raw()
            .checked_neg()
            .map(|r| Value::Currency(Currency::from_raw(r)))
            .ok_or(BasicError::Overflow),
        (UnOp::Neg, Value::Date(d)) => Ok(Value::Date(-d)),
        (UnOp::Neg, other) => Ok(Value::Double(-other.to_f64()?)),
        (UnOp::Not, Value::Empty) => Ok(Value::Integer(-1)),
        (UnOp::Not, Value::Integer(n)) => Ok(Value::Integer(!n)),
        (UnOp::Not, Value::Long(n)) => Ok(Value::Long(!n)),
        (UnOp::Not, Value::Int64(n)) => Ok(Value::Int64(!n)),
        (UnOp::Not, other) => Ok(Value::Long(!other.to_i32()?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bin(op: BinOp, a: Value, b: Value) -> Result<Value, BasicError> {
        binary(op, &a, &b, false)
    }

    #[test]
    fn integer_arithmetic_keeps_width() {
        assert_eq!(bin(BinOp::Add, Value::Integer(2), Value::Integer(3)), Ok(Value::Integer(5)));
        assert_eq!(bin(BinOp::Add, Value::Integer(2), Value::Long(3)), Ok(Value::Long(5)));
        assert_eq!(
            bin(BinOp::Mul, Value::Integer(300), Value::Integer(300)),
            Err(BasicError::Overflow)
        );
    }

    #[test]
    fn mixed_float_promotes() {
        assert_eq!(bin(BinOp::Add, Value::Integer(1), Value::Double(0.5)), Ok(Value::Double(1.5)));
        assert_eq!(bin(BinOp::Div, Value::Integer(7), Value::Integer(2)), Ok(Value::Double(3.5)));
        assert_eq!(bin(BinOp::IDiv, Value::Integer(7), Value::Integer(2)), Ok(Value::Integer(3)));
        assert_eq!(bin(BinOp::Mod, Value::Long(7), Value::Integer(4)), Ok(Value::Long(3)));
    }

    #[test]
    fn currency_arithmetic_is_exact() {
        let cur = |raw| Value::Currency(Currency::from_raw(raw));
        assert_eq!(
            bin(BinOp::Add, cur(123_456_789_012_345_678), cur(1)),
            Ok(cur(123_456_789_012_345_679))
        );
        assert_eq!(
            bin(BinOp::Sub, cur(9_000_000_000_000_000_001), Value::Integer(0)),
            Ok(cur(9_000_000_000_000_000_001))
        );
        assert_eq!(bin(BinOp::Add, cur(i64::MAX), cur(1)), Err(BasicError::Overflow));
        // 1.5 * 0.0001 = 0.00015, half to even at four places.
        assert_eq!(bin(BinOp::Mul, cur(15_000), cur(1)), Ok(cur(2)));
        assert_eq!(bin(BinOp::Mul, cur(25_000), cur(1)), Ok(cur(2)));
        assert_eq!(bin(BinOp::Mul, cur(-15_000), cur(1)), Ok(cur(-2)));
        assert_eq!(bin(BinOp::Mul, cur(25_000), Value::Long(4)), Ok(cur(100_000)));
        assert_eq!(bin(BinOp::Mul, cur(i64::MAX), Value::Integer(2)), Err(BasicError::Overflow));
    }

    #[test]
    fn division_by_zero_faults() {
        assert_eq!(
            bin(BinOp::Div, Value::Integer(1), Value::Integer(0)),
            Err(BasicError::DivisionByZero)
        );
        assert_eq!(
            bin(BinOp::Mod, Value::Integer(1), Value::Empty),
            Err(BasicError::DivisionByZero)
        );
    }

    #[test]
    fn plus_on_strings_concatenates() {
        assert_eq!(bin(BinOp::Add, "ab".into(), "cd".into()), Ok(Value::string("abcd")));
        assert_eq!(bin(BinOp::Add, "2".into(), Value::Integer(3)), Ok(Value::Double(5.0)));
        assert_eq!(bin(BinOp::Concat, Value::Integer(2), "x".into()), Ok(Value::string("2x")));
    }

    #[test]
    fn logical_ops_on_booleans_and_integers() {
        assert_eq!(bin(BinOp::And, true.into(), false.into()), Ok(Value::Bool(false)));
        assert_eq!(bin(BinOp::Imp, false.into(), false.into()), Ok(Value::Bool(true)));
        assert_eq!(bin(BinOp::Or, Value::Integer(4), Value::Integer(1)), Ok(Value::Integer(5)));
        assert_eq!(unary(UnOp::Not, &Value::Integer(0)), Ok(Value::Integer(-1)));
    }

    #[test]
    fn comparisons() {
        assert_eq!(bin(BinOp::Lt, Value::Integer(1), Value::Double(1.5)), Ok(Value::Bool(true)));
        assert_eq!(bin(BinOp::Eq, "10".into(), Value::Integer(10)), Ok(Value::Bool(true)));
        assert_eq!(bin(BinOp::Gt, "abc".into(), Value::Integer(10)), Ok(Value::Bool(true)));
        assert_eq!(binary(BinOp::Eq, &"ABC".into(), &"abc".into(), true), Ok(Value::Bool(true)));
        assert_eq!(bin(BinOp::Eq, "ABC".into(), "abc".into()), Ok(Value::Bool(false)));
    }

    #[test]
    fn negation_overflow() {
        assert_eq!(unary(UnOp::Neg, &Value::Integer(i16::MIN)), Err(BasicError::Overflow));
        assert_eq!(unary(UnOp::Neg, &Value::Long(5)), Ok(Value::Long(-5)));
    }
}
