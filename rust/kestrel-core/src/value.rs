//! Variant values: the tagged dynamic value type every other component
//! manipulates.

use crate::array::ArrayRef;
use crate::error::BasicError;
use crate::object::ObjectRef;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;
use strum_macros::{Display, EnumString, FromRepr};

/// Declared storage type of a variable, parameter or literal.
///
/// Discriminants follow the classic variant type numbering so that operand
/// words emitted by a compiler can be decoded with [`VarType::from_repr`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, FromRepr,
)]
#[repr(u8)]
pub enum VarType {
    Empty = 0,
    Integer = 2,
    Long = 3,
    Single = 4,
    Double = 5,
    Currency = 6,
    Date = 7,
    String = 8,
    Object = 9,
    Boolean = 11,
    Variant = 12,
    Int64 = 20,
}

impl VarType {
    /// Value a freshly declared variable of this type starts out with.
    pub fn default_value(self) -> Value {
        match self {
            VarType::Empty | VarType::Variant => Value::Empty,
            VarType::Integer => Value::Integer(0),
            VarType::Long => Value::Long(0),
            VarType::Int64 => Value::Int64(0),
            VarType::Single => Value::Single(0.0),
            VarType::Double => Value::Double(0.0),
            VarType::Currency => Value::Currency(Currency::ZERO),
            VarType::Date => Value::Date(0.0),
            VarType::String => Value::String(Rc::from("")),
            VarType::Object => Value::Object(None),
            VarType::Boolean => Value::Bool(false),
        }
    }

    /// `true` for types that pin the variable to one tag on assignment.
    pub fn is_fixed(self) -> bool {
        !matches!(self, VarType::Empty | VarType::Variant)
    }
}

/// Fixed-point currency with four decimal places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Currency(i64);

impl Currency {
    pub const SCALE: i64 = 10_000;
    pub const ZERO: Currency = Currency(0);

    pub fn from_raw(raw: i64) -> Self {
        Currency(raw)
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn from_f64(f: f64) -> Result<Self, BasicError> {
        let scaled = round_half_even(f * Self::SCALE as f64);
        if !scaled.is_finite() || scaled < i64::MIN as f64 || scaled > i64::MAX as f64 {
            return Err(BasicError::Overflow);
        }
        Ok(Currency(scaled as i64))
    }

    /// Exact conversion of a whole number.
    pub fn from_i64(n: i64) -> Result<Self, BasicError> {
        n.checked_mul(Self::SCALE)
            .map(Currency)
            .ok_or(BasicError::Overflow)
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }

    pub fn checked_add(self, rhs: Self) -> Result<Self, BasicError> {
        self.0.checked_add(rhs.0).map(Currency).ok_or(BasicError::Overflow)
    }

    pub fn checked_sub(self, rhs: Self) -> Result<Self, BasicError> {
        self.0.checked_sub(rhs.0).map(Currency).ok_or(BasicError::Overflow)
    }

    /// Product rounded half to even at the fourth decimal place.
    pub fn checked_mul(self, rhs: Self) -> Result<Self, BasicError> {
        let scale = i128::from(Self::SCALE);
        let product = i128::from(self.0) * i128::from(rhs.0);
        let (mut q, r) = (product / scale, product % scale);
        let twice = 2 * r.abs();
        if twice > scale || (twice == scale && q % 2 != 0) {
            q += product.signum();
        }
        i64::try_from(q).map(Currency).map_err(|_| BasicError::Overflow)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / Self::SCALE as u64;
        let frac = abs % Self::SCALE as u64;
        if frac == 0 {
            write!(f, "{sign}{whole}")
        } else {
            let digits = format!("{frac:04}");
            write!(f, "{sign}{whole}.{}", digits.trim_end_matches('0'))
        }
    }
}

/// Runtime variant value.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Empty,
    Bool(bool),
    Integer(i16),
    Long(i32),
    Int64(i64),
    Single(f32),
    Double(f64),
    Currency(Currency),
    /// OLE automation date: days since 1899-12-30, fraction is time of day.
    Date(f64),
    String(Rc<str>),
    /// `None` is `Nothing`.
    Object(Option<ObjectRef>),
    Array(ArrayRef),
}

impl Value {
    pub fn string(s: impl Into<Rc<str>>) -> Self {
        Value::String(s.into())
    }

    pub fn var_type(&self) -> VarType {
        match self {
            Value::Empty => VarType::Empty,
            Value::Bool(_) => VarType::Boolean,
            Value::Integer(_) => VarType::Integer,
            Value::Long(_) => VarType::Long,
            Value::Int64(_) => VarType::Int64,
            Value::Single(_) => VarType::Single,
            Value::Double(_) => VarType::Double,
            Value::Currency(_) => VarType::Currency,
            Value::Date(_) => VarType::Date,
            Value::String(_) => VarType::String,
            Value::Object(_) => VarType::Object,
            Value::Array(_) => VarType::Variant,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::Integer(_)
                | Value::Long(_)
                | Value::Int64(_)
                | Value::Single(_)
                | Value::Double(_)
                | Value::Currency(_)
        )
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(Some(obj)) => Some(obj),
            _ => None,
        }
    }

    /// Take sole ownership of shared array storage by copying it. Every
    /// other value is immutable and may stay shared.
    pub fn make_exclusive(&mut self) {
        if let Value::Array(arr) = self {
            if Rc::strong_count(arr) > 1 {
                let copy = arr.borrow().deep_copy();
                *arr = copy.into_ref();
            }
        }
    }

    pub fn as_array(&self) -> Option<&ArrayRef> {
        match self {
            Value::Array(arr) => Some(arr),
            _ => None,
        }
    }

    pub fn to_f64(&self) -> Result<f64, BasicError> {
        match self {
            Value::Empty => Ok(0.0),
            Value::Bool(b) => Ok(if *b { -1.0 } else { 0.0 }),
            Value::Integer(n) => Ok(*n as f64),
            Value::Long(n) => Ok(*n as f64),
            Value::Int64(n) => Ok(*n as f64),
            Value::Single(f) => Ok(*f as f64),
            Value::Double(f) => Ok(*f),
            Value::Currency(c) => Ok(c.to_f64()),
            Value::Date(d) => Ok(*d),
            Value::String(s) => parse_number(s).ok_or(BasicError::TypeMismatch),
            Value::Object(_) | Value::Array(_) => Err(BasicError::TypeMismatch),
        }
    }

    pub fn to_i64(&self) -> Result<i64, BasicError> {
        match self {
            Value::Empty => Ok(0),
            Value::Bool(b) => Ok(if *b { -1 } else { 0 }),
            Value::Integer(n) => Ok(*n as i64),
            Value::Long(n) => Ok(*n as i64),
            Value::Int64(n) => Ok(*n),
            _ => {
                let f = round_half_even(self.to_f64()?);
                if !f.is_finite() || f < i64::MIN as f64 || f > i64::MAX as f64 {
                    return Err(BasicError::Overflow);
                }
                Ok(f as i64)
            }
        }
    }

    pub fn to_i32(&self) -> Result<i32, BasicError> {
        i32::try_from(self.to_i64()?).map_err(|_| BasicError::Overflow)
    }

    pub fn to_i16(&self) -> Result<i16, BasicError> {
        i16::try_from(self.to_i64()?).map_err(|_| BasicError::Overflow)
    }

    pub fn to_bool(&self) -> Result<bool, BasicError> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::String(s) => {
                let t = s.trim();
                if t.eq_ignore_ascii_case("true") {
                    Ok(true)
                } else if t.eq_ignore_ascii_case("false") {
                    Ok(false)
                } else {
                    parse_number(t)
                        .map(|n| n != 0.0)
                        .ok_or(BasicError::TypeMismatch)
                }
            }
            other => Ok(other.to_f64()? != 0.0),
        }
    }

    /// String conversion used by `CStr`, concatenation and `PRINT`.
    pub fn to_basic_string(&self) -> Result<String, BasicError> {
        match self {
            Value::Empty => Ok(String::new()),
            Value::Bool(b) => Ok(if *b { "True" } else { "False" }.to_string()),
            Value::Integer(n) => Ok(n.to_string()),
            Value::Long(n) => Ok(n.to_string()),
            Value::Int64(n) => Ok(n.to_string()),
            Value::Single(f) => Ok(format_float(*f as f64, 7)),
            Value::Double(f) => Ok(format_float(*f, 15)),
            Value::Currency(c) => Ok(c.to_string()),
            Value::Date(d) => Ok(format_date(*d)),
            Value::String(s) => Ok(s.to_string()),
            Value::Object(_) | Value::Array(_) => Err(BasicError::TypeMismatch),
        }
    }

    /// Explicit conversion to a declared type.
    pub fn convert(&self, ty: VarType) -> Result<Value, BasicError> {
        Ok(match ty {
            VarType::Variant => self.clone(),
            VarType::Empty => Value::Empty,
            VarType::Integer => Value::Integer(self.to_i16()?),
            VarType::Long => Value::Long(self.to_i32()?),
            VarType::Int64 => Value::Int64(self.to_i64()?),
            VarType::Single => {
                let f = self.to_f64()?;
                if f.is_finite() && f.abs() > f32::MAX as f64 {
                    return Err(BasicError::Overflow);
                }
                Value::Single(f as f32)
            }
            VarType::Double => Value::Double(self.to_f64()?),
            VarType::Currency => match self {
                Value::Currency(c) => Value::Currency(*c),
                Value::Empty | Value::Bool(_) | Value::Integer(_) | Value::Long(_) | Value::Int64(_) => {
                    Value::Currency(Currency::from_i64(self.to_i64()?)?)
                }
                other => Value::Currency(Currency::from_f64(other.to_f64()?)?),
            },
            VarType::Date => match self {
                Value::String(s) => Value::Date(parse_date(s).ok_or(BasicError::TypeMismatch)?),
                other => Value::Date(other.to_f64()?),
            },
            VarType::String => Value::string(self.to_basic_string()?),
            VarType::Boolean => Value::Bool(self.to_bool()?),
            VarType::Object => match self {
                Value::Object(_) => self.clone(),
                _ => return Err(BasicError::ObjectRequired),
            },
        })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Empty, Value::Empty) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Single(a), Value::Single(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Currency(a), Value::Currency(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(None), Value::Object(None)) => true,
            (Value::Object(Some(a)), Value::Object(Some(b))) => {
                std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
            }
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Object(None) => write!(f, "Nothing"),
            Value::Object(Some(obj)) => write!(f, "<{}>", obj.class_name()),
            Value::Array(arr) => write!(f, "<array{:?}>", arr.borrow().bounds()),
            other => match other.to_basic_string() {
                Ok(s) => write!(f, "{s}"),
                Err(_) => write!(f, "<{}>", other.var_type()),
            },
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i16> for Value {
    fn from(n: i16) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Long(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Double(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

/// Round to nearest, ties to even (banker's rounding).
pub fn round_half_even(f: f64) -> f64 {
    let r = f.round();
    if (f - f.trunc()).abs() == 0.5 && r % 2.0 != 0.0 {
        r - f.signum()
    } else {
        r
    }
}

/// Parse a numeric string the way implicit conversion does: surrounding
/// blanks are ignored and `&H`/`&O` radix prefixes are accepted.
pub fn parse_number(s: &str) -> Option<f64> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    if let Some(rest) = t.strip_prefix('&') {
        let (radix, digits) = match rest.chars().next()? {
            'h' | 'H' => (16, &rest[1..]),
            'o' | 'O' => (8, &rest[1..]),
            _ => (8, rest),
        };
        if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
            return None;
        }
        return i64::from_str_radix(digits, radix).ok().map(|n| n as f64);
    }
    t.parse::<f64>().ok().filter(|f| f.is_finite())
}

fn format_float(f: f64, digits: usize) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        return format!("{}", f as i64);
    }
    let repr = format!("{f}");
    let significant = repr.chars().filter(|c| c.is_ascii_digit()).count();
    if significant <= digits {
        repr
    } else {
        let magnitude = f.abs().log10().floor() as i32;
        let decimals = (digits as i32 - 1 - magnitude).max(0) as usize;
        let rounded = format!("{f:.decimals$}");
        if rounded.contains('.') {
            rounded.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            rounded
        }
    }
}

fn date_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1899, 12, 30)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Convert an OLE day count to a calendar date-time.
pub fn date_to_naive(days: f64) -> Option<NaiveDateTime> {
    let whole = days.trunc() as i64;
    let secs = ((days - days.trunc()).abs() * 86_400.0).round() as i64;
    date_epoch()
        .checked_add_signed(Duration::try_days(whole)?)?
        .checked_add_signed(Duration::try_seconds(secs)?)
}

/// Whole days count from the epoch; the time of day is added away from
/// zero, so 1899-12-29 06:00 is -1.25.
pub fn naive_to_date(dt: NaiveDateTime) -> f64 {
    let days = (dt.date() - date_epoch().date()).num_days() as f64;
    let time = f64::from(dt.time().num_seconds_from_midnight()) / 86_400.0;
    if days < 0.0 {
        days - time
    } else {
        days + time
    }
}

fn format_date(days: f64) -> String {
    let Some(dt) = date_to_naive(days) else {
        return format!("{days}");
    };
    if dt.time() == NaiveTime::MIN {
        dt.format("%Y-%m-%d").to_string()
    } else if days.trunc() == 0.0 {
        dt.format("%H:%M:%S").to_string()
    } else {
        dt.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

fn parse_date(s: &str) -> Option<f64> {
    let t = s.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S") {
        return Some(naive_to_date(dt));
    }
    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return Some(naive_to_date(d.and_hms_opt(0, 0, 0)?));
    }
    if let Ok(tm) = NaiveTime::parse_from_str(t, "%H:%M:%S") {
        return Some(naive_to_date(date_epoch().date().and_time(tm)));
    }
    None
}
