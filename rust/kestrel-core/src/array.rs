//! Multi-dimensional arrays with explicit per-axis bounds.

use crate::error::BasicError;
use crate::value::{Value, VarType};
use crate::variable::VarRef;
use std::cell::RefCell;
use std::rc::Rc;

pub type ArrayRef = Rc<RefCell<ArrayValue>>;

/// Array storage. Elements are variables so that `a(i)` can be bound by
/// reference and assigned through. The first index varies fastest.
#[derive(Debug, Clone)]
pub struct ArrayValue {
    bounds: Vec<(i32, i32)>,
    elements: Vec<VarRef>,
    elem_type: VarType,
    /// Bounds were given in the declaration (`DIM a(1 TO 3)`) rather than
    /// established later by `REDIM`.
    fixed: bool,
}

impl ArrayValue {
    pub fn new(bounds: Vec<(i32, i32)>, elem_type: VarType, fixed: bool) -> Result<Self, BasicError> {
        let len = element_count(&bounds)?;
        let elements = (0..len).map(|_| VarRef::element(elem_type)).collect();
        Ok(Self {
            bounds,
            elements,
            elem_type,
            fixed,
        })
    }

    /// A dynamic array that has not been dimensioned yet.
    pub fn unallocated(elem_type: VarType) -> Self {
        Self {
            bounds: Vec::new(),
            elements: Vec::new(),
            elem_type,
            fixed: false,
        }
    }

    pub fn into_ref(self) -> ArrayRef {
        Rc::new(RefCell::new(self))
    }

    pub fn bounds(&self) -> &[(i32, i32)] {
        &self.bounds
    }

    pub fn dims(&self) -> usize {
        self.bounds.len()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn elem_type(&self) -> VarType {
        self.elem_type
    }

    /// Bounds of a 1-based dimension, as `LBound`/`UBound` report them.
    pub fn dim_bounds(&self, dim: usize) -> Result<(i32, i32), BasicError> {
        dim.checked_sub(1)
            .and_then(|d| self.bounds.get(d).copied())
            .ok_or(BasicError::SubscriptOutOfRange)
    }

    fn offset(&self, index: &[i32]) -> Result<usize, BasicError> {
        if index.len() != self.bounds.len() || self.bounds.is_empty() {
            return Err(BasicError::SubscriptOutOfRange);
        }
        let mut offset = 0usize;
        let mut stride = 1usize;
        for (&i, &(lo, hi)) in index.iter().zip(&self.bounds) {
            if i < lo || i > hi {
                return Err(BasicError::SubscriptOutOfRange);
            }
            offset += (i - lo) as usize * stride;
            stride *= (hi - lo + 1) as usize;
        }
        Ok(offset)
    }

    /// The element variable at `index`, shared with the array.
    pub fn element(&self, index: &[i32]) -> Result<VarRef, BasicError> {
        let off = self.offset(index)?;
        Ok(self.elements[off].clone())
    }

    pub fn get(&self, index: &[i32]) -> Result<Value, BasicError> {
        Ok(self.element(index)?.value())
    }

    pub fn set(&self, index: &[i32], value: Value) -> Result<(), BasicError> {
        self.element(index)?.assign(value)
    }

    /// Change the bounds. With `preserve`, every element whose index is valid
    /// under both the old and the new bounds keeps its value; everything else
    /// starts at the element default. Preserving an allocated array under a
    /// different number of dimensions is a subscript error.
    pub fn redim(&mut self, bounds: Vec<(i32, i32)>, preserve: bool) -> Result<(), BasicError> {
        if preserve && !self.bounds.is_empty() && self.bounds.len() != bounds.len() {
            return Err(BasicError::SubscriptOutOfRange);
        }
        let mut next = ArrayValue::new(bounds, self.elem_type, false)?;
        if preserve {
            let mut index: Vec<i32> = next.bounds.iter().map(|&(lo, _)| lo).collect();
            for slot in 0..next.elements.len() {
                if let Ok(old) = self.offset(&index) {
                    next.elements[slot] = self.elements[old].clone();
                }
                advance(&mut index, &next.bounds);
            }
        }
        *self = next;
        Ok(())
    }

    /// `ERASE`: a declared array is reset element-wise, a dynamic one is
    /// deallocated.
    pub fn erase(&mut self) {
        if self.fixed {
            for el in &self.elements {
                el.reset();
            }
        } else {
            self.bounds.clear();
            self.elements.clear();
        }
    }

    /// An independent array with the same bounds and values.
    pub fn deep_copy(&self) -> ArrayValue {
        let elements = self
            .elements
            .iter()
            .map(|el| {
                let mut el = el.clone();
                el.make_exclusive();
                el
            })
            .collect();
        ArrayValue {
            bounds: self.bounds.clone(),
            elements,
            elem_type: self.elem_type,
            fixed: self.fixed,
        }
    }

    /// Values in storage order.
    pub fn values(&self) -> Vec<Value> {
        self.elements.iter().map(VarRef::value).collect()
    }
}

/// Step a multi-index to the next position, first dimension fastest.
/// Returns `false` once every position has been visited.
pub fn advance(index: &mut [i32], bounds: &[(i32, i32)]) -> bool {
    for (i, &(lo, hi)) in index.iter_mut().zip(bounds) {
        if *i < hi {
            *i += 1;
            return true;
        }
        *i = lo;
    }
    false
}

/// Number of elements `bounds` describe.
pub fn element_count(bounds: &[(i32, i32)]) -> Result<usize, BasicError> {
    bounds.iter().try_fold(1usize, |acc, &(lo, hi)| {
        if hi < lo {
            return Err(BasicError::SubscriptOutOfRange);
        }
        acc.checked_mul((hi as i64 - lo as i64 + 1) as usize)
            .ok_or(BasicError::Overflow)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(bounds: Vec<(i32, i32)>) -> ArrayValue {
        let arr = ArrayValue::new(bounds, VarType::Variant, true).unwrap();
        for (n, el) in arr.elements.iter().enumerate() {
            el.assign(Value::Long(n as i32 + 1)).unwrap();
        }
        arr
    }

    #[test]
    fn first_index_varies_fastest() {
        let arr = filled(vec![(0, 1), (0, 2)]);
        assert_eq!(arr.get(&[1, 0]).unwrap(), Value::Long(2));
        assert_eq!(arr.get(&[0, 1]).unwrap(), Value::Long(3));
        assert_eq!(arr.get(&[2, 0]), Err(BasicError::SubscriptOutOfRange));
        assert_eq!(arr.get(&[0]), Err(BasicError::SubscriptOutOfRange));
    }

    #[test]
    fn redim_preserve_keeps_overlap() {
        let mut arr = filled(vec![(1, 3)]);
        arr.redim(vec![(1, 5)], true).unwrap();
        assert_eq!(arr.values()[..3], [Value::Long(1), Value::Long(2), Value::Long(3)]);
        assert_eq!(arr.get(&[4]).unwrap(), Value::Empty);
        assert_eq!(arr.get(&[5]).unwrap(), Value::Empty);
    }

    #[test]
    fn redim_preserve_cannot_change_rank() {
        let mut arr = filled(vec![(1, 3)]);
        assert_eq!(
            arr.redim(vec![(1, 3), (1, 2)], true),
            Err(BasicError::SubscriptOutOfRange)
        );
        assert_eq!(arr.values(), [Value::Long(1), Value::Long(2), Value::Long(3)]);
        arr.redim(vec![(1, 3), (1, 2)], false).unwrap();
        assert_eq!(arr.dims(), 2);

        let mut fresh = ArrayValue::unallocated(VarType::Variant);
        fresh.redim(vec![(0, 1), (0, 1)], true).unwrap();
        assert_eq!(fresh.len(), 4);
    }

    #[test]
    fn shared_array_value_is_copied_before_mutation() {
        let original = filled(vec![(1, 2)]).into_ref();
        let mut copy = Value::Array(original.clone());
        copy.make_exclusive();
        original.borrow().set(&[1], Value::Long(99)).unwrap();
        let copied = copy.as_array().unwrap().borrow().values();
        assert_eq!(copied, [Value::Long(1), Value::Long(2)]);

        let mut sole = Value::Array(filled(vec![(1, 2)]).into_ref());
        let before = sole.as_array().map(Rc::as_ptr);
        sole.make_exclusive();
        assert_eq!(sole.as_array().map(Rc::as_ptr), before);
    }

    #[test]
    fn element_count_overflow_is_reported() {
        assert_eq!(element_count(&[(0, 9), (1, 10)]), Ok(100));
        assert_eq!(
            element_count(&[(i32::MIN, i32::MAX); 3]),
            Err(BasicError::Overflow)
        );
    }

    #[test]
    fn redim_without_preserve_discards() {
        let mut arr = filled(vec![(1, 3)]);
        arr.redim(vec![(1, 2)], false).unwrap();
        assert_eq!(arr.values(), vec![Value::Empty, Value::Empty]);
    }

    #[test]
    fn erase_depends_on_fixed_flag() {
        let mut fixed = filled(vec![(0, 1)]);
        fixed.erase();
        assert_eq!(fixed.len(), 2);
        assert_eq!(fixed.get(&[0]).unwrap(), Value::Empty);

        let mut dynamic = ArrayValue::new(vec![(0, 1)], VarType::Integer, false).unwrap();
        dynamic.erase();
        assert!(dynamic.is_empty());
        assert_eq!(dynamic.dims(), 0);
    }

    #[test]
    fn inverted_bounds_rejected() {
        assert!(matches!(
            ArrayValue::new(vec![(3, 1)], VarType::Variant, true),
            Err(BasicError::SubscriptOutOfRange)
        ));
    }
}
