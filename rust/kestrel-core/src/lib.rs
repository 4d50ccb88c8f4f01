//! Kestrel Core
//!
//! Variant values, variables, arrays, operators, host object traits and the
//! bytecode image shared by the interpreter and its embedders.

pub mod array;
pub mod error;
pub mod image;
pub mod object;
pub mod ops;
pub mod value;
pub mod variable;

pub use array::{ArrayRef, ArrayValue};
pub use error::{BasicError, ErrorInfo};
pub use object::{Collection, HostEnumerator, HostObject, MemberKind, NativeContext, NativeFunction, ObjectRef};
pub use value::{Currency, Value, VarType};
pub use variable::{Arg, ArgVec, Callee, VarFlags, VarKind, VarRef};
