//! Opcode numbering.
//!
//! Opcodes occupy three contiguous ranges by operand count. Each
//! instruction is one opcode byte followed by that many little-endian `u32`
//! operands.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, FromRepr};

pub const ZERO_BASE: u8 = 0x00;
pub const ONE_BASE: u8 = 0x40;
pub const TWO_BASE: u8 = 0x80;
pub const TWO_END: u8 = 0xC0;

pub const ZERO_COUNT: usize = 50;
pub const ONE_COUNT: usize = 16;
pub const TWO_COUNT: usize = 10;

/// Name operand bit: an argument vector has been built for this reference.
pub const ARGS_FLAG: u32 = 0x8000_0000;
/// Type operand bit: consult the procedure's static table first.
pub const STATIC_FLAG: u32 = 0x0100;
/// `ARGTYP` operand bit: pass the last argument by value.
pub const BYVAL_FLAG: u32 = 0x0100;
/// `ONJUMP` operand bit: the targets are `GOSUB`s rather than `JUMP`s.
pub const GOSUB_FLAG: u32 = 0x8000_0000;
/// `RESUME` operand re-executing the faulting statement. Any other operand
/// below [`RESUME_NEXT`] is a label address.
pub const RESUME_BARE: u32 = u32::MAX;
/// `RESUME` operand continuing after the faulting statement.
pub const RESUME_NEXT: u32 = u32::MAX - 1;
/// `RETURN` operand popping the saved return address.
pub const RETURN_PLAIN: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    // ── zero operands ──
    Nop = 0x00,
    Exp,
    Mul,
    Div,
    Mod,
    Plus,
    Minus,
    Neg,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    IDiv,
    And,
    Or,
    Xor,
    Eqv,
    Imp,
    Not,
    Cat,
    Like,
    Is,
    /// Begin an argument vector.
    ArgC,
    /// Append the top of stack as a positional argument.
    ArgV,
    /// Replace the top of stack by its evaluated value.
    Get,
    /// Pop value, pop variable, assign.
    Set,
    /// `SET var = object`.
    SetRef,
    /// Placeholder for an omitted argument.
    Empty,
    Leave,
    Stop,
    InitFor,
    InitForEach,
    Next,
    PopFor,
    Dim,
    Redim,
    RedimPreserve,
    Erase,
    Error,
    StdError,
    NoError,
    Channel,
    Chan0,
    Print,
    PrintF,
    Write,
    LineInput,
    Input,

    // ── one operand ──
    Number = 0x40,
    String,
    Const,
    ArgN,
    ArgTyp,
    Jump,
    JumpT,
    JumpF,
    OnJump,
    Gosub,
    Return,
    TestFor,
    ErrHdl,
    Resume,
    Close,
    PrChar,

    // ── two operands ──
    Rtl = 0x80,
    Find,
    Elem,
    Param,
    Call,
    Stmnt,
    Open,
    Local,
    Public,
    Static,
}

impl Opcode {
    pub fn arity(self) -> usize {
        arity_of(self as u8).unwrap_or(0)
    }
}

/// Operand count implied by an opcode byte's range.
pub fn arity_of(byte: u8) -> Option<usize> {
    match byte {
        b if b < ONE_BASE => Some(0),
        b if b < TWO_BASE => Some(1),
        b if b < TWO_END => Some(2),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_are_contiguous() {
        assert_eq!(Opcode::Input as usize, ZERO_BASE as usize + ZERO_COUNT - 1);
        assert_eq!(Opcode::PrChar as usize, ONE_BASE as usize + ONE_COUNT - 1);
        assert_eq!(Opcode::Static as usize, TWO_BASE as usize + TWO_COUNT - 1);
        for b in 0..ZERO_COUNT as u8 {
            assert!(Opcode::from_repr(ZERO_BASE + b).is_some());
        }
        assert!(Opcode::from_repr(ZERO_BASE + ZERO_COUNT as u8).is_none());
    }

    #[test]
    fn arity_by_range() {
        assert_eq!(Opcode::Plus.arity(), 0);
        assert_eq!(Opcode::Jump.arity(), 1);
        assert_eq!(Opcode::Stmnt.arity(), 2);
        assert_eq!(arity_of(0xC5), None);
    }
}
