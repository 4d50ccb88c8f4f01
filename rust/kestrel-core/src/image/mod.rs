//! Compiled bytecode image: code bytes, constant pool, procedure table and
//! foreign declarations. The image is immutable once built and shared by
//! every interpreter instance executing it.

mod builder;
pub mod opcode;

pub use builder::{ImageBuilder, Label};
pub use opcode::{arity_of, Opcode};

use crate::value::{parse_number, Value, VarType};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("truncated instruction at offset {0}")]
    Truncated(usize),
    #[error("unknown opcode 0x{0:02x} at offset {1}")]
    UnknownOpcode(u8, usize),
    #[error("label {0} used but never bound")]
    UnboundLabel(usize),
    #[error("invalid image json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Constant pool entry. `ty` is the storage type a numeric literal was
/// written with (`10%`, `10&`, `1.5!` ...), `None` when untyped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub text: String,
    #[serde(default)]
    pub ty: Option<VarType>,
}

impl PoolEntry {
    /// The entry read as a literal. Typed entries convert to their declared
    /// type; untyped integral literals take the narrowest of Integer, Long
    /// and Double, and `&H`/`&O` literals wrap at 16 or 32 bits the way
    /// their digit count implies. Non-numeric untyped text is a string.
    pub fn value(&self) -> Option<Value> {
        let text = self.text.trim();
        match self.ty {
            Some(VarType::String) => Some(Value::string(self.text.as_str())),
            Some(ty) => {
                let n = match text.parse::<i64>() {
                    Ok(n) => Value::Int64(n),
                    Err(_) => Value::Double(parse_number(text)?),
                };
                n.convert(ty).ok()
            }
            None if text.starts_with('&') => radix_literal(text),
            None => match text.parse::<i64>() {
                Ok(n) => Some(narrowest(n)),
                Err(_) => match parse_number(text) {
                    Some(f) => Some(Value::Double(f)),
                    None => Some(Value::string(self.text.as_str())),
                },
            },
        }
    }
}

fn narrowest(n: i64) -> Value {
    if let Ok(i) = i16::try_from(n) {
        Value::Integer(i)
    } else if let Ok(l) = i32::try_from(n) {
        Value::Long(l)
    } else {
        Value::Double(n as f64)
    }
}

fn radix_literal(text: &str) -> Option<Value> {
    let rest = &text[1..];
    let (radix, digits) = match rest.chars().next()? {
        'h' | 'H' => (16, &rest[1..]),
        'o' | 'O' => (8, &rest[1..]),
        _ => (8, rest),
    };
    let n = u64::from_str_radix(digits, radix).ok()?;
    if n <= 0xFFFF {
        Some(Value::Integer(n as u16 as i16))
    } else if n <= 0xFFFF_FFFF {
        Some(Value::Long(n as u32 as i32))
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: VarType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub by_val: bool,
    /// Pool id of the declared default literal.
    #[serde(default)]
    pub default: Option<u32>,
}

impl ParamDecl {
    pub fn new(name: impl Into<String>, ty: VarType) -> Self {
        Self {
            name: name.into(),
            ty,
            optional: false,
            by_val: false,
            default: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn by_val(mut self) -> Self {
        self.by_val = true;
        self
    }

    pub fn with_default(mut self, pool_id: u32) -> Self {
        self.optional = true;
        self.default = Some(pool_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    pub name: String,
    /// Code offset of the first instruction.
    pub entry: u32,
    pub params: Vec<ParamDecl>,
    #[serde(rename = "returns")]
    pub ret: VarType,
    pub is_function: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CallConv {
    #[default]
    StdCall,
    CDecl,
}

/// `DECLARE FUNCTION name LIB "library" ALIAS "alias"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declare {
    pub name: String,
    pub library: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub convention: CallConv,
    #[serde(rename = "returns")]
    pub ret: VarType,
}

impl Declare {
    /// Symbol looked up in the library.
    pub fn symbol(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Position of a statement marker in the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatementBoundary {
    pub offset: usize,
    pub line: u32,
    pub start_col: u16,
    pub end_col: u16,
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: Opcode,
    pub a: u32,
    pub b: u32,
    /// Encoded length in bytes.
    pub len: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    pub code: Vec<u8>,
    pub pool: Vec<PoolEntry>,
    pub procedures: Vec<Procedure>,
    #[serde(default)]
    pub declares: Vec<Declare>,
    /// `OPTION EXPLICIT`: implicit variables are not allowed.
    #[serde(default)]
    pub explicit: bool,
    /// `OPTION COMPARE TEXT`.
    #[serde(default)]
    pub compare_text: bool,
}

impl Image {
    pub fn from_json(s: &str) -> Result<Self, ImageError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn to_json(&self) -> Result<String, ImageError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let bytes = self.code.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn decode(&self, pc: usize) -> Result<Instruction, ImageError> {
        let byte = *self.code.get(pc).ok_or(ImageError::Truncated(pc))?;
        let op = Opcode::from_repr(byte).ok_or(ImageError::UnknownOpcode(byte, pc))?;
        let arity = op.arity();
        let mut operands = [0u32; 2];
        for (i, slot) in operands.iter_mut().enumerate().take(arity) {
            *slot = self
                .read_u32(pc + 1 + 4 * i)
                .ok_or(ImageError::Truncated(pc))?;
        }
        let mut len = 1 + 4 * arity;
        if op == Opcode::OnJump {
            // Jump table words follow the instruction inline.
            let targets = (operands[0] & !opcode::GOSUB_FLAG) as usize;
            len += 4 * targets;
            if pc + len > self.code.len() {
                return Err(ImageError::Truncated(pc));
            }
        }
        Ok(Instruction {
            op,
            a: operands[0],
            b: operands[1],
            len,
        })
    }

    /// The first statement marker at or after `offset`, which must be an
    /// instruction boundary.
    pub fn next_statement(&self, offset: usize) -> Option<StatementBoundary> {
        let mut pc = offset;
        while pc < self.code.len() {
            let ins = self.decode(pc).ok()?;
            if ins.op == Opcode::Stmnt {
                return Some(StatementBoundary {
                    offset: pc,
                    line: ins.a,
                    start_col: (ins.b & 0xFFFF) as u16,
                    end_col: (ins.b >> 16) as u16,
                });
            }
            pc += ins.len;
        }
        None
    }

    /// Targets of the `ONJUMP` at `pc`.
    pub fn jump_table(&self, pc: usize, ins: &Instruction) -> Vec<u32> {
        let count = (ins.a & !opcode::GOSUB_FLAG) as usize;
        (0..count)
            .filter_map(|i| self.read_u32(pc + 5 + 4 * i))
            .collect()
    }

    pub fn string(&self, id: u32) -> Option<&str> {
        self.pool.get(id as usize).map(|e| e.text.as_str())
    }

    pub fn literal(&self, id: u32) -> Option<&PoolEntry> {
        self.pool.get(id as usize)
    }

    pub fn find_procedure(&self, name: &str) -> Option<(u32, &Procedure)> {
        self.procedures
            .iter()
            .enumerate()
            .find(|(_, p)| p.name.eq_ignore_ascii_case(name))
            .map(|(i, p)| (i as u32, p))
    }

    /// End offset (exclusive) of a procedure's code: the next procedure's
    /// entry, or the end of the image.
    pub fn procedure_end(&self, idx: u32) -> usize {
        let Some(entry) = self.procedures.get(idx as usize).map(|p| p.entry) else {
            return self.code.len();
        };
        self.procedures
            .iter()
            .map(|p| p.entry)
            .filter(|&e| e > entry)
            .min()
            .map_or(self.code.len(), |e| e as usize)
    }

    /// Human-readable listing, one instruction per line.
    pub fn disassemble(&self) -> Result<String, ImageError> {
        let mut out = String::new();
        let mut pc = 0;
        while pc < self.code.len() {
            for p in self.procedures.iter().filter(|p| p.entry as usize == pc) {
                let _ = writeln!(out, "{}:", p.name);
            }
            let ins = self.decode(pc)?;
            let _ = write!(out, "{pc:06}  {:<14}", ins.op.to_string());
            if ins.op == Opcode::OnJump {
                let targets: Vec<String> = self
                    .jump_table(pc, &ins)
                    .iter()
                    .map(u32::to_string)
                    .collect();
                let kind = if ins.a & opcode::GOSUB_FLAG != 0 { "gosub" } else { "goto" };
                let _ = writeln!(out, "{kind} [{}]", targets.join(", "));
                pc += ins.len;
                continue;
            }
            match ins.op.arity() {
                1 => {
                    let _ = write!(out, "{}", ins.a);
                }
                2 => {
                    let _ = write!(out, "{}, {}", ins.a, ins.b);
                }
                _ => {}
            }
            if let Some(note) = self.annotate(&ins) {
                let _ = write!(out, "  ; {note}");
            }
            out.push('\n');
            pc += ins.len;
        }
        Ok(out)
    }

    fn annotate(&self, ins: &Instruction) -> Option<String> {
        match ins.op {
            Opcode::Number | Opcode::String | Opcode::ArgN => self.string(ins.a).map(str::to_string),
            Opcode::Rtl
            | Opcode::Find
            | Opcode::Elem
            | Opcode::Local
            | Opcode::Public
            | Opcode::Static => {
                let name = self.string(ins.a & !opcode::ARGS_FLAG)?;
                let args = if ins.a & opcode::ARGS_FLAG != 0 { "()" } else { "" };
                Some(format!("{name}{args}"))
            }
            Opcode::Call => self.declares.get(ins.a as usize).map(|d| d.name.clone()),
            _ => None,
        }
    }
}
