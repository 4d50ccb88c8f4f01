//! Incremental image assembly with forward-referenced labels.

use super::opcode::{Opcode, ARGS_FLAG, GOSUB_FLAG};
use super::{Declare, Image, ImageError, ParamDecl, PoolEntry, Procedure};
use crate::value::VarType;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Emits instructions into an [`Image`]. Methods chain; jump targets may be
/// labels bound later, patched in [`ImageBuilder::finish`].
#[derive(Debug, Default)]
pub struct ImageBuilder {
    image: Image,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
    interned: HashMap<String, u32>,
}

impl ImageBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            image: Image {
                name: name.into(),
                ..Image::default()
            },
            ..Self::default()
        }
    }

    pub fn explicit(&mut self, on: bool) -> &mut Self {
        self.image.explicit = on;
        self
    }

    pub fn compare_text(&mut self, on: bool) -> &mut Self {
        self.image.compare_text = on;
        self
    }

    /// Current code offset.
    pub fn pos(&self) -> u32 {
        self.image.code.len() as u32
    }

    /// Untyped pool string, deduplicated.
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.interned.get(s) {
            return id;
        }
        let id = self.push_pool(s, None);
        self.interned.insert(s.to_string(), id);
        id
    }

    /// Numeric literal carrying its declared storage type.
    pub fn literal(&mut self, text: &str, ty: Option<VarType>) -> u32 {
        match ty {
            None => self.intern(text),
            Some(_) => self.push_pool(text, ty),
        }
    }

    fn push_pool(&mut self, text: &str, ty: Option<VarType>) -> u32 {
        self.image.pool.push(PoolEntry {
            text: text.to_string(),
            ty,
        });
        (self.image.pool.len() - 1) as u32
    }

    pub fn op(&mut self, op: Opcode) -> &mut Self {
        debug_assert_eq!(op.arity(), 0, "{op} takes operands");
        self.image.code.push(op as u8);
        self
    }

    pub fn op1(&mut self, op: Opcode, a: u32) -> &mut Self {
        debug_assert_eq!(op.arity(), 1, "{op} does not take one operand");
        self.image.code.push(op as u8);
        self.image.code.extend_from_slice(&a.to_le_bytes());
        self
    }

    pub fn op2(&mut self, op: Opcode, a: u32, b: u32) -> &mut Self {
        debug_assert_eq!(op.arity(), 2, "{op} does not take two operands");
        self.image.code.push(op as u8);
        self.image.code.extend_from_slice(&a.to_le_bytes());
        self.image.code.extend_from_slice(&b.to_le_bytes());
        self
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.pos());
        self
    }

    /// One-operand instruction whose operand is a code address.
    pub fn jump(&mut self, op: Opcode, label: Label) -> &mut Self {
        self.op1(op, 0);
        self.fixups.push((self.image.code.len() - 4, label));
        self
    }

    /// `ON n GOTO` / `ON n GOSUB` with its inline target table.
    pub fn on_jump(&mut self, targets: &[Label], gosub: bool) -> &mut Self {
        let mut count = targets.len() as u32;
        if gosub {
            count |= GOSUB_FLAG;
        }
        self.op1(Opcode::OnJump, count);
        for &label in targets {
            self.fixups.push((self.image.code.len(), label));
            self.image.code.extend_from_slice(&0u32.to_le_bytes());
        }
        self
    }

    pub fn stmnt(&mut self, line: u32) -> &mut Self {
        self.stmnt_cols(line, 0, 0)
    }

    pub fn stmnt_cols(&mut self, line: u32, start: u16, end: u16) -> &mut Self {
        self.op2(Opcode::Stmnt, line, start as u32 | (end as u32) << 16)
    }

    pub fn const_int(&mut self, n: i32) -> &mut Self {
        self.op1(Opcode::Const, n as u32)
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        let id = self.intern(s);
        self.op1(Opcode::String, id)
    }

    pub fn number(&mut self, text: &str) -> &mut Self {
        let id = self.intern(text);
        self.op1(Opcode::Number, id)
    }

    pub fn find(&mut self, name: &str, ty: VarType) -> &mut Self {
        let id = self.intern(name);
        self.op2(Opcode::Find, id, ty as u32)
    }

    /// `FIND` consuming the argument vector built just before it.
    pub fn find_args(&mut self, name: &str, ty: VarType) -> &mut Self {
        let id = self.intern(name);
        self.op2(Opcode::Find, id | ARGS_FLAG, ty as u32)
    }

    pub fn named_arg(&mut self, name: &str) -> &mut Self {
        let id = self.intern(name);
        self.op1(Opcode::ArgN, id)
    }

    pub fn local(&mut self, name: &str, ty: VarType) -> &mut Self {
        let id = self.intern(name);
        self.op2(Opcode::Local, id, ty as u32)
    }

    /// Register a procedure whose code starts at the current offset.
    pub fn procedure(
        &mut self,
        name: &str,
        params: Vec<ParamDecl>,
        ret: VarType,
        is_function: bool,
    ) -> u32 {
        self.image.procedures.push(Procedure {
            name: name.to_string(),
            entry: self.pos(),
            params,
            ret,
            is_function,
        });
        (self.image.procedures.len() - 1) as u32
    }

    pub fn declare(&mut self, decl: Declare) -> u32 {
        self.image.declares.push(decl);
        (self.image.declares.len() - 1) as u32
    }

    pub fn finish(mut self) -> Result<Image, ImageError> {
        for (at, label) in std::mem::take(&mut self.fixups) {
            let target = self.labels[label.0].ok_or(ImageError::UnboundLabel(label.0))?;
            self.image.code[at..at + 4].copy_from_slice(&target.to_le_bytes());
        }
        Ok(self.image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_labels_are_patched() {
        let mut b = ImageBuilder::new("t");
        let end = b.new_label();
        b.jump(Opcode::Jump, end).op(Opcode::Nop);
        b.bind(end).op(Opcode::Leave);
        let img = b.finish().unwrap();
        assert_eq!(img.read_u32(1), Some(6));
    }

    #[test]
    fn unbound_label_is_an_error() {
        let mut b = ImageBuilder::new("t");
        let l = b.new_label();
        b.jump(Opcode::Gosub, l);
        assert!(matches!(b.finish(), Err(ImageError::UnboundLabel(0))));
    }

    #[test]
    fn typed_literals_are_not_merged() {
        let mut b = ImageBuilder::new("t");
        let plain = b.intern("10");
        let again = b.intern("10");
        let typed = b.literal("10", Some(VarType::Long));
        assert_eq!(plain, again);
        assert_ne!(plain, typed);
    }
}
