//! Bytecode emission.

use vex_types::{StackOffset, SymbolId};

use crate::Op;

/// Append-only bytecode writer.
///
/// The writer is deliberately dumb: the compiler emits destination slots and
/// operands in exactly the order and widths the opcode table declares, and
/// the program validator re-walks the result. Emitting the same instruction
/// stream twice yields byte-identical code.
#[derive(Debug, Default, Clone)]
pub struct Assembler {
    code: Vec<u8>,
}

impl Assembler {
    /// New empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current write position (the next instruction's address).
    pub fn pc(&self) -> usize {
        self.code.len()
    }

    /// Begin an instruction; returns its address.
    pub fn op(&mut self, op: Op) -> usize {
        let at = self.code.len();
        self.code.extend_from_slice(&(op as u16).to_le_bytes());
        at
    }

    /// Emit a value-stack slot operand.
    pub fn slot(&mut self, slot: StackOffset) {
        self.code.extend_from_slice(&slot.to_le_bytes());
    }

    /// Emit an unsigned 16-bit immediate.
    pub fn imm16(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    /// Emit a signed 64-bit immediate.
    pub fn imm_i64(&mut self, v: i64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    /// Emit a float immediate.
    pub fn imm_f64(&mut self, v: f64) {
        self.code.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    /// Emit an unsigned 64-bit immediate.
    pub fn imm_u64(&mut self, v: u64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    /// Emit a literal reference: vmm offset then length.
    pub fn lit_ref(&mut self, offset: u32, len: u32) {
        self.code.extend_from_slice(&offset.to_le_bytes());
        self.code.extend_from_slice(&len.to_le_bytes());
    }

    /// Emit a dictionary payload index.
    pub fn dict_ref(&mut self, idx: u16) {
        self.code.extend_from_slice(&idx.to_le_bytes());
    }

    /// Emit an aggregation-slot byte offset.
    pub fn agg_slot(&mut self, offset: u32) {
        self.code.extend_from_slice(&offset.to_le_bytes());
    }

    /// Emit an interned symbol identifier.
    pub fn symbol(&mut self, sym: SymbolId) {
        self.code.extend_from_slice(&sym.get().to_le_bytes());
    }

    /// Overwrite a previously emitted 16-bit field.
    pub fn patch_u16(&mut self, at: usize, v: u16) {
        self.code[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    /// Overwrite a previously emitted 32-bit field.
    pub fn patch_u32(&mut self, at: usize, v: u32) {
        self.code[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Finish, yielding the raw bytecode.
    pub fn finish(self) -> Vec<u8> {
        self.code
    }

    /// Bytes emitted so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.code
    }
}
