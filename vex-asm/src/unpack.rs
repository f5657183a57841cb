//! Functions for reading instruction operands at fixed offsets from the
//! program counter.

use vex_types::bytes;

use crate::{InvalidOpcode, Op};

/// Decode the opcode at `at`.
pub fn op_at(code: &[u8], at: usize) -> Result<Op, InvalidOpcode> {
    let raw = bytes::try_u16_le(code, at).ok_or(InvalidOpcode)?;
    Op::try_from(raw)
}

/// Read a 16-bit operand.
pub fn u16_at(code: &[u8], at: usize) -> Result<u16, InvalidOpcode> {
    bytes::try_u16_le(code, at).ok_or(InvalidOpcode)
}

/// Read a 32-bit operand.
pub fn u32_at(code: &[u8], at: usize) -> Result<u32, InvalidOpcode> {
    bytes::try_u32_le(code, at).ok_or(InvalidOpcode)
}

/// Read a 64-bit unsigned operand.
pub fn u64_at(code: &[u8], at: usize) -> Result<u64, InvalidOpcode> {
    bytes::try_u64_le(code, at).ok_or(InvalidOpcode)
}

/// Read a 64-bit signed operand.
pub fn i64_at(code: &[u8], at: usize) -> Result<i64, InvalidOpcode> {
    u64_at(code, at).map(|v| v as i64)
}

/// Read a float operand.
pub fn f64_at(code: &[u8], at: usize) -> Result<f64, InvalidOpcode> {
    u64_at(code, at).map(f64::from_bits)
}

/// Read a literal reference operand: (vmm offset, length).
pub fn lit_ref_at(code: &[u8], at: usize) -> Result<(u32, u32), InvalidOpcode> {
    Ok((u32_at(code, at)?, u32_at(code, at + 4)?))
}

/// Statistics gathered by [`scan`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeStats {
    /// Number of instructions in the stream.
    pub ops: usize,
    /// Sum of the table's per-op scratch reservations.
    pub scratch: usize,
    /// `true` when the final instruction is a `ret` family sink.
    pub terminated: bool,
}

/// Walk a bytecode stream, validating opcode ranges and operand lengths.
///
/// This is the static half of program validation; slot bounds are checked
/// by the interpreter against the program's declared stack size.
pub fn scan(code: &[u8]) -> Result<CodeStats, InvalidOpcode> {
    let mut stats = CodeStats::default();
    let mut pc = 0usize;
    while pc < code.len() {
        let op = op_at(code, pc)?;
        let end = pc + op.encoded_len();
        if end > code.len() {
            return Err(InvalidOpcode);
        }
        stats.ops += 1;
        stats.scratch += op.scratch();
        stats.terminated = matches!(op, Op::RET | Op::RET_K | Op::RET_V | Op::ABORT);
        pc = end;
    }
    if pc != code.len() {
        return Err(InvalidOpcode);
    }
    Ok(stats)
}
