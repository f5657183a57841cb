//! Lowering from optimized SSA to bytecode.
//!
//! Each scheduled value is assigned stack slots of its register class; slots
//! are released at their owner's last use, so a destination may reuse an
//! operand's slot (handlers read every source before writing a result).
//! Emission follows the opcode table's declared operand order and widths,
//! and the whole path is deterministic: compiling the same SSA against the
//! same symbol table yields byte-identical programs.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};

use vex_asm::{Assembler, Op, RegClass};
use vex_types::{Composer, StackOffset, Symtab};

use super::{
    optimize, schedule, symbolize, ArithOp, CaseMode, CmpOp, MathOp, OpKind, Prog, StrTestKind,
    TsField, Type, TypePred, ValueId,
};
use crate::agg::AggKind;
use crate::error::{CompileError, VmResult};
use crate::interpreter::{grouping::hash128, ENTRY_BASE_SLOT, ENTRY_MASK_SLOT};
use crate::memory::Segment;
use crate::program::{DictPayload, LikePattern, OutputContract, ProgFlags, Program};
use crate::stack::StackAllocator;

/// Knobs for one lowering run.
#[derive(Debug, Clone, Default)]
pub struct LowerParams {
    /// Inviolate scratch prefix carried by the produced program.
    pub scratch_reserve: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Slots {
    val: Option<StackOffset>,
    mask: Option<StackOffset>,
}

struct Lowering<'p> {
    prog: &'p Prog,
    asm: Assembler,
    stack: StackAllocator,
    slots: Vec<Slots>,
    literals: Vec<u8>,
    dict: Vec<DictPayload>,
    flags: ProgFlags,
    aux_count: usize,
}

/// Lower an optimized, symbolized program to bytecode.
pub fn lower(prog: &Prog, params: &LowerParams) -> VmResult<Program> {
    let order = schedule(prog);

    // Alias resolution: `mask_of(v)` shares v's slots.
    let root = |id: ValueId| -> ValueId {
        match prog.value(id).kind {
            OpKind::MaskOf => prog.value(id).args[0],
            _ => id,
        }
    };

    // Last use per alias root, in schedule positions.
    let mut pos = vec![usize::MAX; prog.len()];
    for (i, &v) in order.iter().enumerate() {
        pos[v.0 as usize] = i;
    }
    let mut last_use = vec![0usize; prog.len()];
    for &v in &order {
        let at = pos[v.0 as usize];
        for &a in &prog.value(v).args {
            let r = root(a);
            last_use[r.0 as usize] = last_use[r.0 as usize].max(at);
        }
    }

    let mut lo = Lowering {
        prog,
        asm: Assembler::new(),
        stack: StackAllocator::new(),
        slots: vec![Slots::default(); prog.len()],
        literals: Vec::new(),
        dict: Vec::new(),
        flags: ProgFlags::empty(),
        aux_count: 0,
    };

    // The entry protocol pins the caller-provided registers.
    lo.stack.reserve(RegClass::K, ENTRY_MASK_SLOT as StackOffset);
    lo.stack.reserve(RegClass::B, ENTRY_BASE_SLOT as StackOffset);

    let mut contract = OutputContract::Sink;
    for (i, &id) in order.iter().enumerate() {
        lo.emit(id, &mut contract)?;

        // Retire operands whose last use just happened.
        let mut seen = HashSet::new();
        for &a in &prog.value(id).args {
            let r = root(a);
            if last_use[r.0 as usize] == i && seen.insert(r) {
                lo.release(r);
            }
        }
    }

    let program = Program::new(
        lo.asm.finish(),
        lo.dict,
        lo.literals,
        lo.stack.stack_size(),
        lo.stack.hash_size(),
        params.scratch_reserve,
        lo.aux_count,
        lo.flags,
        contract,
    )?;
    tracing::debug!(
        code = program.code().len(),
        stack = program.stack_size(),
        literals = program.literals().len(),
        "lowered program"
    );
    Ok(program)
}

impl Lowering<'_> {
    fn val_slot(&self, id: ValueId) -> StackOffset {
        let r = self.alias(id);
        self.slots[r.0 as usize].val.expect("value slot assigned")
    }

    fn mask_slot(&self, id: ValueId) -> StackOffset {
        let r = self.alias(id);
        let s = &self.slots[r.0 as usize];
        match self.prog.value(id).kind {
            // A mask-typed value's own slot is its K slot.
            OpKind::MaskOf => s.mask.expect("mask pair assigned"),
            _ if self.prog.value(id).ty == Type::Mask => s.val.expect("mask slot assigned"),
            _ => s.mask.expect("mask pair assigned"),
        }
    }

    fn alias(&self, id: ValueId) -> ValueId {
        match self.prog.value(id).kind {
            OpKind::MaskOf => self.prog.value(id).args[0],
            _ => id,
        }
    }

    fn release(&mut self, id: ValueId) {
        let v = self.prog.value(id);
        if matches!(v.kind, OpKind::KInit | OpKind::BInit) {
            return;
        }
        let slots = std::mem::take(&mut self.slots[id.0 as usize]);
        if let (Some(slot), Some(rc)) = (slots.val, v.ty.regclass()) {
            self.stack.free(rc, slot);
        }
        if let Some(mask) = slots.mask {
            self.stack.free(RegClass::K, mask);
        }
    }

    fn alloc_out(&mut self, id: ValueId) -> Result<StackOffset, CompileError> {
        let rc = self
            .prog
            .value(id)
            .ty
            .regclass()
            .expect("output has a register class");
        let slot = self.stack.alloc(rc)?;
        self.slots[id.0 as usize].val = Some(slot);
        Ok(slot)
    }

    fn alloc_pair(&mut self, id: ValueId) -> Result<(StackOffset, StackOffset), CompileError> {
        let val = self.alloc_out(id)?;
        let mask = self.stack.alloc(RegClass::K)?;
        self.slots[id.0 as usize].mask = Some(mask);
        Ok((val, mask))
    }

    fn intern(&mut self, encoded: &[u8]) -> (u32, u32) {
        let off = self.literals.len() as u32;
        self.literals.extend_from_slice(encoded);
        (Segment::Literals.base() + off, encoded.len() as u32)
    }

    fn intern_str(&mut self, s: &str) -> (u32, u32) {
        let mut c = Composer::new();
        c.put_string(s);
        let bytes = c.take();
        self.intern(&bytes)
    }

    fn dict_entry(&mut self, payload: DictPayload) -> u16 {
        let idx = self.dict.len() as u16;
        self.dict.push(payload);
        idx
    }

    fn emit(&mut self, id: ValueId, contract: &mut OutputContract) -> VmResult<()> {
        use OpKind::*;
        let value = self.prog.value(id).clone();
        let args = &value.args;
        match &value.kind {
            // -- sources and non-emitting values ----------------------------
            KInit => {
                self.slots[id.0 as usize].val = Some(ENTRY_MASK_SLOT as StackOffset);
            }
            BInit => {
                self.flags |= ProgFlags::USES_BASE;
                self.slots[id.0 as usize].val = Some(ENTRY_BASE_SLOT as StackOffset);
            }
            MemInit | MemMerge => {}
            MaskOf => {}

            KFalse => {
                let d = self.alloc_out(id)?;
                self.asm.op(Op::FALSE_K);
                self.asm.slot(d);
            }
            Missing => {
                // The value register is never read: every consumer sees the
                // all-false mask first.
                let (_, mask) = self.alloc_pair(id)?;
                self.asm.op(Op::FALSE_K);
                self.asm.slot(mask);
            }

            ConstInt(v) => {
                let d = self.alloc_out(id)?;
                self.asm.op(Op::BROADCAST_I);
                self.asm.slot(d);
                self.asm.imm_i64(*v);
            }
            ConstTs(v) => {
                let d = self.alloc_out(id)?;
                self.asm.op(Op::BROADCAST_TS);
                self.asm.slot(d);
                self.asm.imm_i64(*v);
            }
            ConstFloat(v) => {
                let d = self.alloc_out(id)?;
                self.asm.op(Op::BROADCAST_F);
                self.asm.slot(d);
                self.asm.imm_f64(v.get());
            }
            LitValue(bytes) => {
                let (off, len) = self.intern(&bytes.clone());
                let d = self.alloc_out(id)?;
                self.asm.op(Op::BROADCAST_LIT);
                self.asm.slot(d);
                self.asm.lit_ref(off, len);
            }

            // -- masks ------------------------------------------------------
            MaskAnd | MaskOr | MaskXor | MaskAndn => {
                let op = match &value.kind {
                    MaskAnd => Op::AND_K,
                    MaskOr => Op::OR_K,
                    MaskXor => Op::XOR_K,
                    _ => Op::ANDN_K,
                };
                let (a, b) = (self.mask_slot(args[0]), self.mask_slot(args[1]));
                let d = self.alloc_out(id)?;
                self.asm.op(op);
                self.asm.slot(d);
                self.asm.slot(a);
                self.asm.slot(b);
            }

            // -- field access ----------------------------------------------
            LoadField(_) => {
                return Err(CompileError::Unsupported("unsymbolized field lookup").into());
            }
            FindSym(sym) => {
                let sym = *sym;
                let base = self.val_slot(args[0]);
                let mask = self.mask_slot(args[1]);
                let (dv, dk) = self.alloc_pair(id)?;
                self.asm.op(Op::FINDSYM);
                self.asm.slot(dv);
                self.asm.slot(dk);
                self.asm.slot(base);
                self.asm.symbol(sym);
                self.asm.slot(mask);
            }
            Tuple => {
                let v = self.val_slot(args[0]);
                let mask = self.mask_slot(args[1]);
                let d = self.alloc_out(id)?;
                self.asm.op(Op::TUPLE);
                self.asm.slot(d);
                self.asm.slot(v);
                self.asm.slot(mask);
            }
            IndexList(n) => {
                let n = *n;
                let v = self.val_slot(args[0]);
                let mask = self.mask_slot(args[1]);
                let (dv, dk) = self.alloc_pair(id)?;
                self.asm.op(Op::INDEX_LIST);
                self.asm.slot(dv);
                self.asm.slot(dk);
                self.asm.slot(v);
                self.asm.imm16(n);
                self.asm.slot(mask);
            }

            // -- unboxing ---------------------------------------------------
            ToI64 | ToF64 | ToTs | ToStr | ToSym => {
                let op = match &value.kind {
                    ToI64 => Op::TO_I64,
                    ToF64 => Op::TO_F64,
                    ToTs => Op::TO_TS,
                    ToStr => Op::TO_STR,
                    _ => Op::TO_SYM,
                };
                let v = self.val_slot(args[0]);
                let mask = self.mask_slot(args[1]);
                let (dv, dk) = self.alloc_pair(id)?;
                self.asm.op(op);
                self.asm.slot(dv);
                self.asm.slot(dk);
                self.asm.slot(v);
                self.asm.slot(mask);
            }

            // -- predicates -------------------------------------------------
            TypeIs(pred) => {
                let op = match pred {
                    TypePred::Null => Op::IS_NULL,
                    TypePred::Bool => Op::IS_BOOL,
                    TypePred::Int => Op::IS_INT,
                    TypePred::Float => Op::IS_FLOAT,
                    TypePred::Number => Op::IS_NUMBER,
                    TypePred::String => Op::IS_STRING,
                    TypePred::Symbol => Op::IS_SYMBOL,
                    TypePred::Timestamp => Op::IS_TS,
                    TypePred::List => Op::IS_LIST,
                    TypePred::Struct => Op::IS_STRUCT,
                    TypePred::True => Op::IS_TRUE,
                    TypePred::False => Op::IS_FALSE,
                };
                let v = self.val_slot(args[0]);
                let mask = self.mask_slot(args[1]);
                let d = self.alloc_out(id)?;
                self.asm.op(op);
                self.asm.slot(d);
                self.asm.slot(v);
                self.asm.slot(mask);
            }
            CheckTag(set) => {
                let set = *set;
                let v = self.val_slot(args[0]);
                let mask = self.mask_slot(args[1]);
                let d = self.alloc_out(id)?;
                self.asm.op(Op::CHECK_TAG);
                self.asm.slot(d);
                self.asm.slot(v);
                self.asm.imm16(set);
                self.asm.slot(mask);
            }

            // -- arithmetic -------------------------------------------------
            ArithI(op) => {
                let opc = int_arith_op(*op)?;
                self.emit_bin(id, opc, args, arith_makes_pair_i(*op))?;
            }
            ArithImmI(op, imm) => {
                let imm = *imm;
                let opc = int_arith_imm_op(*op)?;
                self.emit_bin_imm_i(id, opc, args, imm, arith_makes_pair_i(*op))?;
            }
            MathI(op) => {
                let opc = match op {
                    MathOp::Abs => Op::ABS_I,
                    MathOp::Neg => Op::NEG_I,
                    _ => return Err(CompileError::Unsupported("integer math op").into()),
                };
                self.emit_un(id, opc, args)?;
            }
            ArithF(op) => {
                let opc = float_arith_op(*op)?;
                self.emit_bin(id, opc, args, false)?;
            }
            ArithImmF(op, imm) => {
                let imm = imm.get();
                let opc = float_arith_imm_op(*op)?;
                let a = self.val_slot(args[0]);
                let mask = self.mask_slot(args[1]);
                let d = self.alloc_out(id)?;
                self.asm.op(opc);
                self.asm.slot(d);
                self.asm.slot(a);
                self.asm.imm_f64(imm);
                self.asm.slot(mask);
            }
            MathF(op) => {
                let opc = float_math_op(*op);
                self.emit_un(id, opc, args)?;
            }
            CvtI2F => self.emit_un(id, Op::CVT_I2F, args)?,
            CvtF2I | CvtFloorF2I | CvtCeilF2I => {
                let opc = match &value.kind {
                    CvtF2I => Op::CVT_F2I,
                    CvtFloorF2I => Op::CVT_FLOOR_F2I,
                    _ => Op::CVT_CEIL_F2I,
                };
                let a = self.val_slot(args[0]);
                let mask = self.mask_slot(args[1]);
                let (dv, dk) = self.alloc_pair(id)?;
                self.asm.op(opc);
                self.asm.slot(dv);
                self.asm.slot(dk);
                self.asm.slot(a);
                self.asm.slot(mask);
            }

            // -- comparisons ------------------------------------------------
            CmpI(op) => self.emit_bin(id, int_cmp_op(*op), args, false)?,
            CmpF(op) => self.emit_bin(id, float_cmp_op(*op), args, false)?,
            CmpImmI(op, imm) => {
                let imm = *imm;
                self.emit_bin_imm_i(id, int_cmp_imm_op(*op), args, imm, false)?;
            }
            CmpImmF(op, imm) => {
                let imm = imm.get();
                let opc = float_cmp_imm_op(*op);
                let a = self.val_slot(args[0]);
                let mask = self.mask_slot(args[1]);
                let d = self.alloc_out(id)?;
                self.asm.op(opc);
                self.asm.slot(d);
                self.asm.slot(a);
                self.asm.imm_f64(imm);
                self.asm.slot(mask);
            }
            CmpEqV => self.emit_bin(id, Op::CMP_EQ_V, args, false)?,
            SortCmpV => self.emit_bin(id, Op::SORTCMP_V, args, false)?,
            CmpLitStr(op, mode, s) => {
                let s = s.clone();
                let opc = match (op, mode) {
                    (CmpOp::Eq, CaseMode::Sensitive) => Op::CMP_LIT_EQ_CS,
                    (CmpOp::Eq, CaseMode::AsciiCi) => Op::CMP_LIT_EQ_CI,
                    (CmpOp::Eq, CaseMode::Utf8Ci) => Op::CMP_LIT_EQ_UTF8_CI,
                    (CmpOp::Lt, CaseMode::Sensitive) => Op::CMP_LIT_LT_CS,
                    (CmpOp::Gt, CaseMode::Sensitive) => Op::CMP_LIT_GT_CS,
                    _ => return Err(CompileError::Unsupported("string comparison form").into()),
                };
                let v = self.val_slot(args[0]);
                let mask = self.mask_slot(args[1]);
                let d = self.alloc_out(id)?;
                self.asm.op(opc);
                self.asm.slot(d);
                self.asm.slot(v);
                if opc == Op::CMP_LIT_EQ_UTF8_CI {
                    let folded: String = s.chars().flat_map(char::to_lowercase).collect();
                    let dict = self.dict_entry(DictPayload::Needle(folded));
                    self.asm.dict_ref(dict);
                } else {
                    let (off, len) = self.intern_str(&s);
                    self.asm.lit_ref(off, len);
                }
                self.asm.slot(mask);
            }

            // -- timestamps -------------------------------------------------
            TsExtract(field) => {
                let opc = match field {
                    TsField::Year => Op::TS_YEAR,
                    TsField::Month => Op::TS_MONTH,
                    TsField::Day => Op::TS_DAY,
                    TsField::Hour => Op::TS_HOUR,
                    TsField::Minute => Op::TS_MINUTE,
                    TsField::Second => Op::TS_SECOND,
                };
                self.emit_un(id, opc, args)?;
            }
            TsAdd(imm) => {
                let imm = *imm;
                self.emit_bin_imm_i(id, Op::TS_ADD, args, imm, false)?;
            }
            TsBucket(imm) => {
                let imm = *imm;
                self.emit_bin_imm_i(id, Op::TS_BUCKET, args, imm, false)?;
            }

            // -- strings ----------------------------------------------------
            StrTest(test, mode, s) => {
                let s = s.clone();
                let opc = match (test, mode) {
                    (StrTestKind::Prefix, CaseMode::Sensitive) => Op::HAS_PREFIX_CS,
                    (StrTestKind::Prefix, CaseMode::AsciiCi) => Op::HAS_PREFIX_CI,
                    (StrTestKind::Suffix, CaseMode::Sensitive) => Op::HAS_SUFFIX_CS,
                    (StrTestKind::Suffix, CaseMode::AsciiCi) => Op::HAS_SUFFIX_CI,
                    (StrTestKind::Contains, CaseMode::Sensitive) => Op::CONTAINS_CS,
                    (StrTestKind::Contains, CaseMode::AsciiCi) => Op::CONTAINS_CI,
                    _ => return Err(CompileError::Unsupported("string containment form").into()),
                };
                let v = self.val_slot(args[0]);
                let mask = self.mask_slot(args[1]);
                let d = self.alloc_out(id)?;
                let (off, len) = self.intern_str(&s);
                self.asm.op(opc);
                self.asm.slot(d);
                self.asm.slot(v);
                self.asm.lit_ref(off, len);
                self.asm.slot(mask);
            }
            Like { pattern, ci } => {
                let (pattern, ci) = (pattern.clone(), *ci);
                let v = self.val_slot(args[0]);
                let mask = self.mask_slot(args[1]);
                let d = self.alloc_out(id)?;
                let dict = self.dict_entry(DictPayload::Pattern(LikePattern::compile(
                    &pattern, ci,
                )));
                self.asm.op(if ci { Op::LIKE_CI } else { Op::LIKE });
                self.asm.slot(d);
                self.asm.slot(v);
                self.asm.dict_ref(dict);
                self.asm.slot(mask);
            }
            StrLen => self.emit_un(id, Op::STR_LEN, args)?,
            Trim(left, right) => {
                let opc = match (left, right) {
                    (true, true) => Op::TRIM_WS,
                    (true, false) => Op::TRIM_WS_LEFT,
                    _ => Op::TRIM_WS_RIGHT,
                };
                self.emit_un(id, opc, args)?;
            }
            Substr => {
                let v = self.val_slot(args[0]);
                let start = self.val_slot(args[1]);
                let len = self.val_slot(args[2]);
                let mask = self.mask_slot(args[3]);
                let d = self.alloc_out(id)?;
                self.asm.op(Op::SUBSTR);
                self.asm.slot(d);
                self.asm.slot(v);
                self.asm.slot(start);
                self.asm.slot(len);
                self.asm.slot(mask);
            }
            ConcatStr => self.emit_bin(id, Op::CONCAT_STR, args, false)?,

            // -- boxing -----------------------------------------------------
            BoxI | BoxF | BoxTs => {
                let opc = match &value.kind {
                    BoxI => Op::BOX_I,
                    BoxF => Op::BOX_F,
                    _ => Op::BOX_TS,
                };
                self.emit_un(id, opc, args)?;
            }
            BoxBool => {
                let values = self.mask_slot(args[0]);
                let mask = self.mask_slot(args[1]);
                let d = self.alloc_out(id)?;
                self.asm.op(Op::BOX_BOOL);
                self.asm.slot(d);
                self.asm.slot(values);
                self.asm.slot(mask);
            }

            // -- hashing and grouping ---------------------------------------
            HashV => self.emit_un(id, Op::HASH_V, args)?,
            HashMix => self.emit_bin(id, Op::HASH_MIX, args, false)?,
            HashMember(values) => {
                let set: hashbrown::HashSet<u128> =
                    values.iter().map(|v| hash128(v, 0)).collect();
                let v = self.val_slot(args[0]);
                let mask = self.mask_slot(args[1]);
                let d = self.alloc_out(id)?;
                let dict = self.dict_entry(DictPayload::HashSet(set));
                self.asm.op(Op::HASH_MEMBER);
                self.asm.slot(d);
                self.asm.slot(v);
                self.asm.dict_ref(dict);
                self.asm.slot(mask);
            }
            HashLookup(pairs) => {
                let pairs = pairs.clone();
                let mut map = HashMap::new();
                for (key, val) in &pairs {
                    let (off, len) = self.intern(val);
                    map.insert(hash128(key, 0), (off, len));
                }
                let h = self.val_slot(args[0]);
                let mask = self.mask_slot(args[1]);
                let (dv, dk) = self.alloc_pair(id)?;
                let dict = self.dict_entry(DictPayload::Lookup(map));
                self.asm.op(Op::HASH_LOOKUP);
                self.asm.slot(dv);
                self.asm.slot(dk);
                self.asm.slot(h);
                self.asm.dict_ref(dict);
                self.asm.slot(mask);
            }
            Bucket => {
                self.flags |= ProgFlags::USES_GROUPS;
                self.emit_un(id, Op::BUCKET, args)?;
            }

            // -- geo --------------------------------------------------------
            GeoHash(prec) => {
                let prec = *prec;
                let lat = self.val_slot(args[0]);
                let lon = self.val_slot(args[1]);
                let mask = self.mask_slot(args[2]);
                let d = self.alloc_out(id)?;
                self.asm.op(Op::GEO_HASH);
                self.asm.slot(d);
                self.asm.slot(lat);
                self.asm.slot(lon);
                self.asm.imm16(prec);
                self.asm.slot(mask);
            }
            GeoTileX => self.emit_bin(id, Op::GEO_TILE_X, args, false)?,
            GeoTileY => self.emit_bin(id, Op::GEO_TILE_Y, args, false)?,
            GeoDistance => {
                let slots: Vec<StackOffset> =
                    args[..4].iter().map(|&a| self.val_slot(a)).collect();
                let mask = self.mask_slot(args[4]);
                let d = self.alloc_out(id)?;
                self.asm.op(Op::GEO_DISTANCE);
                self.asm.slot(d);
                for s in slots {
                    self.asm.slot(s);
                }
                self.asm.slot(mask);
            }

            // -- aggregation ------------------------------------------------
            Agg(kind, off) => {
                let (kind, off) = (*kind, *off);
                self.flags |= ProgFlags::USES_AGG;
                self.asm.op(kind.op());
                self.asm.agg_slot(off);
                match kind {
                    AggKind::Count => {
                        let mask = self.mask_slot(args[1]);
                        self.asm.slot(mask);
                    }
                    AggKind::AndBool | AggKind::OrBool => {
                        let values = self.mask_slot(args[1]);
                        let mask = self.mask_slot(args[2]);
                        self.asm.slot(values);
                        self.asm.slot(mask);
                    }
                    _ => {
                        let src = self.val_slot(args[1]);
                        let mask = self.mask_slot(args[2]);
                        self.asm.slot(src);
                        self.asm.slot(mask);
                    }
                }
            }
            AggSlot(kind, packed) => {
                let (kind, packed) = (*kind, *packed);
                self.flags |= ProgFlags::USES_AGG | ProgFlags::USES_GROUPS;
                let opc = kind
                    .slot_op()
                    .ok_or(CompileError::Unsupported("grouped aggregate kind"))?;
                self.asm.op(opc);
                self.asm.agg_slot(packed);
                let bucket = self.val_slot(args[1]);
                if kind == AggKind::Count {
                    let mask = self.mask_slot(args[2]);
                    self.asm.slot(bucket);
                    self.asm.slot(mask);
                } else {
                    let src = self.val_slot(args[2]);
                    let mask = self.mask_slot(args[3]);
                    self.asm.slot(bucket);
                    self.asm.slot(src);
                    self.asm.slot(mask);
                }
            }

            // -- auxiliary bindings -----------------------------------------
            StoreAux(idx) => {
                let idx = *idx;
                self.flags |= ProgFlags::USES_AUX;
                self.aux_count = self.aux_count.max(idx as usize + 1);
                let v = self.val_slot(args[1]);
                let mask = self.mask_slot(args[2]);
                self.asm.op(Op::STORE_AUX);
                self.asm.imm16(idx);
                self.asm.slot(v);
                self.asm.slot(mask);
            }
            LoadAux(idx) => {
                let idx = *idx;
                self.flags |= ProgFlags::USES_AUX;
                self.aux_count = self.aux_count.max(idx as usize + 1);
                let (dv, dk) = self.alloc_pair(id)?;
                self.asm.op(Op::LOAD_AUX);
                self.asm.slot(dv);
                self.asm.slot(dk);
                self.asm.imm16(idx);
            }

            // -- epilogues --------------------------------------------------
            RetMask => {
                *contract = OutputContract::Mask;
                let mask = self.mask_slot(args[1]);
                self.asm.op(Op::RET_K);
                self.asm.slot(mask);
            }
            RetValue => {
                *contract = OutputContract::Value;
                let v = self.val_slot(args[1]);
                let mask = self.mask_slot(args[2]);
                self.asm.op(Op::RET_V);
                self.asm.slot(v);
                self.asm.slot(mask);
            }
            Ret => {
                *contract = OutputContract::Sink;
                self.asm.op(Op::RET);
            }
        }
        Ok(())
    }

    fn emit_un(&mut self, id: ValueId, opc: Op, args: &[ValueId]) -> VmResult<()> {
        let a = self.val_slot(args[0]);
        let mask = self.mask_slot(args[1]);
        if self.prog.has_mask_pair(id) {
            let (dv, dk) = self.alloc_pair(id)?;
            self.asm.op(opc);
            self.asm.slot(dv);
            self.asm.slot(dk);
        } else {
            let d = self.alloc_out(id)?;
            self.asm.op(opc);
            self.asm.slot(d);
        }
        self.asm.slot(a);
        self.asm.slot(mask);
        Ok(())
    }

    fn emit_bin(&mut self, id: ValueId, opc: Op, args: &[ValueId], pair: bool) -> VmResult<()> {
        let a = self.val_slot(args[0]);
        let b = self.val_slot(args[1]);
        let mask = self.mask_slot(args[2]);
        if pair {
            let (dv, dk) = self.alloc_pair(id)?;
            self.asm.op(opc);
            self.asm.slot(dv);
            self.asm.slot(dk);
        } else {
            let d = self.alloc_out(id)?;
            self.asm.op(opc);
            self.asm.slot(d);
        }
        self.asm.slot(a);
        self.asm.slot(b);
        self.asm.slot(mask);
        Ok(())
    }

    fn emit_bin_imm_i(
        &mut self,
        id: ValueId,
        opc: Op,
        args: &[ValueId],
        imm: i64,
        pair: bool,
    ) -> VmResult<()> {
        let a = self.val_slot(args[0]);
        let mask = self.mask_slot(args[1]);
        if pair {
            let (dv, dk) = self.alloc_pair(id)?;
            self.asm.op(opc);
            self.asm.slot(dv);
            self.asm.slot(dk);
        } else {
            let d = self.alloc_out(id)?;
            self.asm.op(opc);
            self.asm.slot(d);
        }
        self.asm.slot(a);
        self.asm.imm_i64(imm);
        self.asm.slot(mask);
        Ok(())
    }
}

fn arith_makes_pair_i(op: ArithOp) -> bool {
    matches!(op, ArithOp::Div | ArithOp::Mod)
}

fn int_arith_op(op: ArithOp) -> Result<Op, CompileError> {
    Ok(match op {
        ArithOp::Add => Op::ADD_I,
        ArithOp::Sub => Op::SUB_I,
        ArithOp::Mul => Op::MUL_I,
        ArithOp::Div => Op::DIV_I,
        ArithOp::Mod => Op::MOD_I,
        ArithOp::Min => Op::MIN_I,
        ArithOp::Max => Op::MAX_I,
        ArithOp::BitAnd => Op::AND_I,
        ArithOp::BitOr => Op::OR_I,
        ArithOp::BitXor => Op::XOR_I,
        ArithOp::Sll => Op::SLL_I,
        ArithOp::Srl => Op::SRL_I,
        ArithOp::Sra => Op::SRA_I,
        _ => return Err(CompileError::Unsupported("integer arithmetic op")),
    })
}

fn int_arith_imm_op(op: ArithOp) -> Result<Op, CompileError> {
    Ok(match op {
        ArithOp::Add => Op::ADD_IMM_I,
        ArithOp::Sub => Op::SUB_IMM_I,
        ArithOp::Mul => Op::MUL_IMM_I,
        ArithOp::Div => Op::DIV_IMM_I,
        ArithOp::Mod => Op::MOD_IMM_I,
        ArithOp::BitAnd => Op::AND_IMM_I,
        ArithOp::BitOr => Op::OR_IMM_I,
        ArithOp::BitXor => Op::XOR_IMM_I,
        ArithOp::Sll => Op::SLL_IMM_I,
        ArithOp::Srl => Op::SRL_IMM_I,
        ArithOp::Sra => Op::SRA_IMM_I,
        _ => return Err(CompileError::Unsupported("integer immediate arithmetic op")),
    })
}

fn float_arith_op(op: ArithOp) -> Result<Op, CompileError> {
    Ok(match op {
        ArithOp::Add => Op::ADD_F,
        ArithOp::Sub => Op::SUB_F,
        ArithOp::Mul => Op::MUL_F,
        ArithOp::Div => Op::DIV_F,
        ArithOp::Min => Op::MIN_F,
        ArithOp::Max => Op::MAX_F,
        ArithOp::Atan2 => Op::ATAN2_F,
        ArithOp::Pow => Op::POW_F,
        ArithOp::Hypot => Op::HYPOT_F,
        _ => return Err(CompileError::Unsupported("float arithmetic op")),
    })
}

fn float_arith_imm_op(op: ArithOp) -> Result<Op, CompileError> {
    Ok(match op {
        ArithOp::Add => Op::ADD_IMM_F,
        ArithOp::Sub => Op::SUB_IMM_F,
        ArithOp::Mul => Op::MUL_IMM_F,
        ArithOp::Div => Op::DIV_IMM_F,
        _ => return Err(CompileError::Unsupported("float immediate arithmetic op")),
    })
}

fn float_math_op(op: MathOp) -> Op {
    match op {
        MathOp::Abs => Op::ABS_F,
        MathOp::Neg => Op::NEG_F,
        MathOp::Sqrt => Op::SQRT_F,
        MathOp::Cbrt => Op::CBRT_F,
        MathOp::Exp => Op::EXP_F,
        MathOp::Expm1 => Op::EXPM1_F,
        MathOp::Ln => Op::LN_F,
        MathOp::Ln1p => Op::LN1P_F,
        MathOp::Log2 => Op::LOG2_F,
        MathOp::Log10 => Op::LOG10_F,
        MathOp::Sin => Op::SIN_F,
        MathOp::Cos => Op::COS_F,
        MathOp::Tan => Op::TAN_F,
        MathOp::Asin => Op::ASIN_F,
        MathOp::Acos => Op::ACOS_F,
        MathOp::Atan => Op::ATAN_F,
        MathOp::Floor => Op::FLOOR_F,
        MathOp::Ceil => Op::CEIL_F,
        MathOp::Trunc => Op::TRUNC_F,
        MathOp::Round => Op::ROUND_F,
        MathOp::RoundEven => Op::ROUND_EVEN_F,
    }
}

fn int_cmp_op(op: CmpOp) -> Op {
    match op {
        CmpOp::Eq => Op::CMP_EQ_I,
        CmpOp::Ne => Op::CMP_NE_I,
        CmpOp::Lt => Op::CMP_LT_I,
        CmpOp::Le => Op::CMP_LE_I,
        CmpOp::Gt => Op::CMP_GT_I,
        CmpOp::Ge => Op::CMP_GE_I,
    }
}

fn int_cmp_imm_op(op: CmpOp) -> Op {
    match op {
        CmpOp::Eq => Op::CMP_EQ_IMM_I,
        CmpOp::Ne => Op::CMP_NE_IMM_I,
        CmpOp::Lt => Op::CMP_LT_IMM_I,
        CmpOp::Le => Op::CMP_LE_IMM_I,
        CmpOp::Gt => Op::CMP_GT_IMM_I,
        CmpOp::Ge => Op::CMP_GE_IMM_I,
    }
}

fn float_cmp_op(op: CmpOp) -> Op {
    match op {
        CmpOp::Eq => Op::CMP_EQ_F,
        CmpOp::Ne => Op::CMP_NE_F,
        CmpOp::Lt => Op::CMP_LT_F,
        CmpOp::Le => Op::CMP_LE_F,
        CmpOp::Gt => Op::CMP_GT_F,
        CmpOp::Ge => Op::CMP_GE_F,
    }
}

fn float_cmp_imm_op(op: CmpOp) -> Op {
    match op {
        CmpOp::Eq => Op::CMP_EQ_IMM_F,
        CmpOp::Ne => Op::CMP_NE_IMM_F,
        CmpOp::Lt => Op::CMP_LT_IMM_F,
        CmpOp::Le => Op::CMP_LE_IMM_F,
        CmpOp::Gt => Op::CMP_GT_IMM_F,
        CmpOp::Ge => Op::CMP_GE_IMM_F,
    }
}

/// A compiled expression that re-symbolizes itself against each chunk's
/// symbol table, caching the program keyed on the table's fingerprint.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    ssa: Arc<Prog>,
    params: LowerParams,
    cache: Option<(u64, Program)>,
}

impl CompiledExpr {
    /// Wrap an unsymbolized SSA program.
    pub fn new(ssa: Prog) -> Self {
        Self {
            ssa: Arc::new(ssa),
            params: LowerParams::default(),
            cache: None,
        }
    }

    /// Wrap with explicit lowering parameters.
    pub fn with_params(ssa: Prog, params: LowerParams) -> Self {
        Self {
            ssa: Arc::new(ssa),
            params,
            cache: None,
        }
    }

    /// The unsymbolized source graph.
    pub fn ssa(&self) -> &Prog {
        &self.ssa
    }

    /// Bind to a symbol table, recompiling only when assignments changed.
    pub fn symbolize(&mut self, symtab: &Symtab) -> VmResult<&Program> {
        let sig = symtab.signature();
        let stale = match &self.cache {
            Some((cached, _)) => *cached != sig,
            None => true,
        };
        if stale {
            tracing::debug!(signature = sig, "symbolizing expression");
            let bound = symbolize(&self.ssa, symtab);
            let optimized = optimize(&bound);
            let program = lower(&optimized, &self.params)?;
            self.cache = Some((sig, program));
        }
        Ok(&self.cache.as_ref().expect("cache populated").1)
    }

    /// The currently bound program, if symbolize has run.
    pub fn program(&self) -> Option<&Program> {
        self.cache.as_ref().map(|(_, p)| p)
    }
}
