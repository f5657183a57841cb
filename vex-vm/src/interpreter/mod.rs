//! The bytecode interpreter.
//!
//! Every opcode runs to completion on 16 lanes under a predicate mask; the
//! dispatch loop never suspends. A handler that detects an invariant
//! violation stores a categorical [`Fault`] and aborts the whole program.

use std::sync::Arc;

use vex_asm::{unpack, Fault, Op, RegClass};
use vex_types::{bytes, LaneMask, VmRef, LANE_COUNT};

use crate::agg::GroupTable;
use crate::memory::Window;
use crate::program::{ProgFlags, Program};

mod arith;
mod boxing;
mod cmp;
mod find;
mod geo;
pub(crate) mod grouping;
mod strings;
mod ts;

/// Value-stack offset of the entry mask (reserved by the compiler).
pub const ENTRY_MASK_SLOT: usize = 0;

/// Value-stack offset of the row-base register (reserved by the compiler).
pub const ENTRY_BASE_SLOT: usize = 8;

/// A V register: 16 value references with their descriptor and header bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VReg {
    /// Window offsets of the referenced values.
    pub offs: [u32; LANE_COUNT],
    /// Byte lengths of the referenced values.
    pub lens: [u32; LANE_COUNT],
    /// Descriptor byte of each lane's value.
    pub typel: [u8; LANE_COUNT],
    /// Header length of each lane's value (0 once stripped).
    pub hlen: [u8; LANE_COUNT],
}

impl VReg {
    pub(crate) fn read_from(buf: &[u8], off: usize) -> Self {
        let mut v = Self::default();
        v.offs = bytes::read_u32x16(&buf[off..off + 64]);
        v.lens = bytes::read_u32x16(&buf[off + 64..off + 128]);
        v.typel.copy_from_slice(&buf[off + 128..off + 144]);
        v.hlen.copy_from_slice(&buf[off + 144..off + 160]);
        v
    }

    pub(crate) fn write_to(&self, buf: &mut [u8], off: usize) {
        bytes::write_u32x16(&mut buf[off..off + 64], &self.offs);
        bytes::write_u32x16(&mut buf[off + 64..off + 128], &self.lens);
        buf[off + 128..off + 144].copy_from_slice(&self.typel);
        buf[off + 144..off + 160].copy_from_slice(&self.hlen);
    }

    /// The full encoded-value reference of one lane.
    pub fn lane(&self, lane: usize) -> VmRef {
        VmRef::new(self.offs[lane], self.lens[lane])
    }

    /// The body reference of one lane (header stripped).
    pub fn body(&self, lane: usize) -> VmRef {
        self.lane(lane).skip(self.hlen[lane] as u32)
    }

    /// Install a lane from a reference and its decoded descriptor.
    pub fn set_lane(&mut self, lane: usize, r: VmRef, descriptor: u8, header_len: u8) {
        self.offs[lane] = r.offset();
        self.lens[lane] = r.len();
        self.typel[lane] = descriptor;
        self.hlen[lane] = header_len;
    }
}

/// One auxiliary binding: a value register plus the mask it was stored under.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuxOut {
    /// Stored values.
    pub vals: VReg,
    /// Lanes the values are defined for.
    pub mask: LaneMask,
}

/// External state an execution may bind.
pub struct ExecEnv<'w, 'a> {
    /// The reference window (chunk, literals, scratch).
    pub window: &'w mut Window<'a>,
    /// Aggregation buffer, when the program writes aggregates. Grouped
    /// programs grow it as new groups appear mid-chunk.
    pub agg: Option<&'w mut Vec<u8>>,
    /// Group table, when the program resolves group slots.
    pub groups: Option<&'w mut GroupTable>,
}

/// One execution of a program: value stacks, scratch cursor and outputs.
///
/// Machines are per worker; a pipeline running in parallel clones the
/// program and gives each worker its own machine.
#[derive(Debug)]
pub struct Machine {
    prog: Program,
    stack: Vec<u8>,
    hstack: Vec<u8>,
    aux: Vec<AuxOut>,
    out_mask: LaneMask,
    out_value: Option<(VReg, LaneMask)>,
    fault: Option<Fault>,
}

impl Machine {
    /// Build an execution state for a program.
    pub fn new(prog: Program) -> Self {
        let stack = vec![0u8; prog.stack_size().max(ENTRY_BASE_SLOT + RegClass::B.size())];
        let hstack = vec![0u8; prog.hash_size()];
        let aux = vec![AuxOut::default(); prog.aux_count()];
        Self {
            prog,
            stack,
            hstack,
            aux,
            out_mask: 0,
            out_value: None,
            fault: None,
        }
    }

    /// The program this machine executes.
    pub fn program(&self) -> &Program {
        &self.prog
    }

    /// The sticky fault from the last failed entry.
    pub fn fault(&self) -> Option<Fault> {
        self.fault
    }

    /// Mask returned by the last `ret_k`.
    pub fn out_mask(&self) -> LaneMask {
        self.out_mask
    }

    /// Value register returned by the last `ret_v`.
    pub fn out_value(&self) -> Option<(VReg, LaneMask)> {
        self.out_value
    }

    /// Auxiliary output written by `store_aux`.
    pub fn aux(&self, idx: usize) -> AuxOut {
        self.aux[idx]
    }

    /// Execute the program over one 16-lane group.
    ///
    /// The caller provides the row-base register and the live-lane mask;
    /// scratch resets to the reserved prefix before dispatch.
    pub fn run_group(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        base: &VReg,
        mask: LaneMask,
    ) -> Result<(), Fault> {
        self.out_mask = 0;
        self.out_value = None;
        for aux in &mut self.aux {
            *aux = AuxOut::default();
        }
        env.window.reset_scratch();

        self.write_k(ENTRY_MASK_SLOT, mask)?;
        if self.prog.flags().contains(ProgFlags::USES_BASE) {
            self.write_b(ENTRY_BASE_SLOT, base, mask)?;
        }

        match self.dispatch(env) {
            Ok(()) => Ok(()),
            Err(fault) => {
                self.fault = Some(fault);
                Err(fault)
            }
        }
    }

    fn dispatch(&mut self, env: &mut ExecEnv<'_, '_>) -> Result<(), Fault> {
        let code: Arc<Vec<u8>> = self.prog.code_arc();
        let code = code.as_slice();
        let mut pc = 0usize;
        loop {
            let op = unpack::op_at(code, pc).map_err(|_| Fault::InvalidOpcode)?;
            match op {
                // -- epilogues ----------------------------------------------
                Op::RET => return Ok(()),
                Op::RET_K => {
                    let k = self.slot_at(code, pc + 2)?;
                    self.out_mask = self.read_k(k)?;
                    return Ok(());
                }
                Op::RET_V => {
                    let v = self.slot_at(code, pc + 2)?;
                    let k = self.slot_at(code, pc + 4)?;
                    let mask = self.read_k(k)?;
                    self.out_value = Some((self.read_v(v)?, mask));
                    self.out_mask = mask;
                    return Ok(());
                }
                Op::ABORT => {
                    let raw = unpack::u16_at(code, pc + 2).map_err(|_| Fault::InvalidOpcode)?;
                    return Err(Fault::from(raw as u8));
                }

                // -- masks and moves ----------------------------------------
                Op::INIT_K => {
                    let d = self.slot_at(code, pc + 2)?;
                    let m = self.read_k(ENTRY_MASK_SLOT)?;
                    self.write_k(d, m)?;
                }
                Op::INIT_B => {
                    let d = self.slot_at(code, pc + 2)?;
                    let (b, m) = self.read_b(ENTRY_BASE_SLOT)?;
                    self.write_b(d, &b, m)?;
                }
                Op::FALSE_K => {
                    let d = self.slot_at(code, pc + 2)?;
                    self.write_k(d, 0)?;
                }
                Op::MOV_K => {
                    let d = self.slot_at(code, pc + 2)?;
                    let s = self.slot_at(code, pc + 4)?;
                    let m = self.read_k(s)?;
                    self.write_k(d, m)?;
                }
                Op::AND_K => self.mask2(code, pc, |a, b| a & b)?,
                Op::OR_K => self.mask2(code, pc, |a, b| a | b)?,
                Op::XOR_K => self.mask2(code, pc, |a, b| a ^ b)?,
                Op::ANDN_K => self.mask2(code, pc, |a, b| !a & b)?,
                Op::MOV_S => {
                    let d = self.slot_at(code, pc + 2)?;
                    let s = self.slot_at(code, pc + 4)?;
                    let v = self.read_s_u64(s)?;
                    self.write_s_u64(d, &v)?;
                }
                Op::MOV_V => {
                    let d = self.slot_at(code, pc + 2)?;
                    let s = self.slot_at(code, pc + 4)?;
                    let v = self.read_v(s)?;
                    self.write_v(d, &v)?;
                }
                Op::MOV_B => {
                    let d = self.slot_at(code, pc + 2)?;
                    let s = self.slot_at(code, pc + 4)?;
                    let (b, m) = self.read_b(s)?;
                    self.write_b(d, &b, m)?;
                }

                // -- broadcasts ---------------------------------------------
                Op::BROADCAST_I | Op::BROADCAST_TS => {
                    let d = self.slot_at(code, pc + 2)?;
                    let imm = unpack::i64_at(code, pc + 4).map_err(|_| Fault::InvalidOpcode)?;
                    self.write_s_i64(d, &[imm; LANE_COUNT])?;
                }
                Op::BROADCAST_F => {
                    let d = self.slot_at(code, pc + 2)?;
                    let imm = unpack::f64_at(code, pc + 4).map_err(|_| Fault::InvalidOpcode)?;
                    self.write_s_f64(d, &[imm; LANE_COUNT])?;
                }
                Op::BROADCAST_LIT => self.broadcast_lit(code, pc)?,

                // -- field access and unboxing ------------------------------
                Op::FINDSYM => self.findsym(env, code, pc)?,
                Op::TUPLE => self.tuple(env, code, pc)?,
                Op::INDEX_LIST => self.index_list(env, code, pc)?,
                Op::TO_I64 => self.unbox_i64(env, code, pc)?,
                Op::TO_F64 => self.unbox_f64(env, code, pc)?,
                Op::TO_TS => self.unbox_ts(env, code, pc)?,
                Op::TO_STR => self.unbox_str(code, pc)?,
                Op::TO_SYM => self.unbox_sym(env, code, pc)?,

                // -- type predicates ----------------------------------------
                Op::IS_NULL
                | Op::IS_BOOL
                | Op::IS_INT
                | Op::IS_FLOAT
                | Op::IS_NUMBER
                | Op::IS_STRING
                | Op::IS_SYMBOL
                | Op::IS_TS
                | Op::IS_LIST
                | Op::IS_STRUCT
                | Op::IS_TRUE
                | Op::IS_FALSE => self.type_predicate(op, code, pc)?,
                Op::CHECK_TAG => self.check_tag(code, pc)?,

                // -- integer arithmetic -------------------------------------
                Op::ADD_I => self.bin_i(code, pc, i64::wrapping_add)?,
                Op::SUB_I => self.bin_i(code, pc, i64::wrapping_sub)?,
                Op::MUL_I => self.bin_i(code, pc, i64::wrapping_mul)?,
                Op::DIV_I => self.bin_i_checked(code, pc, |a, b| a.checked_div(b))?,
                Op::MOD_I => self.bin_i_checked(code, pc, |a, b| a.checked_rem(b))?,
                Op::MIN_I => self.bin_i(code, pc, i64::min)?,
                Op::MAX_I => self.bin_i(code, pc, i64::max)?,
                Op::ABS_I => self.un_i(code, pc, i64::wrapping_abs)?,
                Op::NEG_I => self.un_i(code, pc, i64::wrapping_neg)?,
                Op::ADD_IMM_I => self.bin_i_imm(code, pc, i64::wrapping_add)?,
                Op::SUB_IMM_I => self.bin_i_imm(code, pc, i64::wrapping_sub)?,
                Op::MUL_IMM_I => self.bin_i_imm(code, pc, i64::wrapping_mul)?,
                Op::DIV_IMM_I => self.bin_i_imm_checked(code, pc, |a, b| a.checked_div(b))?,
                Op::MOD_IMM_I => self.bin_i_imm_checked(code, pc, |a, b| a.checked_rem(b))?,

                // -- bitwise ------------------------------------------------
                Op::AND_I => self.bin_i(code, pc, |a, b| a & b)?,
                Op::OR_I => self.bin_i(code, pc, |a, b| a | b)?,
                Op::XOR_I => self.bin_i(code, pc, |a, b| a ^ b)?,
                Op::SLL_I => self.bin_i(code, pc, shift_left)?,
                Op::SRL_I => self.bin_i(code, pc, shift_right_logical)?,
                Op::SRA_I => self.bin_i(code, pc, shift_right_arith)?,
                Op::AND_IMM_I => self.bin_i_imm(code, pc, |a, b| a & b)?,
                Op::OR_IMM_I => self.bin_i_imm(code, pc, |a, b| a | b)?,
                Op::XOR_IMM_I => self.bin_i_imm(code, pc, |a, b| a ^ b)?,
                Op::SLL_IMM_I => self.bin_i_imm(code, pc, shift_left)?,
                Op::SRL_IMM_I => self.bin_i_imm(code, pc, shift_right_logical)?,
                Op::SRA_IMM_I => self.bin_i_imm(code, pc, shift_right_arith)?,

                // -- float arithmetic ---------------------------------------
                Op::ADD_F => self.bin_f(code, pc, |a, b| a + b)?,
                Op::SUB_F => self.bin_f(code, pc, |a, b| a - b)?,
                Op::MUL_F => self.bin_f(code, pc, |a, b| a * b)?,
                Op::DIV_F => self.bin_f(code, pc, |a, b| a / b)?,
                Op::MIN_F => self.bin_f(code, pc, f64::min)?,
                Op::MAX_F => self.bin_f(code, pc, f64::max)?,
                Op::ABS_F => self.un_f(code, pc, f64::abs)?,
                Op::NEG_F => self.un_f(code, pc, |a| -a)?,
                Op::SQRT_F => self.un_f(code, pc, f64::sqrt)?,
                Op::CBRT_F => self.un_f(code, pc, f64::cbrt)?,
                Op::EXP_F => self.un_f(code, pc, f64::exp)?,
                Op::EXPM1_F => self.un_f(code, pc, f64::exp_m1)?,
                Op::LN_F => self.un_f(code, pc, f64::ln)?,
                Op::LN1P_F => self.un_f(code, pc, f64::ln_1p)?,
                Op::LOG2_F => self.un_f(code, pc, f64::log2)?,
                Op::LOG10_F => self.un_f(code, pc, f64::log10)?,
                Op::SIN_F => self.un_f(code, pc, f64::sin)?,
                Op::COS_F => self.un_f(code, pc, f64::cos)?,
                Op::TAN_F => self.un_f(code, pc, f64::tan)?,
                Op::ASIN_F => self.un_f(code, pc, f64::asin)?,
                Op::ACOS_F => self.un_f(code, pc, f64::acos)?,
                Op::ATAN_F => self.un_f(code, pc, f64::atan)?,
                Op::ATAN2_F => self.bin_f(code, pc, f64::atan2)?,
                Op::POW_F => self.bin_f(code, pc, f64::powf)?,
                Op::HYPOT_F => self.bin_f(code, pc, f64::hypot)?,
                Op::ADD_IMM_F => self.bin_f_imm(code, pc, |a, b| a + b)?,
                Op::SUB_IMM_F => self.bin_f_imm(code, pc, |a, b| a - b)?,
                Op::MUL_IMM_F => self.bin_f_imm(code, pc, |a, b| a * b)?,
                Op::DIV_IMM_F => self.bin_f_imm(code, pc, |a, b| a / b)?,
                Op::FLOOR_F => self.un_f(code, pc, f64::floor)?,
                Op::CEIL_F => self.un_f(code, pc, f64::ceil)?,
                Op::TRUNC_F => self.un_f(code, pc, f64::trunc)?,
                Op::ROUND_F => self.un_f(code, pc, f64::round)?,
                Op::ROUND_EVEN_F => self.un_f(code, pc, round_ties_even)?,
                Op::CVT_I2F => self.cvt_i2f(code, pc)?,
                Op::CVT_F2I => self.cvt_f2i(code, pc, f64::trunc)?,
                Op::CVT_FLOOR_F2I => self.cvt_f2i(code, pc, f64::floor)?,
                Op::CVT_CEIL_F2I => self.cvt_f2i(code, pc, f64::ceil)?,

                // -- comparisons --------------------------------------------
                Op::CMP_EQ_I => self.cmp_i(code, pc, |a, b| a == b)?,
                Op::CMP_NE_I => self.cmp_i(code, pc, |a, b| a != b)?,
                Op::CMP_LT_I => self.cmp_i(code, pc, |a, b| a < b)?,
                Op::CMP_LE_I => self.cmp_i(code, pc, |a, b| a <= b)?,
                Op::CMP_GT_I => self.cmp_i(code, pc, |a, b| a > b)?,
                Op::CMP_GE_I => self.cmp_i(code, pc, |a, b| a >= b)?,
                Op::CMP_EQ_IMM_I => self.cmp_i_imm(code, pc, |a, b| a == b)?,
                Op::CMP_NE_IMM_I => self.cmp_i_imm(code, pc, |a, b| a != b)?,
                Op::CMP_LT_IMM_I => self.cmp_i_imm(code, pc, |a, b| a < b)?,
                Op::CMP_LE_IMM_I => self.cmp_i_imm(code, pc, |a, b| a <= b)?,
                Op::CMP_GT_IMM_I => self.cmp_i_imm(code, pc, |a, b| a > b)?,
                Op::CMP_GE_IMM_I => self.cmp_i_imm(code, pc, |a, b| a >= b)?,
                Op::CMP_EQ_F => self.cmp_f(code, pc, |a, b| a == b)?,
                Op::CMP_NE_F => self.cmp_f(code, pc, |a, b| a != b)?,
                Op::CMP_LT_F => self.cmp_f(code, pc, |a, b| a < b)?,
                Op::CMP_LE_F => self.cmp_f(code, pc, |a, b| a <= b)?,
                Op::CMP_GT_F => self.cmp_f(code, pc, |a, b| a > b)?,
                Op::CMP_GE_F => self.cmp_f(code, pc, |a, b| a >= b)?,
                Op::CMP_EQ_IMM_F => self.cmp_f_imm(code, pc, |a, b| a == b)?,
                Op::CMP_NE_IMM_F => self.cmp_f_imm(code, pc, |a, b| a != b)?,
                Op::CMP_LT_IMM_F => self.cmp_f_imm(code, pc, |a, b| a < b)?,
                Op::CMP_LE_IMM_F => self.cmp_f_imm(code, pc, |a, b| a <= b)?,
                Op::CMP_GT_IMM_F => self.cmp_f_imm(code, pc, |a, b| a > b)?,
                Op::CMP_GE_IMM_F => self.cmp_f_imm(code, pc, |a, b| a >= b)?,
                Op::CMP_EQ_V => self.cmp_eq_v(env, code, pc)?,
                Op::SORTCMP_V => self.sortcmp_v(env, code, pc)?,
                Op::CMP_LIT_EQ_CS => self.cmp_lit(env, code, pc, strings::StrRel::Eq, false)?,
                Op::CMP_LIT_EQ_CI => self.cmp_lit(env, code, pc, strings::StrRel::Eq, true)?,
                Op::CMP_LIT_EQ_UTF8_CI => self.cmp_lit_utf8_ci(env, code, pc)?,
                Op::CMP_LIT_LT_CS => self.cmp_lit(env, code, pc, strings::StrRel::Lt, false)?,
                Op::CMP_LIT_GT_CS => self.cmp_lit(env, code, pc, strings::StrRel::Gt, false)?,

                // -- timestamps ---------------------------------------------
                Op::TS_YEAR => self.ts_extract(code, pc, ts::Field::Year)?,
                Op::TS_MONTH => self.ts_extract(code, pc, ts::Field::Month)?,
                Op::TS_DAY => self.ts_extract(code, pc, ts::Field::Day)?,
                Op::TS_HOUR => self.ts_extract(code, pc, ts::Field::Hour)?,
                Op::TS_MINUTE => self.ts_extract(code, pc, ts::Field::Minute)?,
                Op::TS_SECOND => self.ts_extract(code, pc, ts::Field::Second)?,
                Op::TS_ADD => self.bin_i_imm(code, pc, i64::wrapping_add)?,
                Op::TS_BUCKET => self.bin_i_imm(code, pc, |a, m| {
                    if m <= 0 {
                        0
                    } else {
                        a.div_euclid(m).wrapping_mul(m)
                    }
                })?,

                // -- strings ------------------------------------------------
                Op::HAS_PREFIX_CS => self.str_test(env, code, pc, strings::StrTest::Prefix, false)?,
                Op::HAS_PREFIX_CI => self.str_test(env, code, pc, strings::StrTest::Prefix, true)?,
                Op::HAS_SUFFIX_CS => self.str_test(env, code, pc, strings::StrTest::Suffix, false)?,
                Op::HAS_SUFFIX_CI => self.str_test(env, code, pc, strings::StrTest::Suffix, true)?,
                Op::CONTAINS_CS => self.str_test(env, code, pc, strings::StrTest::Contains, false)?,
                Op::CONTAINS_CI => self.str_test(env, code, pc, strings::StrTest::Contains, true)?,
                Op::LIKE | Op::LIKE_CI => self.like(env, code, pc)?,
                Op::STR_LEN => self.str_len(code, pc)?,
                Op::TRIM_WS => self.trim(env, code, pc, true, true)?,
                Op::TRIM_WS_LEFT => self.trim(env, code, pc, true, false)?,
                Op::TRIM_WS_RIGHT => self.trim(env, code, pc, false, true)?,
                Op::SUBSTR => self.substr(code, pc)?,
                Op::CONCAT_STR => self.concat_str(env, code, pc)?,

                // -- boxing -------------------------------------------------
                Op::BOX_I => self.box_int(env, code, pc)?,
                Op::BOX_F => self.box_float(env, code, pc)?,
                Op::BOX_TS => self.box_timestamp(env, code, pc)?,
                Op::BOX_BOOL => self.box_bool(env, code, pc)?,

                // -- hashing and grouping -----------------------------------
                Op::HASH_V => self.hash_value(env, code, pc)?,
                Op::HASH_MIX => self.hash_mix(env, code, pc)?,
                Op::HASH_MEMBER => self.hash_member(code, pc)?,
                Op::HASH_LOOKUP => self.hash_lookup(code, pc)?,
                Op::BUCKET => self.bucket(env, code, pc)?,

                // -- geo ----------------------------------------------------
                Op::GEO_HASH => self.geo_hash(env, code, pc)?,
                Op::GEO_TILE_X => self.geo_tile(code, pc, true)?,
                Op::GEO_TILE_Y => self.geo_tile(code, pc, false)?,
                Op::GEO_DISTANCE => self.geo_distance(code, pc)?,

                // -- aggregation --------------------------------------------
                Op::AGG_SUM_F
                | Op::AGG_SUM_I
                | Op::AGG_AVG_F
                | Op::AGG_AVG_I
                | Op::AGG_MIN_F
                | Op::AGG_MAX_F
                | Op::AGG_MIN_I
                | Op::AGG_MAX_I
                | Op::AGG_MIN_TS
                | Op::AGG_MAX_TS
                | Op::AGG_COUNT
                | Op::AGG_APPROX_COUNT
                | Op::AGG_AND_I
                | Op::AGG_OR_I
                | Op::AGG_XOR_I
                | Op::AGG_AND_BOOL
                | Op::AGG_OR_BOOL => self.agg_scalar(op, env, code, pc)?,
                Op::AGG_SLOT_SUM_F
                | Op::AGG_SLOT_SUM_I
                | Op::AGG_SLOT_AVG_F
                | Op::AGG_SLOT_AVG_I
                | Op::AGG_SLOT_MIN_F
                | Op::AGG_SLOT_MAX_F
                | Op::AGG_SLOT_MIN_I
                | Op::AGG_SLOT_MAX_I
                | Op::AGG_SLOT_COUNT => self.agg_grouped(op, env, code, pc)?,

                // -- auxiliary bindings -------------------------------------
                Op::STORE_AUX => {
                    let idx = unpack::u16_at(code, pc + 2).map_err(|_| Fault::InvalidOpcode)?;
                    let v = self.slot_at(code, pc + 4)?;
                    let k = self.slot_at(code, pc + 6)?;
                    let vals = self.read_v(v)?;
                    let mask = self.read_k(k)?;
                    let aux = self
                        .aux
                        .get_mut(idx as usize)
                        .ok_or(Fault::InvalidOpcode)?;
                    *aux = AuxOut { vals, mask };
                }
                Op::LOAD_AUX => {
                    let dv = self.slot_at(code, pc + 2)?;
                    let dk = self.slot_at(code, pc + 4)?;
                    let idx = unpack::u16_at(code, pc + 6).map_err(|_| Fault::InvalidOpcode)?;
                    let aux = *self.aux.get(idx as usize).ok_or(Fault::InvalidOpcode)?;
                    self.write_v(dv, &aux.vals)?;
                    self.write_k(dk, aux.mask)?;
                }
            }
            pc += op.encoded_len();
        }
    }

    /// Bytes of a literal reference into the program's literal arena.
    pub(crate) fn literal(&self, r: VmRef) -> Result<&[u8], Fault> {
        let lits = self.prog.literals();
        let off = (r.offset() as usize)
            .checked_sub(crate::memory::Segment::Literals.base() as usize)
            .ok_or(Fault::CorruptInput)?;
        lits.get(off..off + r.len() as usize)
            .ok_or(Fault::CorruptInput)
    }

    // -- slot access --------------------------------------------------------

    pub(crate) fn slot_at(&self, code: &[u8], at: usize) -> Result<usize, Fault> {
        unpack::u16_at(code, at)
            .map(|s| s as usize)
            .map_err(|_| Fault::InvalidOpcode)
    }

    fn check(&self, off: usize, len: usize) -> Result<(), Fault> {
        if off + len <= self.stack.len() {
            Ok(())
        } else {
            Err(Fault::StackOverflow)
        }
    }

    pub(crate) fn read_k(&self, off: usize) -> Result<LaneMask, Fault> {
        self.check(off, 2)?;
        Ok(bytes::u16_le(&self.stack, off))
    }

    pub(crate) fn write_k(&mut self, off: usize, mask: LaneMask) -> Result<(), Fault> {
        self.check(off, 2)?;
        bytes::put_u16_le(&mut self.stack, off, mask);
        Ok(())
    }

    pub(crate) fn read_s_u64(&self, off: usize) -> Result<[u64; LANE_COUNT], Fault> {
        self.check(off, RegClass::S.size())?;
        Ok(bytes::read_u64x16(&self.stack[off..]))
    }

    pub(crate) fn read_s_i64(&self, off: usize) -> Result<[i64; LANE_COUNT], Fault> {
        Ok(self.read_s_u64(off)?.map(|v| v as i64))
    }

    pub(crate) fn read_s_f64(&self, off: usize) -> Result<[f64; LANE_COUNT], Fault> {
        Ok(self.read_s_u64(off)?.map(f64::from_bits))
    }

    pub(crate) fn write_s_u64(&mut self, off: usize, lanes: &[u64; LANE_COUNT]) -> Result<(), Fault> {
        self.check(off, RegClass::S.size())?;
        bytes::write_u64x16(&mut self.stack[off..off + 128], lanes);
        Ok(())
    }

    pub(crate) fn write_s_i64(&mut self, off: usize, lanes: &[i64; LANE_COUNT]) -> Result<(), Fault> {
        self.write_s_u64(off, &lanes.map(|v| v as u64))
    }

    pub(crate) fn write_s_f64(&mut self, off: usize, lanes: &[f64; LANE_COUNT]) -> Result<(), Fault> {
        self.write_s_u64(off, &lanes.map(f64::to_bits))
    }

    pub(crate) fn read_l(&self, off: usize) -> Result<[u32; LANE_COUNT], Fault> {
        self.check(off, RegClass::L.size())?;
        Ok(bytes::read_u32x16(&self.stack[off..]))
    }

    pub(crate) fn write_l(&mut self, off: usize, lanes: &[u32; LANE_COUNT]) -> Result<(), Fault> {
        self.check(off, RegClass::L.size())?;
        bytes::write_u32x16(&mut self.stack[off..off + 64], lanes);
        Ok(())
    }

    pub(crate) fn read_v(&self, off: usize) -> Result<VReg, Fault> {
        self.check(off, RegClass::V.size())?;
        Ok(VReg::read_from(&self.stack, off))
    }

    pub(crate) fn write_v(&mut self, off: usize, v: &VReg) -> Result<(), Fault> {
        self.check(off, RegClass::V.size())?;
        v.write_to(&mut self.stack, off);
        Ok(())
    }

    pub(crate) fn read_b(&self, off: usize) -> Result<(VReg, LaneMask), Fault> {
        self.check(off, RegClass::B.size())?;
        let v = VReg::read_from(&self.stack, off);
        let mask = bytes::u16_le(&self.stack, off + RegClass::V.size());
        Ok((v, mask))
    }

    pub(crate) fn write_b(&mut self, off: usize, v: &VReg, mask: LaneMask) -> Result<(), Fault> {
        self.check(off, RegClass::B.size())?;
        v.write_to(&mut self.stack, off);
        bytes::put_u16_le(&mut self.stack, off + RegClass::V.size(), mask);
        Ok(())
    }

    pub(crate) fn read_h(&self, off: usize) -> Result<[u128; LANE_COUNT], Fault> {
        if off + RegClass::H.size() > self.hstack.len() {
            return Err(Fault::StackOverflow);
        }
        Ok(bytes::read_u128x16(&self.hstack[off..]))
    }

    pub(crate) fn write_h(&mut self, off: usize, lanes: &[u128; LANE_COUNT]) -> Result<(), Fault> {
        if off + RegClass::H.size() > self.hstack.len() {
            return Err(Fault::StackOverflow);
        }
        bytes::write_u128x16(&mut self.hstack[off..off + 256], lanes);
        Ok(())
    }

    fn mask2(&mut self, code: &[u8], pc: usize, f: fn(LaneMask, LaneMask) -> LaneMask) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let a = self.slot_at(code, pc + 4)?;
        let b = self.slot_at(code, pc + 6)?;
        let m = f(self.read_k(a)?, self.read_k(b)?);
        self.write_k(d, m)
    }
}

fn shift_left(a: i64, b: i64) -> i64 {
    if (0..64).contains(&b) {
        ((a as u64) << b) as i64
    } else {
        0
    }
}

fn shift_right_logical(a: i64, b: i64) -> i64 {
    if (0..64).contains(&b) {
        ((a as u64) >> b) as i64
    } else {
        0
    }
}

fn shift_right_arith(a: i64, b: i64) -> i64 {
    if (0..64).contains(&b) {
        a >> b
    } else if a < 0 {
        -1
    } else {
        0
    }
}

fn round_ties_even(a: f64) -> f64 {
    let r = a.round();
    if (a - a.trunc()).abs() == 0.5 && r % 2.0 != 0.0 {
        r - (r - a).signum()
    } else {
        r
    }
}
