//! Type predicates and whole-value comparisons.

use std::cmp::Ordering;

use vex_asm::{unpack, Fault, Op};
use vex_types::{read_bool, read_f64, read_int, read_timestamp, read_uint, Kind, LANE_COUNT};

use super::{ExecEnv, Machine, VReg};

fn kind_of(desc: u8) -> u8 {
    desc >> 4
}

fn is_null(desc: u8) -> bool {
    desc & 0x0f == 15 || kind_of(desc) == Kind::Null as u8
}

impl Machine {
    /// One of the `is_*` opcodes: a mask of lanes satisfying the predicate.
    pub(super) fn type_predicate(&mut self, op: Op, code: &[u8], pc: usize) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let v = self.slot_at(code, pc + 4)?;
        let k = self.slot_at(code, pc + 6)?;
        let vals = self.read_v(v)?;
        let mask = self.read_k(k)?;
        let mut out = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            let desc = vals.typel[lane];
            let kind = kind_of(desc);
            let null = is_null(desc);
            let hit = match op {
                Op::IS_NULL => null,
                Op::IS_BOOL => !null && kind == Kind::Bool as u8,
                Op::IS_INT => !null && (kind == Kind::Uint as u8 || kind == Kind::Int as u8),
                Op::IS_FLOAT => !null && kind == Kind::Float as u8,
                Op::IS_NUMBER => {
                    !null
                        && (kind == Kind::Uint as u8
                            || kind == Kind::Int as u8
                            || kind == Kind::Float as u8)
                }
                Op::IS_STRING => !null && kind == Kind::String as u8,
                Op::IS_SYMBOL => !null && kind == Kind::Symbol as u8,
                Op::IS_TS => !null && kind == Kind::Timestamp as u8,
                Op::IS_LIST => !null && kind == Kind::List as u8,
                Op::IS_STRUCT => !null && kind == Kind::Struct as u8,
                Op::IS_TRUE => !null && kind == Kind::Bool as u8 && read_bool(desc),
                Op::IS_FALSE => !null && kind == Kind::Bool as u8 && !read_bool(desc),
                _ => return Err(Fault::InvalidOpcode),
            };
            if hit {
                out |= 1 << lane;
            }
        }
        self.write_k(d, out)
    }

    /// Mask of lanes whose type tag is in the immediate bitset.
    pub(super) fn check_tag(&mut self, code: &[u8], pc: usize) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let v = self.slot_at(code, pc + 4)?;
        let set = unpack::u16_at(code, pc + 6).map_err(|_| Fault::InvalidOpcode)?;
        let k = self.slot_at(code, pc + 8)?;
        let vals = self.read_v(v)?;
        let mask = self.read_k(k)?;
        let mut out = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            let desc = vals.typel[lane];
            if !is_null(desc) && set & (1 << kind_of(desc)) != 0 {
                out |= 1 << lane;
            }
        }
        self.write_k(d, out)
    }

    /// Raw encoded equality of two value registers.
    pub(super) fn cmp_eq_v(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let a = self.slot_at(code, pc + 4)?;
        let b = self.slot_at(code, pc + 6)?;
        let k = self.slot_at(code, pc + 8)?;
        let av = self.read_v(a)?;
        let bv = self.read_v(b)?;
        let mask = self.read_k(k)?;
        let mut out = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            let ab = env.window.bytes(av.lane(lane))?;
            let bb = env.window.bytes(bv.lane(lane))?;
            if ab == bb {
                out |= 1 << lane;
            }
        }
        self.write_k(d, out)
    }

    /// Order comparator over two value registers: -1, 0 or 1 per lane.
    pub(super) fn sortcmp_v(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let a = self.slot_at(code, pc + 4)?;
        let b = self.slot_at(code, pc + 6)?;
        let k = self.slot_at(code, pc + 8)?;
        let av = self.read_v(a)?;
        let bv = self.read_v(b)?;
        let mask = self.read_k(k)?;
        let mut out = [0i64; LANE_COUNT];
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            let ord = compare_lane(env, &av, &bv, lane)?;
            out[lane] = match ord {
                Ordering::Less => -1,
                Ordering::Equal => 0,
                Ordering::Greater => 1,
            };
        }
        self.write_s_i64(d, &out)
    }
}

/// Rank of a value kind in the engine's total order.
fn class_rank(desc: u8) -> u8 {
    if is_null(desc) {
        return 0;
    }
    match kind_of(desc) {
        x if x == Kind::Bool as u8 => 1,
        x if x == Kind::Uint as u8 || x == Kind::Int as u8 || x == Kind::Float as u8 => 2,
        x if x == Kind::Timestamp as u8 => 3,
        x if x == Kind::String as u8 || x == Kind::Symbol as u8 => 4,
        x if x == Kind::List as u8 => 5,
        _ => 6,
    }
}

fn numeric_value(desc: u8, body: &[u8]) -> Result<f64, Fault> {
    Ok(match kind_of(desc) {
        x if x == Kind::Uint as u8 => read_uint(body)? as f64,
        x if x == Kind::Int as u8 => read_int(Kind::Int, body)? as f64,
        _ => read_f64(body)?,
    })
}

fn compare_lane(
    env: &ExecEnv<'_, '_>,
    a: &VReg,
    b: &VReg,
    lane: usize,
) -> Result<Ordering, Fault> {
    let (da, db) = (a.typel[lane], b.typel[lane]);
    let rank = class_rank(da).cmp(&class_rank(db));
    if rank != Ordering::Equal {
        return Ok(rank);
    }
    let ab = env.window.bytes(a.body(lane))?;
    let bb = env.window.bytes(b.body(lane))?;
    Ok(match class_rank(da) {
        0 => Ordering::Equal,
        1 => read_bool(da).cmp(&read_bool(db)),
        2 => numeric_value(da, ab)?
            .partial_cmp(&numeric_value(db, bb)?)
            .unwrap_or(Ordering::Equal),
        3 => read_timestamp(ab)?.cmp(&read_timestamp(bb)?),
        _ => ab.cmp(bb),
    })
}
