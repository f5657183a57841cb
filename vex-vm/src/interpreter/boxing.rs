//! Boxing and unboxing between scalar lanes and encoded values.

use vex_asm::{unpack, Fault};
use vex_types::{read_f64, read_int, read_timestamp, read_uint, Kind, VmRef, LANE_COUNT};

use super::{ExecEnv, Machine, VReg};

const NULL_DESC: u8 = 0x0f;

fn kind_of(desc: u8) -> u8 {
    desc >> 4
}

fn is_null(desc: u8) -> bool {
    desc & 0x0f == 15 || kind_of(desc) == Kind::Null as u8
}

impl Machine {
    /// Broadcast an interned literal value to all lanes.
    pub(super) fn broadcast_lit(&mut self, code: &[u8], pc: usize) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let (off, len) = unpack::lit_ref_at(code, pc + 4).map_err(|_| Fault::InvalidOpcode)?;
        let r = VmRef::new(off, len);
        // The literal arena is part of the window, so reading the descriptor
        // goes through the same bounds checks as any other reference.
        let (desc, hlen) = {
            let bytes = self.literal(r)?;
            let header = vex_types::decode_header(bytes)?;
            (bytes[0], header.header_len as u8)
        };
        let mut out = VReg::default();
        for lane in 0..LANE_COUNT {
            out.set_lane(lane, r, desc, hlen);
        }
        self.write_v(d, &out)
    }

    /// Unbox integer lanes.
    pub(super) fn unbox_i64(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        self.unbox_scalar(env, code, pc, |desc, body| {
            let kind = kind_of(desc);
            if kind == Kind::Uint as u8 || kind == Kind::Int as u8 {
                let k = if kind == Kind::Uint as u8 { Kind::Uint } else { Kind::Int };
                Ok(Some(read_int(k, body)?))
            } else {
                Ok(None)
            }
        })
    }

    /// Unbox numeric lanes as floats; integers widen.
    pub(super) fn unbox_f64(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        let dv = self.slot_at(code, pc + 2)?;
        let dk = self.slot_at(code, pc + 4)?;
        let v = self.slot_at(code, pc + 6)?;
        let k = self.slot_at(code, pc + 8)?;
        let vals = self.read_v(v)?;
        let mask = self.read_k(k)?;
        let mut out = [0.0f64; LANE_COUNT];
        let mut ok = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            let desc = vals.typel[lane];
            if is_null(desc) {
                continue;
            }
            let body = env.window.bytes(vals.body(lane))?;
            let parsed = match kind_of(desc) {
                x if x == Kind::Uint as u8 => Some(read_uint(body)? as f64),
                x if x == Kind::Int as u8 => Some(read_int(Kind::Int, body)? as f64),
                x if x == Kind::Float as u8 => Some(read_f64(body)?),
                _ => None,
            };
            if let Some(value) = parsed {
                out[lane] = value;
                ok |= 1 << lane;
            }
        }
        self.write_s_f64(dv, &out)?;
        self.write_k(dk, ok)
    }

    /// Unbox timestamp lanes as epoch microseconds.
    pub(super) fn unbox_ts(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        self.unbox_scalar(env, code, pc, |desc, body| {
            if kind_of(desc) == Kind::Timestamp as u8 {
                Ok(Some(read_timestamp(body)?))
            } else {
                Ok(None)
            }
        })
    }

    /// Unbox symbol lanes as their identifiers.
    pub(super) fn unbox_sym(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        self.unbox_scalar(env, code, pc, |desc, body| {
            if kind_of(desc) == Kind::Symbol as u8 {
                Ok(Some(read_uint(body)? as i64))
            } else {
                Ok(None)
            }
        })
    }

    fn unbox_scalar(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
        f: impl Fn(u8, &[u8]) -> Result<Option<i64>, Fault>,
    ) -> Result<(), Fault> {
        let dv = self.slot_at(code, pc + 2)?;
        let dk = self.slot_at(code, pc + 4)?;
        let v = self.slot_at(code, pc + 6)?;
        let k = self.slot_at(code, pc + 8)?;
        let vals = self.read_v(v)?;
        let mask = self.read_k(k)?;
        let mut out = [0i64; LANE_COUNT];
        let mut ok = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            let desc = vals.typel[lane];
            if is_null(desc) {
                continue;
            }
            let body = env.window.bytes(vals.body(lane))?;
            if let Some(value) = f(desc, body)? {
                out[lane] = value;
                ok |= 1 << lane;
            }
        }
        self.write_s_i64(dv, &out)?;
        self.write_k(dk, ok)
    }

    /// Strip string headers, leaving raw byte references.
    pub(super) fn unbox_str(&mut self, code: &[u8], pc: usize) -> Result<(), Fault> {
        let dv = self.slot_at(code, pc + 2)?;
        let dk = self.slot_at(code, pc + 4)?;
        let v = self.slot_at(code, pc + 6)?;
        let k = self.slot_at(code, pc + 8)?;
        let vals = self.read_v(v)?;
        let mask = self.read_k(k)?;
        let mut out = VReg::default();
        let mut ok = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            let desc = vals.typel[lane];
            if kind_of(desc) == Kind::String as u8 && !is_null(desc) {
                out.set_lane(lane, vals.body(lane), desc, 0);
                ok |= 1 << lane;
            }
        }
        self.write_v(dv, &out)?;
        self.write_k(dk, ok)
    }

    /// Box integer lanes into scratch.
    pub(super) fn box_int(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        self.box_scalar(env, code, pc, |value, buf| {
            if value >= 0 {
                buf[0] = (Kind::Uint as u8) << 4 | 8;
                buf[1..9].copy_from_slice(&(value as u64).to_be_bytes());
            } else {
                buf[0] = (Kind::Int as u8) << 4 | 8;
                buf[1..9].copy_from_slice(&value.unsigned_abs().to_be_bytes());
            }
        })
    }

    /// Box float lanes into scratch.
    pub(super) fn box_float(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        let dv = self.slot_at(code, pc + 2)?;
        let s = self.slot_at(code, pc + 4)?;
        let k = self.slot_at(code, pc + 6)?;
        let lanes = self.read_s_f64(s)?;
        let mask = self.read_k(k)?;
        let base = env.window.alloc_scratch(9 * LANE_COUNT)?;
        let mut out = VReg::default();
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                out.set_lane(lane, VmRef::NULL, NULL_DESC, 1);
                continue;
            }
            let off = base + (lane * 9) as u32;
            let buf = env.window.scratch_mut(off, 9);
            buf[0] = (Kind::Float as u8) << 4 | 8;
            buf[1..9].copy_from_slice(&lanes[lane].to_be_bytes());
            out.set_lane(lane, VmRef::new(off, 9), buf[0], 1);
        }
        self.write_v(dv, &out)
    }

    /// Box timestamp lanes into scratch.
    pub(super) fn box_timestamp(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        self.box_scalar(env, code, pc, |value, buf| {
            buf[0] = (Kind::Timestamp as u8) << 4 | 8;
            buf[1..9].copy_from_slice(&value.to_be_bytes());
        })
    }

    fn box_scalar(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
        put: impl Fn(i64, &mut [u8]),
    ) -> Result<(), Fault> {
        let dv = self.slot_at(code, pc + 2)?;
        let s = self.slot_at(code, pc + 4)?;
        let k = self.slot_at(code, pc + 6)?;
        let lanes = self.read_s_i64(s)?;
        let mask = self.read_k(k)?;
        let base = env.window.alloc_scratch(9 * LANE_COUNT)?;
        let mut out = VReg::default();
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                out.set_lane(lane, VmRef::NULL, NULL_DESC, 1);
                continue;
            }
            let off = base + (lane * 9) as u32;
            let buf = env.window.scratch_mut(off, 9);
            put(lanes[lane], buf);
            let desc = buf[0];
            out.set_lane(lane, VmRef::new(off, 9), desc, 1);
        }
        self.write_v(dv, &out)
    }

    /// Box boolean lanes (value mask under validity mask) into scratch.
    pub(super) fn box_bool(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        let dv = self.slot_at(code, pc + 2)?;
        let vk = self.slot_at(code, pc + 4)?;
        let k = self.slot_at(code, pc + 6)?;
        let values = self.read_k(vk)?;
        let mask = self.read_k(k)?;
        let base = env.window.alloc_scratch(LANE_COUNT)?;
        let mut out = VReg::default();
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                out.set_lane(lane, VmRef::NULL, NULL_DESC, 1);
                continue;
            }
            let off = base + lane as u32;
            let bit = (values >> lane) & 1;
            let buf = env.window.scratch_mut(off, 1);
            buf[0] = (Kind::Bool as u8) << 4 | bit as u8;
            out.set_lane(lane, VmRef::new(off, 1), buf[0], 1);
        }
        self.write_v(dv, &out)
    }
}
