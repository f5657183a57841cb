//! Hashing, group-slot resolution and the aggregation write handlers.

use vex_asm::{unpack, Fault, Op};
use vex_types::{VmRef, LANE_COUNT};

use super::{ExecEnv, Machine};
use crate::agg;
use crate::consts::AGG_SLOT_SIZE;
use crate::program::DictPayload;

fn mix64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^ (x >> 33)
}

/// 128-bit hash of encoded value bytes under a seed.
pub(crate) fn hash128(bytes: &[u8], seed: u64) -> u128 {
    let mut h1 = seed ^ 0x9e37_79b9_7f4a_7c15;
    let mut h2 = seed.wrapping_mul(0xc2b2_ae3d_27d4_eb4f) ^ bytes.len() as u64;
    for chunk in bytes.chunks(8) {
        let mut raw = [0u8; 8];
        raw[..chunk.len()].copy_from_slice(chunk);
        let word = u64::from_le_bytes(raw);
        h1 = mix64(h1 ^ word);
        h2 = mix64(h2.rotate_left(27) ^ word.wrapping_mul(0x9e37_79b9_7f4a_7c15));
    }
    (h1 as u128) << 64 | mix64(h1 ^ h2) as u128
}

impl Machine {
    /// 128-bit hash of each lane's encoded value.
    pub(super) fn hash_value(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let v = self.slot_at(code, pc + 4)?;
        let k = self.slot_at(code, pc + 6)?;
        let vals = self.read_v(v)?;
        let mask = self.read_k(k)?;
        let mut out = [0u128; LANE_COUNT];
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) != 0 {
                out[lane] = hash128(env.window.bytes(vals.lane(lane))?, 0);
            }
        }
        self.write_h(d, &out)
    }

    /// Fold another column's value into existing lane hashes.
    pub(super) fn hash_mix(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let h = self.slot_at(code, pc + 4)?;
        let v = self.slot_at(code, pc + 6)?;
        let k = self.slot_at(code, pc + 8)?;
        let hashes = self.read_h(h)?;
        let vals = self.read_v(v)?;
        let mask = self.read_k(k)?;
        let mut out = hashes;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) != 0 {
                let seed = hashes[lane] as u64 ^ (hashes[lane] >> 64) as u64;
                out[lane] = hash128(env.window.bytes(vals.lane(lane))?, seed);
            }
        }
        self.write_h(d, &out)
    }

    /// Mask of lanes whose hash is in the dictionary set.
    pub(super) fn hash_member(&mut self, code: &[u8], pc: usize) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let h = self.slot_at(code, pc + 4)?;
        let dict = unpack::u16_at(code, pc + 6).map_err(|_| Fault::InvalidOpcode)?;
        let k = self.slot_at(code, pc + 8)?;
        let hashes = self.read_h(h)?;
        let mask = self.read_k(k)?;
        let payloads = self.program().dict_arc();
        let set = match payloads.get(dict as usize) {
            Some(DictPayload::HashSet(s)) => s,
            _ => return Err(Fault::InvalidOpcode),
        };
        let mut out = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) != 0 && set.contains(&hashes[lane]) {
                out |= 1 << lane;
            }
        }
        self.write_k(d, out)
    }

    /// Map lane hashes to stored literal values.
    pub(super) fn hash_lookup(&mut self, code: &[u8], pc: usize) -> Result<(), Fault> {
        let dv = self.slot_at(code, pc + 2)?;
        let dk = self.slot_at(code, pc + 4)?;
        let h = self.slot_at(code, pc + 6)?;
        let dict = unpack::u16_at(code, pc + 8).map_err(|_| Fault::InvalidOpcode)?;
        let k = self.slot_at(code, pc + 10)?;
        let hashes = self.read_h(h)?;
        let mask = self.read_k(k)?;
        let payloads = self.program().dict_arc();
        let map = match payloads.get(dict as usize) {
            Some(DictPayload::Lookup(m)) => m,
            _ => return Err(Fault::InvalidOpcode),
        };
        let mut out = super::VReg::default();
        let mut hit = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            if let Some(&(off, len)) = map.get(&hashes[lane]) {
                let r = VmRef::new(off, len);
                let bytes = self.lit_body_header(r)?;
                out.set_lane(lane, r, bytes.0, bytes.1);
                hit |= 1 << lane;
            }
        }
        self.write_v(dv, &out)?;
        self.write_k(dk, hit)
    }

    fn lit_body_header(&self, r: VmRef) -> Result<(u8, u8), Fault> {
        let bytes = self.literal(r)?;
        let header = vex_types::decode_header(bytes)?;
        Ok((bytes[0], header.header_len as u8))
    }

    /// Assign each lane's hash a dense group slot.
    pub(super) fn bucket(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let h = self.slot_at(code, pc + 4)?;
        let k = self.slot_at(code, pc + 6)?;
        let hashes = self.read_h(h)?;
        let mask = self.read_k(k)?;
        let table = env.groups.as_deref_mut().ok_or(Fault::InvalidOpcode)?;
        let mut out = [u32::MAX; LANE_COUNT];
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) != 0 {
                out[lane] = table.lookup_or_insert(hashes[lane])?;
            }
        }
        self.write_l(d, &out)
    }

    /// Scalar aggregation writes.
    pub(super) fn agg_scalar(
        &mut self,
        op: Op,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        let at = unpack::u32_at(code, pc + 2).map_err(|_| Fault::InvalidOpcode)? as usize;

        // Masks-only shapes decode before borrowing the buffer.
        match op {
            Op::AGG_COUNT => {
                let k = self.slot_at(code, pc + 6)?;
                let mask = self.read_k(k)?;
                let slot = Self::agg_slot_mut(env, at)?;
                agg::update_count(slot, mask);
                return Ok(());
            }
            Op::AGG_AND_BOOL | Op::AGG_OR_BOOL => {
                let vk = self.slot_at(code, pc + 6)?;
                let k = self.slot_at(code, pc + 8)?;
                let values = self.read_k(vk)?;
                let mask = self.read_k(k)?;
                let slot = Self::agg_slot_mut(env, at)?;
                agg::update_bool(slot, values, mask, op == Op::AGG_AND_BOOL);
                return Ok(());
            }
            _ => {}
        }

        let src = self.slot_at(code, pc + 6)?;
        let k = self.slot_at(code, pc + 8)?;
        let mask = self.read_k(k)?;
        match op {
            Op::AGG_SUM_F | Op::AGG_AVG_F => {
                let x = self.read_s_f64(src)?;
                agg::update_sum_f(Self::agg_slot_mut(env, at)?, &x, mask);
            }
            Op::AGG_SUM_I | Op::AGG_AVG_I => {
                let x = self.read_s_i64(src)?;
                agg::update_sum_i(Self::agg_slot_mut(env, at)?, &x, mask);
            }
            Op::AGG_MIN_F | Op::AGG_MAX_F => {
                let x = self.read_s_f64(src)?;
                agg::update_minmax_f(Self::agg_slot_mut(env, at)?, &x, mask, op == Op::AGG_MAX_F);
            }
            Op::AGG_MIN_I | Op::AGG_MAX_I | Op::AGG_MIN_TS | Op::AGG_MAX_TS => {
                let x = self.read_s_i64(src)?;
                let max = matches!(op, Op::AGG_MAX_I | Op::AGG_MAX_TS);
                agg::update_minmax_i(Self::agg_slot_mut(env, at)?, &x, mask, max);
            }
            Op::AGG_APPROX_COUNT => {
                let x = self.read_h(src)?;
                agg::approx::update(Self::agg_slot_mut(env, at)?, &x, mask);
            }
            Op::AGG_AND_I | Op::AGG_OR_I | Op::AGG_XOR_I => {
                let x = self.read_s_i64(src)?;
                let f: fn(i64, i64) -> i64 = match op {
                    Op::AGG_AND_I => |a, b| a & b,
                    Op::AGG_OR_I => |a, b| a | b,
                    _ => |a, b| a ^ b,
                };
                agg::update_bits(Self::agg_slot_mut(env, at)?, &x, mask, f);
            }
            _ => return Err(Fault::InvalidOpcode),
        }
        Ok(())
    }

    fn agg_slot_mut<'e>(env: &'e mut ExecEnv<'_, '_>, at: usize) -> Result<&'e mut [u8], Fault> {
        let buf = env.agg.as_deref_mut().ok_or(Fault::InvalidOpcode)?;
        buf.get_mut(at..at + AGG_SLOT_SIZE).ok_or(Fault::Overflow)
    }

    /// Grouped aggregation writes.
    ///
    /// The `agg_slot` operand packs the cell stride in its high 16 bits and
    /// the aggregate's offset within the cell in the low 16 bits. The bank
    /// grows as new groups appear; fresh cells start zeroed, which every
    /// grouped kernel treats as its identity via the lane counters.
    pub(super) fn agg_grouped(
        &mut self,
        op: Op,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        let packed = unpack::u32_at(code, pc + 2).map_err(|_| Fault::InvalidOpcode)?;
        let stride = (packed >> 16) as usize;
        let in_cell = (packed & 0xffff) as usize;
        if stride < AGG_SLOT_SIZE || in_cell + AGG_SLOT_SIZE > stride {
            return Err(Fault::Overflow);
        }
        let l = self.slot_at(code, pc + 6)?;
        let slots = self.read_l(l)?;

        let (values_f, values_i, mask) = if op == Op::AGG_SLOT_COUNT {
            let k = self.slot_at(code, pc + 8)?;
            ([0.0; LANE_COUNT], [0; LANE_COUNT], self.read_k(k)?)
        } else {
            let src = self.slot_at(code, pc + 8)?;
            let k = self.slot_at(code, pc + 10)?;
            (
                self.read_s_f64(src)?,
                self.read_s_i64(src)?,
                self.read_k(k)?,
            )
        };

        let bank = env.agg.as_deref_mut().ok_or(Fault::InvalidOpcode)?;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            let group = slots[lane] as usize;
            if slots[lane] == u32::MAX {
                return Err(Fault::TreeCorrupt);
            }
            let at = group
                .checked_mul(stride)
                .and_then(|v| v.checked_add(in_cell))
                .ok_or(Fault::Overflow)?;
            if at + AGG_SLOT_SIZE > bank.len() {
                // Grow to cover the whole cell; fresh cells start zeroed.
                let want = group.checked_add(1).and_then(|g| g.checked_mul(stride));
                bank.resize(want.ok_or(Fault::Overflow)?, 0);
            }
            let slot = &mut bank[at..at + AGG_SLOT_SIZE];
            match op {
                Op::AGG_SLOT_SUM_F | Op::AGG_SLOT_AVG_F => {
                    agg::update_one_sum_f(slot, lane, values_f[lane]);
                }
                Op::AGG_SLOT_SUM_I | Op::AGG_SLOT_AVG_I => {
                    agg::update_one_sum_i(slot, lane, values_i[lane]);
                }
                Op::AGG_SLOT_MIN_F | Op::AGG_SLOT_MAX_F => {
                    agg::update_one_minmax_f(slot, lane, values_f[lane], op == Op::AGG_SLOT_MAX_F);
                }
                Op::AGG_SLOT_MIN_I | Op::AGG_SLOT_MAX_I => {
                    agg::update_one_minmax_i(slot, lane, values_i[lane], op == Op::AGG_SLOT_MAX_I);
                }
                Op::AGG_SLOT_COUNT => {
                    agg::update_count(slot, 1 << lane);
                }
                _ => return Err(Fault::InvalidOpcode),
            }
        }
        Ok(())
    }
}
