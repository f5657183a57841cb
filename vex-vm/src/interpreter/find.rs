//! Structure navigation: symbol lookup, struct re-basing, list indexing.

use vex_asm::{unpack, Fault};
use vex_types::{decode_header, decode_varint, Kind, VmRef, LANE_COUNT};

use super::{ExecEnv, Machine, VReg};

impl Machine {
    /// Scan each lane's struct body for a symbol.
    pub(super) fn findsym(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        let dv = self.slot_at(code, pc + 2)?;
        let dk = self.slot_at(code, pc + 4)?;
        let b = self.slot_at(code, pc + 6)?;
        let sym = unpack::u32_at(code, pc + 8).map_err(|_| Fault::InvalidOpcode)?;
        let k = self.slot_at(code, pc + 12)?;

        let (base, bmask) = self.read_b(b)?;
        let mask = self.read_k(k)? & bmask;
        let mut out = VReg::default();
        let mut hit = 0u16;

        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            let body_ref = base.body(lane);
            let body = env.window.bytes(body_ref)?;
            if let Some((at, total, desc, hlen)) = find_field(body, sym)? {
                let r = VmRef::new(body_ref.offset() + at as u32, total as u32);
                out.set_lane(lane, r, desc, hlen);
                hit |= 1 << lane;
            }
        }
        self.write_v(dv, &out)?;
        self.write_k(dk, hit)
    }

    /// Re-base struct values for nested field lookups.
    pub(super) fn tuple(
        &mut self,
        _env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let v = self.slot_at(code, pc + 4)?;
        let k = self.slot_at(code, pc + 6)?;

        let vals = self.read_v(v)?;
        let mask = self.read_k(k)?;
        let mut out = VReg::default();
        let mut ok = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            let desc = vals.typel[lane];
            if desc >> 4 == Kind::Struct as u8 && desc & 0x0f != 15 {
                out.set_lane(lane, vals.body(lane), desc, 0);
                ok |= 1 << lane;
            }
        }
        self.write_b(d, &out, ok)
    }

    /// Select the n-th element of each lane's list.
    pub(super) fn index_list(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        let dv = self.slot_at(code, pc + 2)?;
        let dk = self.slot_at(code, pc + 4)?;
        let v = self.slot_at(code, pc + 6)?;
        let n = unpack::u16_at(code, pc + 8).map_err(|_| Fault::InvalidOpcode)? as usize;
        let k = self.slot_at(code, pc + 10)?;

        let vals = self.read_v(v)?;
        let mask = self.read_k(k)?;
        let mut out = VReg::default();
        let mut hit = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            let desc = vals.typel[lane];
            if desc >> 4 != Kind::List as u8 || desc & 0x0f == 15 {
                continue;
            }
            let body_ref = vals.body(lane);
            let body = env.window.bytes(body_ref)?;
            if let Some((at, total, desc, hlen)) = nth_value(body, n)? {
                let r = VmRef::new(body_ref.offset() + at as u32, total as u32);
                out.set_lane(lane, r, desc, hlen);
                hit |= 1 << lane;
            }
        }
        self.write_v(dv, &out)?;
        self.write_k(dk, hit)
    }
}

/// Locate a symbol in a struct body; returns (offset, total_len, descriptor,
/// header_len) of the value.
fn find_field(body: &[u8], sym: u32) -> Result<Option<(usize, usize, u8, u8)>, Fault> {
    let mut at = 0usize;
    while at < body.len() {
        let (label, label_len) = decode_varint(&body[at..])?;
        let value_at = at + label_len;
        let header = decode_header(&body[value_at..])?;
        if label == sym {
            return Ok(Some((
                value_at,
                header.total_len(),
                body[value_at],
                header.header_len as u8,
            )));
        }
        at = value_at + header.total_len();
    }
    Ok(None)
}

/// Locate the n-th value of a list body.
fn nth_value(body: &[u8], n: usize) -> Result<Option<(usize, usize, u8, u8)>, Fault> {
    let mut at = 0usize;
    let mut idx = 0usize;
    while at < body.len() {
        let header = decode_header(&body[at..])?;
        if idx == n {
            return Ok(Some((
                at,
                header.total_len(),
                body[at],
                header.header_len as u8,
            )));
        }
        idx += 1;
        at += header.total_len();
    }
    Ok(None)
}
