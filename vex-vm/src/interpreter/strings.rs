//! String comparison, search and slicing handlers.
//!
//! String registers hold references to raw UTF-8 bytes (headers already
//! stripped by `to_str`). Case-insensitive variants fold ASCII only; the
//! `utf8_ci` equality goes through a pre-folded needle from the dictionary.

use vex_asm::{unpack, Fault};
use vex_types::{VmRef, LANE_COUNT};

use super::{ExecEnv, Machine, VReg};
use crate::program::DictPayload;

/// Relation tested by the literal-comparison opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum StrRel {
    Eq,
    Lt,
    Gt,
}

/// Containment shape tested by the prefix/suffix/contains opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum StrTest {
    Prefix,
    Suffix,
    Contains,
}

fn fold(b: u8) -> u8 {
    b.to_ascii_lowercase()
}

fn eq_ci(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(&x, &y)| fold(x) == fold(y))
}

fn contains_at(haystack: &[u8], needle: &[u8], ci: bool) -> bool {
    if needle.is_empty() {
        return true;
    }
    if needle.len() > haystack.len() {
        return false;
    }
    (0..=haystack.len() - needle.len()).any(|i| {
        let window = &haystack[i..i + needle.len()];
        if ci {
            eq_ci(window, needle)
        } else {
            window == needle
        }
    })
}

impl Machine {
    /// String comparison against an interned literal.
    pub(super) fn cmp_lit(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
        rel: StrRel,
        ci: bool,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let v = self.slot_at(code, pc + 4)?;
        let (off, len) = unpack::lit_ref_at(code, pc + 6).map_err(|_| Fault::InvalidOpcode)?;
        let k = self.slot_at(code, pc + 14)?;
        let vals = self.read_v(v)?;
        let mask = self.read_k(k)?;
        let needle = self.lit_body(VmRef::new(off, len))?.to_vec();
        let mut out = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            let s = env.window.bytes(vals.body(lane))?;
            let hit = match (rel, ci) {
                (StrRel::Eq, false) => s == &needle[..],
                (StrRel::Eq, true) => eq_ci(s, &needle),
                (StrRel::Lt, _) => s < &needle[..],
                (StrRel::Gt, _) => s > &needle[..],
            };
            if hit {
                out |= 1 << lane;
            }
        }
        self.write_k(d, out)
    }

    /// Unicode case-insensitive equality against a pre-folded needle.
    pub(super) fn cmp_lit_utf8_ci(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let v = self.slot_at(code, pc + 4)?;
        let dict = unpack::u16_at(code, pc + 6).map_err(|_| Fault::InvalidOpcode)?;
        let k = self.slot_at(code, pc + 8)?;
        let vals = self.read_v(v)?;
        let mask = self.read_k(k)?;
        let payloads = self.program().dict_arc();
        let needle = match payloads.get(dict as usize) {
            Some(DictPayload::Needle(n)) => n.clone(),
            _ => return Err(Fault::InvalidOpcode),
        };
        let mut out = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            let bytes = env.window.bytes(vals.body(lane))?;
            // Invalid UTF-8 simply fails to match; it is data, not a fault.
            if let Ok(s) = std::str::from_utf8(bytes) {
                if s.chars().flat_map(char::to_lowercase).eq(needle.chars()) {
                    out |= 1 << lane;
                }
            }
        }
        self.write_k(d, out)
    }

    /// Prefix, suffix and containment tests against a literal.
    pub(super) fn str_test(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
        test: StrTest,
        ci: bool,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let v = self.slot_at(code, pc + 4)?;
        let (off, len) = unpack::lit_ref_at(code, pc + 6).map_err(|_| Fault::InvalidOpcode)?;
        let k = self.slot_at(code, pc + 14)?;
        let vals = self.read_v(v)?;
        let mask = self.read_k(k)?;
        let needle = self.lit_body(VmRef::new(off, len))?.to_vec();
        let mut out = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            let s = env.window.bytes(vals.body(lane))?;
            let hit = match test {
                StrTest::Prefix if s.len() >= needle.len() => {
                    let head = &s[..needle.len()];
                    if ci {
                        eq_ci(head, &needle)
                    } else {
                        head == &needle[..]
                    }
                }
                StrTest::Suffix if s.len() >= needle.len() => {
                    let tail = &s[s.len() - needle.len()..];
                    if ci {
                        eq_ci(tail, &needle)
                    } else {
                        tail == &needle[..]
                    }
                }
                StrTest::Contains => contains_at(s, &needle, ci),
                _ => false,
            };
            if hit {
                out |= 1 << lane;
            }
        }
        self.write_k(d, out)
    }

    /// Match lanes against a compiled wildcard pattern.
    pub(super) fn like(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let v = self.slot_at(code, pc + 4)?;
        let dict = unpack::u16_at(code, pc + 6).map_err(|_| Fault::InvalidOpcode)?;
        let k = self.slot_at(code, pc + 8)?;
        let vals = self.read_v(v)?;
        let mask = self.read_k(k)?;
        let payloads = self.program().dict_arc();
        let pattern = match payloads.get(dict as usize) {
            Some(DictPayload::Pattern(p)) => p.clone(),
            _ => return Err(Fault::InvalidOpcode),
        };
        let mut out = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            if pattern.matches(env.window.bytes(vals.body(lane))?) {
                out |= 1 << lane;
            }
        }
        self.write_k(d, out)
    }

    /// Byte length of each lane's string.
    pub(super) fn str_len(&mut self, code: &[u8], pc: usize) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let v = self.slot_at(code, pc + 4)?;
        let k = self.slot_at(code, pc + 6)?;
        let vals = self.read_v(v)?;
        let mask = self.read_k(k)?;
        let mut out = [0i64; LANE_COUNT];
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) != 0 {
                out[lane] = vals.body(lane).len() as i64;
            }
        }
        self.write_s_i64(d, &out)
    }

    /// Strip ASCII whitespace from either side of each lane.
    pub(super) fn trim(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
        left: bool,
        right: bool,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let v = self.slot_at(code, pc + 4)?;
        let k = self.slot_at(code, pc + 6)?;
        let vals = self.read_v(v)?;
        let mask = self.read_k(k)?;
        let mut out = VReg::default();
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            let body = vals.body(lane);
            let s = env.window.bytes(body)?;
            let mut start = 0usize;
            let mut end = s.len();
            if left {
                while start < end && s[start].is_ascii_whitespace() {
                    start += 1;
                }
            }
            if right {
                while end > start && s[end - 1].is_ascii_whitespace() {
                    end -= 1;
                }
            }
            let r = VmRef::new(body.offset() + start as u32, (end - start) as u32);
            out.set_lane(lane, r, vals.typel[lane], 0);
        }
        self.write_v(d, &out)
    }

    /// Substring with 1-based start lanes and length lanes.
    pub(super) fn substr(&mut self, code: &[u8], pc: usize) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let v = self.slot_at(code, pc + 4)?;
        let start_s = self.slot_at(code, pc + 6)?;
        let len_s = self.slot_at(code, pc + 8)?;
        let k = self.slot_at(code, pc + 10)?;
        let vals = self.read_v(v)?;
        let starts = self.read_s_i64(start_s)?;
        let lens = self.read_s_i64(len_s)?;
        let mask = self.read_k(k)?;
        let mut out = VReg::default();
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            let body = vals.body(lane);
            let total = body.len() as i64;
            let start = (starts[lane].max(1) - 1).min(total);
            let take = lens[lane].max(0).min(total - start);
            let r = VmRef::new(body.offset() + start as u32, take as u32);
            out.set_lane(lane, r, vals.typel[lane], 0);
        }
        self.write_v(d, &out)
    }

    /// Concatenate two string registers into scratch.
    pub(super) fn concat_str(
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
        let mut out = VReg::default();
        let mut joined = Vec::new();
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            joined.clear();
            joined.extend_from_slice(env.window.bytes(av.body(lane))?);
            joined.extend_from_slice(env.window.bytes(bv.body(lane))?);
            let off = env.window.alloc_scratch(joined.len())?;
            env.window
                .scratch_mut(off, joined.len())
                .copy_from_slice(&joined);
            let desc = (vex_types::Kind::String as u8) << 4;
            out.set_lane(lane, VmRef::new(off, joined.len() as u32), desc, 0);
        }
        self.write_v(d, &out)
    }

    /// Body bytes of a literal reference (strings are interned with their
    /// headers; comparisons want the raw bytes).
    pub(super) fn lit_body(&self, r: VmRef) -> Result<&[u8], Fault> {
        let bytes = self.literal(r)?;
        let header = vex_types::decode_header(bytes)?;
        Ok(&bytes[header.header_len..])
    }
}
