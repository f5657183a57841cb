//! Shared lane-loop helpers for the numeric opcode families.
//!
//! Each helper decodes operands at the offsets the opcode table declares for
//! its family's layout, applies the lane function under the mask, and writes
//! the destination registers. Handlers only compute masked lanes; unmasked
//! lanes carry unspecified values.

use vex_asm::{unpack, Fault};
use vex_types::LANE_COUNT;

use super::Machine;

impl Machine {
    /// `Scalar = f(Slot, Slot) under Mask` over float lanes.
    pub(super) fn bin_f(
        &mut self,
        code: &[u8],
        pc: usize,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let a = self.slot_at(code, pc + 4)?;
        let b = self.slot_at(code, pc + 6)?;
        let k = self.slot_at(code, pc + 8)?;
        let mask = self.read_k(k)?;
        let av = self.read_s_f64(a)?;
        let bv = self.read_s_f64(b)?;
        let mut out = [0.0f64; LANE_COUNT];
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) != 0 {
                out[lane] = f(av[lane], bv[lane]);
            }
        }
        self.write_s_f64(d, &out)
    }

    /// `Scalar = f(Slot, imm) under Mask` over float lanes.
    pub(super) fn bin_f_imm(
        &mut self,
        code: &[u8],
        pc: usize,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let a = self.slot_at(code, pc + 4)?;
        let imm = unpack::f64_at(code, pc + 6).map_err(|_| Fault::InvalidOpcode)?;
        let k = self.slot_at(code, pc + 14)?;
        let mask = self.read_k(k)?;
        let av = self.read_s_f64(a)?;
        let mut out = [0.0f64; LANE_COUNT];
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) != 0 {
                out[lane] = f(av[lane], imm);
            }
        }
        self.write_s_f64(d, &out)
    }

    /// `Scalar = f(Slot) under Mask` over float lanes.
    pub(super) fn un_f(
        &mut self,
        code: &[u8],
        pc: usize,
        f: impl Fn(f64) -> f64,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let a = self.slot_at(code, pc + 4)?;
        let k = self.slot_at(code, pc + 6)?;
        let mask = self.read_k(k)?;
        let av = self.read_s_f64(a)?;
        let mut out = [0.0f64; LANE_COUNT];
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) != 0 {
                out[lane] = f(av[lane]);
            }
        }
        self.write_s_f64(d, &out)
    }

    /// `Scalar = f(Slot, Slot) under Mask` over integer lanes.
    pub(super) fn bin_i(
        &mut self,
        code: &[u8],
        pc: usize,
        f: impl Fn(i64, i64) -> i64,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let a = self.slot_at(code, pc + 4)?;
        let b = self.slot_at(code, pc + 6)?;
        let k = self.slot_at(code, pc + 8)?;
        let mask = self.read_k(k)?;
        let av = self.read_s_i64(a)?;
        let bv = self.read_s_i64(b)?;
        let mut out = [0i64; LANE_COUNT];
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) != 0 {
                out[lane] = f(av[lane], bv[lane]);
            }
        }
        self.write_s_i64(d, &out)
    }

    /// `Scalar = f(Slot, imm) under Mask` over integer lanes.
    pub(super) fn bin_i_imm(
        &mut self,
        code: &[u8],
        pc: usize,
        f: impl Fn(i64, i64) -> i64,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let a = self.slot_at(code, pc + 4)?;
        let imm = unpack::i64_at(code, pc + 6).map_err(|_| Fault::InvalidOpcode)?;
        let k = self.slot_at(code, pc + 14)?;
        let mask = self.read_k(k)?;
        let av = self.read_s_i64(a)?;
        let mut out = [0i64; LANE_COUNT];
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) != 0 {
                out[lane] = f(av[lane], imm);
            }
        }
        self.write_s_i64(d, &out)
    }

    /// `Scalar = f(Slot) under Mask` over integer lanes.
    pub(super) fn un_i(
        &mut self,
        code: &[u8],
        pc: usize,
        f: impl Fn(i64) -> i64,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let a = self.slot_at(code, pc + 4)?;
        let k = self.slot_at(code, pc + 6)?;
        let mask = self.read_k(k)?;
        let av = self.read_s_i64(a)?;
        let mut out = [0i64; LANE_COUNT];
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) != 0 {
                out[lane] = f(av[lane]);
            }
        }
        self.write_s_i64(d, &out)
    }

    /// Partial integer op: lanes where `f` declines fall out of the mask.
    pub(super) fn bin_i_checked(
        &mut self,
        code: &[u8],
        pc: usize,
        f: impl Fn(i64, i64) -> Option<i64>,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let dk = self.slot_at(code, pc + 4)?;
        let a = self.slot_at(code, pc + 6)?;
        let b = self.slot_at(code, pc + 8)?;
        let k = self.slot_at(code, pc + 10)?;
        let mask = self.read_k(k)?;
        let av = self.read_s_i64(a)?;
        let bv = self.read_s_i64(b)?;
        let mut out = [0i64; LANE_COUNT];
        let mut ok = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) != 0 {
                if let Some(v) = f(av[lane], bv[lane]) {
                    out[lane] = v;
                    ok |= 1 << lane;
                }
            }
        }
        self.write_s_i64(d, &out)?;
        self.write_k(dk, ok)
    }

    /// Partial integer op against an immediate.
    pub(super) fn bin_i_imm_checked(
        &mut self,
        code: &[u8],
        pc: usize,
        f: impl Fn(i64, i64) -> Option<i64>,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let dk = self.slot_at(code, pc + 4)?;
        let a = self.slot_at(code, pc + 6)?;
        let imm = unpack::i64_at(code, pc + 8).map_err(|_| Fault::InvalidOpcode)?;
        let k = self.slot_at(code, pc + 16)?;
        let mask = self.read_k(k)?;
        let av = self.read_s_i64(a)?;
        let mut out = [0i64; LANE_COUNT];
        let mut ok = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) != 0 {
                if let Some(v) = f(av[lane], imm)  {
                    out[lane] = v;
                    ok |= 1 << lane;
                }
            }
        }
        self.write_s_i64(d, &out)?;
        self.write_k(dk, ok)
    }

    /// Integer comparison to a mask.
    pub(super) fn cmp_i(
        &mut self,
        code: &[u8],
        pc: usize,
        f: impl Fn(i64, i64) -> bool,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let a = self.slot_at(code, pc + 4)?;
        let b = self.slot_at(code, pc + 6)?;
        let k = self.slot_at(code, pc + 8)?;
        let mask = self.read_k(k)?;
        let av = self.read_s_i64(a)?;
        let bv = self.read_s_i64(b)?;
        let mut out = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) != 0 && f(av[lane], bv[lane]) {
                out |= 1 << lane;
            }
        }
        self.write_k(d, out)
    }

    /// Integer comparison against an immediate.
    pub(super) fn cmp_i_imm(
        &mut self,
        code: &[u8],
        pc: usize,
        f: impl Fn(i64, i64) -> bool,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let a = self.slot_at(code, pc + 4)?;
        let imm = unpack::i64_at(code, pc + 6).map_err(|_| Fault::InvalidOpcode)?;
        let k = self.slot_at(code, pc + 14)?;
        let mask = self.read_k(k)?;
        let av = self.read_s_i64(a)?;
        let mut out = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) != 0 && f(av[lane], imm) {
                out |= 1 << lane;
            }
        }
        self.write_k(d, out)
    }

    /// Ordered float comparison; NaN operands drop their lane.
    pub(super) fn cmp_f(
        &mut self,
        code: &[u8],
        pc: usize,
        f: impl Fn(f64, f64) -> bool,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let a = self.slot_at(code, pc + 4)?;
        let b = self.slot_at(code, pc + 6)?;
        let k = self.slot_at(code, pc + 8)?;
        let mask = self.read_k(k)?;
        let av = self.read_s_f64(a)?;
        let bv = self.read_s_f64(b)?;
        let mut out = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) != 0
                && !av[lane].is_nan()
                && !bv[lane].is_nan()
                && f(av[lane], bv[lane])
            {
                out |= 1 << lane;
            }
        }
        self.write_k(d, out)
    }

    /// Ordered float comparison against an immediate; NaN lanes drop.
    pub(super) fn cmp_f_imm(
        &mut self,
        code: &[u8],
        pc: usize,
        f: impl Fn(f64, f64) -> bool,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let a = self.slot_at(code, pc + 4)?;
        let imm = unpack::f64_at(code, pc + 6).map_err(|_| Fault::InvalidOpcode)?;
        let k = self.slot_at(code, pc + 14)?;
        let mask = self.read_k(k)?;
        let av = self.read_s_f64(a)?;
        let mut out = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) != 0 && !av[lane].is_nan() && f(av[lane], imm) {
                out |= 1 << lane;
            }
        }
        self.write_k(d, out)
    }

    /// Widen integer lanes to floats.
    pub(super) fn cvt_i2f(&mut self, code: &[u8], pc: usize) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let a = self.slot_at(code, pc + 4)?;
        let k = self.slot_at(code, pc + 6)?;
        let mask = self.read_k(k)?;
        let av = self.read_s_i64(a)?;
        let mut out = [0.0f64; LANE_COUNT];
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) != 0 {
                out[lane] = av[lane] as f64;
            }
        }
        self.write_s_f64(d, &out)
    }

    /// Narrow float lanes to integers after `round`; lanes that do not fit
    /// drop out of the mask.
    pub(super) fn cvt_f2i(
        &mut self,
        code: &[u8],
        pc: usize,
        round: impl Fn(f64) -> f64,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let dk = self.slot_at(code, pc + 4)?;
        let a = self.slot_at(code, pc + 6)?;
        let k = self.slot_at(code, pc + 8)?;
        let mask = self.read_k(k)?;
        let av = self.read_s_f64(a)?;
        let mut out = [0i64; LANE_COUNT];
        let mut ok = 0u16;
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) != 0 {
                let r = round(av[lane]);
                if r.is_finite() && r >= i64::MIN as f64 && r <= i64::MAX as f64 {
                    out[lane] = r as i64;
                    ok |= 1 << lane;
                }
            }
        }
        self.write_s_i64(d, &out)?;
        self.write_k(dk, ok)
    }
}
