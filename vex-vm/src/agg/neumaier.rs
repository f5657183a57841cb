//! Neumaier-compensated summation.
//!
//! The compensation term tracks the low-order bits lost by each addition,
//! choosing the error expression by which operand had the larger magnitude.

use vex_types::LANE_COUNT;

/// Add `x` into `(sum, comp)`.
#[inline]
pub fn add(sum: &mut f64, comp: &mut f64, x: f64) {
    let t = *sum + x;
    if sum.abs() >= x.abs() {
        *comp += (*sum - t) + x;
    } else {
        *comp += (x - t) + *sum;
    }
    *sum = t;
}

/// Add masked lanes of `x` into per-lane accumulators.
pub fn add_lanes(
    sum: &mut [f64; LANE_COUNT],
    comp: &mut [f64; LANE_COUNT],
    x: &[f64; LANE_COUNT],
    mask: u16,
) {
    for lane in 0..LANE_COUNT {
        if mask & (1 << lane) != 0 {
            add(&mut sum[lane], &mut comp[lane], x[lane]);
        }
    }
}

/// Collapse per-lane accumulators into one compensated total.
pub fn fold(sum: &[f64; LANE_COUNT], comp: &[f64; LANE_COUNT]) -> f64 {
    let mut total = 0.0f64;
    let mut c = 0.0f64;
    for &v in sum.iter().chain(comp.iter()) {
        add(&mut total, &mut c, v);
    }
    total + c
}
