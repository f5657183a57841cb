//! Geospatial primitives: geohash, web-mercator tiles, great-circle
//! distance.

use vex_asm::{unpack, Fault};
use vex_types::{Kind, VmRef, LANE_COUNT};

use super::{ExecEnv, Machine, VReg};

const GEOHASH_ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";
const MAX_GEOHASH_CHARS: usize = 12;
const EARTH_RADIUS_M: f64 = 6_371_008.8;

fn geohash(lat: f64, lon: f64, chars: usize, out: &mut [u8]) -> usize {
    let chars = chars.clamp(1, MAX_GEOHASH_CHARS);
    let (mut lat_lo, mut lat_hi) = (-90.0f64, 90.0f64);
    let (mut lon_lo, mut lon_hi) = (-180.0f64, 180.0f64);
    let mut even = true;
    let mut bits = 0u32;
    let mut acc = 0usize;
    let mut written = 0usize;
    while written < chars {
        let (lo, hi, v) = if even {
            (&mut lon_lo, &mut lon_hi, lon)
        } else {
            (&mut lat_lo, &mut lat_hi, lat)
        };
        let mid = (*lo + *hi) / 2.0;
        acc <<= 1;
        if v >= mid {
            acc |= 1;
            *lo = mid;
        } else {
            *hi = mid;
        }
        even = !even;
        bits += 1;
        if bits == 5 {
            out[written] = GEOHASH_ALPHABET[acc];
            written += 1;
            bits = 0;
            acc = 0;
        }
    }
    written
}

impl Machine {
    /// Geohash string of lat/lon lanes at the immediate precision.
    pub(super) fn geo_hash(
        &mut self,
        env: &mut ExecEnv<'_, '_>,
        code: &[u8],
        pc: usize,
    ) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let lat_s = self.slot_at(code, pc + 4)?;
        let lon_s = self.slot_at(code, pc + 6)?;
        let prec = unpack::u16_at(code, pc + 8).map_err(|_| Fault::InvalidOpcode)? as usize;
        let k = self.slot_at(code, pc + 10)?;
        let lat = self.read_s_f64(lat_s)?;
        let lon = self.read_s_f64(lon_s)?;
        let mask = self.read_k(k)?;
        let base = env.window.alloc_scratch(13 * LANE_COUNT)?;
        let mut out = VReg::default();
        let mut buf = [0u8; MAX_GEOHASH_CHARS];
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                out.set_lane(lane, VmRef::NULL, 0x0f, 1);
                continue;
            }
            let n = geohash(lat[lane], lon[lane], prec, &mut buf);
            let off = base + (lane * 13) as u32;
            let desc = (Kind::String as u8) << 4 | n as u8;
            let dst = env.window.scratch_mut(off, 1 + n);
            dst[0] = desc;
            dst[1..1 + n].copy_from_slice(&buf[..n]);
            out.set_lane(lane, VmRef::new(off, 1 + n as u32), desc, 1);
        }
        self.write_v(d, &out)
    }

    /// Web-mercator tile coordinate at per-lane zoom levels.
    pub(super) fn geo_tile(&mut self, code: &[u8], pc: usize, x_axis: bool) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let coord_s = self.slot_at(code, pc + 4)?;
        let zoom_s = self.slot_at(code, pc + 6)?;
        let k = self.slot_at(code, pc + 8)?;
        let coord = self.read_s_f64(coord_s)?;
        let zoom = self.read_s_i64(zoom_s)?;
        let mask = self.read_k(k)?;
        let mut out = [0i64; LANE_COUNT];
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            let z = zoom[lane].clamp(0, 30);
            let n = (1i64 << z) as f64;
            let t = if x_axis {
                (coord[lane] + 180.0) / 360.0 * n
            } else {
                let lat = coord[lane].clamp(-85.05112878, 85.05112878).to_radians();
                (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / std::f64::consts::PI) / 2.0 * n
            };
            out[lane] = (t.floor() as i64).clamp(0, (1i64 << z) - 1);
        }
        self.write_s_i64(d, &out)
    }

    /// Haversine distance in meters between two lat/lon lane pairs.
    pub(super) fn geo_distance(&mut self, code: &[u8], pc: usize) -> Result<(), Fault> {
        let d = self.slot_at(code, pc + 2)?;
        let lat1_s = self.slot_at(code, pc + 4)?;
        let lon1_s = self.slot_at(code, pc + 6)?;
        let lat2_s = self.slot_at(code, pc + 8)?;
        let lon2_s = self.slot_at(code, pc + 10)?;
        let k = self.slot_at(code, pc + 12)?;
        let lat1 = self.read_s_f64(lat1_s)?;
        let lon1 = self.read_s_f64(lon1_s)?;
        let lat2 = self.read_s_f64(lat2_s)?;
        let lon2 = self.read_s_f64(lon2_s)?;
        let mask = self.read_k(k)?;
        let mut out = [0.0f64; LANE_COUNT];
        for lane in 0..LANE_COUNT {
            if mask & (1 << lane) == 0 {
                continue;
            }
            let (p1, p2) = (lat1[lane].to_radians(), lat2[lane].to_radians());
            let dp = p2 - p1;
            let dl = (lon2[lane] - lon1[lane]).to_radians();
            let a = (dp / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dl / 2.0).sin().powi(2);
            out[lane] = 2.0 * EARTH_RADIUS_M * a.sqrt().asin();
        }
        self.write_s_f64(d, &out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_geohash() {
        let mut buf = [0u8; MAX_GEOHASH_CHARS];
        // The canonical example point.
        let n = geohash(57.64911, 10.40744, 11, &mut buf);
        assert_eq!(&buf[..n], b"u4pruydqqvj");
    }

    #[test]
    fn geohash_precision_clamps() {
        let mut buf = [0u8; MAX_GEOHASH_CHARS];
        assert_eq!(geohash(0.0, 0.0, 99, &mut buf), MAX_GEOHASH_CHARS);
        assert_eq!(geohash(0.0, 0.0, 0, &mut buf), 1);
    }
}
