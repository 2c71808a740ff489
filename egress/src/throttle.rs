//! The 28-byte throttle blob: parsing the inbound bits/sec update, deriving the sub-category
//! split, and packing the outbound bytes/sec report (spec.md §4.5, §6, §7).

use byteorder::{ByteOrder, LittleEndian};

use crate::category::Category;

/// The ten throttle-bearing categories' requested drip rates, in bytes/sec, after the
/// task/asset/state split described in spec.md §4.5. `OutBand` has no entry here — it bypasses
/// throttling and its bucket is always pinned to `0` by the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throttles {
    pub resend: f64,
    pub land: f64,
    pub wind: f64,
    pub cloud: f64,
    pub task: f64,
    pub texture: f64,
    pub asset: f64,
    pub transfer: f64,
    pub state: f64,
    pub avatar_info: f64,
}

impl Throttles {
    /// Clamps a raw wire value (bits/sec) into `[0, max_bits]`, mapping NaN to `0`, `+Inf` to
    /// `max_bits`, and negative values to `0` — spec.md §7's structural-error policy for a
    /// corrupt throttle blob.
    fn clamp_input_bits(raw: f32, max_bits: f64) -> f64 {
        let v = raw as f64;
        if v.is_nan() {
            0.0
        } else if v == f64::INFINITY {
            max_bits
        } else if v < 0.0 {
            0.0
        } else {
            v.min(max_bits)
        }
    }

    /// Parses the inbound 28-byte blob (seven little-endian `f32` bits/sec values, order:
    /// resend, land, wind, cloud, task, texture, asset), converts to bytes/sec, splits out the
    /// `state`/`transfer`/`avatar_info` sub-categories, and — if the resulting total falls below
    /// `min_per_client_rate` — applies the documented integer-math floor scaling.
    pub fn from_wire_bits(bytes: &[u8; 28], min_per_client_rate: u32, max_per_client_rate: u32) -> Throttles {
        let max_bits = max_per_client_rate as f64 * 8.0;

        let resend = Self::clamp_input_bits(LittleEndian::read_f32(&bytes[0..4]), max_bits) * 0.125;
        let land = Self::clamp_input_bits(LittleEndian::read_f32(&bytes[4..8]), max_bits) * 0.125;
        let wind = Self::clamp_input_bits(LittleEndian::read_f32(&bytes[8..12]), max_bits) * 0.125;
        let cloud = Self::clamp_input_bits(LittleEndian::read_f32(&bytes[12..16]), max_bits) * 0.125;
        let mut task = Self::clamp_input_bits(LittleEndian::read_f32(&bytes[16..20]), max_bits) * 0.125;
        let texture = Self::clamp_input_bits(LittleEndian::read_f32(&bytes[20..24]), max_bits) * 0.125;
        let mut asset = Self::clamp_input_bits(LittleEndian::read_f32(&bytes[24..28]), max_bits) * 0.125;

        let state_base = (task * 0.3).floor();
        task -= state_base;

        let transfer = (asset * 0.75).floor();
        asset -= transfer;

        let avatar_info = (state_base * 0.3).floor();
        let state = state_base - avatar_info;

        let mut throttles = Throttles {
            resend,
            land,
            wind,
            cloud,
            task,
            texture,
            asset,
            transfer,
            state,
            avatar_info,
        };
        throttles.apply_floor_scaling(min_per_client_rate, max_per_client_rate);
        throttles
    }

    fn total(&self) -> f64 {
        self.resend
            + self.land
            + self.wind
            + self.cloud
            + self.task
            + self.texture
            + self.asset
            + self.transfer
            + self.state
            + self.avatar_info
    }

    /// If the requested total falls below `min_per_client_rate`, scales every category by
    /// `percent = (min * 100) / total` using **integer division**, then divides by `100` — also
    /// integer division. This reproduces the documented quirk verbatim (spec.md §9 bullet 1):
    /// for `min=6250, total=1000` the scale factor is 625%, not a normalization to exactly
    /// `min`. Do not "fix" this without updating the scenario S4 test alongside it.
    fn apply_floor_scaling(&mut self, min_per_client_rate: u32, max_per_client_rate: u32) {
        let total = self.total().min(max_per_client_rate as f64);
        if total <= 0.0 {
            return;
        }

        let min = min_per_client_rate as f64;
        if total < min {
            let total_int = total as i64;
            let percent = (min as i64 * 100) / total_int.max(1);

            let scale = |v: f64| -> f64 { ((v as i64) * percent / 100) as f64 };
            self.resend = scale(self.resend);
            self.land = scale(self.land);
            self.wind = scale(self.wind);
            self.cloud = scale(self.cloud);
            self.task = scale(self.task);
            self.texture = scale(self.texture);
            self.asset = scale(self.asset);
            self.transfer = scale(self.transfer);
            self.state = scale(self.state);
            self.avatar_info = scale(self.avatar_info);
        }
    }

    /// The requested drip rate for a throttle-bearing category. `None` for `OutBand`, which has
    /// no entry here — it is pinned to `0` and bypasses throttling entirely.
    pub fn rate_for(&self, category: Category) -> Option<f64> {
        match category {
            Category::Resend => Some(self.resend),
            Category::Land => Some(self.land),
            Category::Wind => Some(self.wind),
            Category::Cloud => Some(self.cloud),
            Category::Task => Some(self.task),
            Category::Texture => Some(self.texture),
            Category::Asset => Some(self.asset),
            Category::Transfer => Some(self.transfer),
            Category::State => Some(self.state),
            Category::AvatarInfo => Some(self.avatar_info),
            Category::OutBand => None,
        }
    }

    /// Packs the outbound 28-byte report: seven little-endian `f32` bytes/sec values in the
    /// original wire order, with `task` and `asset` re-aggregated so the viewer sees the seven
    /// categories it originally sent (spec.md §6).
    pub fn to_report_bytes(&self) -> [u8; 28] {
        let mut out = [0u8; 28];
        let task_out = self.task + self.state + self.avatar_info;
        let asset_out = self.asset + self.transfer;

        LittleEndian::write_f32(&mut out[0..4], self.resend as f32);
        LittleEndian::write_f32(&mut out[4..8], self.land as f32);
        LittleEndian::write_f32(&mut out[8..12], self.wind as f32);
        LittleEndian::write_f32(&mut out[12..16], self.cloud as f32);
        LittleEndian::write_f32(&mut out[16..20], task_out as f32);
        LittleEndian::write_f32(&mut out[20..24], self.texture as f32);
        LittleEndian::write_f32(&mut out[24..28], asset_out as f32);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(resend: f32, land: f32, wind: f32, cloud: f32, task: f32, texture: f32, asset: f32) -> [u8; 28] {
        let mut bytes = [0u8; 28];
        LittleEndian::write_f32(&mut bytes[0..4], resend);
        LittleEndian::write_f32(&mut bytes[4..8], land);
        LittleEndian::write_f32(&mut bytes[8..12], wind);
        LittleEndian::write_f32(&mut bytes[12..16], cloud);
        LittleEndian::write_f32(&mut bytes[16..20], task);
        LittleEndian::write_f32(&mut bytes[20..24], texture);
        LittleEndian::write_f32(&mut bytes[24..28], asset);
        bytes
    }

    #[test]
    fn scenario_s4_throttle_floor() {
        // total bits/sec such that bytes/sec total = 1000 (below MIN=6250): 8000 bits/sec each
        // across the seven slots gives 1000 bytes/sec per slot before splitting, but we want an
        // exact, easy-to-trace total, so drive it through land alone plus zeros elsewhere and
        // check the documented 625% scale factor on land specifically, per S4.
        let bytes = wire(0.0, 200.0 * 8.0, 0.0, 0.0, 0.0, 0.0, 0.0 /* bits/sec */);
        let throttles = Throttles::from_wire_bits(&bytes, 6_250, 625_000);

        // land bytes/sec before scaling = 200.0; total = 200 < MIN, percent = (6250*100)/200
        // would blow past the scenario's intended total=1000 bytes/sec setup, so instead assert
        // the scaling formula directly on a hand-built Throttles to match S4's stated total.
        let mut t = Throttles {
            resend: 0.0,
            land: 200.0,
            wind: 0.0,
            cloud: 0.0,
            task: 0.0,
            texture: 0.0,
            asset: 800.0,
            transfer: 0.0,
            state: 0.0,
            avatar_info: 0.0,
        };
        t.apply_floor_scaling(6_250, 625_000);
        assert_eq!(t.land, 1_250.0);

        // Sanity: the parsed throttles above are internally consistent (land alone, everything
        // else zero, percent = (6250*100)/200 = 3125, land -> 200*3125/100 = 6250).
        assert_eq!(throttles.land, 6_250.0);
    }

    #[test]
    fn task_splits_into_state_and_avatar_info() {
        let bytes = wire(0.0, 0.0, 0.0, 0.0, 1_000.0 * 8.0, 0.0, 0.0);
        let throttles = Throttles::from_wire_bits(&bytes, 0, 10_000_000);

        // bytes/sec task = 1000; state = floor(1000*0.3) = 300; task -= 300 -> 700.
        // avatar_info = floor(300*0.3) = 90; state -= 90 -> 210.
        assert_eq!(throttles.state, 210.0);
        assert_eq!(throttles.avatar_info, 90.0);
        assert_eq!(throttles.task, 700.0);
    }

    #[test]
    fn asset_splits_into_transfer() {
        let bytes = wire(0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1_000.0 * 8.0);
        let throttles = Throttles::from_wire_bits(&bytes, 0, 10_000_000);

        // bytes/sec asset = 1000; transfer = floor(1000*0.75) = 750; asset -= 750 -> 250.
        assert_eq!(throttles.transfer, 750.0);
        assert_eq!(throttles.asset, 250.0);
    }

    #[test]
    fn extreme_inputs_are_clamped() {
        let bytes = wire(f32::NAN, f32::INFINITY, -5.0, 0.0, 0.0, 0.0, 0.0);
        let throttles = Throttles::from_wire_bits(&bytes, 0, 625_000);

        assert_eq!(throttles.resend, 0.0);
        assert_eq!(throttles.wind, 0.0);
        assert_eq!(throttles.land, 625_000.0 * 8.0 * 0.125);
    }

    #[test]
    fn round_trip_near_idempotence() {
        // Property 4: pack(unpack(b)) == b up to the documented task/asset aggregation.
        let bytes = wire(100.0 * 8.0, 200.0 * 8.0, 50.0 * 8.0, 25.0 * 8.0, 1_000.0 * 8.0, 75.0 * 8.0, 1_000.0 * 8.0);
        let throttles = Throttles::from_wire_bits(&bytes, 0, 10_000_000);
        let report = throttles.to_report_bytes();

        assert_eq!(LittleEndian::read_f32(&report[0..4]), 100.0);
        assert_eq!(LittleEndian::read_f32(&report[4..8]), 200.0);
        assert_eq!(LittleEndian::read_f32(&report[8..12]), 50.0);
        assert_eq!(LittleEndian::read_f32(&report[12..16]), 25.0);
        // task_out = task + state + avatar_info must reconstruct the original 1000.
        assert_eq!(LittleEndian::read_f32(&report[16..20]), 1_000.0);
        assert_eq!(LittleEndian::read_f32(&report[20..24]), 75.0);
        // asset_out = asset + transfer must reconstruct the original 1000.
        assert_eq!(LittleEndian::read_f32(&report[24..28]), 1_000.0);
    }

    #[test]
    fn outband_has_no_rate() {
        let bytes = wire(0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        let throttles = Throttles::from_wire_bits(&bytes, 0, 625_000);
        assert_eq!(throttles.rate_for(Category::OutBand), None);
        assert_eq!(throttles.rate_for(Category::Wind), Some(0.0));
    }
}
