//! Synthetic daily power curves.
//!
//! Every curve takes the normalized daytime (`0.0` = 00:00:00, `1.0` = 24:00:00)
//! and maps it onto `x = n * 4π` before evaluating. The curves are pure; the
//! randomness lives in the `*_power_watt` helpers, which take the RNG explicitly.

use rand::Rng;
use std::f64::consts::PI;

pub const SECONDS_PER_DAY: i64 = 24 * 3600;

/// Peak-ish scale of the household consumption curve in watts.
pub const METER_AMPLITUDE_WATT: f64 = 8500.0;
/// Scale of the photovoltaic curve in watts.
pub const PV_AMPLITUDE_WATT: f64 = 3250.0;
/// Jitter bounds (inclusive) added to both absolute wattages.
pub const JITTER_WATT: i32 = 50;

/// Seconds elapsed on the day of timestamp `t` (seconds since epoch).
pub fn second_of_day(t: i64) -> i64 {
    t.rem_euclid(SECONDS_PER_DAY)
}

/// Fraction of the day elapsed at `t`, in `[0, 1)`.
pub fn normalized_daytime(t: i64) -> f64 {
    second_of_day(t) as f64 / SECONDS_PER_DAY as f64
}

/// Normalized household consumption, mimicking a typical daily load profile
/// with a morning and an evening peak. Not clamped.
pub fn meter_curve(n: f64) -> f64 {
    let x = n * PI * 4.0;
    let meter_value = x.sin() + (x / 2.5) * (-(x / 12.0).exp() + 2.85) + 1.0;
    meter_value / 5.0
}

/// Normalized photovoltaic output: the upper envelope of two parabolas,
/// clamped at zero.
pub fn pv_curve(n: f64) -> f64 {
    let x = n * PI * 4.0;
    let narrow = -((x - 7.0).powi(2) / 10.0) + 1.0;
    let wide = -((x - 6.3).powi(2) / 100.0) + 2.0;
    narrow.max(wide).max(0.0)
}

fn jitter<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.random_range(-JITTER_WATT..=JITTER_WATT) as f64
}

/// Absolute household consumption at `t`, including jitter.
pub fn meter_power_watt<R: Rng + ?Sized>(t: i64, rng: &mut R) -> f64 {
    meter_curve(normalized_daytime(t)) * METER_AMPLITUDE_WATT + jitter(rng)
}

/// Absolute photovoltaic output at `t`, including jitter. Never negative.
pub fn pv_power_watt<R: Rng + ?Sized>(t: i64, rng: &mut R) -> f64 {
    (pv_curve(normalized_daytime(t)) * PV_AMPLITUDE_WATT + jitter(rng)).max(0.0)
}
