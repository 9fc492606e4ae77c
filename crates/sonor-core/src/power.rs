//! Sound power conversions and band table
//!
//! Decibel/watt conversions and the geometric divergence term used to rank
//! sources before any real path is traced. Attenuation formulas beyond pure
//! divergence live with the result sink, not here.

/// Speed of sound in air in m/s, standard conditions.
pub const SOUND_SPEED: f64 = 340.0;

/// Octave band centre frequencies in Hz.
pub const DEFAULT_FREQUENCIES: [f64; 8] = [
    63.0, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0,
];

/// Convert a level in dB to linear power (W).
pub fn db_to_w(db: f64) -> f64 {
    10.0_f64.powf(db / 10.0)
}

/// Convert linear power (W) to a level in dB.
pub fn w_to_db(w: f64) -> f64 {
    10.0 * w.log10()
}

/// Geometric divergence of a point source over a distance in metres.
///
/// Returns the attenuation in dB (positive value). Distances under one
/// metre are clamped so the term never turns into a gain.
pub fn divergence_db(distance: f64) -> f64 {
    20.0 * distance.max(1.0).log10() + 11.0
}

/// Sum of a slice of linear powers.
pub fn sum_w(values: &[f64]) -> f64 {
    values.iter().sum()
}

/// Energetic sum of two per-band level arrays in dB.
pub fn sum_db_arrays(a: &[f64], b: &[f64]) -> Vec<f64> {
    if a.is_empty() {
        return b.to_vec();
    }
    if b.is_empty() {
        return a.to_vec();
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| w_to_db(db_to_w(*x) + db_to_w(*y)))
        .collect()
}
