//! Engine configuration
//!
//! All knobs of one propagation run, serializable so callers can persist
//! or ship them. Distances are metres, levels are dB.

use serde::{Deserialize, Serialize};

use crate::power::DEFAULT_FREQUENCIES;

/// Configuration of one propagation computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum source search distance around a receiver in metres.
    pub max_source_distance: f64,
    /// Maximum distance between a receiver and a reflecting wall in
    /// metres.
    pub max_reflection_distance: f64,
    /// Number of successive wall reflections followed; 0 disables
    /// reflections.
    pub reflection_order: usize,
    /// Compute diffraction over horizontal edges (roof lines).
    pub vertical_diffraction: bool,
    /// Compute diffraction around vertical edges (building corners).
    pub horizontal_diffraction: bool,
    /// Per-receiver error tolerance in dB; once the remaining sources can
    /// no longer move the accumulated level by more than this, they are
    /// skipped. 0 disables the early exit.
    pub maximum_error_db: f64,
    /// Worker threads; 0 uses the available hardware parallelism.
    pub thread_count: usize,
    /// Maximum pending entries in the output queue before pushes block.
    pub output_queue_depth: usize,
    /// Seconds to wait for the worker pool to drain before giving up with
    /// a warning; None waits forever.
    pub join_timeout_secs: Option<u64>,
    /// Ground coefficient outside every ground effect region.
    pub default_ground: f64,
    /// Octave band centre frequencies in Hz.
    pub frequencies: Vec<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_source_distance: 1200.0,
            max_reflection_distance: 50.0,
            reflection_order: 1,
            vertical_diffraction: true,
            horizontal_diffraction: true,
            maximum_error_db: 0.1,
            thread_count: 0,
            output_queue_depth: 50_000,
            join_timeout_secs: None,
            default_ground: 0.0,
            frequencies: DEFAULT_FREQUENCIES.to_vec(),
        }
    }
}

impl EngineConfig {
    /// Effective worker count.
    pub fn effective_threads(&self) -> usize {
        if self.thread_count > 0 {
            self.thread_count
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Lowest band frequency, driving the widest diffraction threshold.
    pub fn min_frequency(&self) -> f64 {
        self.frequencies
            .iter()
            .copied()
            .fold(f64::MAX, f64::min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.reflection_order, 1);
        assert!(cfg.vertical_diffraction);
        assert_eq!(cfg.frequencies.len(), 8);
        assert!(cfg.effective_threads() >= 1);
        assert!((cfg.min_frequency() - 63.0).abs() < 1e-12);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut cfg = EngineConfig::default();
        cfg.reflection_order = 3;
        cfg.thread_count = 4;
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.reflection_order, 3);
        assert_eq!(back.thread_count, 4);
        assert_eq!(back.frequencies, cfg.frequencies);
    }
}
