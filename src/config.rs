//! Campaign configuration.
//!
//! Every tunable lives in [`FuzzConfig`]. The command line populates it and
//! checkpoints embed it verbatim, so a resumed campaign can be compared
//! against the flags it was originally started with.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// How the scheduler orders its seeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SortStrategy {
    /// Energy-weighted max-heap, AFL FAST schedule in spirit.
    #[default]
    Energy,
    /// Plain insertion order, wrapping around.
    Fifo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzConfig {
    /// Per-execution deadline in seconds.
    pub timeout: f64,
    /// Address-space limit for the target, in MiB. Not applied under
    /// sandboxing, where it would hit the sandbox helper instead.
    pub mem_limit: u64,
    /// Launch the target through a user-namespace sandbox (bwrap).
    pub use_sandbox: bool,
    /// Collect edge coverage through AFL-style shared memory.
    pub use_coverage: bool,
    /// Size of the coverage bitmap in bytes.
    pub bitmap_size: usize,
    /// Seeds larger than this never enter the queue.
    pub max_seed_size: usize,
    /// Mutation operators stacked per havoc call.
    pub havoc_iterations: usize,
    pub seed_sort_strategy: SortStrategy,
    /// Seed-count bound of the scheduler.
    pub max_seeds: usize,
    /// Total seed-bytes bound of the scheduler, in MiB.
    pub max_seeds_memory: u64,
    /// Seconds between telemetry rows.
    pub log_interval: f64,
    /// Captured stderr is truncated to this many bytes.
    pub stderr_max_len: usize,
    /// Stderr stored in crash metadata is truncated to this many bytes.
    pub crash_info_max_len: usize,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            timeout: 1.0,
            mem_limit: 256,
            use_sandbox: false,
            use_coverage: true,
            bitmap_size: 65536,
            max_seed_size: 1024 * 1024,
            havoc_iterations: 16,
            seed_sort_strategy: SortStrategy::Energy,
            max_seeds: 10_000,
            max_seeds_memory: 512,
            log_interval: 5.0,
            stderr_max_len: 1000,
            crash_info_max_len: 500,
        }
    }
}

impl FuzzConfig {
    /// Seed-memory bound in bytes.
    pub fn max_seeds_memory_bytes(&self) -> usize {
        self.max_seeds_memory as usize * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let config = FuzzConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: FuzzConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bitmap_size, config.bitmap_size);
        assert_eq!(back.seed_sort_strategy, SortStrategy::Energy);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let back: FuzzConfig = serde_json::from_str(r#"{"timeout": 2.5}"#).unwrap();
        assert_eq!(back.timeout, 2.5);
        assert_eq!(back.bitmap_size, FuzzConfig::default().bitmap_size);
    }
}
