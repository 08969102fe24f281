//! Execution-result classification and artifact persistence.
//!
//! The monitor owns three AFL-style virgin bitmaps: one for normal coverage,
//! one for crash traces, one for hang traces. A virgin byte starts at 0xFF
//! ("no hit-count bucket of this edge seen yet") and loses bits as traces are
//! consumed, which makes novelty detection a single and-compare-clear pass.
//! Crash and hang traces are simplified to hit/no-hit first so dedup is
//! robust to counter jitter; when no coverage is available at all, a 64-bit
//! BLAKE2s digest of stderr (or of the input) stands in.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2sVar;
use serde::{Deserialize, Serialize};

use crate::config::FuzzConfig;
use crate::error::Result;
use crate::executor::ExecResult;

/// Marks a trace byte as new in `virgin` and clears the observed bits.
///
/// This is both the discriminator and the updater: calling it twice with the
/// same trace reports novelty only once.
pub fn has_new_bits(trace: &[u8], virgin: &mut [u8]) -> bool {
    let mut new = false;
    for (v, &t) in virgin.iter_mut().zip(trace) {
        if t != 0 && *v & t != 0 {
            *v &= !t;
            new = true;
        }
    }
    new
}

/// Collapses hit counters to three states: never (0 -> 1 on the "not taken"
/// plane), taken (1..=255 -> 128). Idempotent.
#[must_use]
pub fn simplify_trace(trace: &[u8]) -> Vec<u8> {
    trace
        .iter()
        .map(|&b| if b == 0 { 1 } else { 128 })
        .collect()
}

fn hash64(data: &[u8]) -> u64 {
    let mut hasher = Blake2sVar::new(8).expect("8 is a valid blake2s digest size");
    hasher.update(data);
    let mut out = [0u8; 8];
    hasher
        .finalize_variable(&mut out)
        .expect("digest size fixed at construction");
    u64::from_le_bytes(out)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorStats {
    pub total_execs: u64,
    pub total_crashes: u64,
    pub saved_crashes: u64,
    pub total_hangs: u64,
    pub saved_hangs: u64,
    pub interesting_inputs: u64,
    pub total_coverage_bits: u64,
    pub start_time: String,
}

impl Default for MonitorStats {
    fn default() -> Self {
        Self {
            total_execs: 0,
            total_crashes: 0,
            saved_crashes: 0,
            total_hangs: 0,
            saved_hangs: 0,
            interesting_inputs: 0,
            total_coverage_bits: 0,
            start_time: chrono::Local::now().to_rfc3339(),
        }
    }
}

pub struct ExecutionMonitor {
    output_dir: PathBuf,
    crashes_dir: PathBuf,
    hangs_dir: PathBuf,
    queue_dir: PathBuf,
    use_coverage: bool,
    pub(crate) virgin_bits: Option<Vec<u8>>,
    pub(crate) virgin_crash: Option<Vec<u8>>,
    pub(crate) virgin_tmout: Option<Vec<u8>>,
    crash_hashes: HashSet<u64>,
    hang_hashes: HashSet<u64>,
    timeout: f64,
    crash_info_max_len: usize,
    pub stats: MonitorStats,
}

impl ExecutionMonitor {
    pub fn new(output_dir: &Path, config: &FuzzConfig) -> Result<Self> {
        let crashes_dir = output_dir.join("crashes");
        let hangs_dir = output_dir.join("hangs");
        let queue_dir = output_dir.join("queue");
        fs::create_dir_all(&crashes_dir)?;
        fs::create_dir_all(&hangs_dir)?;
        fs::create_dir_all(&queue_dir)?;

        let virgin = || Some(vec![0xFFu8; config.bitmap_size]);
        let (virgin_bits, virgin_crash, virgin_tmout) = if config.use_coverage {
            (virgin(), virgin(), virgin())
        } else {
            (None, None, None)
        };

        log::info!(
            "monitor ready ({}), output dir: {}",
            if config.use_coverage {
                "coverage-guided"
            } else {
                "blind"
            },
            output_dir.display()
        );

        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            crashes_dir,
            hangs_dir,
            queue_dir,
            use_coverage: config.use_coverage,
            virgin_bits,
            virgin_crash,
            virgin_tmout,
            crash_hashes: HashSet::new(),
            hang_hashes: HashSet::new(),
            timeout: config.timeout,
            crash_info_max_len: config.crash_info_max_len,
            stats: MonitorStats::default(),
        })
    }

    #[must_use]
    pub fn use_coverage(&self) -> bool {
        self.use_coverage
    }

    /// Classifies one execution. Crash beats hang beats new coverage; a
    /// single call updates exactly one of the three classifications. Returns
    /// whether the input discovered something worth keeping.
    pub fn process(&mut self, input: &[u8], result: &ExecResult) -> bool {
        self.stats.total_execs += 1;

        if result.crashed {
            self.handle_crash(input, result)
        } else if result.timed_out {
            self.handle_hang(input, result)
        } else if let Some(trace) = &result.coverage {
            self.handle_coverage(input, trace)
        } else {
            false
        }
    }

    fn handle_coverage(&mut self, input: &[u8], trace: &[u8]) -> bool {
        let Some(virgin) = self.virgin_bits.as_mut() else {
            return false;
        };
        if !has_new_bits(trace, virgin) {
            return false;
        }

        self.stats.total_coverage_bits = self
            .virgin_bits
            .as_ref()
            .map(|v| v.iter().map(|&b| (0xFF ^ b).count_ones() as u64).sum())
            .unwrap_or(0);
        self.stats.interesting_inputs += 1;

        let name = format!("new_coverage_{}", self.stats.total_execs);
        if let Err(err) = fs::write(self.queue_dir.join(&name), input) {
            log::warn!("could not write queue entry {name}: {err}");
        }
        log::debug!(
            "queued {name}, coverage now {} bits",
            self.stats.total_coverage_bits
        );
        true
    }

    fn handle_crash(&mut self, input: &[u8], result: &ExecResult) -> bool {
        self.stats.total_crashes += 1;

        let is_new = match (&result.coverage, self.virgin_crash.as_mut()) {
            (Some(trace), Some(virgin)) => {
                let simplified = simplify_trace(trace);
                has_new_bits(&simplified, virgin)
            }
            _ => {
                let basis = if result.stderr.is_empty() {
                    input
                } else {
                    &result.stderr[..]
                };
                self.crash_hashes.insert(hash64(basis))
            }
        };
        if !is_new {
            return false;
        }

        self.stats.saved_crashes += 1;
        let exec_id = self.stats.total_execs;
        let signal = result.signal().unwrap_or(0);
        let filename = format!("crash_{exec_id}_sig{signal}");

        if let Err(err) = fs::write(self.crashes_dir.join(&filename), input) {
            log::warn!("could not write crash artifact {filename}: {err}");
        }
        let info = serde_json::json!({
            "exec_id": exec_id,
            "signal": signal,
            "return_code": result.return_code,
            "exec_time": result.exec_time,
            "stderr": truncate_lossy(&result.stderr, self.crash_info_max_len),
        });
        if let Err(err) = self.write_info(&self.crashes_dir.join(format!("{filename}.json")), &info)
        {
            log::warn!("could not write crash info for {filename}: {err}");
        }

        log::info!(
            "new crash saved ({} saved / {} total)",
            self.stats.saved_crashes,
            self.stats.total_crashes
        );
        true
    }

    fn handle_hang(&mut self, input: &[u8], result: &ExecResult) -> bool {
        self.stats.total_hangs += 1;

        let is_new = match (&result.coverage, self.virgin_tmout.as_mut()) {
            (Some(trace), Some(virgin)) => {
                let simplified = simplify_trace(trace);
                has_new_bits(&simplified, virgin)
            }
            _ => self.hang_hashes.insert(hash64(input)),
        };
        if !is_new {
            return false;
        }

        self.stats.saved_hangs += 1;
        let exec_id = self.stats.total_execs;
        let filename = format!("hang_{exec_id}");

        if let Err(err) = fs::write(self.hangs_dir.join(&filename), input) {
            log::warn!("could not write hang artifact {filename}: {err}");
        }
        let info = serde_json::json!({
            "exec_id": exec_id,
            "exec_time": result.exec_time,
            "timeout": self.timeout,
            "input_size": input.len(),
        });
        if let Err(err) = self.write_info(&self.hangs_dir.join(format!("{filename}.json")), &info) {
            log::warn!("could not write hang info for {filename}: {err}");
        }

        log::info!(
            "new hang saved ({} saved / {} total)",
            self.stats.saved_hangs,
            self.stats.total_hangs
        );
        true
    }

    fn write_info(&self, path: &Path, info: &serde_json::Value) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(info)?)?;
        Ok(())
    }

    /// Writes `stats.json` with the final counters.
    pub fn write_stats(&self) -> Result<()> {
        let mut value = serde_json::to_value(&self.stats)?;
        value["end_time"] = serde_json::Value::String(chrono::Local::now().to_rfc3339());
        fs::write(
            self.output_dir.join("stats.json"),
            serde_json::to_string_pretty(&value)?,
        )?;
        Ok(())
    }
}

fn truncate_lossy(bytes: &[u8], max_len: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.chars().take(max_len).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MAP: usize = 64;

    fn config() -> FuzzConfig {
        FuzzConfig {
            bitmap_size: MAP,
            ..FuzzConfig::default()
        }
    }

    fn monitor(dir: &TempDir, use_coverage: bool) -> ExecutionMonitor {
        let cfg = FuzzConfig {
            use_coverage,
            ..config()
        };
        ExecutionMonitor::new(dir.path(), &cfg).unwrap()
    }

    fn ok_result(trace: Vec<u8>) -> ExecResult {
        ExecResult {
            return_code: 0,
            exec_time: 0.01,
            crashed: false,
            timed_out: false,
            stderr: Vec::new(),
            coverage: Some(trace),
        }
    }

    fn crash_result(trace: Option<Vec<u8>>, stderr: &[u8]) -> ExecResult {
        ExecResult {
            return_code: -11,
            exec_time: 0.01,
            crashed: true,
            timed_out: false,
            stderr: stderr.to_vec(),
            coverage: trace,
        }
    }

    fn trace_with(bytes: &[(usize, u8)]) -> Vec<u8> {
        let mut t = vec![0u8; MAP];
        for &(i, b) in bytes {
            t[i] = b;
        }
        t
    }

    #[test]
    fn first_trace_is_new_then_known() {
        let mut virgin = vec![0xFFu8; MAP];
        let trace = trace_with(&[(0, 0xFF), (10, 0x0F)]);
        assert!(has_new_bits(&trace, &mut virgin));
        assert!(!has_new_bits(&trace, &mut virgin));
    }

    #[test]
    fn additional_buckets_count_as_new() {
        let mut virgin = vec![0xFFu8; MAP];
        assert!(has_new_bits(&trace_with(&[(0, 0x0F)]), &mut virgin));
        assert!(has_new_bits(&trace_with(&[(0, 0xFF)]), &mut virgin));
        // subset afterwards is old news
        assert!(!has_new_bits(&trace_with(&[(0, 0x05)]), &mut virgin));
    }

    #[test]
    fn simplify_trace_table_and_idempotence() {
        let trace = vec![0, 1, 2, 100, 255];
        let simplified = simplify_trace(&trace);
        assert_eq!(simplified, vec![1, 128, 128, 128, 128]);
        assert_eq!(simplify_trace(&simplified), simplified);
    }

    #[test]
    fn new_coverage_updates_count_and_queue() {
        let dir = TempDir::new().unwrap();
        let mut monitor = monitor(&dir, true);

        let interesting = monitor.process(b"INPUT", &ok_result(trace_with(&[(3, 0x01)])));
        assert!(interesting);
        assert_eq!(monitor.stats.total_execs, 1);
        assert_eq!(monitor.stats.interesting_inputs, 1);
        assert!(monitor.stats.total_coverage_bits > 0);
        assert!(dir.path().join("queue/new_coverage_1").exists());

        // same trace again: not interesting, count stays
        let before = monitor.stats.total_coverage_bits;
        assert!(!monitor.process(b"INPUT", &ok_result(trace_with(&[(3, 0x01)]))));
        assert_eq!(monitor.stats.total_coverage_bits, before);
    }

    #[test]
    fn coverage_bits_grow_monotonically() {
        let dir = TempDir::new().unwrap();
        let mut monitor = monitor(&dir, true);
        let mut last = 0;
        for i in 0..8 {
            monitor.process(b"x", &ok_result(trace_with(&[(i, 0xFF)])));
            assert!(monitor.stats.total_coverage_bits >= last);
            last = monitor.stats.total_coverage_bits;
        }
        assert_eq!(last, 8 * 8);
    }

    #[test]
    fn identical_crash_traces_are_deduplicated() {
        let dir = TempDir::new().unwrap();
        let mut monitor = monitor(&dir, true);

        let trace = trace_with(&[(0, 0xFF), (1, 0xAA)]);
        assert!(monitor.process(b"crash1", &crash_result(Some(trace.clone()), b"Segfault")));
        // both executions count as crashes, only one artifact is kept
        assert!(!monitor.process(b"crash2", &crash_result(Some(trace), b"Segfault")));
        assert_eq!(monitor.stats.total_crashes, 2);
        assert_eq!(monitor.stats.saved_crashes, 1);

        let saved: Vec<_> = fs::read_dir(dir.path().join("crashes"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| !n.ends_with(".json"))
            .collect();
        assert_eq!(saved.len(), 1);
        assert!(saved[0].starts_with("crash_1_sig11"));
    }

    #[test]
    fn count_jitter_does_not_defeat_crash_dedup() {
        let dir = TempDir::new().unwrap();
        let mut monitor = monitor(&dir, true);
        assert!(monitor.process(b"a", &crash_result(Some(trace_with(&[(0, 1)])), b"")));
        // same edge, different hit count: simplification makes it a duplicate
        assert!(!monitor.process(b"b", &crash_result(Some(trace_with(&[(0, 200)])), b"")));
        assert_eq!(monitor.stats.saved_crashes, 1);
    }

    #[test]
    fn crash_fallback_hashes_stderr() {
        let dir = TempDir::new().unwrap();
        let mut monitor = monitor(&dir, false);

        assert!(monitor.process(b"in1", &crash_result(None, b"Segfault at 0x1234")));
        assert!(!monitor.process(b"in2", &crash_result(None, b"Segfault at 0x1234")));
        assert!(monitor.process(b"in3", &crash_result(None, b"Assertion failed")));
        assert_eq!(monitor.stats.saved_crashes, 2);

        // empty stderr falls back to the input bytes
        assert!(monitor.process(b"same", &crash_result(None, b"")));
        assert!(!monitor.process(b"same", &crash_result(None, b"")));
    }

    #[test]
    fn hangs_are_deduplicated_against_their_own_map() {
        let dir = TempDir::new().unwrap();
        let mut monitor = monitor(&dir, true);

        let hang = ExecResult {
            return_code: -1,
            exec_time: 2.5,
            crashed: false,
            timed_out: true,
            stderr: Vec::new(),
            coverage: Some(trace_with(&[(0, 0xAA), (1, 0x55)])),
        };
        assert!(monitor.process(b"hang1", &hang));
        assert!(!monitor.process(b"hang2", &hang));
        assert_eq!(monitor.stats.total_hangs, 2);
        assert_eq!(monitor.stats.saved_hangs, 1);
        assert!(dir.path().join("hangs/hang_1").exists());
        assert!(dir.path().join("hangs/hang_1.json").exists());
    }

    #[test]
    fn crash_does_not_consume_normal_coverage() {
        let dir = TempDir::new().unwrap();
        let mut monitor = monitor(&dir, true);

        let trace = trace_with(&[(5, 0x01)]);
        monitor.process(b"crash", &crash_result(Some(trace.clone()), b"boom"));
        // the crash went to virgin_crash only; the same trace still counts as
        // fresh normal coverage afterwards
        assert!(monitor.process(b"ok", &ok_result(trace)));
    }

    #[test]
    fn stats_file_contains_counters_and_end_time() {
        let dir = TempDir::new().unwrap();
        let mut monitor = monitor(&dir, true);
        monitor.process(b"x", &ok_result(trace_with(&[(0, 1)])));
        monitor.write_stats().unwrap();

        let text = fs::read_to_string(dir.path().join("stats.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["total_execs"], 1);
        assert!(value["end_time"].is_string());
    }
}
