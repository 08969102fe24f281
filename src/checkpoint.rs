//! Checkpointing: one self-contained JSON document from which a campaign can
//! be resumed.
//!
//! The payload carries the target identity, the full configuration, runtime
//! counters, the monitor's stats and virgin bitmaps (base64), and the seed
//! queue. The save is atomic (tmp file + rename). On load the time anchor is
//! rebased so elapsed campaign time carries over, the coverage count is
//! recomputed from the restored bitmaps rather than trusted, and seeds
//! re-enter through the scheduler's normal insertion path so its invariants
//! re-establish themselves.

use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::config::{FuzzConfig, SortStrategy};
use crate::error::{Error, Result};
use crate::fuzzer::{now_secs, Fuzzer};
use crate::monitor::MonitorStats;
use crate::scheduler::SeedScheduler;

/// `major.minor`. A different major is refused on load; an older minor loads
/// with a warning, with missing fields taking defaults.
pub const CHECKPOINT_VERSION: &str = "1.0";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RuntimeState {
    start_time: f64,
    last_snapshot_time: f64,
    last_coverage: u64,
    last_execs: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct MonitorSnapshot {
    stats: MonitorStats,
    virgin_bits: Option<String>,
    virgin_crash: Option<String>,
    virgin_tmout: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SeedRecord {
    data: String,
    exec_count: u64,
    coverage_bits: u64,
    exec_time: f64,
    energy: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct SchedulerSnapshot {
    strategy: SortStrategy,
    total_exec_time: f64,
    total_coverage: u64,
    total_memory: usize,
    fifo_index: usize,
    seeds: Vec<SeedRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    version: String,
    reason: String,
    target_id: String,
    target_path: String,
    target_args: String,
    seed_dir: String,
    output_dir: String,
    timestamp: String,
    config: FuzzConfig,
    runtime: RuntimeState,
    monitor: MonitorSnapshot,
    scheduler: SchedulerSnapshot,
}

/// Writes `checkpoint.json` into `dir`, creating it as needed. Returns the
/// final path.
pub fn save(dir: &Path, fuzzer: &Fuzzer, reason: &str) -> Result<PathBuf> {
    let monitor = &fuzzer.monitor;
    if fuzzer.config.use_coverage
        && (monitor.virgin_bits.is_none()
            || monitor.virgin_crash.is_none()
            || monitor.virgin_tmout.is_none())
    {
        return Err(Error::Checkpoint(
            "virgin bitmaps missing while coverage is enabled".to_string(),
        ));
    }

    let encode = |map: &Option<Vec<u8>>| map.as_ref().map(|m| BASE64.encode(m));
    let seeds = fuzzer
        .scheduler
        .seeds()
        .into_iter()
        .map(|seed| SeedRecord {
            data: BASE64.encode(&seed.data),
            exec_count: seed.exec_count,
            coverage_bits: seed.coverage_bits,
            exec_time: seed.exec_time,
            energy: seed.energy,
        })
        .collect();

    let state = CheckpointFile {
        version: CHECKPOINT_VERSION.to_string(),
        reason: reason.to_string(),
        target_id: fuzzer.target_id.clone(),
        target_path: fuzzer.target_path.display().to_string(),
        target_args: fuzzer.target_args.clone(),
        seed_dir: fuzzer.seed_dir.display().to_string(),
        output_dir: fuzzer.output_dir.display().to_string(),
        timestamp: chrono::Local::now().to_rfc3339(),
        config: fuzzer.config.clone(),
        runtime: RuntimeState {
            start_time: fuzzer.start_time,
            last_snapshot_time: fuzzer.last_snapshot_time,
            last_coverage: fuzzer.last_coverage,
            last_execs: fuzzer.last_execs,
        },
        monitor: MonitorSnapshot {
            stats: monitor.stats.clone(),
            virgin_bits: encode(&monitor.virgin_bits),
            virgin_crash: encode(&monitor.virgin_crash),
            virgin_tmout: encode(&monitor.virgin_tmout),
        },
        scheduler: SchedulerSnapshot {
            strategy: fuzzer.scheduler.strategy(),
            total_exec_time: fuzzer.scheduler.total_exec_time(),
            total_coverage: fuzzer.scheduler.total_coverage(),
            total_memory: fuzzer.scheduler.total_memory(),
            fifo_index: fuzzer.scheduler.fifo_index(),
            seeds,
        },
    };

    fs::create_dir_all(dir)?;
    let path = dir.join("checkpoint.json");
    let tmp = dir.join("checkpoint.json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(&state)?)?;
    fs::rename(&tmp, &path)?;
    Ok(path)
}

/// Restores `fuzzer` in place from a checkpoint file. Any failure refuses
/// the resume; there is no silent fallback to a fresh run.
pub fn load(path: &Path, fuzzer: &mut Fuzzer) -> Result<()> {
    let text = fs::read_to_string(path)
        .map_err(|err| Error::Checkpoint(format!("cannot read {}: {err}", path.display())))?;
    let state: CheckpointFile = serde_json::from_str(&text)
        .map_err(|err| Error::Checkpoint(format!("cannot parse {}: {err}", path.display())))?;

    check_version(&state.version)?;

    if state.monitor.virgin_bits.is_some() != fuzzer.monitor.use_coverage() {
        log::warn!("coverage setting differs from the checkpointed campaign");
    }
    if state.config.bitmap_size != fuzzer.config.bitmap_size {
        return Err(Error::Checkpoint(format!(
            "bitmap size mismatch: checkpoint has {}, campaign uses {}",
            state.config.bitmap_size, fuzzer.config.bitmap_size
        )));
    }
    if state.target_path != fuzzer.target_path.display().to_string() {
        log::warn!(
            "checkpoint was taken against {}, resuming against {}",
            state.target_path,
            fuzzer.target_path.display()
        );
    }

    let decode = |field: &str, value: &Option<String>| -> Result<Option<Vec<u8>>> {
        value
            .as_ref()
            .map(|encoded| {
                BASE64
                    .decode(encoded)
                    .map_err(|err| Error::Checkpoint(format!("corrupt {field}: {err}")))
            })
            .transpose()
    };

    // Monitor: counters verbatim, bitmaps byte-for-byte, coverage count
    // recomputed from the restored virgin bits.
    fuzzer.monitor.stats = state.monitor.stats;
    fuzzer.monitor.virgin_bits = decode("virgin_bits", &state.monitor.virgin_bits)?;
    fuzzer.monitor.virgin_crash = decode("virgin_crash", &state.monitor.virgin_crash)?;
    fuzzer.monitor.virgin_tmout = decode("virgin_tmout", &state.monitor.virgin_tmout)?;
    if let Some(virgin) = &fuzzer.monitor.virgin_bits {
        fuzzer.monitor.stats.total_coverage_bits = virgin
            .iter()
            .map(|&b| (0xFF ^ b).count_ones() as u64)
            .sum();
    }

    // Scheduler: rebuilt through the normal push path.
    let mut scheduler = SeedScheduler::new(
        state.scheduler.strategy,
        fuzzer.config.max_seeds,
        fuzzer.config.max_seeds_memory_bytes(),
    );
    for record in &state.scheduler.seeds {
        let data = BASE64
            .decode(&record.data)
            .map_err(|err| Error::Checkpoint(format!("corrupt seed data: {err}")))?;
        scheduler.restore(data, record.exec_count, record.coverage_bits, record.exec_time);
    }
    scheduler.set_fifo_index(state.scheduler.fifo_index);
    fuzzer.scheduler = scheduler;

    // Rebase the clock so elapsed-since-start is preserved across the pause.
    let now = now_secs();
    fuzzer.start_time = now - (state.runtime.last_snapshot_time - state.runtime.start_time);
    fuzzer.last_snapshot_time = now;
    fuzzer.last_coverage = state.runtime.last_coverage;
    fuzzer.last_execs = state.runtime.last_execs;

    log::info!(
        "resumed from {} (saved {}, reason {}): {} execs, {} seeds",
        path.display(),
        state.timestamp,
        state.reason,
        fuzzer.monitor.stats.total_execs,
        fuzzer.scheduler.len()
    );
    Ok(())
}

fn check_version(version: &str) -> Result<()> {
    let (major, minor) = version
        .split_once('.')
        .and_then(|(major, minor)| {
            Some((major.parse::<u32>().ok()?, minor.parse::<u32>().ok()?))
        })
        .ok_or_else(|| Error::Checkpoint(format!("malformed version `{version}`")))?;
    let (cur_major, cur_minor) = CHECKPOINT_VERSION
        .split_once('.')
        .map(|(a, b)| (a.parse::<u32>().unwrap(), b.parse::<u32>().unwrap()))
        .expect("crate version constant is well-formed");

    if major != cur_major {
        return Err(Error::Checkpoint(format!(
            "unsupported checkpoint version {version} (this build reads {CHECKPOINT_VERSION})"
        )));
    }
    if minor < cur_minor {
        log::warn!(
            "checkpoint version {version} is older than {CHECKPOINT_VERSION}; missing fields take defaults"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecResult;
    use std::path::Path;
    use tempfile::TempDir;

    fn config() -> FuzzConfig {
        FuzzConfig {
            bitmap_size: 64,
            ..FuzzConfig::default()
        }
    }

    fn fuzzer(out: &TempDir) -> Fuzzer {
        Fuzzer::new(
            "ckpt-test",
            Path::new("/bin/cat"),
            "cat @@",
            Path::new("/tmp/none"),
            out.path(),
            config(),
        )
        .unwrap()
    }

    fn crash(trace_byte: u8) -> ExecResult {
        let mut trace = vec![0u8; 64];
        trace[1] = trace_byte;
        ExecResult {
            return_code: -11,
            exec_time: 0.01,
            crashed: true,
            timed_out: false,
            stderr: b"boom".to_vec(),
            coverage: Some(trace),
        }
    }

    fn ok(trace_byte: u8) -> ExecResult {
        let mut trace = vec![0u8; 64];
        trace[0] = trace_byte;
        ExecResult {
            return_code: 0,
            exec_time: 0.01,
            crashed: false,
            timed_out: false,
            stderr: Vec::new(),
            coverage: Some(trace),
        }
    }

    #[test]
    fn save_then_load_round_trips_the_engine() {
        let out_a = TempDir::new().unwrap();
        let mut a = fuzzer(&out_a);
        a.monitor.process(b"input1", &ok(0x0F));
        a.monitor.process(b"input2", &ok(0xFF));
        a.monitor.process(b"crash1", &crash(3));
        a.scheduler.push(b"seed-one".to_vec(), 12, 0.02);
        a.scheduler.push(b"seed-two".to_vec(), 4, 0.5);
        a.scheduler.pop();

        let ckpt_dir = out_a.path().join("checkpoints");
        let path = save(&ckpt_dir, &a, "manual").unwrap();
        assert_eq!(path.file_name().unwrap(), "checkpoint.json");

        let out_b = TempDir::new().unwrap();
        let mut b = fuzzer(&out_b);
        load(&path, &mut b).unwrap();

        assert_eq!(b.monitor.stats.total_execs, a.monitor.stats.total_execs);
        assert_eq!(b.monitor.stats.saved_crashes, a.monitor.stats.saved_crashes);
        assert_eq!(
            b.monitor.stats.total_coverage_bits,
            a.monitor.stats.total_coverage_bits
        );
        assert_eq!(b.monitor.virgin_bits, a.monitor.virgin_bits);
        assert_eq!(b.monitor.virgin_crash, a.monitor.virgin_crash);
        assert_eq!(b.monitor.virgin_tmout, a.monitor.virgin_tmout);

        let mut seeds_a: Vec<Vec<u8>> =
            a.scheduler.seeds().iter().map(|s| s.data.clone()).collect();
        let mut seeds_b: Vec<Vec<u8>> =
            b.scheduler.seeds().iter().map(|s| s.data.clone()).collect();
        seeds_a.sort();
        seeds_b.sort();
        assert_eq!(seeds_a, seeds_b);

        // use counts survived the trip through the push path
        assert!(b.scheduler.seeds().iter().any(|s| s.exec_count == 1));
    }

    #[test]
    fn elapsed_time_is_rebased_not_copied() {
        let out_a = TempDir::new().unwrap();
        let mut a = fuzzer(&out_a);
        // pretend the campaign has been running for 100s, snapshotted at 90s
        a.start_time -= 100.0;
        a.last_snapshot_time = a.start_time + 90.0;
        let path = save(&out_a.path().join("checkpoints"), &a, "pause").unwrap();

        let out_b = TempDir::new().unwrap();
        let mut b = fuzzer(&out_b);
        load(&path, &mut b).unwrap();
        let elapsed = now_secs() - b.start_time;
        assert!((elapsed - 90.0).abs() < 5.0, "elapsed was {elapsed}");
    }

    #[test]
    fn foreign_major_version_is_refused() {
        let out = TempDir::new().unwrap();
        let a = fuzzer(&out);
        let path = save(&out.path().join("checkpoints"), &a, "manual").unwrap();

        let mut value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        value["version"] = "9.0".into();
        fs::write(&path, value.to_string()).unwrap();

        let out_b = TempDir::new().unwrap();
        let mut b = fuzzer(&out_b);
        let err = load(&path, &mut b).unwrap_err();
        assert!(matches!(err, Error::Checkpoint(_)));
    }

    #[test]
    fn missing_checkpoint_refuses_resume() {
        let out = TempDir::new().unwrap();
        let mut b = fuzzer(&out);
        let err = load(Path::new("/nonexistent/checkpoint.json"), &mut b).unwrap_err();
        assert!(matches!(err, Error::Checkpoint(_)));
    }

    #[test]
    fn bitmap_size_mismatch_is_fatal() {
        let out = TempDir::new().unwrap();
        let a = fuzzer(&out);
        let path = save(&out.path().join("checkpoints"), &a, "manual").unwrap();

        let out_b = TempDir::new().unwrap();
        let mut b = Fuzzer::new(
            "other",
            Path::new("/bin/cat"),
            "cat @@",
            Path::new("/tmp/none"),
            out_b.path(),
            FuzzConfig {
                bitmap_size: 128,
                ..FuzzConfig::default()
            },
        )
        .unwrap();
        assert!(load(&path, &mut b).is_err());
    }
}
