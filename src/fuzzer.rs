//! The core fuzzing loop: seed ingestion, scheduling, mutation, execution,
//! classification, telemetry and cooperative shutdown.
//!
//! Signal handlers only set flags; the loop polls them before seed selection
//! and between mutations of the same seed, so the worst-case latency from
//! signal to action is one execution. A first SIGINT or SIGTERM requests an
//! orderly pause (checkpoint, then exit); a second one while the first is
//! pending exits immediately.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::SeedableRng;
use signal_hook::consts::{SIGINT, SIGTERM};
use walkdir::WalkDir;

use crate::checkpoint;
use crate::config::FuzzConfig;
use crate::coverage::{count_bits, CoverageTracker};
use crate::error::Result;
use crate::executor::Executor;
use crate::monitor::ExecutionMonitor;
use crate::mutator::Mutator;
use crate::scheduler::SeedScheduler;
use crate::telemetry::{FinalReport, Telemetry, TimelineRow};

/// Upper bound on mutations drawn from one seed selection.
const MAX_ENERGY_USES: i64 = 16;

/// Seconds since the Unix epoch.
pub(crate) fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub struct Fuzzer {
    pub(crate) target_id: String,
    pub(crate) target_path: PathBuf,
    pub(crate) target_args: String,
    pub(crate) seed_dir: PathBuf,
    pub(crate) output_dir: PathBuf,
    pub(crate) config: FuzzConfig,
    pub(crate) checkpoint_dir: PathBuf,

    executor: Executor,
    pub(crate) monitor: ExecutionMonitor,
    pub(crate) scheduler: SeedScheduler,
    telemetry: Telemetry,
    coverage: CoverageTracker,
    rng: StdRng,

    pub(crate) start_time: f64,
    pub(crate) last_snapshot_time: f64,
    pub(crate) last_coverage: u64,
    pub(crate) last_execs: u64,

    pause: Arc<AtomicBool>,
    term: Arc<AtomicBool>,
}

impl Fuzzer {
    pub fn new(
        target_id: &str,
        target: &Path,
        target_args: &str,
        seed_dir: &Path,
        output_dir: &Path,
        config: FuzzConfig,
    ) -> Result<Self> {
        let telemetry = Telemetry::new(output_dir)?;
        let monitor = ExecutionMonitor::new(output_dir, &config)?;
        let executor = Executor::new(target, target_args, &config)?;
        let scheduler = SeedScheduler::new(
            config.seed_sort_strategy,
            config.max_seeds,
            config.max_seeds_memory_bytes(),
        );
        let coverage = CoverageTracker::new(config.bitmap_size);
        let (pause, term) = register_signals()?;

        let now = now_secs();
        Ok(Self {
            target_id: target_id.to_string(),
            target_path: executor.target_path().to_path_buf(),
            target_args: target_args.to_string(),
            seed_dir: seed_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            checkpoint_dir: output_dir.join("checkpoints"),
            config,
            executor,
            monitor,
            scheduler,
            telemetry,
            coverage,
            rng: StdRng::from_entropy(),
            start_time: now,
            last_snapshot_time: now,
            last_coverage: 0,
            last_execs: 0,
            pause,
            term,
        })
    }

    /// Overrides where pause checkpoints are written.
    pub fn set_checkpoint_dir(&mut self, dir: &Path) {
        self.checkpoint_dir = dir.to_path_buf();
    }

    /// Restores runtime state from an earlier checkpoint.
    pub fn resume_from(&mut self, path: &Path) -> Result<()> {
        checkpoint::load(path, self)
    }

    fn stop_requested(&self) -> bool {
        self.pause.load(Ordering::Relaxed) || self.term.load(Ordering::Relaxed)
    }

    /// Runs the campaign for at most `duration_secs` of wall time, then
    /// persists final stats and the report. Returns early on pause or
    /// termination, writing a checkpoint first.
    pub fn run(&mut self, duration_secs: u64) -> Result<()> {
        log::info!(
            "fuzzing {} ({}) with args `{}` for {}s",
            self.target_id,
            self.target_path.display(),
            self.target_args,
            duration_secs
        );

        self.load_initial_seeds();

        let duration = duration_secs as f64;
        'campaign: while now_secs() - self.start_time < duration {
            if self.stop_requested() {
                break;
            }
            let Some(seed) = self.scheduler.pop() else {
                log::warn!("seed queue is empty, stopping");
                break;
            };

            let energy_uses = (seed.energy as i64).clamp(1, MAX_ENERGY_USES) as usize;
            for _ in 0..energy_uses {
                if self.stop_requested() {
                    break 'campaign;
                }
                let mutant = Mutator::havoc(&seed.data, self.config.havoc_iterations, &mut self.rng);
                let result = self.executor.execute(&mutant);

                if let Some(trace) = &result.coverage {
                    let (delta, fresh) = self.coverage.update(trace);
                    if fresh {
                        log::debug!(
                            "trace union grew by {delta} bits to {}",
                            self.coverage.count()
                        );
                    }
                }

                let interesting = self.monitor.process(&mutant, &result);
                if interesting && mutant.len() <= self.config.max_seed_size {
                    let bits = result.coverage.as_deref().map(count_bits).unwrap_or(0);
                    self.scheduler.push(mutant, bits as u64, result.exec_time);
                }

                if self.monitor.stats.total_coverage_bits > self.last_coverage {
                    log::info!(
                        "new coverage: {} bits",
                        self.monitor.stats.total_coverage_bits
                    );
                    self.last_coverage = self.monitor.stats.total_coverage_bits;
                }
            }

            if now_secs() - self.last_snapshot_time >= self.config.log_interval {
                self.snapshot();
            }
        }

        self.finalize()
    }

    /// Walks the seed directory (following symlinks) and runs every file once
    /// so its coverage primes the virgin bitmaps. Each file is added to the
    /// queue regardless of how it classified; with no usable seeds at all, a
    /// single empty seed gets the campaign going.
    fn load_initial_seeds(&mut self) {
        let mut loaded = 0usize;
        if self.seed_dir.exists() {
            for entry in WalkDir::new(&self.seed_dir).follow_links(true) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        log::warn!("skipping unreadable seed entry: {err}");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let data = match fs::read(entry.path()) {
                    Ok(data) => data,
                    Err(err) => {
                        log::warn!("could not read seed {}: {err}", entry.path().display());
                        continue;
                    }
                };
                if data.len() > self.config.max_seed_size {
                    log::warn!(
                        "skipping oversized seed {} ({} bytes)",
                        entry.path().display(),
                        data.len()
                    );
                    continue;
                }

                let result = self.executor.execute(&data);
                if let Some(trace) = &result.coverage {
                    self.coverage.update(trace);
                }
                let bits = result.coverage.as_deref().map(count_bits).unwrap_or(0);
                self.monitor.process(&data, &result);
                self.scheduler.push(data, bits as u64, result.exec_time);
                loaded += 1;
            }
        } else {
            log::warn!("seed directory {} not found", self.seed_dir.display());
        }

        if loaded == 0 {
            log::warn!("no usable seeds, starting from an empty input");
            self.scheduler.push(Vec::new(), 0, 0.1);
        } else {
            log::info!("loaded {loaded} initial seeds");
        }
    }

    fn snapshot(&mut self) {
        let now = now_secs();
        let elapsed_recent = now - self.last_snapshot_time;
        let stats = &self.monitor.stats;
        let recent_execs = stats.total_execs - self.last_execs;
        let exec_rate = if elapsed_recent > 0.0 {
            recent_execs as f64 / elapsed_recent
        } else {
            0.0
        };

        let row = TimelineRow {
            elapsed_sec: now - self.start_time,
            total_execs: stats.total_execs,
            exec_rate,
            total_crashes: stats.total_crashes,
            saved_crashes: stats.saved_crashes,
            total_hangs: stats.total_hangs,
            saved_hangs: stats.saved_hangs,
            coverage: stats.total_coverage_bits,
        };
        if let Err(err) = self.telemetry.record(&row) {
            log::warn!("dropping telemetry row: {err}");
        }

        log::info!(
            "t={:6.1}s | execs {:8} | {:6.1}/s | coverage {:5} | crashes {} ({} saved)",
            now - self.start_time,
            stats.total_execs,
            exec_rate,
            stats.total_coverage_bits,
            stats.total_crashes,
            stats.saved_crashes,
        );

        self.last_snapshot_time = now;
        self.last_execs = stats.total_execs;
    }

    fn finalize(&mut self) -> Result<()> {
        let reason = if self.term.load(Ordering::Relaxed) {
            Some("sigterm")
        } else if self.pause.load(Ordering::Relaxed) {
            Some("pause")
        } else {
            None
        };
        if let Some(reason) = reason {
            let dir = self.checkpoint_dir.clone();
            match checkpoint::save(&dir, self, reason) {
                Ok(path) => log::info!("checkpoint saved to {}", path.display()),
                // exit still succeeds; the campaign just cannot be resumed
                Err(err) => log::error!("checkpoint save failed: {err}"),
            }
        }

        if let Err(err) = self.monitor.write_stats() {
            log::warn!("could not write stats.json: {err}");
        }

        let elapsed = now_secs() - self.start_time;
        let stats = &self.monitor.stats;
        self.telemetry.write_final_report(&FinalReport {
            target_id: self.target_id.clone(),
            target_path: self.target_path.display().to_string(),
            duration: elapsed,
            total_execs: stats.total_execs,
            total_crashes: stats.total_crashes,
            total_hangs: stats.total_hangs,
            saved_crashes: stats.saved_crashes,
            saved_hangs: stats.saved_hangs,
            total_coverage_bits: stats.total_coverage_bits,
            total_seeds: self.scheduler.len(),
            exec_rate: if elapsed > 0.0 {
                stats.total_execs as f64 / elapsed
            } else {
                0.0
            },
        })?;

        log::info!(
            "done after {elapsed:.1}s: {} execs, {} crashes ({} saved), {} hangs ({} saved)",
            stats.total_execs,
            stats.total_crashes,
            stats.saved_crashes,
            stats.total_hangs,
            stats.saved_hangs,
        );
        Ok(())
    }
}

/// Registers pause/terminate flags. The conditional-shutdown hooks run
/// first, so a repeated signal while its flag is already up exits on the
/// spot with the conventional 128+n status.
fn register_signals() -> Result<(Arc<AtomicBool>, Arc<AtomicBool>)> {
    let pause = Arc::new(AtomicBool::new(false));
    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register_conditional_shutdown(SIGINT, 130, Arc::clone(&pause))?;
    signal_hook::flag::register(SIGINT, Arc::clone(&pause))?;
    signal_hook::flag::register_conditional_shutdown(SIGTERM, 143, Arc::clone(&term))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&term))?;
    Ok((pause, term))
}
