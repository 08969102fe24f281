//! Time-series telemetry and the final campaign report.
//!
//! `timeline.csv` gets one row per log interval; `final_report.json` is
//! written once at the end. Both live in the output directory and are the
//! interface for external plotting and comparison tooling.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::Result;

const CSV_HEADER: &str = "timestamp,elapsed_sec,total_execs,exec_rate,total_crashes,\
saved_crashes,total_hangs,saved_hangs,coverage";

/// One telemetry snapshot.
#[derive(Debug, Clone)]
pub struct TimelineRow {
    pub elapsed_sec: f64,
    pub total_execs: u64,
    /// Executions per second since the previous row.
    pub exec_rate: f64,
    pub total_crashes: u64,
    pub saved_crashes: u64,
    pub total_hangs: u64,
    pub saved_hangs: u64,
    pub coverage: u64,
}

#[derive(Debug, Serialize)]
pub struct FinalReport {
    pub target_id: String,
    pub target_path: String,
    pub duration: f64,
    pub total_execs: u64,
    pub total_crashes: u64,
    pub total_hangs: u64,
    pub saved_crashes: u64,
    pub saved_hangs: u64,
    pub total_coverage_bits: u64,
    pub total_seeds: usize,
    /// Whole-run average executions per second.
    pub exec_rate: f64,
}

pub struct Telemetry {
    output_dir: PathBuf,
    csv_path: PathBuf,
}

impl Telemetry {
    /// Creates the output directory and (re)writes the CSV header.
    pub fn new(output_dir: &Path) -> Result<Self> {
        fs::create_dir_all(output_dir)?;
        let csv_path = output_dir.join("timeline.csv");
        fs::write(&csv_path, format!("{CSV_HEADER}\n"))?;
        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            csv_path,
        })
    }

    /// Appends one snapshot row.
    pub fn record(&self, row: &TimelineRow) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.csv_path)?;
        writeln!(
            file,
            "{},{:.1},{},{:.1},{},{},{},{},{}",
            chrono::Local::now().to_rfc3339(),
            row.elapsed_sec,
            row.total_execs,
            row.exec_rate,
            row.total_crashes,
            row.saved_crashes,
            row.total_hangs,
            row.saved_hangs,
            row.coverage,
        )?;
        Ok(())
    }

    pub fn write_final_report(&self, report: &FinalReport) -> Result<()> {
        let path = self.output_dir.join("final_report.json");
        fs::write(&path, serde_json::to_string_pretty(report)?)?;
        log::info!("final report written to {}", path.display());
        Ok(())
    }
}
