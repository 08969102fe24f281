//! The command line interface of the fuzzer

use std::path::PathBuf;

use clap::Parser;

use edgefuzz::config::SortStrategy;

#[derive(Debug, Parser)]
#[command(about = "Coverage-guided mutation fuzzer for AFL++-instrumented binaries")]
pub struct Cli {
    #[arg(
        help = "The instrumented binary we want to fuzz",
        long = "target",
        required = true
    )]
    pub target: PathBuf,

    #[arg(
        help = "Argument template; `@@` is replaced by the input file path, \
                without it the input arrives on stdin",
        long = "args",
        required = true,
        allow_hyphen_values = true
    )]
    pub args: String,

    #[arg(
        help = "The directory to read initial inputs from ('seeds')",
        long = "seeds",
        required = true
    )]
    pub seeds: PathBuf,

    #[arg(
        help = "The directory to store all outputs in",
        long = "output",
        required = true
    )]
    pub output: PathBuf,

    #[arg(
        help = "Wall-clock fuzzing budget in seconds",
        long = "duration",
        default_value = "3600"
    )]
    pub duration: u64,

    #[arg(help = "Identifier used in reports", long = "target-id", default_value = "unknown")]
    pub target_id: String,

    #[arg(
        help = "Timeout for each individual execution, in seconds",
        short = 't',
        long = "timeout",
        default_value = "1.0"
    )]
    pub timeout: f64,

    #[arg(
        help = "Address-space limit for the target, in MB",
        short = 'm',
        long = "mem-limit",
        default_value = "256"
    )]
    pub mem_limit: u64,

    #[arg(
        help = "Run the target inside a user-namespace sandbox (requires bwrap)",
        long = "use-sandbox",
        default_value = "false"
    )]
    pub use_sandbox: bool,

    #[arg(
        help = "Disable shared-memory coverage collection",
        long = "no-coverage",
        default_value = "false"
    )]
    pub no_coverage: bool,

    #[arg(help = "Coverage bitmap size in bytes", long = "bitmap-size", default_value = "65536")]
    pub bitmap_size: usize,

    #[arg(
        help = "Inputs larger than this never enter the seed queue, in bytes",
        long = "max-seed-size",
        default_value = "1048576"
    )]
    pub max_seed_size: usize,

    #[arg(
        help = "Mutation operators stacked per havoc call",
        long = "havoc-iterations",
        default_value = "16"
    )]
    pub havoc_iterations: usize,

    #[arg(
        help = "Seed scheduling strategy",
        long = "seed-sort-strategy",
        value_enum,
        default_value = "energy"
    )]
    pub seed_sort_strategy: SortStrategy,

    #[arg(help = "Maximum number of queued seeds", long = "max-seeds", default_value = "10000")]
    pub max_seeds: usize,

    #[arg(
        help = "Maximum total size of queued seeds, in MB",
        long = "max-seeds-memory",
        default_value = "512"
    )]
    pub max_seeds_memory: u64,

    #[arg(
        help = "Seconds between telemetry snapshots",
        long = "log-interval",
        default_value = "5.0"
    )]
    pub log_interval: f64,

    #[arg(
        help = "Captured stderr is truncated to this many bytes",
        long = "stderr-max-len",
        default_value = "1000"
    )]
    pub stderr_max_len: usize,

    #[arg(
        help = "Stderr kept in crash metadata is truncated to this many bytes",
        long = "crash-info-max-len",
        default_value = "500"
    )]
    pub crash_info_max_len: usize,

    #[arg(
        help = "Directory for pause checkpoints (default: <output>/checkpoints)",
        long = "checkpoint-path"
    )]
    pub checkpoint_path: Option<PathBuf>,

    #[arg(help = "Resume from an earlier checkpoint.json", long = "resume-from")]
    pub resume_from: Option<PathBuf>,
}

impl Cli {
    pub fn fuzz_config(&self) -> edgefuzz::config::FuzzConfig {
        edgefuzz::config::FuzzConfig {
            timeout: self.timeout,
            mem_limit: self.mem_limit,
            use_sandbox: self.use_sandbox,
            use_coverage: !self.no_coverage,
            bitmap_size: self.bitmap_size,
            max_seed_size: self.max_seed_size,
            havoc_iterations: self.havoc_iterations,
            seed_sort_strategy: self.seed_sort_strategy,
            max_seeds: self.max_seeds,
            max_seeds_memory: self.max_seeds_memory,
            log_interval: self.log_interval,
            stderr_max_len: self.stderr_max_len,
            crash_info_max_len: self.crash_info_max_len,
        }
    }
}
