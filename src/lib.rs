//! edgefuzz, a coverage-guided mutation fuzzer for Linux binaries
//! instrumented with the AFL++ edge-coverage convention.

pub mod checkpoint;
pub mod config;
pub mod coverage;
pub mod error;
pub mod executor;
pub mod fuzzer;
pub mod monitor;
pub mod mutator;
pub mod scheduler;
pub mod shm;
pub mod telemetry;

pub use error::{Error, Result};
