//! The crate-wide error type.
//!
//! Only non-recoverable conditions surface as [`Error`]. Failures that the
//! fuzzing loop should survive (a target that cannot be spawned, a scratch
//! file that cannot be written) are folded into
//! [`crate::executor::ExecResult`] instead, so a bad mutation never takes
//! down the campaign.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid command line or campaign setup. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A System V shared-memory call failed. Fatal to executor construction.
    #[error("shared memory error: {0}")]
    Shm(String),

    /// A checkpoint could not be written, read or understood.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
