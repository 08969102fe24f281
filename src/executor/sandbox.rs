//! User-namespace sandboxing of the target via bubblewrap.
//!
//! The wrapped command gets a read-only view of the root filesystem, fresh
//! `/dev`, `/proc` and `/tmp`, write access only to the target's own
//! directory and the executor's scratch directory, its own PID namespace and
//! session, and dies with the fuzzer.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Name of the sandbox helper looked up on PATH.
pub const HELPER: &str = "bwrap";

/// Finds the helper binary on PATH, checking the executable bit.
#[must_use]
pub fn find_helper() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(HELPER);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Builds the helper's argument list up to and including the `--` separator.
/// The caller appends the actual target command after it.
#[must_use]
pub fn sandbox_args(target_dir: &Path, scratch_dir: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--ro-bind".into(),
        "/".into(),
        "/".into(),
        "--dev".into(),
        "/dev".into(),
        "--proc".into(),
        "/proc".into(),
        "--tmpfs".into(),
        "/tmp".into(),
    ];
    for dir in [target_dir, scratch_dir] {
        args.push("--bind".into());
        args.push(dir.into());
        args.push(dir.into());
    }
    args.extend([
        "--unshare-pid".into(),
        "--die-with-parent".into(),
        "--new-session".into(),
        "--".into(),
    ]);
    args
}
