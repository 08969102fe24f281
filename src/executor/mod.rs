//! Runs the target once per input under resource limits and harvests the
//! AFL-style coverage bitmap from shared memory.
//!
//! The target is started in its own session so the whole process group can be
//! signaled; on timeout the group gets SIGKILL, and after every execution the
//! group is swept so backgrounded grandchildren cannot outlive their run.
//! Failures inside the executor never abort the campaign: they come back as
//! an [`ExecResult`] with `crashed` set and the message in `stderr`.

pub mod sandbox;

use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::os::unix::io::AsRawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, Stdio};
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tempfile::TempDir;

use crate::config::FuzzConfig;
use crate::error::{Error, Result};
use crate::shm::AflShm;

/// Placeholder in the argument template replaced by the input file path.
/// When absent, the input is fed on stdin instead.
pub const INPUT_TOKEN: &str = "@@";

/// Outcome of one target execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub return_code: i32,
    /// Wall time in seconds.
    pub exec_time: f64,
    pub crashed: bool,
    pub timed_out: bool,
    /// Captured stderr, truncated to the configured cap.
    pub stderr: Vec<u8>,
    /// The edge-counter bitmap, absent when coverage is off or the run
    /// aborted before the instrumentation wrote anything.
    pub coverage: Option<Vec<u8>>,
}

impl ExecResult {
    /// The signal that terminated the target, from either the raw wait
    /// status or the 128+n shell convention.
    #[must_use]
    pub fn signal(&self) -> Option<i32> {
        if self.return_code < 0 {
            Some(-self.return_code)
        } else if self.return_code >= 128 {
            Some(self.return_code - 128)
        } else {
            None
        }
    }

    fn internal_error(message: String, elapsed: Duration) -> Self {
        Self {
            return_code: -1,
            exec_time: elapsed.as_secs_f64(),
            crashed: true,
            timed_out: false,
            stderr: message.into_bytes(),
            coverage: None,
        }
    }
}

/// Child configuration applied between fork and exec.
trait ConfigTarget {
    /// Makes the child a session leader so its group can be signaled.
    fn setsid(&mut self) -> &mut Self;
    /// Caps the address space at `memlimit` MiB (0 = no cap) and disables
    /// core dumps.
    fn setlimit(&mut self, memlimit: u64) -> &mut Self;
}

impl ConfigTarget for Command {
    fn setsid(&mut self) -> &mut Self {
        let func = move || {
            if unsafe { libc::setsid() } < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }

    #[allow(trivial_numeric_casts)]
    fn setlimit(&mut self, memlimit: u64) -> &mut Self {
        let func = move || {
            if memlimit > 0 {
                let bytes: libc::rlim_t = (memlimit as libc::rlim_t) << 20;
                let r = libc::rlimit {
                    rlim_cur: bytes,
                    rlim_max: bytes,
                };
                if unsafe { libc::setrlimit(libc::RLIMIT_AS, &r) } < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            let r0 = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            if unsafe { libc::setrlimit(libc::RLIMIT_CORE, &r0) } < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        };
        unsafe { self.pre_exec(func) }
    }
}

#[derive(Debug)]
pub struct Executor {
    target_path: PathBuf,
    target_dir: PathBuf,
    target_args: String,
    timeout: Duration,
    mem_limit: u64,
    sandbox_helper: Option<PathBuf>,
    stderr_max_len: usize,
    scratch: Option<TempDir>,
    input_path: PathBuf,
    shm: Option<AflShm>,
}

impl Executor {
    pub fn new(target: &Path, target_args: &str, config: &FuzzConfig) -> Result<Self> {
        let target_path = fs::canonicalize(target)
            .map_err(|err| Error::Config(format!("target {}: {err}", target.display())))?;
        let target_dir = target_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        let sandbox_helper = if config.use_sandbox {
            let helper = sandbox::find_helper().ok_or_else(|| {
                Error::Config(format!(
                    "sandboxing requested but `{}` was not found in PATH",
                    sandbox::HELPER
                ))
            })?;
            Some(helper)
        } else {
            None
        };

        let scratch = tempfile::Builder::new().prefix("fuzz_").tempdir()?;
        let input_path = scratch.path().join("input");

        let shm = if config.use_coverage {
            let shm = AflShm::new(config.bitmap_size)?;
            log::info!("coverage enabled, shm id {}", shm.id());
            Some(shm)
        } else {
            None
        };

        log::info!(
            "executor ready for {} (scratch {})",
            target_path.display(),
            scratch.path().display()
        );

        Ok(Self {
            target_path,
            target_dir,
            target_args: target_args.to_string(),
            timeout: Duration::from_secs_f64(config.timeout),
            mem_limit: config.mem_limit,
            sandbox_helper,
            stderr_max_len: config.stderr_max_len,
            scratch: Some(scratch),
            input_path,
            shm,
        })
    }

    #[must_use]
    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    /// Runs the target on `input` once.
    pub fn execute(&mut self, input: &[u8]) -> ExecResult {
        if let Some(shm) = &mut self.shm {
            shm.clear();
        }

        let start = Instant::now();

        if self.scratch.is_none() {
            return ExecResult::internal_error(
                "executor already cleaned up".to_string(),
                start.elapsed(),
            );
        }
        if let Err(err) = fs::write(&self.input_path, input) {
            return ExecResult::internal_error(
                format!("failed to write input file: {err}"),
                start.elapsed(),
            );
        }

        let mut command = match self.build_command() {
            Ok(command) => command,
            Err(err) => {
                return ExecResult::internal_error(
                    format!("failed to set up target command: {err}"),
                    start.elapsed(),
                )
            }
        };

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return ExecResult::internal_error(
                    format!("failed to spawn target: {err}"),
                    start.elapsed(),
                )
            }
        };
        // setsid in the child makes its pid the process-group id
        let pgid = Pid::from_raw(child.id() as i32);

        let result = match self.wait_child(&mut child, start) {
            Ok(result) => result,
            Err(err) => {
                let _ = killpg(pgid, Signal::SIGKILL);
                let _ = child.wait();
                ExecResult::internal_error(format!("execution failed: {err}"), start.elapsed())
            }
        };

        // sweep stragglers the target may have backgrounded
        let _ = killpg(pgid, Signal::SIGKILL);
        result
    }

    fn build_command(&self) -> std::io::Result<Command> {
        let use_stdin = !self.target_args.contains(INPUT_TOKEN);
        let cmdline = if use_stdin {
            self.target_args.clone()
        } else {
            self.target_args
                .replace(INPUT_TOKEN, &self.input_path.to_string_lossy())
        };

        let scratch_dir = self
            .scratch
            .as_ref()
            .expect("checked by execute")
            .path()
            .to_path_buf();

        let mut command = if let Some(helper) = &self.sandbox_helper {
            let mut command = Command::new(helper);
            command.args(sandbox::sandbox_args(&self.target_dir, &scratch_dir));
            command.arg("/bin/sh").arg("-c").arg(&cmdline);
            command
        } else {
            let mut command = Command::new("/bin/sh");
            command.arg("-c").arg(&cmdline);
            command
        };

        command.stdout(Stdio::null()).stderr(Stdio::piped());
        // In stdin mode the executor opens the scratch file itself; shell
        // redirection would not survive the sandbox boundary.
        if use_stdin {
            command.stdin(Stdio::from(File::open(&self.input_path)?));
        } else {
            command.stdin(Stdio::null());
        }

        if let Some(shm) = &self.shm {
            command.env("__AFL_SHM_ID", shm.id().to_string());
            // one fresh exec per input; no forkserver handshake
            command.env("AFL_NO_FORKSRV", "1");
        }

        // rlimits would hit the sandbox helper instead of the target
        let memlimit = if self.sandbox_helper.is_some() {
            0
        } else {
            self.mem_limit
        };
        command.setsid().setlimit(memlimit);
        Ok(command)
    }

    fn wait_child(&self, child: &mut Child, start: Instant) -> std::io::Result<ExecResult> {
        let mut stderr_pipe = child.stderr.take();
        if let Some(pipe) = &stderr_pipe {
            fcntl(pipe.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
                .map_err(std::io::Error::from)?;
        }
        let mut stderr = Vec::new();

        let status = loop {
            if let Some(pipe) = &mut stderr_pipe {
                drain_stderr(pipe, &mut stderr, self.stderr_max_len);
            }

            if let Some(status) = child.try_wait()? {
                break status;
            }

            if start.elapsed() >= self.timeout {
                let pgid = Pid::from_raw(child.id() as i32);
                let _ = killpg(pgid, Signal::SIGKILL);
                child.wait()?;
                return Ok(ExecResult {
                    return_code: -1,
                    exec_time: start.elapsed().as_secs_f64(),
                    crashed: false,
                    timed_out: true,
                    stderr: b"Execution timeout".to_vec(),
                    coverage: None,
                });
            }

            std::thread::sleep(Duration::from_millis(1));
        };
        let exec_time = start.elapsed().as_secs_f64();

        if let Some(pipe) = &mut stderr_pipe {
            drain_stderr(pipe, &mut stderr, self.stderr_max_len);
        }

        let return_code = match status.code() {
            Some(code) => code,
            None => -status.signal().unwrap_or(0),
        };
        let crashed = return_code < 0 || return_code >= 128;

        Ok(ExecResult {
            return_code,
            exec_time,
            crashed,
            timed_out: false,
            stderr,
            coverage: self.shm.as_ref().map(AflShm::read),
        })
    }

    /// Removes the scratch directory and the shared-memory segment. Runs on
    /// drop as well; calling it twice is fine.
    pub fn cleanup(&mut self) {
        if let Some(scratch) = self.scratch.take() {
            if let Err(err) = scratch.close() {
                log::warn!("scratch cleanup failed: {err}");
            }
        }
        if let Some(mut shm) = self.shm.take() {
            shm.cleanup();
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn drain_stderr(pipe: &mut ChildStderr, buf: &mut Vec<u8>, cap: usize) {
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                // keep the head, but keep reading so the pipe never fills
                if buf.len() < cap {
                    let take = (cap - buf.len()).min(n);
                    buf.extend_from_slice(&chunk[..take]);
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;

    fn config(use_coverage: bool, timeout: f64) -> FuzzConfig {
        FuzzConfig {
            use_coverage,
            timeout,
            bitmap_size: 1024,
            ..FuzzConfig::default()
        }
    }

    #[test]
    fn cat_of_a_file_succeeds() {
        let mut executor =
            Executor::new(Path::new("/bin/cat"), "cat @@", &config(false, 5.0)).unwrap();
        let result = executor.execute(b"Hello");
        assert_eq!(result.return_code, 0);
        assert!(!result.crashed);
        assert!(!result.timed_out);
        assert!(result.exec_time > 0.0);
    }

    #[test]
    fn missing_token_feeds_stdin() {
        let mut executor =
            Executor::new(Path::new("/bin/cat"), "cat", &config(false, 5.0)).unwrap();
        let result = executor.execute(b"from stdin");
        assert_eq!(result.return_code, 0);
        assert!(!result.crashed);
    }

    #[test]
    fn binary_input_round_trips() {
        let mut executor =
            Executor::new(Path::new("/bin/cat"), "cat @@", &config(false, 5.0)).unwrap();
        let result = executor.execute(b"\x00\x01\x02\xFF\xFE");
        assert_eq!(result.return_code, 0);
    }

    #[test]
    fn sleep_times_out_within_budget() {
        let mut executor =
            Executor::new(Path::new("/bin/sleep"), "sleep 10", &config(false, 1.0)).unwrap();
        let start = Instant::now();
        let result = executor.execute(b"");
        let wall = start.elapsed().as_secs_f64();

        assert!(result.timed_out);
        assert!(!result.crashed);
        assert_eq!(result.return_code, -1);
        assert!(wall <= 2.5, "timeout took {wall}s");
    }

    #[test]
    fn coverage_bitmap_is_harvested() {
        let mut executor =
            Executor::new(Path::new("/bin/cat"), "cat @@", &config(true, 5.0)).unwrap();
        let result = executor.execute(b"x");
        // an uninstrumented target writes nothing, but the bitmap is there
        let coverage = result.coverage.unwrap();
        assert_eq!(coverage.len(), 1024);
        assert!(coverage.iter().all(|&b| b == 0));
    }

    #[test]
    fn missing_target_is_a_config_error() {
        let err = Executor::new(
            Path::new("/nonexistent/program"),
            "program @@",
            &config(false, 1.0),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn stderr_is_captured_and_capped() {
        let cfg = FuzzConfig {
            stderr_max_len: 16,
            ..config(false, 5.0)
        };
        let mut executor =
            Executor::new(Path::new("/bin/sh"), "sh -c 'echo 0123456789abcdefGHIJK >&2'", &cfg)
                .unwrap();
        let result = executor.execute(b"");
        assert_eq!(result.stderr.len(), 16);
        assert!(result.stderr.starts_with(b"0123456789"));
    }

    #[test]
    fn nonzero_signal_exit_is_a_crash() {
        let mut executor =
            Executor::new(Path::new("/bin/sh"), "sh -c 'kill -s SEGV $$'", &config(false, 5.0))
                .unwrap();
        let result = executor.execute(b"");
        assert!(result.crashed);
        assert_eq!(result.signal(), Some(11));
    }

    #[test]
    fn backgrounded_children_do_not_leak() {
        let marker = "1375.53";
        let script_dir = tempfile::tempdir().unwrap();
        let script = script_dir.path().join("bg.sh");
        fs::write(&script, format!("#!/bin/sh\nsleep {marker} &\necho done\n")).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let mut executor = Executor::new(&script, &script.to_string_lossy(), &config(false, 2.0))
            .unwrap();
        let result = executor.execute(b"");
        assert!(!result.timed_out);

        std::thread::sleep(Duration::from_millis(300));
        assert!(
            !process_with_cmdline_exists(marker),
            "leaked a backgrounded sleep"
        );
    }

    fn process_with_cmdline_exists(marker: &str) -> bool {
        let Ok(entries) = fs::read_dir("/proc") else {
            return false;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            if let Ok(cmdline) = fs::read(entry.path().join("cmdline")) {
                if String::from_utf8_lossy(&cmdline).contains(marker) {
                    return true;
                }
            }
        }
        false
    }

    #[test]
    fn cleanup_removes_scratch_dir_and_is_idempotent() {
        let mut executor =
            Executor::new(Path::new("/bin/cat"), "cat @@", &config(false, 5.0)).unwrap();
        let scratch = executor.scratch.as_ref().unwrap().path().to_path_buf();
        assert!(scratch.exists());
        executor.cleanup();
        assert!(!scratch.exists());
        executor.cleanup();

        let result = executor.execute(b"late");
        assert!(result.crashed);
    }

    #[test]
    fn signal_mapping_covers_both_conventions() {
        let mut result = ExecResult {
            return_code: -11,
            exec_time: 0.0,
            crashed: true,
            timed_out: false,
            stderr: Vec::new(),
            coverage: None,
        };
        assert_eq!(result.signal(), Some(11));
        result.return_code = 139;
        assert_eq!(result.signal(), Some(11));
        result.return_code = 0;
        assert_eq!(result.signal(), None);
    }
}
