//! AFL-compatible System V shared memory.
//!
//! The target's instrumentation attaches the segment whose id it finds in
//! `__AFL_SHM_ID` and bumps one byte per edge transition. One segment belongs
//! to exactly one [`crate::executor::Executor`] for its whole lifetime.

use crate::error::{Error, Result};

/// A private SysV shared-memory segment holding the edge-counter bitmap.
#[derive(Debug)]
pub struct AflShm {
    id: i32,
    base: *mut u8,
    size: usize,
}

impl AflShm {
    /// Allocates and attaches a fresh segment of `size` bytes, mode 0600.
    pub fn new(size: usize) -> Result<Self> {
        let id = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                size,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };
        if id < 0 {
            return Err(Error::Shm(format!(
                "shmget of {size} bytes failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let base = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if base as isize == -1 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut());
            }
            return Err(Error::Shm(format!("shmat of segment {id} failed: {err}")));
        }

        Ok(Self {
            id,
            base: base as *mut u8,
            size,
        })
    }

    /// The segment id the target reads from `__AFL_SHM_ID`.
    #[must_use]
    pub fn id(&self) -> i32 {
        self.id
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Zeroes the bitmap before the next execution.
    pub fn clear(&mut self) {
        unsafe { std::ptr::write_bytes(self.base, 0, self.size) };
    }

    /// Copies the bitmap out of the segment.
    #[must_use]
    pub fn read(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.size];
        unsafe { std::ptr::copy_nonoverlapping(self.base, out.as_mut_ptr(), self.size) };
        out
    }

    /// Detaches and removes the segment. Safe to call more than once.
    pub fn cleanup(&mut self) {
        if self.id >= 0 {
            unsafe {
                libc::shmdt(self.base as *const libc::c_void);
                libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut());
            }
            self.id = -1;
        }
    }
}

impl Drop for AflShm {
    fn drop(&mut self) {
        self.cleanup();
    }
}
