//! Cross-process notification via POSIX semaphores in shared memory
//!
//! Each inbound queue embeds one `SharedSemaphore`. Producers post it only on
//! the 0→1 transition of the queue's pending counter; the receive loop waits
//! on it with a timeout and re-checks the counter after every return.

use std::cell::UnsafeCell;
#[cfg(test)]
use std::mem::MaybeUninit;

use crate::error::{LrpcError, Result};

/// Counting semaphore with process-shared attributes, resident in a segment
///
/// The wrapper is only ever accessed through a pointer into mapped shared
/// memory (or a pinned allocation in tests); it is never moved after
/// `init_in_place`.
#[repr(C)]
pub struct SharedSemaphore {
    sem: UnsafeCell<libc::sem_t>,
}

unsafe impl Send for SharedSemaphore {}
unsafe impl Sync for SharedSemaphore {}

impl SharedSemaphore {
    /// Initialize a semaphore in place with a zero count
    ///
    /// # Safety
    /// `ptr` must point to uninitialized or zeroed memory inside a mapping
    /// shared by every process that will post or wait. Must be called exactly
    /// once per location before any other operation.
    pub unsafe fn init_in_place(ptr: *mut SharedSemaphore) -> Result<()> {
        let rc = libc::sem_init((*ptr).sem.get(), 1, 0);
        if rc != 0 {
            return Err(LrpcError::platform(format!(
                "sem_init failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Wake one waiter (or bank a token if nobody waits)
    pub fn post(&self) -> Result<()> {
        let rc = unsafe { libc::sem_post(self.sem.get()) };
        if rc != 0 {
            return Err(LrpcError::platform(format!(
                "sem_post failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Wait up to `timeout_ms`; returns `true` when signalled, `false` on
    /// timeout
    pub fn timed_wait(&self, timeout_ms: u64) -> Result<bool> {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // sem_timedwait takes an absolute CLOCK_REALTIME deadline
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
        if rc != 0 {
            return Err(LrpcError::platform("clock_gettime failed".to_string()));
        }

        let mut deadline = now;
        deadline.tv_sec += (timeout_ms / 1000) as libc::time_t;
        deadline.tv_nsec += ((timeout_ms % 1000) * 1_000_000) as libc::c_long;
        if deadline.tv_nsec >= 1_000_000_000 {
            deadline.tv_sec += 1;
            deadline.tv_nsec -= 1_000_000_000;
        }

        loop {
            let rc = unsafe { libc::sem_timedwait(self.sem.get(), &deadline) };
            if rc == 0 {
                return Ok(true);
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => {
                    return Err(LrpcError::platform(format!(
                        "sem_timedwait failed: {}",
                        std::io::Error::last_os_error()
                    )))
                }
            }
        }
    }

    /// Consume any banked tokens without blocking
    pub fn drain(&self) {
        while unsafe { libc::sem_trywait(self.sem.get()) } == 0 {}
    }

    /// Destroy the semaphore
    ///
    /// # Safety
    /// Only the segment owner may call this, after every other process has
    /// stopped using the segment.
    pub unsafe fn destroy(&self) {
        libc::sem_destroy(self.sem.get());
    }
}

/// Heap-pinned semaphore for single-process use in tests
#[cfg(test)]
pub(crate) struct OwnedSemaphore {
    inner: Box<MaybeUninit<SharedSemaphore>>,
}

#[cfg(test)]
impl OwnedSemaphore {
    pub fn new() -> Result<Self> {
        let mut inner: Box<MaybeUninit<SharedSemaphore>> = Box::new(MaybeUninit::uninit());
        unsafe { SharedSemaphore::init_in_place(inner.as_mut_ptr()) }?;
        Ok(Self { inner })
    }

    pub fn get(&self) -> &SharedSemaphore {
        unsafe { self.inner.assume_init_ref() }
    }
}

#[cfg(test)]
impl Drop for OwnedSemaphore {
    fn drop(&mut self) {
        unsafe { self.get().destroy() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_post_then_wait() {
        let sem = OwnedSemaphore::new().unwrap();
        sem.get().post().unwrap();
        assert!(sem.get().timed_wait(100).unwrap());
    }

    #[test]
    fn test_wait_times_out() {
        let sem = OwnedSemaphore::new().unwrap();
        let start = Instant::now();
        assert!(!sem.get().timed_wait(50).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_cross_thread_wakeup() {
        use std::sync::Arc;

        let sem = Arc::new(OwnedSemaphore::new().unwrap());
        let poster = sem.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            poster.get().post().unwrap();
        });

        assert!(sem.get().timed_wait(2_000).unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn test_drain_consumes_tokens() {
        let sem = OwnedSemaphore::new().unwrap();
        sem.get().post().unwrap();
        sem.get().post().unwrap();
        sem.get().drain();
        assert!(!sem.get().timed_wait(10).unwrap());
    }
}
