//! Counting semaphore that lives in shared memory.
//!
//! The count is a futex word, so a waiter in one process can be woken by a
//! post from another (Linux; other platforms fall back to short sleeps).
//! Waiters register themselves before sleeping, which lets the hot path skip
//! the wake syscall entirely when nobody is parked: `notify_if_waiting` is a
//! fence and a load in the common case.
//!
//! Waits take a readiness predicate and re-check it after registering, so a
//! notification racing with the decision to park is never lost.

use std::sync::atomic::{AtomicU32, Ordering, fence};
use std::time::{Duration, Instant};

/// Process-shared counting semaphore
#[repr(C)]
#[derive(Debug, Default)]
pub struct ShmSemaphore {
    count: AtomicU32,
    waiters: AtomicU32,
}

impl ShmSemaphore {
    /// Create a semaphore with an initial count
    #[must_use]
    pub const fn new(initial: u32) -> Self {
        Self {
            count: AtomicU32::new(initial),
            waiters: AtomicU32::new(0),
        }
    }

    /// Current count (racy, for diagnostics)
    pub fn value(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Number of registered waiters (racy, for diagnostics)
    pub fn waiters(&self) -> u32 {
        self.waiters.load(Ordering::Relaxed)
    }

    /// Increment the count and wake one waiter if any is parked
    pub fn post(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            futex_wake(&self.count, 1);
        }
    }

    /// Post only when a waiter is registered
    ///
    /// Callers publish their state change first; the fence orders that
    /// publication before the waiter check.
    #[inline]
    pub fn notify_if_waiting(&self) {
        fence(Ordering::SeqCst);
        if self.waiters.load(Ordering::Relaxed) > 0 {
            self.post();
        }
    }

    /// Decrement the count if it is positive
    pub fn try_wait(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        while current > 0 {
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Park until `ready()` holds or `timeout` elapses
    ///
    /// Returns the final value of `ready()`.
    pub fn wait_until<F>(&self, timeout: Duration, ready: F) -> bool
    where
        F: Fn() -> bool,
    {
        if ready() {
            return true;
        }

        let deadline = Instant::now() + timeout;
        loop {
            self.waiters.fetch_add(1, Ordering::SeqCst);
            fence(Ordering::SeqCst);

            if ready() {
                self.waiters.fetch_sub(1, Ordering::SeqCst);
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                self.waiters.fetch_sub(1, Ordering::SeqCst);
                return false;
            }

            if !self.try_wait() {
                futex_wait(&self.count, 0, deadline - now);
            }
            self.waiters.fetch_sub(1, Ordering::SeqCst);

            if ready() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: libc::c_long::from(timeout.subsec_nanos() as i32),
    };
    // SAFETY: the futex word is a live AtomicU32 inside a MAP_SHARED mapping
    // (or process memory); FUTEX_WAIT without the private flag keys on the
    // physical page so waiters in other processes share the queue. The
    // timespec outlives the call. Spurious wakeups are handled by the caller.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
            std::ptr::null::<u32>(),
            0,
        );
    }
}

#[cfg(target_os = "linux")]
fn futex_wake(word: &AtomicU32, count: i32) {
    // SAFETY: see futex_wait; FUTEX_WAKE only reads the address as a key.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    if word.load(Ordering::Acquire) == expected {
        std::thread::sleep(timeout.min(Duration::from_micros(200)));
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wake(_word: &AtomicU32, _count: i32) {}
