//! Task Timing
//!
//! Real time always comes from the monotonic clock. Per-thread CPU time is
//! only available on platforms that expose a thread CPU clock; callers
//! must treat it as optional.

use std::time::Instant;

/// Milliseconds of CPU time consumed by the calling thread, if measurable.
#[cfg(unix)]
#[must_use]
pub fn thread_cpu_time_ms() -> Option<i64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime only writes the timespec we hand it.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &raw mut ts) };
    if rc == 0 {
        Some(ts.tv_sec as i64 * 1000 + ts.tv_nsec as i64 / 1_000_000)
    } else {
        None
    }
}

#[cfg(not(unix))]
#[must_use]
pub fn thread_cpu_time_ms() -> Option<i64> {
    None
}

/// Timer for one task's worker thread: wall clock plus (where supported)
/// the thread CPU clock.
pub struct TaskTimer {
    start: Instant,
    cpu_start: Option<i64>,
}

impl Default for TaskTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskTimer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            cpu_start: thread_cpu_time_ms(),
        }
    }

    pub fn reset(&mut self) {
        self.start = Instant::now();
        self.cpu_start = thread_cpu_time_ms();
    }

    #[must_use]
    pub fn elapsed_real_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    /// Thread CPU time since construction, or `None` where the platform
    /// cannot measure it.
    #[must_use]
    pub fn elapsed_cpu_ms(&self) -> Option<i64> {
        let start = self.cpu_start?;
        let now = thread_cpu_time_ms()?;
        Some((now - start).max(0))
    }

    #[must_use]
    pub fn has_valid_cpu_time(&self) -> bool {
        self.cpu_start.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_time_is_monotone() {
        let timer = TaskTimer::new();
        let t0 = timer.elapsed_real_ms();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(timer.elapsed_real_ms() >= t0);
    }

    #[cfg(unix)]
    #[test]
    fn cpu_time_is_available_on_unix() {
        let timer = TaskTimer::new();
        assert!(timer.has_valid_cpu_time());
        // Burn a little CPU so the clock moves somewhere non-negative.
        let mut acc = 0u64;
        for i in 0..100_000u64 {
            acc = acc.wrapping_add(i * i);
        }
        std::hint::black_box(acc);
        assert!(timer.elapsed_cpu_ms().unwrap() >= 0);
    }
}
