//! Low-overhead microsecond timestamps.
//!
//! Reading the wall clock on every hook event would dominate the cost of
//! tracing, so the clock derives timestamps from the CPU cycle counter,
//! calibrated once at startup, and re-syncs against the wall clock every
//! second to bound drift. Reads never allocate and never take a lock, which
//! makes them safe to call from the profile-hook context.

use std::io;

use thiserror::Error;

/// How often a fast read is re-synced against the wall clock, in µs.
const SYNC_INTERVAL: u64 = 1_000_000;

/// Errors that can be occurred by calibrating the clock.
#[derive(Error, Debug)]
pub enum Error {
    /// The CPU frequency could not be read from the operating system.
    #[error("calibration: {0}")]
    Calibration(io::Error),
}

/// A monotonic microsecond clock owned by a single tracer.
pub struct Clock {
    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    cycles_per_usec: f64,
    boot_time: u64,
    last_sync: u64,
    last_read: u64,
}

impl Clock {
    /// Calibrates and constructs the clock. Calibration failure is fatal to
    /// tracer construction.
    pub fn new() -> Result<Self, Error> {
        #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
        {
            let cycles_per_usec = cpu_freq_usec()?;
            let wall = wall_time();
            let boot_time = wall - (cycles() as f64 / cycles_per_usec) as u64;
            Ok(Self { cycles_per_usec, boot_time, last_sync: wall, last_read: wall })
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
        {
            let wall = wall_time();
            Ok(Self { boot_time: 0, last_sync: wall, last_read: wall })
        }
    }

    /// Microseconds since the Unix epoch, monotonic non-decreasing.
    pub fn now(&mut self) -> u64 {
        let fast = self.fast_time();

        let value = if self.last_sync + SYNC_INTERVAL < fast {
            // Re-sync against the wall clock to bound cycle-counter drift.
            let wall = wall_time();
            self.last_sync = wall;
            self.boot_time = wall - (fast - self.boot_time);
            wall
        } else {
            fast
        };

        // A resync may step backwards by a few µs; readers rely on
        // timestamps never decreasing.
        self.last_read = self.last_read.max(value);
        self.last_read
    }

    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    #[inline]
    fn fast_time(&self) -> u64 {
        self.boot_time + (cycles() as f64 / self.cycles_per_usec) as u64
    }

    #[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
    #[inline]
    fn fast_time(&self) -> u64 {
        wall_time()
    }
}

/// Microseconds since the Unix epoch, read from the wall clock.
#[inline]
fn wall_time() -> u64 {
    chrono::Utc::now().timestamp_micros() as u64
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[inline]
fn cycles() -> u64 {
    // SAFETY: `rdtsc` is available on every x86_64 CPU.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Reads the CPU frequency, in cycles per microsecond.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
fn cpu_freq_usec() -> Result<f64, Error> {
    let info = std::fs::read_to_string("/proc/cpuinfo").map_err(Error::Calibration)?;
    info.lines()
        .find_map(|line| {
            let mhz = line.strip_prefix("cpu MHz")?.split(':').nth(1)?;
            mhz.trim().parse::<f64>().ok()
        })
        .ok_or_else(|| {
            Error::Calibration(io::Error::new(io::ErrorKind::NotFound, "no cpu MHz entry"))
        })
}
