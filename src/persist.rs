//! Durable-write primitive: cache-line flush plus memory fence.
//!
//! Persistence on byte-addressable PM is cache-line granular; only a 64-byte
//! line reaches the persistence domain atomically. [`flush`] evicts every
//! line overlapping a byte range and fences on both sides, an
//! `mfence; clflush*; mfence` sequence.
//!
//! # Architecture Support
//!
//! - **`x86_64`**: `_mm_clflush` per line
//! - **`aarch64`**: `dc cvac` per line
//! - **Other**: fences only (volatile testing fallback)
//!
//! An optional per-line spin delay emulates slower PM media on plain DRAM.

use std::sync::atomic::{Ordering, fence};
use std::time::{Duration, Instant};

/// Granularity of the persistence domain.
pub const CACHE_LINE_SIZE: usize = 64;

/// Tunables threaded through pool constructors.
///
/// The emulated write latency travels with the pool that issues the
/// flushes; there is no process-wide state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistConfig {
    /// Emulated per-line write latency in nanoseconds. Zero disables the
    /// spin entirely.
    pub write_latency_ns: u64,
}

/// Evict one cache line toward the persistence domain.
///
/// A hint-like operation: the address must be mapped, but no alignment is
/// required (the hardware rounds down to the containing line).
#[inline]
fn flush_line(ptr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: `ptr` points into a live allocation owned by the caller;
        // clflush has no alignment requirement and no failure mode there.
        unsafe {
            std::arch::x86_64::_mm_clflush(ptr);
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: `dc cvac` cleans the data cache line containing `ptr` to
        // the point of coherency; valid for any mapped address.
        unsafe {
            std::arch::asm!("dc cvac, {0}", in(reg) ptr, options(nostack, preserves_flags));
        }
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = ptr;
    }
}

/// Spin until `ns` nanoseconds have elapsed.
#[inline]
fn emulate_latency(ns: u64) {
    let deadline: Instant = Instant::now() + Duration::from_nanos(ns);
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

/// Flush every cache line overlapping `[addr, addr + len)` and fence.
///
/// Returns the number of lines flushed so callers can account for flush
/// traffic.
pub fn flush(addr: *const u8, len: usize, write_latency_ns: u64) -> u64 {
    if len == 0 {
        return 0;
    }

    fence(Ordering::SeqCst);

    let mut line: *const u8 = addr.map_addr(|a| a & !(CACHE_LINE_SIZE - 1));
    let end: usize = addr.addr().saturating_add(len);
    let mut flushed: u64 = 0;

    while line.addr() < end {
        flush_line(line);
        if write_latency_ns > 0 {
            emulate_latency(write_latency_ns);
        }
        flushed += 1;
        line = line.wrapping_add(CACHE_LINE_SIZE);
    }

    fence(Ordering::SeqCst);
    flushed
}
