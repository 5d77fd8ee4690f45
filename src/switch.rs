//! Switch counter for lock-free page scans.
//!
//! [`SwitchCounter`] is the per-page byte that serves two purposes at once:
//!
//! - **Scan direction**: the low bit tells readers which way the writer is
//!   shifting entries. Even means entries are shifting toward higher slots
//!   (an insert), so readers scan left-to-right; odd means entries are
//!   shifting toward lower slots (a remove), so readers scan right-to-left.
//!   Mirroring the writer's shift direction guarantees a reader never visits
//!   the same physical slot twice while a shift is in flight.
//! - **Validation epoch**: the value changes monotonically before every
//!   entry mutation, so a reader that observes the same value before and
//!   after a scan saw either the full pre-state or the full post-state.
//!
//! # Concurrency Model
//! 1. Readers: load the counter, scan in the indicated direction, load the
//!    counter again; retry the scan if it changed.
//! 2. Writers: call `signal_insert()` / `signal_remove()` / `signal_split()`
//!    while holding the page write lock, *before* touching any entry.
//!
//! The counter intentionally wraps at 255; a reader would have to sleep
//! through 256 mutations of one page mid-scan to be fooled.

use std::sync::atomic::AtomicU8;

use crate::ordering::{COUNTER_ORD, RELAXED, WRITE_ORD};

/// Per-page mutation epoch and scan-direction byte.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct SwitchCounter {
    value: AtomicU8,
}

impl SwitchCounter {
    /// Create a counter in forward (even) state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: AtomicU8::new(0),
        }
    }

    /// Load the current value for scan-direction selection and validation.
    #[inline]
    #[must_use]
    pub fn load(&self) -> u8 {
        self.value.load(COUNTER_ORD)
    }

    /// Whether a counter value directs readers to scan left-to-right.
    #[inline]
    #[must_use]
    pub const fn is_forward(value: u8) -> bool {
        value % 2 == 0
    }

    /// Signal an insert shift: force the counter even.
    ///
    /// Must be called under the page write lock before any entry is moved.
    #[inline]
    pub fn signal_insert(&self) {
        let v: u8 = self.value.load(RELAXED);
        if !Self::is_forward(v) {
            self.value.store(v.wrapping_add(1), WRITE_ORD);
        }
    }

    /// Signal a remove shift: force the counter odd.
    ///
    /// Must be called under the page write lock before any entry is moved.
    #[inline]
    pub fn signal_remove(&self) {
        let v: u8 = self.value.load(RELAXED);
        if Self::is_forward(v) {
            self.value.store(v.wrapping_add(1), WRITE_ORD);
        }
    }

    /// Signal a split: advance the epoch while landing on even.
    ///
    /// Adds 2 from an even value and 1 from an odd one, so validation sees a
    /// change and subsequent readers scan forward over the truncated prefix.
    #[inline]
    pub fn signal_split(&self) {
        let v: u8 = self.value.load(RELAXED);
        let bump: u8 = if Self::is_forward(v) { 2 } else { 1 };
        self.value.store(v.wrapping_add(bump), WRITE_ORD);
    }
}
