//! Page allocation seam for the tree.
//!
//! [`PagePool`] abstracts where pages live and how they reach durability.
//! The tree only ever asks for a page at a level, asks for a byte range to
//! be persisted, and reads flush statistics.
//!
//! ## Pools
//!
//! - [`HeapPool`] (default): pages on the process heap, [`crate::persist`]
//!   for the flush path, optional emulated write latency. This is the
//!   volatile variant; it makes the flush traffic real and observable
//!   without a PM device.
//! - A PM-backed pool implements the same trait over an object pool whose
//!   persist primitive also covers the pool's own metadata; it lives outside
//!   this crate.
//!
//! ## Reclamation
//!
//! Pages retired while readers may still hold references go through seize
//! (`guard.defer_retire` with [`reclaim_page_boxed`]). In the default
//! no-rebalance build no page is ever retired; everything is freed when the
//! tree drops.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::page::Page;
use crate::persist::{self, PersistConfig};
use crate::tree::InsertError;

/// Trait for allocating pages and persisting byte ranges.
///
/// Implementations must guarantee:
///
/// 1. **Pointer stability**: returned pages stay valid until reclaimed.
/// 2. **Alignment**: pages are cache-line aligned (the `Page` type demands
///    64-byte alignment; any allocator honoring the layout satisfies this).
/// 3. **Thread safety**: allocation and persist may be called from any
///    thread concurrently.
pub trait PagePool<const CARD: usize>: Send + Sync {
    /// Allocate an empty page at the given level.
    ///
    /// # Errors
    ///
    /// [`InsertError::AllocationFailed`] when the backing pool is exhausted.
    /// FAIR allocates the sibling before any linkage write, so a failure
    /// here leaves no partial state behind.
    fn allocate(&self, level: u32) -> Result<*mut Page<CARD>, InsertError>;

    /// Flush every cache line overlapping `[addr, addr + len)` and fence.
    fn persist(&self, addr: *const u8, len: usize);

    /// Return a page to the pool.
    ///
    /// PM pools that never reuse space may make this a no-op; the tree
    /// tolerates leaked pages.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`PagePool::allocate`] on this pool, must
    /// not have been deallocated already, and no reader may still hold it.
    unsafe fn deallocate(&self, ptr: *mut Page<CARD>);

    /// Total cache lines flushed through this pool so far.
    fn flush_count(&self) -> u64;
}

/// Heap-backed volatile pool.
///
/// `allocate` boxes a fresh page; `persist` issues real cache-line flushes
/// with the configured emulated latency. Allocation never reports
/// exhaustion: the global allocator aborts on OOM like any Rust heap user,
/// so the `AllocationFailed` path is exercised only by external pools.
#[derive(Debug, Default)]
pub struct HeapPool {
    config: PersistConfig,
    flushes: AtomicU64,
}

impl HeapPool {
    /// Pool with default configuration (no emulated latency).
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PersistConfig::default())
    }

    /// Pool with explicit persistence tunables.
    #[must_use]
    pub fn with_config(config: PersistConfig) -> Self {
        Self {
            config,
            flushes: AtomicU64::new(0),
        }
    }

    /// The configuration this pool was built with.
    #[must_use]
    pub const fn config(&self) -> PersistConfig {
        self.config
    }
}

impl<const CARD: usize> PagePool<CARD> for HeapPool {
    fn allocate(&self, level: u32) -> Result<*mut Page<CARD>, InsertError> {
        Ok(Box::into_raw(Page::new(level)))
    }

    fn persist(&self, addr: *const u8, len: usize) {
        let lines: u64 = persist::flush(addr, len, self.config.write_latency_ns);
        self.flushes.fetch_add(lines, Ordering::Relaxed);
    }

    unsafe fn deallocate(&self, ptr: *mut Page<CARD>) {
        // SAFETY: caller guarantees ptr came from allocate (Box::into_raw)
        // with no remaining readers.
        unsafe { drop(Box::from_raw(ptr)) };
    }

    fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

// ============================================================================
//  Reclaim callbacks (seize signatures)
// ============================================================================

/// Reclaim a boxed page (seize callback).
///
/// # Safety
///
/// - `ptr` must point to a valid `Page<CARD>` allocated via `Box::into_raw`.
/// - Must only be called once seize determines no reader can still hold it.
#[cfg(any(test, feature = "rebalance"))]
pub(crate) unsafe fn reclaim_page_boxed<const CARD: usize>(
    ptr: *mut Page<CARD>,
    _collector: &seize::Collector,
) {
    // SAFETY: caller guarantees ptr came from Box::into_raw and seize
    // guarantees quiescence.
    unsafe { drop(Box::from_raw(ptr)) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::DEFAULT_CARDINALITY;

    #[test]
    fn allocate_returns_aligned_page() {
        let pool = HeapPool::new();
        let ptr: *mut Page<DEFAULT_CARDINALITY> =
            PagePool::<DEFAULT_CARDINALITY>::allocate(&pool, 0).unwrap();

        assert_eq!(ptr.addr() % 64, 0, "pages must be cache-line aligned");

        // SAFETY: just allocated, never shared.
        unsafe { drop(Box::from_raw(ptr)) };
    }

    #[test]
    fn persist_accumulates_flush_count() {
        let pool = HeapPool::new();
        let ptr: *mut Page<DEFAULT_CARDINALITY> =
            PagePool::<DEFAULT_CARDINALITY>::allocate(&pool, 0).unwrap();

        PagePool::<DEFAULT_CARDINALITY>::persist(&pool, ptr.cast(), 512);
        assert_eq!(PagePool::<DEFAULT_CARDINALITY>::flush_count(&pool), 8);

        PagePool::<DEFAULT_CARDINALITY>::persist(&pool, ptr.cast(), 8);
        assert_eq!(PagePool::<DEFAULT_CARDINALITY>::flush_count(&pool), 9);

        // SAFETY: just allocated, never shared.
        unsafe { drop(Box::from_raw(ptr)) };
    }

    #[test]
    fn reclaim_single_page() {
        let page: Box<Page<DEFAULT_CARDINALITY>> = Page::new(0);
        let ptr = Box::into_raw(page);

        // SAFETY: ptr was just created from Box::into_raw and has no readers.
        unsafe {
            let collector = seize::Collector::new();
            reclaim_page_boxed(ptr, &collector);
        }
    }
}
