//! `BTree` - root pointer, height, and the top-down descent drivers.
//!
//! Every operation descends from the root by repeatedly asking the current
//! page for the next child, then runs the leaf-level protocol: lock-free
//! linear search for readers, FAST/FAIR under the page write lock for
//! writers. Parent updates after a split re-descend from the root to the
//! target level instead of holding locks across tree levels.
//!
//! The root pointer is read unsynchronized in the stale-tolerant sense: an
//! old root still descends correctly, because any page whose key range
//! moved right is reachable through its sibling chain.

use std::fmt as StdFmt;
use std::ptr as StdPtr;
use std::sync::atomic::{AtomicPtr, AtomicU32};

use seize::{Collector, LocalGuard};

use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::page::{
    DEFAULT_CARDINALITY, LeafSearch, NULL_HANDLE, Page, handle_from_ptr, ptr_from_handle,
};
use crate::persist::PersistConfig;
use crate::pool::{HeapPool, PagePool};
use crate::tracing_helpers::{debug_log, trace_log};

#[cfg(feature = "rebalance")]
mod rebalance;

// ============================================================================
//  InsertError
// ============================================================================

/// Errors that can escape a write operation.
///
/// Internal retries (a retired page, a mid-split sibling chase) are never
/// surfaced; only the pool's refusal to produce a page is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// The persistent pool is exhausted. FAIR allocates the new sibling
    /// before any linkage write, so no partial state remains.
    AllocationFailed,
}

impl StdFmt::Display for InsertError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::AllocationFailed => write!(f, "page pool exhausted"),
        }
    }
}

impl std::error::Error for InsertError {}

// ============================================================================
//  BTree
// ============================================================================

/// A concurrent, crash-consistent B+-tree index over `i64` keys and opaque
/// `u64` value handles.
///
/// # Type Parameters
///
/// * `CARD` - Entries per page; tests shrink it to force splits early.
/// * `P` - The page pool; [`HeapPool`] is the volatile default.
///
/// # Concurrency
///
/// All operations take `&self` and may be called from any number of threads.
/// Readers are lock-free; writers take one page write lock at a time. Batch
/// callers can amortize reclamation-guard entry with [`BTree::guard`] and
/// the `*_with_guard` variants.
///
/// # Example
///
/// ```
/// use fastfair::BTree;
///
/// let tree: BTree = BTree::new();
/// tree.insert(17, 0xbeef).unwrap();
/// assert_eq!(tree.search(17), Some(0xbeef));
/// assert_eq!(tree.search(18), None);
/// ```
pub struct BTree<const CARD: usize = DEFAULT_CARDINALITY, P: PagePool<CARD> = HeapPool> {
    /// The current root page. Replaced only by the writer that split the
    /// old root; read stale-tolerantly by everyone else.
    root: AtomicPtr<u8>,

    /// Advisory height; the authoritative level is each page's `level`.
    height: AtomicU32,

    /// Where pages come from and how bytes become durable.
    pool: P,

    /// Reclamation domain for pages retired while readers may hold them.
    collector: Collector,
}

impl<const CARD: usize> BTree<CARD, HeapPool> {
    /// Create an empty tree on the heap-backed volatile pool.
    #[must_use]
    pub fn new() -> Self {
        match Self::with_pool(HeapPool::new()) {
            Ok(tree) => tree,
            // The heap pool aborts on OOM instead of reporting it.
            Err(_) => unreachable!("heap pool allocation is infallible"),
        }
    }

    /// Create an empty tree with explicit persistence tunables.
    #[must_use]
    pub fn with_config(config: PersistConfig) -> Self {
        match Self::with_pool(HeapPool::with_config(config)) {
            Ok(tree) => tree,
            Err(_) => unreachable!("heap pool allocation is infallible"),
        }
    }
}

impl<const CARD: usize> Default for BTree<CARD, HeapPool> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CARD: usize, P: PagePool<CARD>> BTree<CARD, P> {
    /// Create an empty tree over an explicit pool.
    ///
    /// # Errors
    ///
    /// [`InsertError::AllocationFailed`] when the pool cannot produce the
    /// initial root leaf.
    pub fn with_pool(pool: P) -> Result<Self, InsertError> {
        let root: *mut Page<CARD> = pool.allocate(0)?;
        pool.persist(root.cast(), crate::page::PAGE_SIZE);

        Ok(Self {
            root: AtomicPtr::new(root.cast()),
            height: AtomicU32::new(1),
            pool,
            collector: Collector::new(),
        })
    }

    /// Enter the reclamation domain for a batch of operations.
    #[must_use]
    pub fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    /// The pool this tree allocates from.
    #[inline]
    pub(crate) const fn pool(&self) -> &P {
        &self.pool
    }

    /// Total cache lines flushed on behalf of this tree.
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.pool.flush_count()
    }

    /// Current root page pointer (stale-tolerant read).
    #[inline]
    pub(crate) fn root_ptr(&self) -> *mut u8 {
        self.root.load(READ_ORD)
    }

    /// Advisory tree height.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height.load(RELAXED)
    }

    /// Publish a new root: persist the root slot, then bump the height.
    pub(crate) fn set_new_root(&self, new_root: *mut u8) {
        self.root.store(new_root, WRITE_ORD);
        self.pool.persist(
            (&raw const self.root).cast(),
            std::mem::size_of::<AtomicPtr<u8>>(),
        );
        self.height.fetch_add(1, RELAXED);
        debug_log!(height = self.height.load(RELAXED), "root replaced");
    }

    // ========================================================================
    //  Descent
    // ========================================================================

    /// Walk from the root to the leaf that owns `key`.
    fn reach_leaf(&self, key: i64, _guard: &LocalGuard<'_>) -> &Page<CARD> {
        // SAFETY: the root always points at a live page, and every child or
        // sibling reachable from a live page stays live under the guard.
        let mut page: &Page<CARD> = unsafe { &*self.root_ptr().cast::<Page<CARD>>() };

        while !page.is_leaf() {
            let child: *mut u8 = page.search_child(key);
            // SAFETY: as above.
            page = unsafe { &*child.cast::<Page<CARD>>() };
        }

        page
    }

    // ========================================================================
    //  Point Operations
    // ========================================================================

    /// Insert `(key, value)`.
    ///
    /// Duplicate keys append a second entry rather than overwriting; a
    /// subsequent [`search`](Self::search) returns whichever entry the scan
    /// reaches first. `value` must not be the null handle (zero), which
    /// terminates a page's entry prefix.
    ///
    /// # Errors
    ///
    /// [`InsertError::AllocationFailed`] when the pool is exhausted.
    pub fn insert(&self, key: i64, value: u64) -> Result<(), InsertError> {
        let guard: LocalGuard<'_> = self.guard();
        self.insert_with_guard(key, value, &guard)
    }

    /// [`insert`](Self::insert) under a caller-held guard.
    ///
    /// # Errors
    ///
    /// [`InsertError::AllocationFailed`] when the pool is exhausted.
    pub fn insert_with_guard(
        &self,
        key: i64,
        value: u64,
        guard: &LocalGuard<'_>,
    ) -> Result<(), InsertError> {
        debug_assert_ne!(value, NULL_HANDLE, "the null handle terminates pages");

        loop {
            let leaf: &Page<CARD> = self.reach_leaf(key, guard);

            if leaf
                .store(self, key, value, true, true, StdPtr::null_mut())?
                .is_some()
            {
                return Ok(());
            }

            // The leaf was retired under us; re-descend.
            trace_log!(key, "insert retry after landing on a retired page");
        }
    }

    /// Insert a separator produced by a split into the given level.
    ///
    /// Re-descends from the root; a stale root or a racing split at the
    /// parent level is handled by the same chase-and-retry as leaf inserts.
    pub(crate) fn insert_parent(
        &self,
        key: i64,
        right: *mut u8,
        level: u32,
    ) -> Result<(), InsertError> {
        loop {
            // SAFETY: root pages are live; see reach_leaf.
            let root: &Page<CARD> = unsafe { &*self.root_ptr().cast::<Page<CARD>>() };

            if level > root.level() {
                // A concurrent root replacement already covers this level.
                return Ok(());
            }

            let mut page: &Page<CARD> = root;
            while page.level() > level {
                let child: *mut u8 = page.search_child(key);
                // SAFETY: as above.
                page = unsafe { &*child.cast::<Page<CARD>>() };
            }

            if page
                .store(self, key, handle_from_ptr(right), true, true, right)?
                .is_some()
            {
                return Ok(());
            }
        }
    }

    /// Look up the value-handle stored under `key`.
    #[must_use]
    pub fn search(&self, key: i64) -> Option<u64> {
        let guard: LocalGuard<'_> = self.guard();
        self.search_with_guard(key, &guard)
    }

    /// [`search`](Self::search) under a caller-held guard.
    #[must_use]
    pub fn search_with_guard(&self, key: i64, guard: &LocalGuard<'_>) -> Option<u64> {
        let mut page: &Page<CARD> = self.reach_leaf(key, guard);

        loop {
            match page.search_leaf(key) {
                LeafSearch::Found(value) => return Some(value),

                LeafSearch::MovedRight(sibling) => {
                    // SAFETY: chain pages are live under the guard.
                    page = unsafe { &*sibling.cast::<Page<CARD>>() };
                }

                LeafSearch::NotFound => return None,
            }
        }
    }

    /// Remove the first entry matching `key`. Returns false when absent.
    pub fn delete(&self, key: i64) -> bool {
        let guard: LocalGuard<'_> = self.guard();
        self.delete_with_guard(key, &guard)
    }

    /// [`delete`](Self::delete) under a caller-held guard.
    pub fn delete_with_guard(&self, key: i64, guard: &LocalGuard<'_>) -> bool {
        loop {
            let mut page: &Page<CARD> = self.reach_leaf(key, guard);

            loop {
                match page.search_leaf(key) {
                    LeafSearch::Found(_) => {
                        if page.remove(key, true, self.pool()) {
                            return true;
                        }
                        // A concurrent delete won the race between our scan
                        // and the lock; re-descend and look again.
                        break;
                    }

                    LeafSearch::MovedRight(sibling) => {
                        // SAFETY: chain pages are live under the guard.
                        page = unsafe { &*sibling.cast::<Page<CARD>>() };
                    }

                    LeafSearch::NotFound => {
                        trace_log!(key, "delete: key absent");
                        return false;
                    }
                }
            }
        }
    }

    // ========================================================================
    //  Range Scan
    // ========================================================================

    /// Append the value-handles of keys strictly inside `(min, max)` to
    /// `out`, ascending. Returns how many were appended.
    pub fn search_range(&self, min: i64, max: i64, out: &mut Vec<u64>) -> usize {
        let guard: LocalGuard<'_> = self.guard();
        self.search_range_with_guard(min, max, out, &guard)
    }

    /// [`search_range`](Self::search_range) under a caller-held guard.
    pub fn search_range_with_guard(
        &self,
        min: i64,
        max: i64,
        out: &mut Vec<u64>,
        guard: &LocalGuard<'_>,
    ) -> usize {
        let before: usize = out.len();
        let leaf: &Page<CARD> = self.reach_leaf(min, guard);
        leaf.search_range_into(min, max, out);
        out.len() - before
    }

    // ========================================================================
    //  Whole-Tree Queries
    // ========================================================================

    /// Number of entries, by walking the leaf chain. O(leaves).
    #[must_use]
    pub fn len(&self) -> usize {
        let guard: LocalGuard<'_> = self.guard();
        let mut page: &Page<CARD> = self.leftmost_leaf(&guard);
        let mut total: usize = 0;

        loop {
            total += page.count();
            let sibling: *mut u8 = page.sibling();
            if sibling.is_null() {
                return total;
            }
            // SAFETY: chain pages are live under the guard.
            page = unsafe { &*sibling.cast::<Page<CARD>>() };
        }
    }

    /// Whether the tree holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Leftmost leaf, by descending `leftmost` pointers.
    fn leftmost_leaf(&self, _guard: &LocalGuard<'_>) -> &Page<CARD> {
        // SAFETY: see reach_leaf.
        let mut page: &Page<CARD> = unsafe { &*self.root_ptr().cast::<Page<CARD>>() };

        while !page.is_leaf() {
            let child: *mut u8 = page.hdr.leftmost.load(READ_ORD);
            // SAFETY: see reach_leaf.
            page = unsafe { &*child.cast::<Page<CARD>>() };
        }

        page
    }

    // ========================================================================
    //  Invariant Checker (test support)
    // ========================================================================

    /// Verify the structural invariants over the whole tree.
    ///
    /// Call at quiescence only: parent/child range containment is checked
    /// recursively, and a mid-split tree legitimately has a sibling its
    /// parent does not know about yet.
    ///
    /// # Panics
    ///
    /// If any page violates sortedness, a subtree escapes its separator
    /// range, or a sibling chain is not strictly ascending.
    pub fn check_invariants(&self) {
        let guard: LocalGuard<'_> = self.guard();

        // SAFETY: see reach_leaf.
        let root: &Page<CARD> = unsafe { &*self.root_ptr().cast::<Page<CARD>>() };
        Self::check_subtree(root, i64::MIN, i64::MAX);

        // Leaf chain strictly ascending across page boundaries.
        let mut page: &Page<CARD> = self.leftmost_leaf(&guard);
        let mut previous: Option<i64> = None;

        loop {
            let n: usize = page.count();
            for i in 0..n {
                let key: i64 = page.records[i].key.load(RELAXED);
                if let Some(prev) = previous {
                    assert!(
                        prev < key,
                        "leaf chain out of order: {prev} before {key}"
                    );
                }
                previous = Some(key);
            }

            let sibling: *mut u8 = page.sibling();
            if sibling.is_null() {
                break;
            }
            // SAFETY: chain pages are live under the guard.
            let next: &Page<CARD> = unsafe { &*sibling.cast::<Page<CARD>>() };
            assert!(
                next.highest() > previous.unwrap_or(i64::MIN),
                "sibling bound not past the left page's keys"
            );
            page = next;
        }
    }

    /// Every key under `page` must lie in `[low, high)`.
    fn check_subtree(page: &Page<CARD>, low: i64, high: i64) {
        page.assert_page_invariants();

        let n: usize = page.count();
        for i in 0..n {
            let key: i64 = page.records[i].key.load(RELAXED);
            assert!(
                low <= key && key < high,
                "key {key} escapes separator range [{low}, {high})"
            );
        }

        if page.is_leaf() || n == 0 {
            return;
        }

        let first: i64 = page.records[0].key.load(RELAXED);
        let leftmost: *mut u8 = page.hdr.leftmost.load(READ_ORD);
        // SAFETY: children of live internal pages are live.
        Self::check_subtree(unsafe { &*leftmost.cast::<Page<CARD>>() }, low, first);

        for i in 0..n {
            let key: i64 = page.records[i].key.load(RELAXED);
            let upper: i64 = if i + 1 < n {
                page.records[i + 1].key.load(RELAXED)
            } else {
                high
            };
            let child: *mut u8 = ptr_from_handle(page.records[i].value.load(RELAXED));
            // SAFETY: as above.
            Self::check_subtree(unsafe { &*child.cast::<Page<CARD>>() }, key, upper);
        }
    }
}

impl<const CARD: usize, P: PagePool<CARD>> Drop for BTree<CARD, P> {
    fn drop(&mut self) {
        // Exclusive access: return every page level by level through the
        // sibling chains. Pages retired earlier by a merge already left the
        // chains and belong to the collector.
        let mut level_head: *mut u8 = self.root.load(RELAXED);

        while !level_head.is_null() {
            // SAFETY: level heads and chain members are live pages owned by
            // this tree; nothing else can reach them during drop.
            let next_head: *mut u8 =
                unsafe { (*level_head.cast::<Page<CARD>>()).hdr.leftmost.load(RELAXED) };

            let mut page: *mut u8 = level_head;
            while !page.is_null() {
                // SAFETY: as above.
                let sibling: *mut u8 =
                    unsafe { (*page.cast::<Page<CARD>>()).hdr.sibling.load(RELAXED) };
                // SAFETY: page came from this tree's pool and has no readers.
                unsafe { self.pool.deallocate(page.cast::<Page<CARD>>()) };
                page = sibling;
            }

            level_head = next_head;
        }
    }
}

impl<const CARD: usize, P: PagePool<CARD>> StdFmt::Debug for BTree<CARD, P> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("BTree")
            .field("cardinality", &CARD)
            .field("height", &self.height())
            .finish_non_exhaustive()
    }
}

// SAFETY: shared mutable state is atomics or lock-protected; raw page
// pointers are only dereferenced under the collector-guard discipline, and
// the pool is Send + Sync by bound.
unsafe impl<const CARD: usize, P: PagePool<CARD>> Send for BTree<CARD, P> {}

// SAFETY: as above; every `&self` operation is designed for concurrent
// callers (lock-free reads, per-page write locks).
unsafe impl<const CARD: usize, P: PagePool<CARD>> Sync for BTree<CARD, P> {}

// ============================================================================
//  Tests
// ============================================================================
