//! Delete-time rebalancing: redistribute with, or merge into, the left
//! sibling when a page drops below half utilization.
//!
//! Shipped behind `feature = "rebalance"` and never called by the default
//! delete path, which tolerates under-full and even empty leaves. On PCM-
//! class media the extra writes of eager rebalancing cost more than the
//! space they reclaim, so this stays an opt-in for read-heavy workloads.
//!
//! The merge path is the one place the tree briefly holds two page locks:
//! the target page first, then its left sibling found through the parent,
//! walking the chain with lock coupling until it actually links to us.
//! Retired pages leave the chains and are handed to the collector; readers
//! that still hold them finish against the tombstoned page.

use seize::{Guard, LocalGuard};

use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::page::{
    LeafSearch, NULL_HANDLE, PAGE_SIZE, Page, handle_from_ptr, ptr_from_handle,
};
use crate::pool::{PagePool, reclaim_page_boxed};
use crate::tracing_helpers::debug_log;
use crate::tree::{BTree, InsertError};

/// What `remove_separator` took out of the parent level.
struct SeparatorRemoval {
    /// The separator key that was removed.
    deleted_key: i64,

    /// The child left of the removed separator; the rebalance partner.
    left_sibling: *mut u8,
}

/// Parent-level outcome for a child asking to rebalance.
enum ParentLookup {
    /// Separator removed; partner identified.
    Removed(SeparatorRemoval),

    /// The child is its parent's leftmost; it has no left partner and the
    /// right sibling must rebalance instead.
    Leftmost,

    /// No separator found (level above the root, or a racing reorganization).
    NotFound,
}

impl<const CARD: usize, P: PagePool<CARD>> BTree<CARD, P> {
    /// Remove `key`, rebalancing pages that fall below half utilization.
    ///
    /// Experimental alternative to [`delete`](Self::delete); correctness
    /// does not require it.
    ///
    /// # Errors
    ///
    /// [`InsertError::AllocationFailed`] when a redistribution needs a
    /// replacement page and the pool is exhausted.
    pub fn delete_rebalance(&self, key: i64) -> Result<bool, InsertError> {
        let guard: LocalGuard<'_> = self.guard();

        loop {
            let mut page: &Page<CARD> = self.reach_leaf(key, &guard);

            loop {
                match page.search_leaf(key) {
                    LeafSearch::Found(_) => {
                        if page.remove_rebalancing(self, key, false, true, &guard)? {
                            return Ok(true);
                        }
                        break;
                    }

                    LeafSearch::MovedRight(sibling) => {
                        // SAFETY: chain pages are live under the guard.
                        page = unsafe { &*sibling.cast::<Page<CARD>>() };
                    }

                    LeafSearch::NotFound => return Ok(false),
                }
            }
        }
    }

    /// Remove the separator pointing at `child` from the parent at `level`,
    /// reporting the left partner for the rebalance.
    ///
    /// Holds the parent's write lock for the scan and the removal, so the
    /// separator and the partner are read consistently.
    fn remove_separator(
        &self,
        key: i64,
        child: *mut u8,
        level: u32,
        _guard: &LocalGuard<'_>,
    ) -> ParentLookup {
        // SAFETY: see reach_leaf_for_rebalance.
        let root: &Page<CARD> = unsafe { &*self.root_ptr().cast::<Page<CARD>>() };
        if level > root.level() {
            return ParentLookup::NotFound;
        }

        let mut page: &Page<CARD> = root;
        while page.level() > level {
            let next: *mut u8 = page.search_child(key);
            // SAFETY: as above.
            page = unsafe { &*next.cast::<Page<CARD>>() };
        }

        let lock = page.hdr.lock.lock();

        if page.hdr.leftmost.load(READ_ORD) == child {
            drop(lock);
            return ParentLookup::Leftmost;
        }

        let mut i: usize = 0;
        while i < CARD && page.records[i].value.load(RELAXED) != NULL_HANDLE {
            if ptr_from_handle(page.records[i].value.load(RELAXED)) == child {
                let left: *mut u8 = if i == 0 {
                    page.hdr.leftmost.load(READ_ORD)
                } else {
                    ptr_from_handle(page.records[i - 1].value.load(RELAXED))
                };

                // The transient-duplicate filter: a slot that mirrors its
                // left neighbor is a shift artifact, not the real entry.
                if left != child {
                    let deleted_key: i64 = page.records[i].key.load(RELAXED);
                    page.remove(deleted_key, false, self.pool());
                    drop(lock);
                    return ParentLookup::Removed(SeparatorRemoval {
                        deleted_key,
                        left_sibling: left,
                    });
                }
            }
            i += 1;
        }

        drop(lock);
        ParentLookup::NotFound
    }

    /// Swing the root pointer to `new_root` after the old root emptied.
    ///
    /// The height stays as-is; it is advisory and each page carries its own
    /// level.
    fn collapse_root(&self, new_root: *mut u8) {
        self.root.store(new_root, WRITE_ORD);
        self.pool().persist(
            (&raw const self.root).cast(),
            std::mem::size_of::<std::sync::atomic::AtomicPtr<u8>>(),
        );
        debug_log!("root collapsed into its only child");
    }
}

impl<const CARD: usize> Page<CARD> {
    /// Remove `key` and rebalance this page against its left sibling when
    /// utilization drops below half.
    ///
    /// `only_rebalance` skips the removal itself; it is set when a leftmost
    /// page redirects the work to its right sibling. Returns false when the
    /// page had already been retired and the caller must re-descend.
    pub(crate) fn remove_rebalancing<P: PagePool<CARD>>(
        &self,
        tree: &BTree<CARD, P>,
        key: i64,
        only_rebalance: bool,
        with_lock: bool,
        guard: &LocalGuard<'_>,
    ) -> Result<bool, InsertError> {
        let lock = with_lock.then(|| self.hdr.lock.lock());

        if self.is_deleted() {
            drop(lock);
            return Ok(false);
        }

        if !only_rebalance {
            let entries_before: usize = self.count();

            if tree.root_ptr() == std::ptr::from_ref(self).cast::<u8>().cast_mut() {
                // The root is exempt from utilization rules; it only
                // collapses when an internal root is down to its last child.
                if self.hdr.level > 0 && entries_before == 1 && self.sibling().is_null() {
                    tree.collapse_root(self.hdr.leftmost.load(READ_ORD));
                    self.hdr.is_deleted.store(1, WRITE_ORD);
                    // SAFETY: the old root left the tree; readers that still
                    // hold it are pinned by their guards.
                    unsafe {
                        guard.defer_retire(
                            std::ptr::from_ref(self).cast_mut(),
                            reclaim_page_boxed::<CARD>,
                        );
                    }
                }

                let _ = self.remove_entry(key, tree.pool());
                drop(lock);
                return Ok(true);
            }

            let should_rebalance: bool = entries_before.saturating_sub(1) < (CARD - 1) / 2;
            let removed: bool = self.remove_entry(key, tree.pool());

            if !should_rebalance {
                drop(lock);
                return Ok(if self.is_leaf() { removed } else { true });
            }
        }

        // Under-full: take the separator out of the parent and fold this
        // page toward its left partner.
        match tree.remove_separator(key, std::ptr::from_ref(self).cast::<u8>().cast_mut(),
            self.hdr.level + 1, guard)
        {
            ParentLookup::Leftmost => {
                drop(lock);

                // No left partner; the right sibling absorbs the imbalance.
                let sibling: *mut u8 = self.sibling();
                if !sibling.is_null() {
                    // SAFETY: chain pages are live under the guard.
                    let sibling_page: &Self = unsafe { &*sibling.cast::<Self>() };
                    let first_key: i64 = sibling_page.records[0].key.load(RELAXED);
                    sibling_page.remove_rebalancing(tree, first_key, true, with_lock, guard)?;
                }
                Ok(true)
            }

            ParentLookup::NotFound => {
                drop(lock);
                Ok(true)
            }

            ParentLookup::Removed(sep) => {
                self.rebalance_with_left(tree, &sep, lock, guard)
            }
        }
    }

    /// Redistribute with or merge into the left partner named by `sep`.
    #[expect(clippy::too_many_lines, reason = "the three-way case split reads best linearly")]
    fn rebalance_with_left<P: PagePool<CARD>>(
        &self,
        tree: &BTree<CARD, P>,
        sep: &SeparatorRemoval,
        lock: Option<parking_lot::MutexGuard<'_, ()>>,
        guard: &LocalGuard<'_>,
    ) -> Result<bool, InsertError> {
        let with_lock: bool = lock.is_some();
        let self_ptr: *mut u8 = std::ptr::from_ref(self).cast::<u8>().cast_mut();

        // The parent's notion of "left" may be stale; couple locks along the
        // chain until the partner actually links to us.
        // SAFETY: partner pages from the parent scan are live under the guard.
        let mut left: &Self = unsafe { &*sep.left_sibling.cast::<Self>() };
        let mut left_lock = with_lock.then(|| left.hdr.lock.lock());

        while left.sibling() != self_ptr {
            let next: *mut u8 = left.sibling();
            drop(left_lock);
            // SAFETY: as above.
            left = unsafe { &*next.cast::<Self>() };
            left_lock = with_lock.then(|| left.hdr.lock.lock());
        }

        let num_entries: usize = self.count();
        let mut left_num_entries: usize = left.count();

        let mut total: usize = num_entries + left_num_entries;
        if !self.is_leaf() {
            total += 1;
        }

        let parent_key: i64;
        let m: usize = total.div_ceil(2);

        if total > CARD - 1 {
            // Redistribution.
            if num_entries < left_num_entries {
                // Pull the left partner's tail over to us.
                let mut n: usize = num_entries;

                if self.is_leaf() {
                    for i in (m..left_num_entries).rev() {
                        let k: i64 = left.records[i].key.load(RELAXED);
                        let v: u64 = left.records[i].value.load(RELAXED);
                        self.insert_entry(k, v, &mut n, true, tree.pool());
                    }

                    left.records[m].value.store(NULL_HANDLE, WRITE_ORD);
                    tree.pool()
                        .persist((&raw const left.records[m].value).cast(), 8);

                    #[expect(clippy::cast_possible_truncation, reason = "CARD fits in i16")]
                    left.hdr.last_index.store(m as i16 - 1, WRITE_ORD);
                    tree.pool()
                        .persist((&raw const left.hdr.last_index).cast(), 2);

                    parent_key = self.records[0].key.load(RELAXED);
                } else {
                    // The parent separator comes down; the left tail's last
                    // child becomes our new leftmost.
                    self.insert_entry(
                        sep.deleted_key,
                        handle_from_ptr(self.hdr.leftmost.load(READ_ORD)),
                        &mut n,
                        true,
                        tree.pool(),
                    );

                    for i in ((m + 1)..left_num_entries).rev() {
                        let k: i64 = left.records[i].key.load(RELAXED);
                        let v: u64 = left.records[i].value.load(RELAXED);
                        self.insert_entry(k, v, &mut n, true, tree.pool());
                    }

                    parent_key = left.records[m].key.load(RELAXED);

                    self.hdr
                        .leftmost
                        .store(ptr_from_handle(left.records[m].value.load(RELAXED)), WRITE_ORD);
                    tree.pool()
                        .persist((&raw const self.hdr.leftmost).cast(), 8);

                    left.records[m].value.store(NULL_HANDLE, WRITE_ORD);
                    tree.pool()
                        .persist((&raw const left.records[m].value).cast(), 8);

                    #[expect(clippy::cast_possible_truncation, reason = "CARD fits in i16")]
                    left.hdr.last_index.store(m as i16 - 1, WRITE_ORD);
                    tree.pool()
                        .persist((&raw const left.hdr.last_index).cast(), 2);
                }

                let left_ptr: *mut u8 = std::ptr::from_ref(left).cast::<u8>().cast_mut();
                if tree.root_ptr() == left_ptr {
                    let new_root: *mut Self = tree.pool().allocate(self.hdr.level + 1)?;
                    // SAFETY: freshly allocated, private until published.
                    unsafe { (*new_root).init_root(left_ptr, parent_key, self_ptr) };
                    tree.pool().persist(new_root.cast(), PAGE_SIZE);
                    tree.set_new_root(new_root.cast());
                } else {
                    tree.insert_parent(parent_key, self_ptr, self.hdr.level + 1)?;
                }
            } else {
                // We hold the larger half: push our head into the partner
                // and rebuild the rest as a fresh right page, bypassing this
                // one entirely.
                self.hdr.is_deleted.store(1, WRITE_ORD);
                tree.pool()
                    .persist((&raw const self.hdr.is_deleted).cast(), 1);

                let new_sibling_ptr: *mut Self = tree.pool().allocate(self.hdr.level)?;
                // SAFETY: freshly allocated, private until linked below.
                let new_sibling: &Self = unsafe { &*new_sibling_ptr };
                let sibling_lock = new_sibling.hdr.lock.lock();
                new_sibling.hdr.sibling.store(self.sibling(), RELAXED);

                let num_dist: usize = num_entries.saturating_sub(m);
                let mut new_sibling_cnt: usize = 0;

                if self.is_leaf() {
                    for i in 0..num_dist {
                        let k: i64 = self.records[i].key.load(RELAXED);
                        let v: u64 = self.records[i].value.load(RELAXED);
                        left.insert_entry(k, v, &mut left_num_entries, true, tree.pool());
                    }

                    let mut i: usize = num_dist;
                    while i < CARD && self.records[i].value.load(RELAXED) != NULL_HANDLE {
                        let k: i64 = self.records[i].key.load(RELAXED);
                        let v: u64 = self.records[i].value.load(RELAXED);
                        new_sibling.insert_entry(k, v, &mut new_sibling_cnt, false, tree.pool());
                        i += 1;
                    }

                    tree.pool().persist(new_sibling_ptr.cast(), PAGE_SIZE);

                    left.hdr.sibling.store(new_sibling_ptr.cast(), WRITE_ORD);
                    tree.pool()
                        .persist((&raw const left.hdr.sibling).cast(), 8);

                    parent_key = new_sibling.records[0].key.load(RELAXED);
                } else {
                    left.insert_entry(
                        sep.deleted_key,
                        handle_from_ptr(self.hdr.leftmost.load(READ_ORD)),
                        &mut left_num_entries,
                        true,
                        tree.pool(),
                    );

                    for i in 0..num_dist.saturating_sub(1) {
                        let k: i64 = self.records[i].key.load(RELAXED);
                        let v: u64 = self.records[i].value.load(RELAXED);
                        left.insert_entry(k, v, &mut left_num_entries, true, tree.pool());
                    }

                    parent_key = self.records[num_dist - 1].key.load(RELAXED);

                    new_sibling.hdr.leftmost.store(
                        ptr_from_handle(self.records[num_dist - 1].value.load(RELAXED)),
                        RELAXED,
                    );

                    let mut i: usize = num_dist;
                    while i < CARD && self.records[i].value.load(RELAXED) != NULL_HANDLE {
                        let k: i64 = self.records[i].key.load(RELAXED);
                        let v: u64 = self.records[i].value.load(RELAXED);
                        new_sibling.insert_entry(k, v, &mut new_sibling_cnt, false, tree.pool());
                        i += 1;
                    }

                    tree.pool().persist(new_sibling_ptr.cast(), PAGE_SIZE);

                    left.hdr.sibling.store(new_sibling_ptr.cast(), WRITE_ORD);
                    tree.pool()
                        .persist((&raw const left.hdr.sibling).cast(), 8);
                }

                let left_ptr: *mut u8 = std::ptr::from_ref(left).cast::<u8>().cast_mut();
                if tree.root_ptr() == left_ptr {
                    let new_root: *mut Self = tree.pool().allocate(self.hdr.level + 1)?;
                    // SAFETY: freshly allocated, private until published.
                    unsafe { (*new_root).init_root(left_ptr, parent_key, new_sibling_ptr.cast()) };
                    tree.pool().persist(new_root.cast(), PAGE_SIZE);
                    tree.set_new_root(new_root.cast());
                } else {
                    tree.insert_parent(parent_key, new_sibling_ptr.cast(), self.hdr.level + 1)?;
                }

                drop(sibling_lock);

                // This page left the chain; hand it to the collector.
                // SAFETY: unreachable once the chain bypasses it; readers
                // still holding it are pinned by their guards.
                unsafe {
                    guard.defer_retire(self_ptr.cast::<Self>(), reclaim_page_boxed::<CARD>);
                }
            }
        } else {
            // Merge: everything fits in the left partner.
            debug_log!(entries = total, "merging page into left sibling");

            self.hdr.is_deleted.store(1, WRITE_ORD);
            tree.pool()
                .persist((&raw const self.hdr.is_deleted).cast(), 1);

            if !self.is_leaf() {
                left.insert_entry(
                    sep.deleted_key,
                    handle_from_ptr(self.hdr.leftmost.load(READ_ORD)),
                    &mut left_num_entries,
                    true,
                    tree.pool(),
                );
            }

            let mut i: usize = 0;
            while i < CARD && self.records[i].value.load(RELAXED) != NULL_HANDLE {
                let k: i64 = self.records[i].key.load(RELAXED);
                let v: u64 = self.records[i].value.load(RELAXED);
                left.insert_entry(k, v, &mut left_num_entries, true, tree.pool());
                i += 1;
            }

            left.hdr.sibling.store(self.sibling(), WRITE_ORD);
            tree.pool()
                .persist((&raw const left.hdr.sibling).cast(), 8);

            // SAFETY: the chain now bypasses this page and the parent
            // separator is gone; guards pin any straggling readers.
            unsafe {
                guard.defer_retire(self_ptr.cast::<Self>(), reclaim_page_boxed::<CARD>);
            }
        }

        drop(left_lock);
        drop(lock);
        Ok(true)
    }
}
