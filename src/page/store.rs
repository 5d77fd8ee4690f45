//! Store: the FAST-or-FAIR write entry point for one page.
//!
//! `store` is what a descent lands on: take the write lock, bail out of
//! retired pages, chase a concurrent split right, and then either FAST the
//! entry in or run the FAIR split.
//!
//! The split's flush order is the crash argument:
//!
//! 1. the fresh sibling is filled and persisted **wholesale** while still
//!    private;
//! 2. linking it into the sibling chain is one pointer store plus a header
//!    flush; from that instant the tree is complete again via chain walk,
//!    parent or no parent;
//! 3. only then is the migrated half of this page disowned by nulling the
//!    split slot's handle, and the parent told last, by a fresh descent.
//!
//! A crash between any two steps leaves either the old tree, or a tree
//! where the new sibling is reachable through the chain and the split-key
//! duplicate is masked by the readers' handle-equality filter.

use crate::ordering::{RELAXED, WRITE_ORD};
use crate::page::{ENTRY_SIZE, HEADER_SIZE, NULL_HANDLE, PAGE_SIZE, Page, ptr_from_handle};
use crate::pool::PagePool;
use crate::tracing_helpers::debug_log;
use crate::tree::{BTree, InsertError};

impl<const CARD: usize> Page<CARD> {
    /// Insert `(key, value)` at this page, splitting when full.
    ///
    /// Returns the page the entry landed in, or `None` when this page had
    /// been retired and the caller must re-descend from the root.
    /// `invalid_sibling` suppresses the rightward chase into a sibling the
    /// caller knows is mid-link (split recursion).
    ///
    /// # Errors
    ///
    /// [`InsertError::AllocationFailed`] when the pool cannot produce the
    /// split sibling or a new root; no linkage has happened at that point.
    pub(crate) fn store<P: PagePool<CARD>>(
        &self,
        tree: &BTree<CARD, P>,
        key: i64,
        value: u64,
        flush: bool,
        with_lock: bool,
        invalid_sibling: *mut u8,
    ) -> Result<Option<*const Self>, InsertError> {
        let lock = if with_lock {
            Some(self.hdr.lock.lock())
        } else {
            None
        };

        if self.is_deleted() {
            drop(lock);
            return Ok(None);
        }

        // A split that finished after our descent may have moved the key
        // range right; follow the chain instead of re-descending.
        let sibling: *mut u8 = self.sibling();
        if !sibling.is_null() && sibling != invalid_sibling {
            // SAFETY: chain pages stay alive under the caller's guard.
            let sibling_page: &Self = unsafe { &*sibling.cast::<Self>() };
            if key >= sibling_page.highest() {
                drop(lock);
                return sibling_page.store(tree, key, value, true, with_lock, invalid_sibling);
            }
        }

        let mut num_entries: usize = self.count();

        if num_entries < CARD - 1 {
            // FAST path.
            self.insert_entry(key, value, &mut num_entries, flush, tree.pool());
            drop(lock);
            return Ok(Some(self));
        }

        // FAIR path: overflow.
        let sibling_page: *mut Self = tree.pool().allocate(self.hdr.level)?;
        // SAFETY: freshly allocated, unreachable by any other thread.
        let new_sibling: &Self = unsafe { &*sibling_page };

        let m: usize = num_entries.div_ceil(2);
        let split_key: i64 = self.records[m].key.load(RELAXED);

        debug_log!(
            page_level = self.hdr.level,
            split_key,
            entries = num_entries,
            "page split"
        );

        // Migrate the upper half into the private sibling, no per-entry
        // flushes: the whole node is persisted in one sweep below.
        let mut sibling_cnt: usize = 0;
        if self.is_leaf() {
            for i in m..num_entries {
                let k: i64 = self.records[i].key.load(RELAXED);
                let v: u64 = self.records[i].value.load(RELAXED);
                new_sibling.insert_entry(k, v, &mut sibling_cnt, false, tree.pool());
            }
        } else {
            for i in (m + 1)..num_entries {
                let k: i64 = self.records[i].key.load(RELAXED);
                let v: u64 = self.records[i].value.load(RELAXED);
                new_sibling.insert_entry(k, v, &mut sibling_cnt, false, tree.pool());
            }
            new_sibling
                .hdr
                .leftmost
                .store(ptr_from_handle(self.records[m].value.load(RELAXED)), RELAXED);
        }
        new_sibling.hdr.highest.store(split_key, RELAXED);

        new_sibling.hdr.sibling.store(self.sibling(), RELAXED);
        tree.pool().persist(sibling_page.cast(), PAGE_SIZE);

        // Link: from here the new layout is reachable via the chain.
        self.hdr.sibling.store(sibling_page.cast(), WRITE_ORD);
        tree.pool().persist((&raw const self.hdr).cast(), HEADER_SIZE);

        // Disown the migrated half: advance the epoch, null the split slot,
        // shrink the hint.
        self.hdr.switch_counter.signal_split();
        self.records[m].value.store(NULL_HANDLE, WRITE_ORD);
        tree.pool()
            .persist((&raw const self.records[m]).cast(), ENTRY_SIZE);

        #[expect(clippy::cast_possible_truncation, reason = "CARD fits in i16")]
        self.hdr.last_index.store(m as i16 - 1, WRITE_ORD);
        tree.pool().persist(
            (&raw const self.hdr.last_index).cast(),
            std::mem::size_of::<i16>(),
        );

        num_entries = m;

        // Place the new entry on whichever side now owns its range.
        let ret: *const Self = if key < split_key {
            self.insert_entry(key, value, &mut num_entries, true, tree.pool());
            self
        } else {
            new_sibling.insert_entry(key, value, &mut sibling_cnt, true, tree.pool());
            new_sibling
        };

        if tree.root_ptr() == (self as *const Self).cast::<u8>().cast_mut() {
            // Root split: only this writer can replace the root pointer.
            let new_root: *mut Self = tree.pool().allocate(self.hdr.level + 1)?;
            // SAFETY: freshly allocated, unreachable by any other thread.
            unsafe {
                (*new_root).init_root(
                    (self as *const Self).cast::<u8>().cast_mut(),
                    split_key,
                    sibling_page.cast(),
                );
            }
            tree.pool().persist(new_root.cast(), PAGE_SIZE);
            tree.set_new_root(new_root.cast());
            drop(lock);
        } else {
            // Tell the parent last, without holding this page's lock across
            // tree levels.
            drop(lock);
            tree.insert_parent(split_key, sibling_page.cast(), self.hdr.level + 1)?;
        }

        Ok(Some(ret))
    }
}
