//! Lock-free linear search over a page, and the chained range scan.
//!
//! Readers never take the write lock. Each scan brackets itself with two
//! loads of the switch counter: the first picks the direction that mirrors
//! any in-flight shift, the second validates that the scan saw a single
//! epoch. Within the scan two cheap filters make in-flight FAST states
//! harmless:
//!
//! - a candidate's key is re-read after its handle, rejecting a slot that
//!   was overwritten underneath us;
//! - a slot whose handle equals its left neighbor's is rejected as the
//!   transient duplicate a shift plants.
//!
//! A reader that finds nothing may still have undershot a concurrent split;
//! the sibling's `highest` bound decides whether the descent must hop right.

use crate::ordering::READ_ORD;
use crate::page::{NULL_HANDLE, Page, ptr_from_handle};
use crate::switch::SwitchCounter;

/// Outcome of a leaf-level point lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeafSearch {
    /// The key's value-handle.
    Found(u64),

    /// A concurrent split moved the key range right; continue there.
    MovedRight(*mut u8),

    /// The key is not present at this leaf.
    NotFound,
}

impl<const CARD: usize> Page<CARD> {
    /// Point lookup in a leaf page.
    pub(crate) fn search_leaf(&self, key: i64) -> LeafSearch {
        debug_assert!(self.is_leaf());

        let mut ret: u64;

        loop {
            let c0: u8 = self.hdr.switch_counter.load();
            ret = NULL_HANDLE;

            if SwitchCounter::is_forward(c0) {
                // Slot 0 first: it has no left neighbor to filter against,
                // only the null-handle check.
                let k: i64 = self.records[0].key.load(READ_ORD);
                if k == key {
                    let t: u64 = self.records[0].value.load(READ_ORD);
                    if t != NULL_HANDLE && self.records[0].key.load(READ_ORD) == k {
                        ret = t;
                    }
                }

                if ret == NULL_HANDLE {
                    let mut i: usize = 1;
                    while i < CARD && self.records[i].value.load(READ_ORD) != NULL_HANDLE {
                        let k: i64 = self.records[i].key.load(READ_ORD);
                        if k == key {
                            let t: u64 = self.records[i].value.load(READ_ORD);
                            if self.records[i - 1].value.load(READ_ORD) != t
                                && self.records[i].key.load(READ_ORD) == k
                            {
                                ret = t;
                                break;
                            }
                        }
                        i += 1;
                    }
                }
            } else {
                // Backward, mirroring a remove shift.
                let mut i: isize = self.count() as isize - 1;
                while i > 0 {
                    let idx = i as usize;
                    let k: i64 = self.records[idx].key.load(READ_ORD);
                    if k == key {
                        let t: u64 = self.records[idx].value.load(READ_ORD);
                        if t != NULL_HANDLE
                            && self.records[idx - 1].value.load(READ_ORD) != t
                            && self.records[idx].key.load(READ_ORD) == k
                        {
                            ret = t;
                            break;
                        }
                    }
                    i -= 1;
                }

                if ret == NULL_HANDLE {
                    let k: i64 = self.records[0].key.load(READ_ORD);
                    if k == key {
                        let t: u64 = self.records[0].value.load(READ_ORD);
                        if t != NULL_HANDLE && self.records[0].key.load(READ_ORD) == k {
                            ret = t;
                        }
                    }
                }
            }

            if self.hdr.switch_counter.load() == c0 {
                break;
            }
        }

        if ret != NULL_HANDLE {
            return LeafSearch::Found(ret);
        }

        let sibling: *mut u8 = self.sibling();
        if !sibling.is_null() {
            // SAFETY: sibling pages stay alive for at least as long as the
            // caller's reclamation guard; the chain never links freed pages.
            let sibling_page: &Page<CARD> = unsafe { &*sibling.cast::<Page<CARD>>() };
            if key >= sibling_page.highest() {
                return LeafSearch::MovedRight(sibling);
            }
        }

        LeafSearch::NotFound
    }

    /// Select the child to descend into from an internal page.
    ///
    /// Returns the child owning the greatest entry key `<= key`, the
    /// leftmost child when `key` precedes every entry, or the right sibling
    /// when a concurrent split moved the key range past this page.
    pub(crate) fn search_child(&self, key: i64) -> *mut u8 {
        debug_assert!(!self.is_leaf());

        let mut ret: *mut u8;

        loop {
            let c0: u8 = self.hdr.switch_counter.load();
            ret = std::ptr::null_mut();

            if SwitchCounter::is_forward(c0) {
                let k0: i64 = self.records[0].key.load(READ_ORD);
                if key < k0 {
                    let leftmost: *mut u8 = self.hdr.leftmost.load(READ_ORD);
                    if leftmost != ptr_from_handle(self.records[0].value.load(READ_ORD)) {
                        ret = leftmost;
                    }
                }

                if ret.is_null() {
                    let mut i: usize = 1;
                    while i < CARD && self.records[i].value.load(READ_ORD) != NULL_HANDLE {
                        let k: i64 = self.records[i].key.load(READ_ORD);
                        if key < k {
                            let t: u64 = self.records[i - 1].value.load(READ_ORD);
                            if t != self.records[i].value.load(READ_ORD) {
                                ret = ptr_from_handle(t);
                                break;
                            }
                        }
                        i += 1;
                    }

                    if ret.is_null() {
                        // Past every separator: the last child routes.
                        ret = ptr_from_handle(self.records[i - 1].value.load(READ_ORD));
                    }
                }
            } else {
                let mut i: isize = self.count() as isize - 1;
                while i >= 0 {
                    let idx = i as usize;
                    let k: i64 = self.records[idx].key.load(READ_ORD);
                    if key >= k {
                        if idx == 0 {
                            let t: u64 = self.records[0].value.load(READ_ORD);
                            if self.hdr.leftmost.load(READ_ORD) != ptr_from_handle(t) {
                                ret = ptr_from_handle(t);
                                break;
                            }
                        } else {
                            let t: u64 = self.records[idx].value.load(READ_ORD);
                            if self.records[idx - 1].value.load(READ_ORD) != t {
                                ret = ptr_from_handle(t);
                                break;
                            }
                        }
                    }
                    i -= 1;
                }
            }

            if self.hdr.switch_counter.load() == c0 {
                break;
            }
        }

        // A split may have moved the range right regardless of what the
        // scan produced; the sibling bound decides first.
        let sibling: *mut u8 = self.sibling();
        if !sibling.is_null() {
            // SAFETY: see search_leaf.
            let sibling_page: &Page<CARD> = unsafe { &*sibling.cast::<Page<CARD>>() };
            if key >= sibling_page.highest() {
                return sibling;
            }
        }

        if ret.is_null() {
            self.hdr.leftmost.load(READ_ORD)
        } else {
            ret
        }
    }

    /// Scan `(min, max)` (both bounds exclusive) from this leaf rightward,
    /// appending matching value-handles to `out` in ascending key order.
    ///
    /// Each leaf is scanned under the switch-counter protocol and re-scanned
    /// from scratch when the counter moves. Forward scans stop at the first
    /// key `>= max`; backward scans cannot stop early (they meet the largest
    /// keys first), so they skip past-bound keys, note that one was seen,
    /// and end the chain walk after the leaf completes. Backward appends are
    /// reversed in place to restore ascending order.
    pub(crate) fn search_range_into(&self, min: i64, max: i64, out: &mut Vec<u64>) {
        debug_assert!(self.is_leaf());

        let mut current: *const Page<CARD> = self;

        // Rises to the largest key emitted so far. A leaf validated just
        // before a split completes can be re-read through the fresh
        // sibling; dropping keys at or below the high-water mark keeps the
        // output duplicate-free and strictly ascending.
        let mut scan_min: i64 = min;

        while !current.is_null() {
            // SAFETY: leaf-chain pages stay alive under the caller's guard.
            let page: &Page<CARD> = unsafe { &*current };
            let base: usize = out.len();
            let mut past_upper_bound: bool;
            let mut node_max_key: i64;

            loop {
                let c0: u8 = page.hdr.switch_counter.load();
                out.truncate(base);
                past_upper_bound = false;
                node_max_key = scan_min;

                if SwitchCounter::is_forward(c0) {
                    let k: i64 = page.records[0].key.load(READ_ORD);
                    if k > scan_min {
                        if k < max {
                            let t: u64 = page.records[0].value.load(READ_ORD);
                            if t != NULL_HANDLE && page.records[0].key.load(READ_ORD) == k {
                                out.push(t);
                                node_max_key = node_max_key.max(k);
                            }
                        } else {
                            return;
                        }
                    }

                    let mut i: usize = 1;
                    while i < CARD && page.records[i].value.load(READ_ORD) != NULL_HANDLE {
                        let k: i64 = page.records[i].key.load(READ_ORD);
                        if k > scan_min {
                            if k < max {
                                let t: u64 = page.records[i].value.load(READ_ORD);
                                if t != NULL_HANDLE
                                    && t != page.records[i - 1].value.load(READ_ORD)
                                    && page.records[i].key.load(READ_ORD) == k
                                {
                                    out.push(t);
                                    node_max_key = node_max_key.max(k);
                                }
                            } else {
                                return;
                            }
                        }
                        i += 1;
                    }
                } else {
                    let mut i: isize = page.count() as isize - 1;
                    while i > 0 {
                        let idx = i as usize;
                        let k: i64 = page.records[idx].key.load(READ_ORD);
                        if k >= max {
                            past_upper_bound = true;
                        } else if k > scan_min {
                            let t: u64 = page.records[idx].value.load(READ_ORD);
                            if t != NULL_HANDLE
                                && t != page.records[idx - 1].value.load(READ_ORD)
                                && page.records[idx].key.load(READ_ORD) == k
                            {
                                out.push(t);
                                node_max_key = node_max_key.max(k);
                            }
                        }
                        i -= 1;
                    }

                    let k: i64 = page.records[0].key.load(READ_ORD);
                    if k >= max {
                        past_upper_bound = true;
                    } else if k > scan_min {
                        let t: u64 = page.records[0].value.load(READ_ORD);
                        if t != NULL_HANDLE && page.records[0].key.load(READ_ORD) == k {
                            out.push(t);
                            node_max_key = node_max_key.max(k);
                        }
                    }

                    out[base..].reverse();
                }

                if page.hdr.switch_counter.load() == c0 {
                    break;
                }
            }

            if past_upper_bound {
                return;
            }

            scan_min = node_max_key;
            current = page.sibling().cast::<Page<CARD>>().cast_const();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::HeapPool;

    fn leaf_with(keys: &[i64]) -> Box<Page> {
        let pool = HeapPool::new();
        let page: Box<Page> = Page::new(0);
        let mut n: usize = 0;
        for &key in keys {
            page.insert_entry(key, key as u64, &mut n, true, &pool);
        }
        page
    }

    #[test]
    fn leaf_search_finds_present_keys() {
        let page = leaf_with(&[5, 3, 8, 1]);

        for key in [1i64, 3, 5, 8] {
            assert_eq!(page.search_leaf(key), LeafSearch::Found(key as u64));
        }
    }

    #[test]
    fn leaf_search_misses_absent_keys() {
        let page = leaf_with(&[2, 4, 6]);

        assert_eq!(page.search_leaf(3), LeafSearch::NotFound);
        assert_eq!(page.search_leaf(100), LeafSearch::NotFound);
    }

    #[test]
    fn leaf_search_backward_mode_after_remove() {
        let pool = HeapPool::new();
        let page = leaf_with(&[1, 2, 3, 4, 5]);

        page.remove_entry(3, &pool);
        assert!(!SwitchCounter::is_forward(page.hdr.switch_counter.load()));

        assert_eq!(page.search_leaf(1), LeafSearch::Found(1));
        assert_eq!(page.search_leaf(5), LeafSearch::Found(5));
        assert_eq!(page.search_leaf(3), LeafSearch::NotFound);
    }

    #[test]
    fn leaf_search_hops_right_past_split_bound() {
        let right = leaf_with(&[10, 11]);
        right.hdr.highest.store(10, crate::ordering::WRITE_ORD);
        let right_ptr: *mut u8 = Box::into_raw(right).cast();

        let left = leaf_with(&[1, 2]);
        left.hdr.sibling.store(right_ptr, crate::ordering::WRITE_ORD);

        assert_eq!(left.search_leaf(11), LeafSearch::MovedRight(right_ptr));
        assert_eq!(left.search_leaf(5), LeafSearch::NotFound);

        // SAFETY: right_ptr came from Box::into_raw above.
        unsafe { drop(Box::from_raw(right_ptr.cast::<Page>())) };
    }

    #[test]
    fn child_selection_routes_by_separator() {
        let pool = HeapPool::new();
        let left: *mut u8 = Box::into_raw(Page::<DEFAULT_CARD>::new(0)).cast();
        let mid: *mut u8 = Box::into_raw(Page::<DEFAULT_CARD>::new(0)).cast();
        let right: *mut u8 = Box::into_raw(Page::<DEFAULT_CARD>::new(0)).cast();

        let inner: Box<Page> = Page::new(1);
        inner.hdr.leftmost.store(left, crate::ordering::WRITE_ORD);
        let mut n: usize = 0;
        inner.insert_entry(10, crate::page::handle_from_ptr(mid), &mut n, true, &pool);
        inner.insert_entry(20, crate::page::handle_from_ptr(right), &mut n, true, &pool);

        assert_eq!(inner.search_child(5), left);
        assert_eq!(inner.search_child(10), mid);
        assert_eq!(inner.search_child(15), mid);
        assert_eq!(inner.search_child(20), right);
        assert_eq!(inner.search_child(99), right);

        // SAFETY: all three came from Box::into_raw above.
        unsafe {
            drop(Box::from_raw(left.cast::<Page>()));
            drop(Box::from_raw(mid.cast::<Page>()));
            drop(Box::from_raw(right.cast::<Page>()));
        }
    }

    const DEFAULT_CARD: usize = crate::page::DEFAULT_CARDINALITY;

    #[test]
    fn range_scan_strict_bounds() {
        let page = leaf_with(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);

        let mut out: Vec<u64> = Vec::new();
        page.search_range_into(2, 8, &mut out);
        assert_eq!(out, vec![3, 4, 5, 6, 7]);
    }

    #[test]
    fn range_scan_backward_mode_stays_ascending() {
        let pool = HeapPool::new();
        let page = leaf_with(&[1, 2, 3, 4, 5, 6]);
        page.remove_entry(4, &pool);

        let mut out: Vec<u64> = Vec::new();
        page.search_range_into(0, 100, &mut out);
        assert_eq!(out, vec![1, 2, 3, 5, 6]);
    }

    #[test]
    fn range_scan_backward_mode_keeps_in_range_keys_below_max() {
        let pool = HeapPool::new();
        let page = leaf_with(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        page.remove_entry(5, &pool);

        // The largest keys are past max; lower ones must still be reported.
        let mut out: Vec<u64> = Vec::new();
        page.search_range_into(0, 8, &mut out);
        assert_eq!(out, vec![1, 2, 3, 4, 6, 7]);
    }

    #[test]
    fn range_scan_walks_sibling_chain() {
        let right = leaf_with(&[10, 11, 12]);
        right.hdr.highest.store(10, crate::ordering::WRITE_ORD);
        let right_ptr: *mut u8 = Box::into_raw(right).cast();

        let left = leaf_with(&[1, 2, 3]);
        left.hdr.sibling.store(right_ptr, crate::ordering::WRITE_ORD);

        let mut out: Vec<u64> = Vec::new();
        left.search_range_into(0, 12, &mut out);
        assert_eq!(out, vec![1, 2, 3, 10, 11]);

        // SAFETY: right_ptr came from Box::into_raw above.
        unsafe { drop(Box::from_raw(right_ptr.cast::<Page>())) };
    }
}
