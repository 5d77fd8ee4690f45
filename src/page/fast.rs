//! FAST: failure-atomic shift for node-local insert and remove.
//!
//! Both operations move entries one slot at a time in an order chosen so
//! that the on-media state is, at every flush boundary, a well-formed sorted
//! prefix plus at most one harmless duplicate. No log, no undo: a crash
//! anywhere mid-shift leaves a page the read protocol already knows how to
//! interpret.
//!
//! Flushes are batched per cache line: four entries share a line, and a
//! line is flushed only when the shift is about to leave it. The writer
//! flips the switch counter to the matching scan direction *before* the
//! first entry moves, which is what lets readers scan concurrently without
//! the lock.

use crate::ordering::{RELAXED, WRITE_ORD};
use crate::page::{ENTRY_SIZE, NULL_HANDLE, Page, handle_from_ptr};
use crate::persist::CACHE_LINE_SIZE;
use crate::pool::PagePool;

impl<const CARD: usize> Page<CARD> {
    /// Whether writing `records[slot]` obligates a flush of its cache line.
    ///
    /// True when the entry begins a line (the shift walks away from it next)
    /// or when it straddles into the following line. With 16-byte entries at
    /// 16-aligned offsets only the first case can fire, keeping at most one
    /// dirty line in flight per shift.
    #[inline]
    fn at_flush_boundary(&self, slot: usize) -> bool {
        let rem: usize = (&raw const self.records[slot]).addr() % CACHE_LINE_SIZE;
        rem == 0
            || ((rem + ENTRY_SIZE) / CACHE_LINE_SIZE == 1
                && (rem + ENTRY_SIZE) % CACHE_LINE_SIZE != 0)
    }

    /// FAST insert of `(key, value)` into this page.
    ///
    /// Caller holds the page write lock, has verified `*num_entries <
    /// CARD - 1`, and passes the current count in `num_entries`; it is
    /// advanced by one on return. `flush = false` suppresses per-entry
    /// persistence for split migration, where the sibling is flushed
    /// wholesale afterwards.
    ///
    /// The shift walks from the tail toward slot 0. Each displaced entry is
    /// written value-first so the transient state a reader can observe is a
    /// duplicated handle, which the read protocol filters, never a torn
    /// `(key, value)` pairing.
    pub(crate) fn insert_entry<P: PagePool<CARD>>(
        &self,
        key: i64,
        value: u64,
        num_entries: &mut usize,
        flush: bool,
        pool: &P,
    ) {
        debug_assert!(*num_entries < CARD - 1, "caller must split before FAST");

        self.hdr.switch_counter.signal_insert();

        if *num_entries == 0 {
            // Empty page: one entry, one terminator, one line.
            self.records[0].key.store(key, WRITE_ORD);
            self.records[0].value.store(value, WRITE_ORD);
            self.records[1].value.store(NULL_HANDLE, WRITE_ORD);

            if flush {
                pool.persist((&raw const self.records[0]).cast(), CACHE_LINE_SIZE);
            }
        } else {
            let n: usize = *num_entries;

            // Extend the terminator one slot right so the whole prefix can
            // shift underneath it.
            let terminator: u64 = self.records[n].value.load(RELAXED);
            self.records[n + 1].value.store(terminator, WRITE_ORD);
            if flush && self.at_flush_boundary(n + 1) {
                pool.persist(
                    (&raw const self.records[n + 1].value).cast(),
                    std::mem::size_of::<u64>(),
                );
            }

            let mut inserted: bool = false;
            let mut i: isize = n as isize - 1;

            while i >= 0 {
                let idx = i as usize;
                let slot_key: i64 = self.records[idx].key.load(RELAXED);

                if key < slot_key {
                    // Shift this entry one slot right, value before key.
                    let slot_value: u64 = self.records[idx].value.load(RELAXED);
                    self.records[idx + 1].value.store(slot_value, WRITE_ORD);
                    self.records[idx + 1].key.store(slot_key, WRITE_ORD);

                    if flush && self.at_flush_boundary(idx + 1) {
                        pool.persist((&raw const self.records[idx + 1]).cast(), CACHE_LINE_SIZE);
                    }
                } else {
                    // Found the insertion slot: seed it with the left
                    // neighbor's handle (transient duplicate), then commit
                    // key and value.
                    let slot_value: u64 = self.records[idx].value.load(RELAXED);
                    self.records[idx + 1].value.store(slot_value, WRITE_ORD);
                    self.records[idx + 1].key.store(key, WRITE_ORD);
                    self.records[idx + 1].value.store(value, WRITE_ORD);

                    if flush {
                        pool.persist((&raw const self.records[idx + 1]).cast(), ENTRY_SIZE);
                    }

                    inserted = true;
                    break;
                }

                i -= 1;
            }

            if !inserted {
                // Ran past slot 0: the new key is the smallest. Seed slot 0
                // with the leftmost child handle, mirroring the interior
                // entry rule that a slot's left neighbor is its child.
                let leftmost: u64 = handle_from_ptr(self.hdr.leftmost.load(RELAXED));
                self.records[0].value.store(leftmost, WRITE_ORD);
                self.records[0].key.store(key, WRITE_ORD);
                self.records[0].value.store(value, WRITE_ORD);

                if flush {
                    pool.persist((&raw const self.records[0]).cast(), ENTRY_SIZE);
                }
            }
        }

        // In-memory hint only; recovery re-derives the count by scanning.
        #[expect(clippy::cast_possible_truncation, reason = "CARD fits in i16")]
        self.hdr.last_index.store(*num_entries as i16, WRITE_ORD);
        *num_entries += 1;
    }

    /// Remove `key` under the page write lock. Returns false when absent.
    ///
    /// `with_lock = false` is for callers that already hold it (the
    /// rebalance paths).
    pub(crate) fn remove<P: PagePool<CARD>>(&self, key: i64, with_lock: bool, pool: &P) -> bool {
        let lock = with_lock.then(|| self.hdr.lock.lock());
        let removed: bool = self.remove_entry(key, pool);
        drop(lock);
        removed
    }

    /// FAST remove of `key` from this page. Returns false when absent.
    ///
    /// Caller holds the page write lock. Mirror image of the insert shift:
    /// the matched slot's handle is first replaced by its left neighbor's
    /// (transient duplicate), then everything after it shifts left by one,
    /// terminator included.
    pub(crate) fn remove_entry<P: PagePool<CARD>>(&self, key: i64, pool: &P) -> bool {
        self.hdr.switch_counter.signal_remove();

        let mut shift: bool = false;
        let mut i: usize = 0;

        while i < CARD && self.records[i].value.load(RELAXED) != NULL_HANDLE {
            if !shift && self.records[i].key.load(RELAXED) == key {
                let replacement: u64 = if i == 0 {
                    handle_from_ptr(self.hdr.leftmost.load(RELAXED))
                } else {
                    self.records[i - 1].value.load(RELAXED)
                };
                self.records[i].value.store(replacement, WRITE_ORD);
                shift = true;
            }

            if shift {
                if i + 1 >= CARD {
                    break;
                }

                let next_key: i64 = self.records[i + 1].key.load(RELAXED);
                let next_value: u64 = self.records[i + 1].value.load(RELAXED);
                self.records[i].key.store(next_key, WRITE_ORD);
                self.records[i].value.store(next_value, WRITE_ORD);

                if self.at_flush_boundary(i) {
                    pool.persist((&raw const self.records[i]).cast(), CACHE_LINE_SIZE);
                }
            }

            i += 1;
        }

        if shift {
            let last: i16 = self.hdr.last_index.load(RELAXED);
            self.hdr.last_index.store(last - 1, WRITE_ORD);
        }

        shift
    }
}
