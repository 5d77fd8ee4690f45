//! Page: the fixed-size B+-tree node.
//!
//! A page is a single 512-byte record: a 64-byte header followed by a sorted
//! array of `(key, value-handle)` entries. Valid entries occupy a contiguous
//! prefix terminated by the first null value-handle; the entry count is
//! *derived* by scanning, never trusted from a stored field, so that an
//! interrupted shift can always be re-counted after a crash.
//!
//! Readers traverse pages without the write lock; every field a reader can
//! observe mid-write is therefore an atomic, and the scan protocol in
//! [`search`](self) validates against the header's switch counter.
//!
//! # Layout
//!
//! `#[repr(C, align(64))]`, header pinned at 64 bytes, entries at 16 bytes,
//! so the default page is exactly 512 bytes and each group of four entries
//! shares one cache line. The `CARD` const parameter exists for tests that
//! want tiny nodes; the on-media format is `DEFAULT_CARDINALITY`.

use std::fmt as StdFmt;
use std::ptr as StdPtr;
use std::sync::atomic::{AtomicI16, AtomicI64, AtomicPtr, AtomicU8, AtomicU64};

use parking_lot::Mutex;

use crate::ordering::{READ_ORD, RELAXED};
use crate::persist::CACHE_LINE_SIZE;
use crate::switch::SwitchCounter;

mod fast;
mod search;
mod store;

pub(crate) use search::LeafSearch;

// ============================================================================
//  Layout Constants
// ============================================================================

/// On-media page size.
pub const PAGE_SIZE: usize = 512;

/// Header size; also the offset of the first entry.
pub const HEADER_SIZE: usize = 64;

/// Size of one `(key, value-handle)` entry.
pub const ENTRY_SIZE: usize = 16;

/// Entries per page in the on-media format.
pub const DEFAULT_CARDINALITY: usize = (PAGE_SIZE - HEADER_SIZE) / ENTRY_SIZE;

/// Key stored in slots that have never held an entry.
pub const KEY_SENTINEL: i64 = i64::MAX;

/// Value-handle that terminates a page's valid prefix. Callers must not
/// store it as a real handle.
pub const NULL_HANDLE: u64 = 0;

// ============================================================================
//  Handle <-> Pointer
// ============================================================================

/// Store a page pointer as an opaque value-handle (internal entries).
#[inline]
#[must_use]
pub(crate) fn handle_from_ptr(ptr: *mut u8) -> u64 {
    ptr.expose_provenance() as u64
}

/// Recover a page pointer from an internal entry's value-handle.
#[inline]
#[must_use]
pub(crate) fn ptr_from_handle(handle: u64) -> *mut u8 {
    StdPtr::with_exposed_provenance_mut(handle as usize)
}

// ============================================================================
//  Entry
// ============================================================================

/// One `(key, value-handle)` slot.
///
/// Both halves are atomics because readers scan entries while a writer is
/// shifting them; the switch-counter protocol makes the races benign.
#[repr(C)]
#[derive(Debug)]
pub struct Entry {
    pub(crate) key: AtomicI64,
    pub(crate) value: AtomicU64,
}

impl Entry {
    fn empty() -> Self {
        Self {
            key: AtomicI64::new(KEY_SENTINEL),
            value: AtomicU64::new(NULL_HANDLE),
        }
    }
}

// ============================================================================
//  Header
// ============================================================================

/// Page header, pinned at exactly one cache line.
///
/// `level` is written once at construction and never changes, so it stays a
/// plain integer; everything else may be observed mid-write by lock-free
/// readers and is atomic.
#[repr(C)]
pub struct Header {
    /// Child strictly less than the first key (internal pages; null in
    /// leaves, which doubles as the leaf/internal discriminator).
    pub(crate) leftmost: AtomicPtr<u8>,

    /// Immediate right sibling at the same level, or null.
    pub(crate) sibling: AtomicPtr<u8>,

    /// Smallest key that does NOT belong in this page; the split key
    /// recorded when this page was created as a right sibling.
    /// [`KEY_SENTINEL`] until the page's left neighbor splits it off.
    pub(crate) highest: AtomicI64,

    /// 0 for leaves, increasing toward the root. Immutable.
    pub(crate) level: u32,

    /// Scan-direction / mutation epoch byte.
    pub(crate) switch_counter: SwitchCounter,

    /// Tombstone for pages retired by a merge.
    pub(crate) is_deleted: AtomicU8,

    /// Index of the last valid entry, or -1. An in-memory hint; the durable
    /// count is recovered by scanning for the terminator.
    pub(crate) last_index: AtomicI16,

    /// Writer mutual exclusion. Readers never take it.
    pub(crate) lock: Mutex<()>,

    _pad: [u8; HEADER_PAD],
}

const HEADER_PAD: usize = 31;

impl Header {
    fn new(level: u32) -> Self {
        Self {
            leftmost: AtomicPtr::new(StdPtr::null_mut()),
            sibling: AtomicPtr::new(StdPtr::null_mut()),
            highest: AtomicI64::new(KEY_SENTINEL),
            level,
            switch_counter: SwitchCounter::new(),
            is_deleted: AtomicU8::new(0),
            last_index: AtomicI16::new(-1),
            lock: Mutex::new(()),
            _pad: [0; HEADER_PAD],
        }
    }
}

// ============================================================================
//  Page
// ============================================================================

/// A fixed-size B+-tree node: header plus entry array.
///
/// # Type Parameters
/// * `CARD` - Entry slots per page. Tests shrink this to force splits early;
///   production pages use [`DEFAULT_CARDINALITY`].
///
/// # Invariants
/// - Valid entries form a key-sorted prefix terminated by [`NULL_HANDLE`].
/// - A value-handle appears at most once, except for the single transient
///   duplicate a FAST shift creates and the next persisted entry resolves.
/// - Every valid key is `< hdr.highest`.
#[repr(C, align(64))]
pub struct Page<const CARD: usize = DEFAULT_CARDINALITY> {
    pub(crate) hdr: Header,
    pub(crate) records: [Entry; CARD],
}

impl<const CARD: usize> Page<CARD> {
    const CARD_CHECK: () = {
        assert!(CARD >= 3, "a page needs room for two entries plus terminator");
        assert!(CARD <= i16::MAX as usize, "last_index is an i16");
    };

    /// Allocate an empty page at the given level.
    #[must_use]
    pub fn new(level: u32) -> Box<Self> {
        let _: () = Self::CARD_CHECK;

        Box::new(Self {
            hdr: Header::new(level),
            records: std::array::from_fn(|_| Entry::empty()),
        })
    }

    /// Fill a freshly allocated page as a new root after a split, with
    /// `left` below the single separator key and `right` at or above it.
    ///
    /// Called on a page no other thread can reach yet; the caller persists
    /// the whole page before publishing it.
    pub(crate) fn init_root(&self, left: *mut u8, key: i64, right: *mut u8) {
        self.hdr.leftmost.store(left, RELAXED);
        self.records[0].key.store(key, RELAXED);
        self.records[0].value.store(handle_from_ptr(right), RELAXED);
        self.records[1].value.store(NULL_HANDLE, RELAXED);
        self.hdr.last_index.store(0, RELAXED);
    }

    // ========================================================================
    //  Header Accessors
    // ========================================================================

    /// Tree level; 0 is a leaf.
    #[inline]
    #[must_use]
    pub const fn level(&self) -> u32 {
        self.hdr.level
    }

    /// Whether this page is a leaf (no leftmost child).
    #[inline]
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.hdr.leftmost.load(READ_ORD).is_null()
    }

    /// Right sibling, or null.
    #[inline]
    #[must_use]
    pub(crate) fn sibling(&self) -> *mut u8 {
        self.hdr.sibling.load(READ_ORD)
    }

    /// Exclusive upper bound of this page's key range.
    #[inline]
    #[must_use]
    pub fn highest(&self) -> i64 {
        self.hdr.highest.load(READ_ORD)
    }

    /// Whether a merge has retired this page.
    #[inline]
    #[must_use]
    pub(crate) fn is_deleted(&self) -> bool {
        self.hdr.is_deleted.load(READ_ORD) != 0
    }

    // ========================================================================
    //  Derived Count
    // ========================================================================

    /// Count valid entries, tolerating an in-flight FAST shift.
    ///
    /// Starts at `last_index + 1` and walks in the direction the switch
    /// counter indicates, falling back to a forward scan from slot 0 when
    /// the backward walk runs off the front, and retrying whenever the
    /// counter moved during the scan.
    #[must_use]
    pub fn count(&self) -> usize {
        loop {
            let c0: u8 = self.hdr.switch_counter.load();

            let mut count: isize = isize::from(self.hdr.last_index.load(READ_ORD)) + 1;

            while count >= 0
                && (count as usize) < CARD
                && self.records[count as usize].value.load(READ_ORD) != NULL_HANDLE
            {
                if SwitchCounter::is_forward(c0) {
                    count += 1;
                } else {
                    count -= 1;
                }
            }

            if count < 0 {
                count = 0;
                while (count as usize) < CARD
                    && self.records[count as usize].value.load(READ_ORD) != NULL_HANDLE
                {
                    count += 1;
                }
            }

            if self.hdr.switch_counter.load() == c0 {
                return count as usize;
            }
        }
    }

    // ========================================================================
    //  Invariant Checker
    // ========================================================================

    /// Verify the page-local invariants. Test support.
    ///
    /// # Panics
    ///
    /// If the valid prefix is not strictly key-sorted, a key reaches
    /// `highest`, or a non-transient duplicate value-handle appears.
    pub fn assert_page_invariants(&self) {
        let n: usize = self.count();
        let highest: i64 = self.highest();

        for i in 0..n {
            let key: i64 = self.records[i].key.load(RELAXED);
            assert!(
                key < highest,
                "key {key} at slot {i} reaches the page bound {highest}"
            );

            if i > 0 {
                let prev: i64 = self.records[i - 1].key.load(RELAXED);
                assert!(
                    prev < key,
                    "keys out of order: slot {} holds {prev}, slot {i} holds {key}",
                    i - 1
                );

                assert_ne!(
                    self.records[i - 1].value.load(RELAXED),
                    self.records[i].value.load(RELAXED),
                    "duplicate value-handle at committed slots {} and {i}",
                    i - 1
                );
            }
        }
    }
}

impl<const CARD: usize> StdFmt::Debug for Page<CARD> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Page")
            .field("level", &self.level())
            .field("count", &self.count())
            .field("last_index", &self.hdr.last_index.load(RELAXED))
            .field("switch_counter", &self.hdr.switch_counter.load())
            .field("highest", &self.highest())
            .field("has_sibling", &(!self.sibling().is_null()))
            .field("is_leaf", &self.is_leaf())
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  Size Assertions
// ============================================================================

/// Compile-time layout checks for the on-media format.
const _: () = {
    assert!(std::mem::size_of::<Entry>() == ENTRY_SIZE);
    assert!(std::mem::size_of::<Header>() == HEADER_SIZE);
    assert!(std::mem::size_of::<Page<DEFAULT_CARDINALITY>>() == PAGE_SIZE);
    assert!(std::mem::align_of::<Page<DEFAULT_CARDINALITY>>() == CACHE_LINE_SIZE);
};

// ============================================================================
//  Tests
// ============================================================================
