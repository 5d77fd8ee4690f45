//! # fastfair
//!
//! A concurrent, crash-consistent B+-tree index for byte-addressable
//! persistent memory, mapping `i64` keys to opaque 64-bit value handles.
//!
//! Two interlocking protocols keep the tree correct without logging:
//!
//! - **FAST** (failure-atomic shift): inserts and removes shift entries one
//!   slot at a time in an order whose every intermediate on-media state is a
//!   sorted prefix plus at most one transient duplicate, flushing cache
//!   lines exactly at the boundaries recovery depends on.
//! - **FAIR** (failure-atomic in-place rebalance): splits persist the new
//!   sibling wholesale, link it into the sibling chain *before* the parent
//!   learns about it, and let readers that undershoot follow the chain.
//!
//! Readers take no locks: each page carries a switch counter whose parity
//! tells a scan which direction mirrors any in-flight shift and whose value
//! validates that the scan saw a single epoch.
//!
//! ## Example
//!
//! ```
//! use fastfair::BTree;
//!
//! let tree: BTree = BTree::new();
//! for key in [5, 3, 8, 1] {
//!     tree.insert(key, key as u64).unwrap();
//! }
//!
//! assert_eq!(tree.search(3), Some(3));
//!
//! let mut out = Vec::new();
//! tree.search_range(1, 8, &mut out);
//! assert_eq!(out, vec![3, 5]);
//! ```
//!
//! ## Persistence
//!
//! The tree consumes a [`PagePool`]: page allocation plus a persist
//! primitive. The bundled [`HeapPool`] is the volatile variant - heap pages,
//! real cache-line flushes, optional emulated write latency - which keeps
//! the flush traffic observable without a PM device. A PM object pool
//! implements the same trait externally and owns the durable root slot.

pub mod page;
pub mod persist;
pub mod pool;
pub mod switch;
pub mod tree;

mod ordering;
pub(crate) mod tracing_helpers;

pub use page::{DEFAULT_CARDINALITY, KEY_SENTINEL, NULL_HANDLE, PAGE_SIZE, Page};
pub use persist::{CACHE_LINE_SIZE, PersistConfig};
pub use pool::{HeapPool, PagePool};
pub use tree::{BTree, InsertError};

/// Install a console `tracing` subscriber honoring `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .with_target(true)
        .compact()
        .try_init();
}
