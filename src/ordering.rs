//! Standard memory orderings for concurrent page access.
//!
//! These constants keep ordering usage consistent across the codebase and
//! make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for reading page fields during lock-free traversal.
/// Pairs with writer's Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for writing page fields under the node write lock.
/// Pairs with reader's Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for relaxed loads within a locked region.
/// Safe because the write lock provides synchronization.
pub const RELAXED: Ordering = Ordering::Relaxed;

/// Ordering for the switch-counter loads that bracket a lock-free scan.
/// Must see the writer's parity flip before any entry mutation.
pub const COUNTER_ORD: Ordering = Ordering::Acquire;
