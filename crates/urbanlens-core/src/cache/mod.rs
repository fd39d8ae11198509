//! Two-tier response cache.
//!
//! This module provides the `CacheStore` shared by every subscriber. Entries
//! are keyed by fully-qualified request URL and hold the last successful JSON
//! payload with the time it was written.
//!
//! - Process tier: in-memory map, lost on restart
//! - Persistent tier: a `PersistentTier` implementation, usually `DiskTier`
//!
//! Entries are fresh for the configured TTL (5 minutes by default). Stale
//! entries are still served; staleness only decides whether a fetch blocks.

pub mod clock;
pub mod disk;
pub mod entry;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use disk::{DiskTier, PersistentTier};
pub use entry::CacheEntry;
pub use store::CacheStore;
