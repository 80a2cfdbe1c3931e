//! Occ-map: a lock-free concurrent hash map with version-gated writes
//!
//! Every stored value carries a caller-assigned version. A write is admitted
//! only if its version is strictly greater than the version currently stored
//! for the key; stale writes are rejected with a [`VersionConflict`] and leave
//! the map untouched.
//!
//! # Key Features
//!
//! - **Lock-Free**: no operation takes a lock, all updates are single-slot CAS
//! - **Cooperative Resize**: threads that meet a migrating table help copy it
//! - **Optimistic Writes**: the version check is re-run on every CAS retry
//! - **Safe Memory Reclamation**: retired cells and root handles go through kovan
//!
//! # Example
//!
//! ```rust
//! use occ_map::{OccMap, Stamped, WriteOutcome};
//!
//! let map = OccMap::new();
//! map.put("balance", Stamped::new(100, 1)).unwrap();
//!
//! // A writer that read version 1 and raced another writer loses.
//! map.put("balance", Stamped::new(90, 2)).unwrap();
//! match map.try_put("balance", Stamped::new(80, 2)) {
//!     WriteOutcome::Conflict(c) => assert_eq!(c.existing.value, 90),
//!     WriteOutcome::Accepted(_) => unreachable!(),
//! }
//!
//! // Removal ignores versions and resets the floor.
//! map.remove("balance");
//! map.put("balance", Stamped::new(0, 0)).unwrap();
//! ```

#![warn(missing_docs)]

mod counter;
mod engine;
mod error;
mod gate;
mod iter;
mod map;
mod resize;
mod table;
mod versioned;

pub use counter::Counter;
pub use error::{Conflict, VersionConflict, WriteOutcome};
pub use iter::{Iter, Keys, Values};
pub use map::OccMap;
pub use versioned::{Stamped, Versioned};
