//! Key placement across cluster members.
//!
//! Owners are computed from the installed view with a consistent hash ring:
//!
//! ```text
//!   EntryKey{cache, key} -> xxh64 -> first vnode clockwise -> primary
//!                                 -> next distinct member   -> backup
//! ```
//!
//! The oracle is a trait so embedding applications can plug other placement
//! schemes in, as long as every node computes the same owners for the same
//! key and view.

mod hashring;
mod ownership;

pub use hashring::{hash_key, HashRing};
pub use ownership::{ConsistentHashOracle, OwnershipOracle, OwnershipRole};
