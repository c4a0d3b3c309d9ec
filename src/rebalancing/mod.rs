//! State transfer on membership changes.
//!
//! Ownership follows the installed view. When the view changes, each node
//! pushes its copies to the owners that gained them:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                 StateTransferCoordinator                    │
//! │  1. plan: owners of every local copy under the new view     │
//! │  2. push: StateTransfer batches to each other owner         │
//! │  3. release: drop copies no longer owned, once delivered    │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Receivers install a copy only if its version is strictly newer than their
//! own, so pushes are idempotent and never roll an owner back. After a merge
//! the transfer runs once the merge completes.

mod coordinator;
mod transfer;

pub use coordinator::{StateTransferCoordinator, TransferReport};
pub use transfer::{OwnedCopy, TransferPlan, TRANSFER_BATCH_SIZE};
