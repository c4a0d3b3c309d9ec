//! Cluster membership views.

pub mod events;
pub mod view;

pub use events::ViewChange;
pub use view::{ClusterView, MembershipProvider, StaticMembership};
