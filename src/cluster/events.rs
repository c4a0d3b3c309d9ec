//! View change classification.

use crate::cluster::view::ClusterView;
use crate::types::NodeId;

/// Difference between two consecutive views.
#[derive(Debug, Clone)]
pub struct ViewChange {
    /// View before the change.
    pub previous: ClusterView,
    /// View after the change.
    pub current: ClusterView,
    /// Members present only in the new view.
    pub joined: Vec<NodeId>,
    /// Members present only in the old view.
    pub left: Vec<NodeId>,
}

impl ViewChange {
    /// Compute the change between two views.
    pub fn between(previous: &ClusterView, current: &ClusterView) -> Self {
        let joined = current
            .members
            .iter()
            .copied()
            .filter(|m| !previous.contains(*m))
            .collect();
        let left = previous
            .members
            .iter()
            .copied()
            .filter(|m| !current.contains(*m))
            .collect();
        Self {
            previous: previous.clone(),
            current: current.clone(),
            joined,
            left,
        }
    }

    /// Whether members were removed.
    pub fn has_departures(&self) -> bool {
        !self.left.is_empty()
    }

    /// Whether members were added.
    pub fn has_arrivals(&self) -> bool {
        !self.joined.is_empty()
    }

    /// Log the change.
    pub fn log(&self, node_id: NodeId) {
        if self.has_departures() {
            tracing::warn!(
                node_id,
                topology_id = self.current.topology_id,
                left = ?self.left,
                "Members left the view"
            );
        }
        if self.has_arrivals() {
            tracing::info!(
                node_id,
                topology_id = self.current.topology_id,
                joined = ?self.joined,
                "Members joined the view"
            );
        }
        if !self.has_departures() && !self.has_arrivals() {
            tracing::debug!(
                node_id,
                topology_id = self.current.topology_id,
                "View reinstalled with the same members"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_change_diff() {
        let before = ClusterView::new(1, vec![1, 2, 3]);
        let after = ClusterView::new(2, vec![1, 3, 4]);
        let change = ViewChange::between(&before, &after);
        assert_eq!(change.joined, vec![4]);
        assert_eq!(change.left, vec![2]);
        assert!(change.has_arrivals());
        assert!(change.has_departures());
    }

    #[test]
    fn test_unchanged_members() {
        let before = ClusterView::new(1, vec![1, 2]);
        let after = ClusterView::new(2, vec![2, 1]);
        let change = ViewChange::between(&before, &after);
        assert!(!change.has_arrivals());
        assert!(!change.has_departures());
    }
}
