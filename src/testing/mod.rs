//! Scenario tests over in-process clusters.
//!
//! Every node is a full [`DataGrid`](crate::DataGrid) wired to an
//! [`InMemoryNetwork`](crate::network::InMemoryNetwork). Views are installed
//! by the harness, so tests decide exactly when a split, a crash or a join
//! becomes visible to the members.
//!
//! Set `RUST_LOG=gridcore=debug` to see the node logs of a failing test.

mod cluster;
mod utils;

mod failure_tests;
mod lock_tests;
mod merge_tests;

pub(crate) use cluster::{test_config, TestCluster, WAIT_TIMEOUT};
pub(crate) use utils::{init_tracing, wait_for, wait_for_result};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_test_config_is_valid() {
        let config = test_config(4);
        assert_eq!(config.node_id, 4);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_wait_for() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            setter.store(true, Ordering::Relaxed);
        });

        let result = wait_for(
            || flag.load(Ordering::Relaxed),
            Duration::from_millis(500),
            Duration::from_millis(10),
        )
        .await;
        assert!(result);
    }

    #[tokio::test]
    async fn test_cluster_start_installs_one_view() {
        let cluster = TestCluster::start(3);
        assert_eq!(cluster.alive(), vec![1, 2, 3]);
        assert!(cluster.wait_for_topology(&[1, 2, 3], 1).await);
        assert_eq!(cluster.topology_id(), 1);
    }
}
