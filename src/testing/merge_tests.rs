//! Split, degraded service and merge after the partitions rejoin.

#[cfg(test)]
mod tests {
    use crate::config::PartitionHandling;
    use crate::error::Error;
    use crate::partition::{MergePolicyConfig, PartitionState};
    use crate::testing::{init_tracing, TestCluster};
    use crate::types::EntryKey;
    use bytes::Bytes;
    use std::time::Duration;

    fn replicated_everywhere(policy: MergePolicyConfig) -> TestCluster {
        TestCluster::start_with(3, move |c| {
            c.with_num_owners(3).with_merge_policy(policy.clone())
        })
    }

    async fn value_on(cluster: &TestCluster, node: u64, key: &EntryKey) -> Option<Bytes> {
        cluster
            .grid(node)
            .local_entry(key)
            .await
            .unwrap()
            .map(|e| e.value)
    }

    #[tokio::test]
    async fn tc_merge_01_preferred_partition_wins() {
        init_tracing();
        let mut cluster = replicated_everywhere(MergePolicyConfig::PreferredPartition);
        let key = EntryKey::new("c", "k");
        cluster.grid(1).cache("c").put("k", "v0").await.unwrap();

        cluster.split(&[1, 2], &[3]).await;
        assert!(cluster.wait_for_state(&[1, 2, 3], PartitionState::Degraded).await);

        // Degraded partitions keep accepting writes.
        cluster.grid(2).cache("c").put("k", "a").await.unwrap();
        cluster.grid(3).cache("c").put("k", "b").await.unwrap();
        assert_eq!(value_on(&cluster, 3, &key).await, Some(Bytes::from("b")));

        cluster.heal().await;
        assert!(cluster.wait_until_stable().await, "merge did not complete");

        for node in [1, 2, 3] {
            assert_eq!(value_on(&cluster, node, &key).await, Some(Bytes::from("a")));
        }
        let coordinator = cluster.grid(1).metrics();
        assert_eq!(coordinator.conflicts_detected, 1);
        assert_eq!(coordinator.conflicts_resolved, 1);
    }

    #[tokio::test]
    async fn tc_merge_02_preferred_non_null_keeps_values() {
        init_tracing();
        let mut cluster = replicated_everywhere(MergePolicyConfig::PreferredNonNull);
        let k1 = EntryKey::new("c", "k1");
        let k2 = EntryKey::new("c", "k2");
        let cache = cluster.grid(1).cache("c");
        cache.put("k1", "v0").await.unwrap();
        cache.put("k2", "v0").await.unwrap();

        cluster.split(&[1, 2], &[3]).await;
        let side_a = cluster.grid(1).cache("c");
        let side_b = cluster.grid(3).cache("c");
        side_a.remove("k1").await.unwrap();
        side_b.put("k1", "x").await.unwrap();
        side_a.put("k2", "y").await.unwrap();
        side_b.remove("k2").await.unwrap();
        side_b.put("k3", "z").await.unwrap();
        let k3 = EntryKey::new("c", "k3");

        cluster.heal().await;
        assert!(cluster.wait_until_stable().await, "merge did not complete");

        for node in [1, 2, 3] {
            assert_eq!(value_on(&cluster, node, &k1).await, Some(Bytes::from("x")));
            assert_eq!(value_on(&cluster, node, &k2).await, Some(Bytes::from("y")));
            assert_eq!(value_on(&cluster, node, &k3).await, Some(Bytes::from("z")));
        }
        assert_eq!(cluster.grid(1).metrics().conflicts_resolved, 3);
    }

    #[tokio::test]
    async fn tc_merge_03_remove_all_removes_one_sided_writes() {
        init_tracing();
        let mut cluster = replicated_everywhere(MergePolicyConfig::RemoveAll);
        let conflicted = EntryKey::new("c", "k");
        let one_sided = EntryKey::new("c", "only-a");
        let untouched = EntryKey::new("c", "stable");
        cluster.grid(1).cache("c").put("k", "v0").await.unwrap();
        cluster.grid(1).cache("c").put("stable", "s").await.unwrap();

        cluster.split(&[1, 2], &[3]).await;
        cluster.grid(1).cache("c").put("k", "a").await.unwrap();
        cluster.grid(1).cache("c").put("only-a", "dropped").await.unwrap();
        cluster.grid(3).cache("c").put("k", "b").await.unwrap();

        cluster.heal().await;
        assert!(cluster.wait_until_stable().await, "merge did not complete");

        // The minority never saw "only-a": its null copy conflicts too.
        for node in [1, 2, 3] {
            assert_eq!(value_on(&cluster, node, &conflicted).await, None);
            assert_eq!(value_on(&cluster, node, &one_sided).await, None);
            assert_eq!(value_on(&cluster, node, &untouched).await, Some(Bytes::from("s")));
        }
        assert!(cluster.grid(1).cache("c").get_entry("only-a").await.unwrap().is_none());
        let coordinator = cluster.grid(1).metrics();
        assert_eq!(coordinator.conflicts_detected, 2);
        assert_eq!(coordinator.conflicts_resolved, 2);
    }

    #[tokio::test]
    async fn tc_merge_06_preferred_partition_drops_minority_only_key() {
        init_tracing();
        let mut cluster = replicated_everywhere(MergePolicyConfig::PreferredPartition);
        let minority_only = EntryKey::new("c", "only-b");

        cluster.split(&[1, 2], &[3]).await;
        assert!(cluster.wait_for_state(&[1, 2, 3], PartitionState::Degraded).await);
        cluster.grid(3).cache("c").put("only-b", "b").await.unwrap();
        assert_eq!(value_on(&cluster, 3, &minority_only).await, Some(Bytes::from("b")));

        cluster.heal().await;
        assert!(cluster.wait_until_stable().await, "merge did not complete");

        // The majority's copy is the null one.
        for node in [1, 2, 3] {
            assert_eq!(value_on(&cluster, node, &minority_only).await, None);
        }
        assert_eq!(cluster.grid(2).cache("c").get("only-b").await.unwrap(), None);
        assert_eq!(cluster.grid(1).metrics().conflicts_resolved, 1);
    }

    #[tokio::test]
    async fn tc_merge_04_deny_read_writes_until_forced() {
        init_tracing();
        let mut cluster = TestCluster::start_with(3, |c| {
            c.with_num_owners(3)
                .with_partition_handling(PartitionHandling::DenyReadWrites)
                .with_merge_policy(MergePolicyConfig::PreferredPartition)
        });
        let key = EntryKey::new("c", "k");
        cluster.grid(1).cache("c").put("k", "v0").await.unwrap();

        cluster.split(&[1, 2], &[3]).await;
        assert!(cluster.wait_for_state(&[1, 2, 3], PartitionState::Unavailable).await);

        let isolated = cluster.grid(3).cache("c");
        assert!(matches!(
            isolated.put("k", "b").await,
            Err(Error::Availability {
                state: PartitionState::Unavailable
            })
        ));
        assert!(matches!(
            isolated.get("k").await,
            Err(Error::Availability { .. })
        ));

        for node in [1, 2, 3] {
            assert!(cluster.grid(node).force_available());
            assert!(!cluster.grid(node).force_available());
        }
        cluster.grid(1).cache("c").put("k", "a").await.unwrap();
        isolated.put("k", "b").await.unwrap();

        // Forcing availability does not forget the split.
        cluster.heal().await;
        assert!(cluster.wait_until_stable().await, "merge did not complete");
        for node in [1, 2, 3] {
            assert_eq!(value_on(&cluster, node, &key).await, Some(Bytes::from("a")));
        }
    }

    #[tokio::test]
    async fn tc_merge_05_allow_reads_rejects_writes() {
        init_tracing();
        let mut cluster = TestCluster::start_with(3, |c| {
            c.with_num_owners(3)
                .with_partition_handling(PartitionHandling::AllowReads)
        });
        cluster.grid(1).cache("c").put("k", "v0").await.unwrap();

        cluster.split(&[1, 2], &[3]).await;
        assert!(cluster.wait_for_state(&[3], PartitionState::Unavailable).await);

        let isolated = cluster.grid(3).cache("c");
        assert_eq!(isolated.get("k").await.unwrap(), Some(Bytes::from("v0")));
        assert!(matches!(
            isolated.remove("k").await,
            Err(Error::Availability { .. })
        ));

        cluster.heal().await;
        assert!(cluster.wait_until_stable().await, "merge did not complete");
        isolated.put("k", "after").await.unwrap();
        assert_eq!(
            cluster.grid(1).cache("c").get("k").await.unwrap(),
            Some(Bytes::from("after"))
        );
    }

    #[tokio::test]
    async fn tc_merge_07_lost_completion_is_redelivered() {
        init_tracing();
        let mut cluster = replicated_everywhere(MergePolicyConfig::PreferredPartition);
        let key = EntryKey::new("c", "k");
        cluster.grid(1).cache("c").put("k", "v0").await.unwrap();

        cluster.split(&[1, 2], &[3]).await;
        cluster.grid(1).cache("c").put("k", "a").await.unwrap();
        cluster.grid(3).cache("c").put("k", "b").await.unwrap();

        cluster.network.drop_messages("merge_complete", true);
        cluster.heal().await;
        assert!(cluster.wait_for_state(&[1], PartitionState::Stable).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        for node in [2, 3] {
            assert_eq!(cluster.grid(node).partition_state(), PartitionState::Merging);
        }

        cluster.network.drop_messages("merge_complete", false);
        assert!(cluster.wait_until_stable().await, "completion never redelivered");
        for node in [1, 2, 3] {
            assert_eq!(value_on(&cluster, node, &key).await, Some(Bytes::from("a")));
        }
        cluster.grid(3).cache("c").put("k", "after").await.unwrap();
        assert_eq!(
            cluster.grid(2).cache("c").get("k").await.unwrap(),
            Some(Bytes::from("after"))
        );
    }

    #[tokio::test]
    async fn tc_merge_08_merge_restarts_after_attempts_run_out() {
        init_tracing();
        let mut cluster = replicated_everywhere(MergePolicyConfig::PreferredPartition);
        let key = EntryKey::new("c", "k");
        cluster.grid(1).cache("c").put("k", "v0").await.unwrap();

        cluster.split(&[1, 2], &[3]).await;
        cluster.grid(2).cache("c").put("k", "a").await.unwrap();
        cluster.grid(3).cache("c").put("k", "b").await.unwrap();

        // Node 3 stays in the merged view but cannot answer.
        cluster.network.crash(3);
        cluster.heal().await;

        // Five attempts with the test backoff take well under this.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(cluster.grid(1).partition_state(), PartitionState::Merging);
        assert_eq!(cluster.grid(1).metrics().conflicts_resolved, 0);

        cluster.network.recover(3);
        assert!(cluster.wait_until_stable().await, "merge never restarted");
        for node in [1, 2, 3] {
            assert_eq!(value_on(&cluster, node, &key).await, Some(Bytes::from("a")));
        }
        assert_eq!(cluster.grid(1).metrics().conflicts_resolved, 1);
    }
}
