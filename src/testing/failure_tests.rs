//! Crashes, evictions and joins.

#[cfg(test)]
mod tests {
    use crate::testing::{init_tracing, wait_for, wait_for_result, TestCluster, WAIT_TIMEOUT};
    use crate::types::EntryKey;
    use bytes::Bytes;
    use std::time::Duration;

    #[tokio::test]
    async fn test_crashed_primary_loses_no_acknowledged_write() {
        init_tracing();
        let mut cluster = TestCluster::start(3);
        let cache = cluster.grid(1).cache("orders");
        for i in 0..20 {
            cache
                .put(format!("order-{}", i), format!("v{}", i))
                .await
                .unwrap();
        }

        cluster.crash_and_evict(2).await;
        assert_eq!(cluster.alive(), vec![1, 3]);

        for reader in cluster.alive() {
            let cache = cluster.grid(reader).cache("orders");
            for i in 0..20 {
                let value = cache.get(format!("order-{}", i)).await.unwrap();
                assert_eq!(value, Some(Bytes::from(format!("v{}", i))), "order-{}", i);
            }
        }

        // Writes keep flowing with a single surviving owner per key.
        cluster
            .grid(3)
            .cache("orders")
            .put("order-0", "after")
            .await
            .unwrap();
        assert_eq!(
            cluster.grid(1).cache("orders").get("order-0").await.unwrap(),
            Some(Bytes::from("after"))
        );
    }

    #[tokio::test]
    async fn test_joining_node_receives_owned_entries() {
        init_tracing();
        let mut cluster = TestCluster::start(3);
        let cache = cluster.grid(1).cache("items");
        for i in 0..30 {
            cache.put(format!("item-{}", i), "x").await.unwrap();
        }

        cluster.join(4).await;
        let owned: Vec<EntryKey> = (0..30)
            .map(|i| EntryKey::new("items", format!("item-{}", i)))
            .filter(|key| cluster.owners(key).contains(&4))
            .collect();
        assert!(!owned.is_empty(), "the new node owns part of the keyspace");

        let joined = cluster.grid(4);
        for key in &owned {
            let entry = wait_for_result(
                move || joined.local_entry(key),
                |entry| matches!(entry, Ok(Some(_))),
                WAIT_TIMEOUT,
            )
            .await;
            assert!(entry.is_some(), "{} not transferred", key);
        }

        let pushed = || {
            [1, 2, 3]
                .iter()
                .map(|&n| cluster.grid(n).metrics().entries_transferred)
                .sum::<u64>()
        };
        assert!(wait_for(|| pushed() > 0, WAIT_TIMEOUT, Duration::from_millis(10)).await);

        // Reads from the new node see every value.
        for i in 0..30 {
            let value = joined.cache("items").get(format!("item-{}", i)).await.unwrap();
            assert_eq!(value, Some(Bytes::from("x")));
        }
    }

    #[tokio::test]
    async fn test_settled_removals_are_forgotten() {
        init_tracing();
        let mut cluster = TestCluster::start(3);
        let cache = cluster.grid(1).cache("sessions");
        for i in 0..20 {
            cache.put(format!("s-{}", i), "x").await.unwrap();
        }
        for i in 0..15 {
            cache.remove(format!("s-{}", i)).await.unwrap();
        }
        let before: usize = [1, 2, 3]
            .iter()
            .map(|&n| cluster.grid(n).stats().versioned_keys)
            .sum();
        let live: u64 = [1, 2, 3]
            .iter()
            .map(|&n| cluster.grid(n).stats().entry_count)
            .sum();
        assert!(before as u64 > live, "removals leave versions behind");

        // The next view settles the removals of the previous one.
        cluster.join(4).await;
        let settled = wait_for(
            || {
                cluster.alive().into_iter().all(|n| {
                    let stats = cluster.grid(n).stats();
                    stats.versioned_keys as u64 == stats.entry_count
                })
            },
            WAIT_TIMEOUT,
            Duration::from_millis(10),
        )
        .await;
        assert!(settled, "tombstone versions were never pruned");

        for i in 0..20 {
            let expected = if i < 15 { None } else { Some(Bytes::from("x")) };
            for node in cluster.alive() {
                assert_eq!(
                    cluster.grid(node).cache("sessions").get(format!("s-{}", i)).await.unwrap(),
                    expected
                );
            }
        }
    }
}
