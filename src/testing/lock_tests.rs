//! Distributed lock scenarios.

#[cfg(test)]
mod tests {
    use crate::error::{Error, LockError};
    use crate::functions::decode_value;
    use crate::lock::{LockConfig, LockOwnership, LockState, LOCKS_CACHE};
    use crate::testing::{init_tracing, TestCluster, WAIT_TIMEOUT};
    use crate::DataGrid;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::{sleep, timeout, Instant};

    fn per_instance() -> LockConfig {
        LockConfig::default().with_ownership(LockOwnership::Instance)
    }

    async fn lock_state(grid: &DataGrid, name: &str) -> LockState {
        match grid
            .cache(LOCKS_CACHE)
            .get_entry(name.to_string())
            .await
            .unwrap()
        {
            Some(entry) => decode_value(&entry).unwrap(),
            None => LockState::default(),
        }
    }

    /// Wait until at least `count` requests are queued on the lock.
    async fn wait_queued(grid: &DataGrid, name: &str, count: usize) {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        while lock_state(grid, name).await.waiters.len() < count {
            assert!(Instant::now() < deadline, "{} waiters never queued", count);
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_lock_unlock_across_nodes() {
        init_tracing();
        let cluster = TestCluster::start(3);
        let locks = cluster.grid(1).locks();
        assert!(locks.define_lock("orders", LockConfig::default()).await.unwrap());
        assert!(!locks.define_lock("orders", LockConfig::default()).await.unwrap());
        assert!(cluster.grid(3).locks().is_defined("orders").await.unwrap());

        let mine = locks.get_lock("orders").await.unwrap();
        let same_node = locks.get_lock("orders").await.unwrap();
        let other = cluster.grid(2).locks().get_lock("orders").await.unwrap();

        mine.lock().await.unwrap();
        assert!(mine.is_locked().await.unwrap());
        assert!(mine.is_locked_by_me().await.unwrap());
        // Node ownership: every handle on the member shares the lock.
        assert!(same_node.is_locked_by_me().await.unwrap());
        assert!(!other.is_locked_by_me().await.unwrap());

        let busy = other.try_lock(Duration::ZERO).await;
        assert!(matches!(busy, Err(Error::Lock(LockError::Timeout { .. }))));
        assert!(matches!(
            other.unlock().await,
            Err(Error::Lock(LockError::NotOwner(_)))
        ));

        mine.unlock().await.unwrap();
        assert!(!other.is_locked().await.unwrap());
        other.try_lock(Duration::ZERO).await.unwrap();
        assert!(other.is_locked_by_me().await.unwrap());
        assert_eq!(cluster.grid(2).metrics().lock_grants, 1);
    }

    #[tokio::test]
    async fn test_undefined_lock() {
        init_tracing();
        let cluster = TestCluster::start(2);
        let err = cluster.grid(1).locks().get_lock("nope").await.unwrap_err();
        assert!(matches!(err, Error::Lock(LockError::Undefined(name)) if name == "nope"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_exclusion() {
        init_tracing();
        let cluster = TestCluster::start(3);
        cluster
            .grid(1)
            .locks()
            .define_lock("counter", per_instance())
            .await
            .unwrap();
        cluster.grid(1).cache("data").put("n", "0").await.unwrap();

        let workers = (0..6u64).map(|i| {
            let grid = cluster.grid(i % 3 + 1);
            async move {
                let lock = grid.locks().get_lock("counter").await.unwrap();
                let data = grid.cache("data");
                for _ in 0..5 {
                    lock.lock().await.unwrap();
                    let current = data.get("n").await.unwrap().unwrap();
                    let n: u64 = std::str::from_utf8(&current).unwrap().parse().unwrap();
                    tokio::task::yield_now().await;
                    data.put("n", (n + 1).to_string()).await.unwrap();
                    lock.unlock().await.unwrap();
                }
            }
        });
        timeout(Duration::from_secs(30), futures::future::join_all(workers))
            .await
            .expect("workers finished");

        let total = cluster.grid(2).cache("data").get("n").await.unwrap();
        assert_eq!(total, Some(Bytes::from("30")));
        assert!(!lock_state(cluster.grid(1), "counter").await.is_locked());
    }

    #[tokio::test]
    async fn test_waiters_are_granted_in_arrival_order() {
        init_tracing();
        let cluster = TestCluster::start(3);
        cluster
            .grid(1)
            .locks()
            .define_lock("fifo", per_instance())
            .await
            .unwrap();
        let first = cluster.grid(1).locks().get_lock("fifo").await.unwrap();
        let second = cluster.grid(2).locks().get_lock("fifo").await.unwrap();
        let third = cluster.grid(3).locks().get_lock("fifo").await.unwrap();
        first.lock().await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let run_second = async {
            second.lock().await.unwrap();
            order.lock().push(2);
            second.unlock().await.unwrap();
        };
        let run_third = async {
            wait_queued(cluster.grid(1), "fifo", 1).await;
            third.lock().await.unwrap();
            order.lock().push(3);
            third.unlock().await.unwrap();
        };
        let release = async {
            wait_queued(cluster.grid(1), "fifo", 2).await;
            first.unlock().await.unwrap();
        };
        timeout(WAIT_TIMEOUT, async {
            tokio::join!(run_second, run_third, release);
        })
        .await
        .expect("lock hand-offs finished");

        assert_eq!(*order.lock(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_try_lock_times_out_and_withdraws() {
        init_tracing();
        let cluster = TestCluster::start(3);
        cluster
            .grid(1)
            .locks()
            .define_lock("slow", per_instance())
            .await
            .unwrap();
        let holder = cluster.grid(1).locks().get_lock("slow").await.unwrap();
        let impatient = cluster.grid(2).locks().get_lock("slow").await.unwrap();
        holder.lock().await.unwrap();

        let started = Instant::now();
        let err = impatient
            .try_lock(Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Lock(LockError::Timeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(cluster.grid(2).metrics().lock_timeouts, 1);
        assert_eq!(cluster.grid(2).locks().pending_waiters(), 0);

        let state = lock_state(cluster.grid(1), "slow").await;
        assert!(state.waiters.is_empty());

        // The withdrawn request is never handed the lock.
        holder.unlock().await.unwrap();
        assert!(!impatient.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_reentrancy() {
        init_tracing();
        let cluster = TestCluster::start(2);
        let locks = cluster.grid(1).locks();
        locks
            .define_lock("re", per_instance().with_reentrant(true))
            .await
            .unwrap();
        locks.define_lock("once", per_instance()).await.unwrap();

        let re = locks.get_lock("re").await.unwrap();
        re.lock().await.unwrap();
        re.lock().await.unwrap();
        re.unlock().await.unwrap();
        assert!(re.is_locked_by_me().await.unwrap());
        re.unlock().await.unwrap();
        assert!(!re.is_locked().await.unwrap());

        let once = locks.get_lock("once").await.unwrap();
        once.lock().await.unwrap();
        assert!(matches!(
            once.lock().await,
            Err(Error::Lock(LockError::NotReentrant(_)))
        ));
        once.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_lock_fails_waiters() {
        init_tracing();
        let cluster = TestCluster::start(3);
        let locks = cluster.grid(1).locks();
        locks.define_lock("doomed", per_instance()).await.unwrap();
        let holder = locks.get_lock("doomed").await.unwrap();
        let waiter = cluster.grid(3).locks().get_lock("doomed").await.unwrap();
        holder.lock().await.unwrap();

        let wait = async { waiter.lock().await };
        let remove = async {
            wait_queued(cluster.grid(1), "doomed", 1).await;
            cluster.grid(2).locks().remove_lock("doomed").await.unwrap()
        };
        let (waited, removed) = timeout(WAIT_TIMEOUT, async { tokio::join!(wait, remove) })
            .await
            .expect("waiter woke up");

        assert!(removed);
        assert!(matches!(waited, Err(Error::Lock(LockError::Deleted(_)))));
        assert!(!locks.is_defined("doomed").await.unwrap());
    }

    #[tokio::test]
    async fn test_departed_holder_releases_to_waiter() {
        init_tracing();
        let mut cluster = TestCluster::start(3);
        cluster
            .grid(1)
            .locks()
            .define_lock("lease", LockConfig::default())
            .await
            .unwrap();
        let holder = cluster.grid(3).locks().get_lock("lease").await.unwrap();
        let waiter = cluster.grid(1).locks().get_lock("lease").await.unwrap();
        holder.lock().await.unwrap();

        let acquired = tokio::spawn(async move {
            waiter.lock().await?;
            waiter.is_locked_by_me().await
        });
        wait_queued(cluster.grid(1), "lease", 1).await;

        cluster.crash_and_evict(3).await;

        let owned = timeout(WAIT_TIMEOUT, acquired)
            .await
            .expect("lock handed to the waiter")
            .unwrap()
            .unwrap();
        assert!(owned);
        let state = lock_state(cluster.grid(2), "lease").await;
        assert_eq!(state.holder.map(|w| w.owner.node), Some(1));
    }
}
