use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Install a log subscriber once; later calls are no-ops.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Wait for a condition with timeout
pub(crate) async fn wait_for<F>(condition: F, timeout: Duration, check_interval: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(check_interval).await;
    }
    condition()
}

/// Repeat an async action until its result satisfies `predicate`.
pub(crate) async fn wait_for_result<F, Fut, T, P>(
    mut action: F,
    predicate: P,
    timeout: Duration,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(20);

    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        sleep(interval).await;
    }
    None
}
