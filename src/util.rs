use std::future::Future;
use std::time::Duration;

/// Poll `check` at a fixed interval until it returns `true` or `max_wait`
/// elapses. Returns whether the condition was met.
///
/// The first check runs immediately, so a zero `max_wait` still observes the
/// condition once. Both the PID-record wait and the SSH readiness wait go
/// through here; they differ only in interval and deadline.
pub(crate) async fn poll_until<F, Fut>(interval: Duration, max_wait: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}
