use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Spawn a Tokio task with a stable name when supported, and trace span otherwise.
pub fn spawn_named_task<F, S>(name: S, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    S: Into<String>,
{
    let name_owned = name.into();
    #[cfg(tokio_unstable)]
    {
        tokio::task::Builder::new().name(&name_owned).spawn(future)
    }
    #[cfg(not(tokio_unstable))]
    {
        use tracing::Instrument;
        let span = tracing::info_span!("task", task_name = %name_owned);
        tokio::spawn(future.instrument(span))
    }
}

/// How a bounded wait ended.
#[derive(Debug, PartialEq, Eq)]
pub enum Bounded<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

/// Awaits `future` unless `cancel` fires or `timeout` elapses first.
/// Cancellation wins ties. `None` waits without a deadline.
pub async fn await_bounded<F>(
    future: F,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Bounded<F::Output>
where
    F: Future,
{
    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Bounded::Cancelled,
        _ = deadline => Bounded::TimedOut,
        output = future => Bounded::Ready(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_futures_complete() {
        let cancel = CancellationToken::new();
        let outcome = await_bounded(async { 7 }, Some(Duration::from_secs(1)), &cancel).await;
        assert_eq!(outcome, Bounded::Ready(7));
    }

    #[tokio::test]
    async fn stalled_futures_time_out() {
        let cancel = CancellationToken::new();
        let outcome = await_bounded(
            std::future::pending::<()>(),
            Some(Duration::from_millis(20)),
            &cancel,
        )
        .await;
        assert_eq!(outcome, Bounded::TimedOut);
    }

    #[tokio::test]
    async fn cancellation_interrupts_unbounded_waits() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        spawn_named_task("cancel-trigger", async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let outcome = await_bounded(std::future::pending::<()>(), None, &cancel).await;
        assert_eq!(outcome, Bounded::Cancelled);
    }
}
