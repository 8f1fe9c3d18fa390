use crate::error::SchedulerError;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Result of work handed to the scheduler or a store
///
/// Resolves to `Err(TaskDropped)` when the producing side went away, for
/// instance because the scheduler was cancelled before the task ran.
#[derive(Debug)]
pub struct Completion<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Completion<T> {
    pub fn channel() -> (oneshot::Sender<T>, Completion<T>) {
        let (tx, rx) = oneshot::channel();
        (tx, Completion { rx })
    }

    /// Already-resolved completion
    pub fn ready(value: T) -> Self {
        let (tx, completion) = Self::channel();
        let _ = tx.send(value);
        completion
    }

    /// Take the value if it is available without waiting
    pub fn try_take(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T, SchedulerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| SchedulerError::TaskDropped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready() {
        assert_eq!(Completion::ready(3).await, Ok(3));
    }

    #[tokio::test]
    async fn test_dropped_sender() {
        let (tx, completion) = Completion::<u8>::channel();
        drop(tx);
        assert_eq!(completion.await, Err(SchedulerError::TaskDropped));
    }

    #[test]
    fn test_try_take() {
        let (tx, mut completion) = Completion::channel();
        assert_eq!(completion.try_take(), None);
        tx.send("done").unwrap();
        assert_eq!(completion.try_take(), Some("done"));
    }
}
