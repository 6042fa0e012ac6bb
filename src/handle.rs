use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::ready;
use tokio::sync::oneshot;

use crate::error::TaskError;

pub(crate) type Outcome<T, E> = Result<T, TaskError<E>>;

/// Outcome of a task submitted to a [`Limiter`](crate::Limiter).
///
/// Resolves exactly once: with the task's value, its error, a caught panic,
/// or `Cancelled` if the task was dropped from the queue before it started.
/// Dropping the handle does not cancel the task.
pub struct TaskHandle<T, E> {
    rx: oneshot::Receiver<Outcome<T, E>>,
}

impl<T, E> TaskHandle<T, E> {
    pub(crate) fn new(rx: oneshot::Receiver<Outcome<T, E>>) -> Self {
        Self { rx }
    }

    /// Take the outcome if the task already settled, without waiting.
    ///
    /// Returns `None` while the task is queued or running. Once this has
    /// returned `Some`, the handle must not be polled again.
    pub fn try_outcome(&mut self) -> Option<Outcome<T, E>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(TaskError::Cancelled)),
        }
    }
}

impl<T, E> Future for TaskHandle<T, E> {
    type Output = Outcome<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // The sender only goes away without a value when the queued run
        // closure was dropped.
        match ready!(Pin::new(&mut self.rx).poll(cx)) {
            Ok(outcome) => Poll::Ready(outcome),
            Err(_) => Poll::Ready(Err(TaskError::Cancelled)),
        }
    }
}

impl<T, E> fmt::Debug for TaskHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_sender_reads_as_cancelled() {
        let (tx, rx) = oneshot::channel::<Outcome<u32, String>>();
        drop(tx);
        let outcome = TaskHandle::new(rx).await;
        assert!(matches!(outcome, Err(TaskError::Cancelled)));
    }

    #[tokio::test]
    async fn delivered_value_passes_through() {
        let (tx, rx) = oneshot::channel::<Outcome<u32, String>>();
        tx.send(Ok(42)).unwrap();
        assert_eq!(TaskHandle::new(rx).await.unwrap(), 42);
    }

    #[test]
    fn try_outcome_is_none_until_sent() {
        let (tx, rx) = oneshot::channel::<Outcome<u32, String>>();
        let mut handle = TaskHandle::new(rx);
        assert!(handle.try_outcome().is_none());
        tx.send(Err(TaskError::Failed("nope".into()))).unwrap();
        match handle.try_outcome() {
            Some(Err(TaskError::Failed(msg))) => assert_eq!(msg, "nope"),
            other => panic!("expected Failed outcome, got {other:?}"),
        }
    }
}
