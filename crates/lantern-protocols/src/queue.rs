//! Serialized Operation Queue - at most one mutation in flight.
//!
//! Components that own shared state (the notification server and client)
//! route every mutation through a [`SerializedOperationQueue`]. Operations
//! start strictly in submission order and never overlap: the next one
//! starts only after the previous one has settled, whether it succeeded,
//! failed, or panicked.
//!
//! ```text
//! enqueue(A) ─┐
//! enqueue(B) ─┼─→ [ A | B | C ] ─→ consumer task ─→ A ─→ B ─→ C
//! enqueue(C) ─┘
//! ```

use std::future::Future;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, trace};

/// Default number of operations that may wait behind the running one.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Errors produced by the queue itself rather than by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Too many operations are already waiting.
    #[error("operation queue is full")]
    Full,

    /// The consumer task is gone (runtime shutting down).
    #[error("operation queue is closed")]
    Closed,

    /// The operation panicked while running.
    #[error("queued operation panicked")]
    OperationPanicked,
}

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A FIFO queue that runs one async operation at a time.
///
/// Cloning yields another handle to the same queue.
#[derive(Debug, Clone)]
pub struct SerializedOperationQueue {
    tx: mpsc::Sender<Job>,
}

impl SerializedOperationQueue {
    /// Create a queue with [`DEFAULT_QUEUE_CAPACITY`].
    ///
    /// Spawns the consumer task, so it must be called from within a Tokio
    /// runtime.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a queue holding at most `capacity` waiting operations.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_queue(rx));
        Self { tx }
    }

    /// Submit an operation.
    ///
    /// The operation is queued immediately, before the returned future is
    /// first polled, so the order of `enqueue` calls is the order in which
    /// operations start. Dropping the returned future does not withdraw the
    /// operation.
    pub fn enqueue<T, E, F, Fut>(&self, op: F) -> impl Future<Output = Result<T, E>> + Send + 'static
    where
        T: Send + 'static,
        E: From<QueueError> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel::<Result<T, E>>();

        let job: Job = Box::new(move || {
            Box::pin(async move {
                // Run on its own task so a panic settles this operation
                // instead of killing the consumer.
                let result = match tokio::spawn(op()).await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => {
                        error!("Queued operation panicked");
                        Err(E::from(QueueError::OperationPanicked))
                    }
                    Err(_) => Err(E::from(QueueError::Closed)),
                };
                // The caller may have stopped listening.
                let _ = result_tx.send(result);
            })
        });

        let submitted = match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(QueueError::Full),
            Err(TrySendError::Closed(_)) => Err(QueueError::Closed),
        };

        async move {
            submitted?;
            match result_rx.await {
                Ok(result) => result,
                Err(_) => Err(E::from(QueueError::Closed)),
            }
        }
    }
}

async fn run_queue(mut rx: mpsc::Receiver<Job>) {
    while let Some(job) = rx.recv().await {
        job().await;
        trace!("Queued operation settled");
    }
    trace!("Operation queue closed");
}
