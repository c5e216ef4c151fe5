//! Quit Signal - one-shot cooperative cancellation.
//!
//! A [`QuitSignal`] tears down everything a round started. Work registers
//! timers ([`QuitSignal::timeout`]) and abort callbacks
//! ([`QuitSignal::on_raise`]) with it; raising the signal completes every
//! pending timer with [`TimerOutcome::Cancelled`] instead of letting it
//! expire, and runs every callback exactly once.
//!
//! Raising is permanent. Registering anything on a raised signal is a logic
//! error and is rejected with [`QuitError::AlreadyRaised`]. Callback order
//! is unspecified, so callbacks must not depend on each other.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::time::Sleep;
use tracing::{debug, error};

/// Registration on a signal that has already been raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QuitError {
    #[error("quit signal already raised")]
    AlreadyRaised,
}

/// How a [`Timeout`] completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    /// The full duration passed.
    Elapsed,
    /// The signal was raised first.
    Cancelled,
}

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Inner {
    raised: bool,
    next_timer: u64,
    timers: HashMap<u64, oneshot::Sender<()>>,
    callbacks: Vec<Callback>,
}

/// Shared one-shot cancellation token.
///
/// Clones share the same state.
#[derive(Clone)]
pub struct QuitSignal {
    inner: Arc<Mutex<Inner>>,
    raised_tx: Arc<watch::Sender<bool>>,
}

impl Default for QuitSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl QuitSignal {
    /// Create an unraised signal.
    pub fn new() -> Self {
        let (raised_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            raised_tx: Arc::new(raised_tx),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the signal has been raised.
    pub fn is_raised(&self) -> bool {
        self.lock().raised
    }

    /// Raise the signal.
    ///
    /// Returns `true` on the first call and `false` afterwards; later calls
    /// have no effect.
    pub fn raise(&self) -> bool {
        let (timers, callbacks) = {
            let mut inner = self.lock();
            if inner.raised {
                return false;
            }
            inner.raised = true;
            (
                std::mem::take(&mut inner.timers),
                std::mem::take(&mut inner.callbacks),
            )
        };

        debug!(
            timers = timers.len(),
            callbacks = callbacks.len(),
            "Raising quit signal"
        );

        for (_, cancel) in timers {
            let _ = cancel.send(());
        }
        for callback in callbacks {
            callback();
        }
        self.raised_tx.send_replace(true);
        true
    }

    /// Register a timer that completes after `duration`, or early with
    /// [`TimerOutcome::Cancelled`] when the signal is raised.
    pub fn timeout(&self, duration: Duration) -> Result<Timeout, QuitError> {
        let mut inner = self.lock();
        if inner.raised {
            error!(?duration, "Timeout registered on a raised quit signal");
            return Err(QuitError::AlreadyRaised);
        }
        let id = inner.next_timer;
        inner.next_timer += 1;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        inner.timers.insert(id, cancel_tx);

        Ok(Timeout {
            id,
            signal: Arc::downgrade(&self.inner),
            sleep: Box::pin(tokio::time::sleep(duration)),
            cancel: cancel_rx,
        })
    }

    /// Register a callback run exactly once when the signal is raised.
    pub fn on_raise<F>(&self, callback: F) -> Result<(), QuitError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.lock();
        if inner.raised {
            error!("Callback registered on a raised quit signal");
            return Err(QuitError::AlreadyRaised);
        }
        inner.callbacks.push(Box::new(callback));
        Ok(())
    }

    /// Wait until the signal is raised.
    pub async fn wait(&self) {
        let mut rx = self.raised_tx.subscribe();
        // The sender lives as long as `self`, so this only returns once raised.
        let _ = rx.wait_for(|raised| *raised).await;
    }
}

impl std::fmt::Debug for QuitSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("QuitSignal")
            .field("raised", &inner.raised)
            .field("timers", &inner.timers.len())
            .field("callbacks", &inner.callbacks.len())
            .finish()
    }
}

/// A timer registered with a [`QuitSignal`].
///
/// Dropping it deregisters the timer.
pub struct Timeout {
    id: u64,
    signal: Weak<Mutex<Inner>>,
    sleep: Pin<Box<Sleep>>,
    cancel: oneshot::Receiver<()>,
}

impl Future for Timeout {
    type Output = TimerOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if Pin::new(&mut self.cancel).poll(cx).is_ready() {
            return Poll::Ready(TimerOutcome::Cancelled);
        }
        if self.sleep.as_mut().poll(cx).is_ready() {
            return Poll::Ready(TimerOutcome::Elapsed);
        }
        Poll::Pending
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        if let Some(inner) = self.signal.upgrade() {
            inner
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .timers
                .remove(&self.id);
        }
    }
}

impl std::fmt::Debug for Timeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeout").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_pending, assert_ready_eq};

    #[tokio::test]
    async fn raise_is_idempotent() {
        let quit = QuitSignal::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let fired = Arc::clone(&fired);
            quit.on_raise(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        assert!(quit.raise());
        assert!(!quit.raise());
        assert!(quit.is_raised());
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn registering_after_raise_fails() {
        let quit = QuitSignal::new();
        quit.raise();

        assert_eq!(
            quit.timeout(Duration::from_secs(1)).unwrap_err(),
            QuitError::AlreadyRaised
        );
        assert_eq!(quit.on_raise(|| {}).unwrap_err(), QuitError::AlreadyRaised);
    }

    #[tokio::test]
    async fn raise_cancels_pending_timer() {
        let quit = QuitSignal::new();
        let mut timer = tokio_test::task::spawn(quit.timeout(Duration::from_secs(60)).unwrap());

        assert_pending!(timer.poll());
        quit.raise();
        assert_ready_eq!(timer.poll(), TimerOutcome::Cancelled);
    }

    #[tokio::test]
    async fn timer_elapses_without_raise() {
        let quit = QuitSignal::new();
        let outcome = quit.timeout(Duration::from_millis(10)).unwrap().await;
        assert_eq!(outcome, TimerOutcome::Elapsed);
    }

    #[tokio::test]
    async fn completed_timer_is_not_affected_by_raise() {
        let quit = QuitSignal::new();
        let outcome = quit.timeout(Duration::from_millis(5)).unwrap().await;
        assert_eq!(outcome, TimerOutcome::Elapsed);

        // The finished timer deregistered itself on drop.
        assert_eq!(quit.lock().timers.len(), 0);
        assert!(quit.raise());
    }

    #[tokio::test]
    async fn wait_returns_after_raise() {
        let quit = QuitSignal::new();
        let waiter = {
            let quit = quit.clone();
            tokio::spawn(async move { quit.wait().await })
        };

        tokio::task::yield_now().await;
        quit.raise();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();

        // Already raised: returns immediately.
        quit.wait().await;
    }
}
