//! A single-shot future with an explicit readiness probe.
//!
//! External collaborators (recorder, spawners, execution runs) hand results
//! back through a [`Promise`]: produced exactly once, observable many times.
//! Unlike a bare `JoinHandle`, a promise can be polled for readiness without
//! consuming it, which is what the validation loop's non-blocking scan needs.

use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Error surfaced by a [`Promise`].
#[derive(Debug, Clone, Error)]
pub enum PromiseError {
    /// The waiter's cancellation token fired before a result arrived.
    #[error("promise cancelled")]
    Cancelled,
    /// The producer was dropped without producing.
    #[error("promise abandoned by its producer")]
    Abandoned,
    /// `current` was called before the promise resolved.
    #[error("promise not ready")]
    NotReady,
    /// The producing task failed.
    #[error("{0}")]
    Failed(Arc<str>),
}

impl PromiseError {
    /// Wraps any displayable error as a promise failure.
    pub fn failed(err: impl fmt::Display) -> Self {
        Self::Failed(err.to_string().into())
    }
}

struct Shared<T> {
    cell: Mutex<Option<Result<T, PromiseError>>>,
    notify: Notify,
}

/// The write half of a promise. Consumed by producing a value or an error;
/// dropping it unresolved resolves every waiter with
/// [`PromiseError::Abandoned`].
pub struct PromiseProducer<T> {
    shared: Arc<Shared<T>>,
    produced: bool,
}

impl<T> fmt::Debug for PromiseProducer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseProducer").field("produced", &self.produced).finish()
    }
}

impl<T> PromiseProducer<T> {
    fn fill(&mut self, result: Result<T, PromiseError>) {
        {
            let mut cell = self.shared.cell.lock().expect("promise cell poisoned");
            if cell.is_none() {
                *cell = Some(result);
            }
        }
        self.produced = true;
        self.shared.notify.notify_waiters();
    }

    /// Resolves the promise with a value.
    pub fn produce(mut self, value: T) {
        self.fill(Ok(value));
    }

    /// Resolves the promise with an error.
    pub fn produce_err(mut self, err: impl fmt::Display) {
        self.fill(Err(PromiseError::failed(err)));
    }

    /// Resolves the promise as cancelled.
    pub fn cancel(mut self) {
        self.fill(Err(PromiseError::Cancelled));
    }
}

impl<T> Drop for PromiseProducer<T> {
    fn drop(&mut self) {
        if !self.produced {
            self.fill(Err(PromiseError::Abandoned));
        }
    }
}

/// The read half: a single-shot, multi-observer future.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").field("ready", &self.ready()).finish()
    }
}

impl<T> Promise<T> {
    /// Creates an unresolved promise and its producer.
    pub fn channel() -> (PromiseProducer<T>, Self) {
        let shared =
            Arc::new(Shared { cell: Mutex::new(None), notify: Notify::new() });
        (PromiseProducer { shared: Arc::clone(&shared), produced: false }, Self { shared })
    }

    /// An already-resolved promise.
    pub fn resolved(value: T) -> Self {
        let (producer, promise) = Self::channel();
        producer.produce(value);
        promise
    }

    /// An already-failed promise.
    pub fn failed(err: impl fmt::Display) -> Self {
        let (producer, promise) = Self::channel();
        producer.produce_err(err);
        promise
    }

    /// True once a result (or error) is available.
    pub fn ready(&self) -> bool {
        self.shared.cell.lock().expect("promise cell poisoned").is_some()
    }
}

impl<T: Clone> Promise<T> {
    /// Returns the result if available, [`PromiseError::NotReady`] otherwise.
    pub fn current(&self) -> Result<T, PromiseError> {
        self.shared
            .cell
            .lock()
            .expect("promise cell poisoned")
            .clone()
            .unwrap_or(Err(PromiseError::NotReady))
    }

    /// Waits for the result, aborting early if `cancel` fires.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<T, PromiseError> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(result) = self.shared.cell.lock().expect("promise cell poisoned").clone() {
                return result;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(PromiseError::Cancelled),
                _ = notified => {}
            }
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Spawns `fut` onto `tracker` and returns a promise for its output.
    ///
    /// If `cancel` fires first, waiters observe [`PromiseError::Cancelled`]
    /// and the future is dropped at its next suspension point.
    pub fn spawn<F, E>(tracker: &TaskTracker, cancel: CancellationToken, fut: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        E: fmt::Display,
    {
        let (producer, promise) = Self::channel();
        tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => producer.cancel(),
                result = fut => match result {
                    Ok(value) => producer.produce(value),
                    Err(err) => producer.produce_err(err),
                },
            }
        });
        promise
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn produce_then_observe_many_times() {
        let (producer, promise) = Promise::channel();
        assert!(!promise.ready());
        assert!(matches!(promise.current(), Err(PromiseError::NotReady)));

        producer.produce(7u64);
        assert!(promise.ready());
        assert_eq!(promise.current().unwrap(), 7);
        assert_eq!(promise.wait(&CancellationToken::new()).await.unwrap(), 7);
        // A second observation sees the same value.
        assert_eq!(promise.current().unwrap(), 7);
    }

    #[tokio::test]
    async fn wait_is_cancellable() {
        let (_producer, promise) = Promise::<u64>::channel();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(promise.wait(&cancel).await, Err(PromiseError::Cancelled)));
    }

    #[tokio::test]
    async fn dropped_producer_abandons_waiters() {
        let (producer, promise) = Promise::<u64>::channel();
        let waiter = {
            let promise = promise.clone();
            tokio::spawn(async move { promise.wait(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(producer);
        assert!(matches!(waiter.await.unwrap(), Err(PromiseError::Abandoned)));
    }

    #[tokio::test]
    async fn spawned_future_resolves_promise() {
        let tracker = TaskTracker::new();
        let promise =
            Promise::spawn(&tracker, CancellationToken::new(), async { Ok::<_, String>(3u32) });
        assert_eq!(promise.wait(&CancellationToken::new()).await.unwrap(), 3);

        let failing = Promise::<u32>::spawn(&tracker, CancellationToken::new(), async {
            Err::<u32, _>("boom".to_string())
        });
        match failing.wait(&CancellationToken::new()).await {
            Err(PromiseError::Failed(msg)) => assert_eq!(&*msg, "boom"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
