//! Unbounded FIFO queue that is primarily a `VecDeque` with `Notify` added
//! on top of it.
//!
//! Both directions between a controller and its worker are one of these.
//! Producers never block: `send` pushes and wakes whoever is waiting. The
//! consumer side can poll (`try_recv`), wait for the next value (`recv`) or
//! wait for a specific value (`take_where`). The latter scans and requeues
//! the whole buffer while holding the queue lock so concurrent scans never
//! lose or duplicate entries.

use error::{RecvError, SendError, TryRecvError};
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};

#[derive(Debug)]
pub struct Channel<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

#[derive(Debug)]
struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Channel<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    // NOTE: None of the critical sections below can panic half way through a
    // queue mutation, so a poisoned lock still guards a consistent queue.
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a value to the back of the queue. Only fails once the channel
    /// has been closed, handing the value back.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(SendError(value));
            }
            inner.queue.push_back(value);
        }

        // Notify all the waiters that a new value is available
        self.notify.notify_waiters();

        Ok(())
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut inner = self.lock();
        match inner.queue.pop_front() {
            Some(value) => Ok(value),
            None if inner.closed => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Wait for the next value in FIFO order, forever when `timeout` is
    /// `None`. Values still buffered are handed out after `close`.
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<T, RecvError> {
        self.wait_until(timeout, |queue| queue.pop_front()).await
    }

    /// Remove the first value matching `predicate` and leave every other
    /// value in place, in its original order.
    pub fn try_take_where<P>(&self, mut predicate: P) -> Option<T>
    where
        P: FnMut(&T) -> bool,
    {
        scan_and_requeue(&mut self.lock().queue, &mut predicate)
    }

    /// Waiting version of [`Channel::try_take_where`]. Every wakeup rescans
    /// the buffer until a match appears, the timeout elapses or the channel
    /// is closed with no match left.
    pub async fn take_where<P>(
        &self,
        mut predicate: P,
        timeout: Option<Duration>,
    ) -> Result<T, RecvError>
    where
        P: FnMut(&T) -> bool,
    {
        self.wait_until(timeout, |queue| scan_and_requeue(queue, &mut predicate))
            .await
    }

    /// Refuse any further `send`. Waiters are woken so they can drain what
    /// is left and then observe [`RecvError::Closed`].
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    async fn wait_until<F, R>(&self, timeout: Option<Duration>, mut attempt: F) -> Result<R, RecvError>
    where
        F: FnMut(&mut VecDeque<T>) -> Option<R>,
    {
        let deadline = timeout.map(|limit| (limit, Instant::now().checked_add(limit)));

        let future = self.notify.notified();
        tokio::pin!(future);

        loop {
            // Make sure that no wakeup is lost between checking the queue
            // and parking on the notification.
            future.as_mut().enable();

            {
                let mut inner = self.lock();
                if let Some(value) = attempt(&mut inner.queue) {
                    return Ok(value);
                }
                if inner.closed {
                    return Err(RecvError::Closed);
                }
            }

            match deadline {
                Some((limit, Some(deadline))) => {
                    if tokio::time::timeout_at(deadline, future.as_mut()).await.is_err() {
                        return Err(RecvError::Timeout(limit));
                    }
                }
                // No deadline, or one past what `Instant` can represent.
                Some((_, None)) | None => future.as_mut().await,
            }

            future.set(self.notify.notified());
        }
    }
}

// Drain the whole buffer into a holding list, keep the first match and push
// everything else back. Callers hold the queue lock for the duration.
fn scan_and_requeue<T, P>(queue: &mut VecDeque<T>, predicate: &mut P) -> Option<T>
where
    P: FnMut(&T) -> bool,
{
    let held: Vec<T> = queue.drain(..).collect();
    let mut found = None;

    for value in held {
        if found.is_none() && predicate(&value) {
            found = Some(value);
        } else {
            queue.push_back(value);
        }
    }

    found
}

pub mod error {
    use std::{fmt, time::Duration};

    /// Returned by `send` once the channel is closed, carrying the rejected value.
    #[derive(PartialEq, Eq)]
    pub struct SendError<T>(pub T);

    impl<T> fmt::Debug for SendError<T> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("SendError").finish_non_exhaustive()
        }
    }

    impl<T> fmt::Display for SendError<T> {
        fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(fmt, "sending on a closed channel")
        }
    }

    impl<T> std::error::Error for SendError<T> {}

    #[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
    pub enum TryRecvError {
        #[error("channel is empty")]
        Empty,
        #[error("channel is closed")]
        Closed,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
    pub enum RecvError {
        #[error("no value received within {0:?}")]
        Timeout(Duration),
        #[error("channel is closed")]
        Closed,
    }
}
