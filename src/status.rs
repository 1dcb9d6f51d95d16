//! Bounded queue carrying [`StatusMessage`]s from the engine tasks to the host.

use ftlcore::FtlError;
use ftlcore::status::{StatusEvent, StatusMessage};
use log::{Level, debug, log};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep, timeout_at};

const DRAIN_POLL: Duration = Duration::from_millis(20);
const DRAIN_ATTEMPTS: u32 = 5;

#[derive(Debug, Default)]
struct Inner {
    messages: VecDeque<StatusMessage>,
    closed: bool,
}

#[derive(Debug)]
pub struct StatusQueue {
    inner: Mutex<Inner>,
    available: Notify,
    waiters: AtomicUsize,
    capacity: usize,
}

impl StatusQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: Notify::new(),
            waiters: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a message. A full queue loses its oldest entry; the new message
    /// is still stored and `QueueFull` is reported.
    pub fn enqueue(&self, message: StatusMessage) -> Result<(), FtlError> {
        let overflowed = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(FtlError::NotInitialized);
            }
            let overflowed = inner.messages.len() >= self.capacity;
            if overflowed {
                inner.messages.pop_front();
            }
            inner.messages.push_back(message);
            overflowed
        };
        self.available.notify_one();

        if overflowed {
            Err(FtlError::QueueFull)
        } else {
            Ok(())
        }
    }

    /// Emits `message` through the `log` facade and hands it to the host.
    pub fn log(&self, target: &str, level: Level, message: impl Into<String>) {
        let message = message.into();
        log!(target: target, level, "{message}");
        let _ = self.enqueue(StatusMessage::log(level, message));
    }

    pub fn event(&self, event: StatusEvent) {
        if let Err(e) = self.enqueue(StatusMessage::Event(event)) {
            debug!(target: "Ingest/Status", "Event {:?} queued with {e}", event.kind);
        }
    }

    /// Waits up to `wait` for the next message. `StatusTimeout` means nothing
    /// arrived in time; `QueueEmpty` means the queue was shut down.
    pub async fn dequeue(&self, wait: Duration) -> Result<StatusMessage, FtlError> {
        let deadline = Instant::now() + wait;

        self.waiters.fetch_add(1, Ordering::SeqCst);
        let _parked = scopeguard::guard(&self.waiters, |waiters| {
            waiters.fetch_sub(1, Ordering::SeqCst);
        });

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if let Some(message) = inner.messages.pop_front() {
                    return Ok(message);
                }
                if inner.closed {
                    return Err(FtlError::QueueEmpty);
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Err(FtlError::StatusTimeout);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_waiters(&self) -> bool {
        self.waiters.load(Ordering::SeqCst) > 0
    }

    /// Shuts the queue down. A host parked in [`dequeue`](Self::dequeue) is
    /// handed a `Destroyed` event first and given a short window to take it.
    pub async fn close(&self) {
        if self.has_waiters() {
            self.event(StatusEvent::destroyed());
            for _ in 0..DRAIN_ATTEMPTS {
                if self.is_empty() {
                    break;
                }
                sleep(DRAIN_POLL).await;
            }
        }

        {
            let mut inner = self.lock();
            inner.closed = true;
            inner.messages.clear();
        }
        self.available.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftlcore::status::EventKind;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let queue = StatusQueue::new(3);
        for i in 0..3 {
            queue.enqueue(StatusMessage::log(Level::Info, format!("m{i}"))).unwrap();
        }
        assert_eq!(
            queue.enqueue(StatusMessage::log(Level::Info, "m3")),
            Err(FtlError::QueueFull)
        );
        assert_eq!(queue.len(), 3);

        let first = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first, StatusMessage::log(Level::Info, "m1"));
    }

    #[tokio::test]
    async fn test_dequeue_timeout() {
        let queue = StatusQueue::new(10);
        assert_eq!(
            queue.dequeue(Duration::from_millis(20)).await,
            Err(FtlError::StatusTimeout)
        );
        assert!(!queue.has_waiters());
    }

    #[tokio::test]
    async fn test_waiter_woken_by_enqueue() {
        let queue = Arc::new(StatusQueue::new(10));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };

        sleep(Duration::from_millis(20)).await;
        queue.event(StatusEvent::connected());

        let message = waiter.await.unwrap().unwrap();
        assert_eq!(message.as_event().map(|e| e.kind), Some(EventKind::Connected));
    }

    #[tokio::test]
    async fn test_close_hands_destroyed_to_waiter() {
        let queue = Arc::new(StatusQueue::new(10));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        while !queue.has_waiters() {
            tokio::task::yield_now().await;
        }

        queue.close().await;

        let message = waiter.await.unwrap().unwrap();
        assert_eq!(message.as_event().map(|e| e.kind), Some(EventKind::Destroyed));
        assert_eq!(
            queue.dequeue(Duration::from_millis(10)).await,
            Err(FtlError::QueueEmpty)
        );
        assert_eq!(
            queue.enqueue(StatusMessage::log(Level::Info, "late")),
            Err(FtlError::NotInitialized)
        );
    }
}
