//! Bounded queue for server-sent notifications.
//!
//! The reader task is the only producer and must never block on a slow
//! consumer, so overflow discards the oldest element. The host drains the
//! queue from its own task, either non-blocking or with a timeout.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

/// Default queue capacity.
pub const MAX_QUEUED_MESSAGES: usize = 500;

/// Bounded FIFO of server notifications with an oldest-dropping policy.
#[derive(Debug)]
pub struct NotificationQueue {
    inner: Mutex<VecDeque<serde_json::Value>>,
    readable: Notify,
    capacity: usize,
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::with_capacity(MAX_QUEUED_MESSAGES)
    }
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            readable: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a notification; never blocks.
    ///
    /// At capacity, the oldest element is discarded to make room. Discard
    /// and insert happen in one critical section, so a concurrent drain can
    /// never observe more than `capacity` elements.
    pub fn try_push(&self, value: serde_json::Value) {
        {
            let mut queue = self.inner.lock().expect("notification queue poisoned");
            if queue.len() >= self.capacity {
                let dropped = queue.pop_front();
                if dropped.is_some() {
                    tracing::debug!("notification queue full, dropping oldest message");
                }
            }
            queue.push_back(value);
        }
        self.readable.notify_one();
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<serde_json::Value> {
        self.inner
            .lock()
            .expect("notification queue poisoned")
            .pop_front()
    }

    /// Pop, waiting up to `timeout` for an element to arrive.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.readable.notified();
            if let Some(value) = self.try_pop() {
                return Some(value);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("notification queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(s: &str) -> serde_json::Value {
        serde_json::Value::String(s.to_string())
    }

    #[test]
    fn test_fifo_order() {
        let queue = NotificationQueue::with_capacity(10);
        queue.try_push(msg("one"));
        queue.try_push(msg("two"));
        assert_eq!(queue.try_pop(), Some(msg("one")));
        assert_eq!(queue.try_pop(), Some(msg("two")));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = NotificationQueue::with_capacity(2);
        queue.try_push(msg("one"));
        queue.try_push(msg("two"));
        queue.try_push(msg("three"));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop(), Some(msg("two")));
        assert_eq!(queue.try_pop(), Some(msg("three")));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_retains_most_recent_up_to_capacity() {
        let queue = NotificationQueue::with_capacity(5);
        for i in 0..20 {
            queue.try_push(msg(&i.to_string()));
        }
        assert_eq!(queue.len(), 5);
        for i in 15..20 {
            assert_eq!(queue.try_pop(), Some(msg(&i.to_string())));
        }
    }

    #[tokio::test]
    async fn test_pop_timeout_returns_queued() {
        let queue = NotificationQueue::new();
        queue.try_push(msg("ready"));
        assert_eq!(
            queue.pop_timeout(Duration::from_millis(10)).await,
            Some(msg("ready"))
        );
    }

    #[tokio::test]
    async fn test_pop_timeout_expires_empty() {
        let queue = NotificationQueue::new();
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)).await, None);
    }

    #[tokio::test]
    async fn test_pop_timeout_wakes_on_push() {
        let queue = std::sync::Arc::new(NotificationQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop_timeout(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        queue.try_push(msg("wake"));
        assert_eq!(consumer.await.unwrap(), Some(msg("wake")));
    }
}
