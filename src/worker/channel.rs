//! Bounded worker → consumer channel where the newest message wins.
//!
//! Sending never blocks: when the queue is full the oldest message is evicted
//! to make room. A consumer that falls behind therefore sees the most recent
//! state rather than a backlog.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;
use tokio::sync::Notify;

use super::messages::WorkerMessage;

struct Shared {
    queue: ArrayQueue<WorkerMessage>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Create a channel holding at most `capacity` undelivered messages.
pub fn delivery_channel(capacity: usize) -> (DeliveryChannel, MessageReceiver) {
    let shared = Arc::new(Shared {
        queue: ArrayQueue::new(capacity.max(1)),
        notify: Notify::new(),
        dropped: AtomicU64::new(0),
        closed: AtomicBool::new(false),
    });
    (
        DeliveryChannel {
            shared: Arc::clone(&shared),
        },
        MessageReceiver { shared },
    )
}

pub struct DeliveryChannel {
    shared: Arc<Shared>,
}

impl DeliveryChannel {
    /// Enqueue `msg`. Returns the evicted message when the queue was full.
    /// Sends after `close()` are discarded.
    pub fn send(&self, msg: WorkerMessage) -> Option<WorkerMessage> {
        if self.shared.closed.load(Ordering::Acquire) {
            return None;
        }
        let evicted = self.shared.queue.force_push(msg);
        if evicted.is_some() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.notify.notify_waiters();
        evicted
    }

    /// Stop accepting messages. Already queued messages stay receivable.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.queue.capacity()
    }

    /// Messages evicted because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer side. Clones share the same queue.
#[derive(Clone)]
pub struct MessageReceiver {
    shared: Arc<Shared>,
}

impl MessageReceiver {
    /// Wait for the next message. `None` once the channel is closed and drained.
    pub async fn recv(&self) -> Option<WorkerMessage> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a send between the check and the
            // await still wakes us.
            notified.as_mut().enable();

            if let Some(msg) = self.shared.queue.pop() {
                return Some(msg);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub fn try_recv(&self) -> Option<WorkerMessage> {
        self.shared.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn phase2(hash: &str) -> WorkerMessage {
        WorkerMessage::Phase2Ready {
            data_hash: hash.to_string(),
        }
    }

    fn hash_of(msg: WorkerMessage) -> String {
        match msg {
            WorkerMessage::Phase2Ready { data_hash } => data_hash,
            other => panic!("unexpected message {}", other.kind()),
        }
    }

    #[test]
    fn test_full_channel_evicts_oldest() {
        let (tx, rx) = delivery_channel(2);
        assert!(tx.send(phase2("a")).is_none());
        assert!(tx.send(phase2("b")).is_none());

        let evicted = tx.send(phase2("c")).map(hash_of);
        assert_eq!(evicted.as_deref(), Some("a"));
        assert_eq!(tx.dropped(), 1);
        assert_eq!(rx.len(), 2);

        assert_eq!(rx.try_recv().map(hash_of).as_deref(), Some("b"));
        assert_eq!(rx.try_recv().map(hash_of).as_deref(), Some("c"));
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let (tx, _rx) = delivery_channel(0);
        assert_eq!(tx.capacity(), 1);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_send() {
        let (tx, rx) = delivery_channel(4);
        let waiter = tokio::spawn(async move { rx.recv().await.map(hash_of) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(phase2("x"));
        let got = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let (tx, rx) = delivery_channel(4);
        tx.send(phase2("last"));
        tx.close();
        assert!(tx.send(phase2("ignored")).is_none());

        assert_eq!(rx.recv().await.map(hash_of).as_deref(), Some("last"));
        assert!(rx.recv().await.is_none());
        assert!(rx.is_closed());
    }
}
