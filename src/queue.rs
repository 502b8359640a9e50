//! Bounded, flushable FIFO queues shared between workers.
//!
//! The text-chunk and PCM queues both need an operation plain channels do
//! not offer: an atomic drain from a third party (the global stop
//! primitive empties them while producers and consumers keep running).
//! A `VecDeque` under a mutex plus two wakeup lists gives exactly that.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

pub struct FlushQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> FlushQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Append an item, waiting while the queue is at capacity.
    pub async fn push(&self, item: T) {
        let mut item = Some(item);
        loop {
            let slot_freed = self.not_full.notified();
            {
                let mut items = self.items.lock().unwrap();
                if items.len() < self.capacity {
                    items.push_back(item.take().unwrap());
                    self.not_empty.notify_one();
                    return;
                }
            }
            slot_freed.await;
        }
    }

    /// Remove the oldest item, waiting while the queue is empty.
    pub async fn pop(&self) -> T {
        loop {
            let item_added = self.not_empty.notified();
            {
                let mut items = self.items.lock().unwrap();
                if let Some(item) = items.pop_front() {
                    self.not_full.notify_one();
                    return item;
                }
            }
            item_added.await;
        }
    }

    /// Atomically discard everything queued. Returns the number of items
    /// dropped. Blocked producers are all released.
    pub fn flush(&self) -> usize {
        let mut items = self.items.lock().unwrap();
        let dropped = items.len();
        items.clear();
        self.not_full.notify_waiters();
        dropped
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let q = FlushQueue::new(8);
        q.push("a").await;
        q.push("b").await;
        q.push("c").await;
        assert_eq!(q.pop().await, "a");
        assert_eq!(q.pop().await, "b");
        assert_eq!(q.pop().await, "c");
    }

    #[tokio::test]
    async fn test_flush_empties_queue() {
        let q = FlushQueue::new(8);
        q.push(1).await;
        q.push(2).await;
        assert_eq!(q.flush(), 2);
        assert!(q.is_empty());
        assert_eq!(q.flush(), 0);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let q = Arc::new(FlushQueue::new(4));
        let q2 = q.clone();
        let popper = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(42).await;
        assert_eq!(popper.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_push_blocks_at_capacity_until_pop() {
        let q = Arc::new(FlushQueue::new(1));
        q.push(1).await;

        let q2 = q.clone();
        let producer = tokio::spawn(async move { q2.push(2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(q.pop().await, 1);
        producer.await.unwrap();
        assert_eq!(q.pop().await, 2);
    }

    #[tokio::test]
    async fn test_flush_releases_blocked_producer() {
        let q = Arc::new(FlushQueue::new(1));
        q.push(1).await;

        let q2 = q.clone();
        let producer = tokio::spawn(async move { q2.push(2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        q.flush();
        producer.await.unwrap();
        assert_eq!(q.pop().await, 2);
    }

    #[tokio::test]
    async fn test_sentinel_consumed_after_preceding_chunks() {
        let q = Arc::new(FlushQueue::new(16));
        for i in 0..5 {
            q.push(format!("chunk-{i}")).await;
        }
        q.push("[[END]]".to_string()).await;

        let mut seen = Vec::new();
        loop {
            let item = q.pop().await;
            let done = item == "[[END]]";
            seen.push(item);
            if done {
                break;
            }
        }
        assert_eq!(seen.len(), 6);
        assert_eq!(seen.last().map(String::as_str), Some("[[END]]"));
        assert!(seen[..5].iter().all(|c| c.starts_with("chunk-")));
    }
}
