//! Bounded inter-stage queue with a blocking or leaky overflow policy
//! (spec §4.2 "Queue").

use channellib::{self, Receiver, Sender};
use std::fmt;

/// What happens when a push would exceed the queue's capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueuePolicy {
    /// `push` blocks the caller until a slot is free.
    Blocking,
    /// `push` drops the oldest queued item to make room, so the producer
    /// never stalls (spec §4.2: "leaky queues bound memory at the cost of
    /// silently dropping old frames under sustained overload").
    Leaky,
}

#[derive(Debug)]
pub enum PushError<T> {
    Disconnected(T),
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue disconnected")
    }
}

impl<T: fmt::Debug> std::error::Error for PushError<T> {}

/// A capacity-bounded queue between two pipeline stages.
pub struct Queue<T> {
    name: String,
    policy: QueuePolicy,
    capacity: usize,
    tx: Sender<T>,
    rx: Receiver<T>,
    dropped: std::sync::atomic::AtomicU64,
}

impl<T> Queue<T> {
    pub fn new(name: impl Into<String>, capacity: usize, policy: QueuePolicy) -> Self {
        let (tx, rx) = channellib::bounded(capacity.max(1));
        Queue {
            name: name.into(),
            policy,
            capacity,
            tx,
            rx,
            dropped: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Total items dropped due to the leaky policy over this queue's life.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Push one item according to this queue's overflow policy.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        match self.policy {
            QueuePolicy::Blocking => self.tx.send(item).map_err(|e| PushError::Disconnected(e.0)),
            QueuePolicy::Leaky => {
                let mut item = item;
                loop {
                    match self.tx.try_send(item) {
                        Ok(()) => return Ok(()),
                        Err(channellib::TrySendError::Full(back)) => {
                            // Drop the oldest queued item to make room, then retry.
                            if self.rx.try_recv().is_ok() {
                                self.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            }
                            item = back;
                        }
                        Err(channellib::TrySendError::Disconnected(back)) => {
                            return Err(PushError::Disconnected(back))
                        }
                    }
                }
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    pub fn pop_timeout(&self, timeout: std::time::Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn sender(&self) -> Sender<T> {
        self.tx.clone()
    }

    pub fn receiver(&self) -> Receiver<T> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn blocking_queue_preserves_every_item() {
        let q: Queue<u32> = Queue::new("q", 2, QueuePolicy::Blocking);
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.dropped_count(), 0);
    }

    #[test]
    fn leaky_queue_drops_oldest_under_overflow() {
        let q: Queue<u32> = Queue::new("q", 2, QueuePolicy::Leaky);
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.push(3).unwrap(); // should drop `1`
        assert_eq!(q.dropped_count(), 1);
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn pop_timeout_returns_none_when_empty() {
        let q: Queue<u32> = Queue::new("q", 2, QueuePolicy::Blocking);
        assert_eq!(q.pop_timeout(Duration::from_millis(10)), None);
    }
}
