//! Bounded FIFO with configurable admission policy
//!
//! One [`BoundedQueue`] sits behind every source lane (and in front of every egress
//! endpoint). A full queue either suspends the producer ([`AdmissionPolicy::Block`])
//! or evicts its oldest entry ([`AdmissionPolicy::DropOldest`]). Consumers suspend
//! on an empty queue until an item arrives or the queue shuts down.
//!
//! Sequencing is part of admission: an item enqueued with a sequence key that is not
//! greater than the last admitted key is refused as a duplicate under the same lock
//! that appends it, so concurrent producers cannot both admit one frame.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::types::AdmissionPolicy;
use crate::{Result, TransportError};

/// Outcome of a successful enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Appended without displacing anything.
    Queued,
    /// Appended after evicting the oldest entry.
    DisplacedOldest,
}

/// Live counters of one queue.
#[derive(Debug, Default)]
pub struct QueueCounters {
    admitted: AtomicU64,
    dropped: AtomicU64,
    duplicates: AtomicU64,
    discarded: AtomicU64,
    blocked: AtomicU64,
    depth: AtomicUsize,
}

impl QueueCounters {
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Entries evicted by drop-oldest admission.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Entries thrown away because the queue closed before they were consumed.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Times a producer found the blocking queue full, whether it waited or gave up.
    pub fn blocked(&self) -> u64 {
        self.blocked.load(Ordering::Relaxed)
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    last_key: Option<i64>,
    accepting: bool,
    closed: bool,
}

/// Bounded FIFO shared between producers and consumers.
pub struct BoundedQueue<T> {
    name: String,
    capacity: usize,
    policy: AdmissionPolicy,
    state: Mutex<QueueState<T>>,
    not_empty: Notify,
    not_full: Notify,
    dequeued: Option<Arc<Notify>>,
    counters: QueueCounters,
}

enum TryAdmit<T> {
    Done(Admission),
    Full(T),
}

impl<T> BoundedQueue<T> {
    /// Create a queue. A zero capacity is raised to one.
    pub fn new(name: impl Into<String>, capacity: usize, policy: AdmissionPolicy) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            policy,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.clamp(1, 1024)),
                last_key: None,
                accepting: true,
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            dequeued: None,
            counters: QueueCounters::default(),
        }
    }

    /// Also wake every waiter on `signal` whenever an item leaves the queue.
    pub fn with_dequeue_signal(mut self, signal: Arc<Notify>) -> Self {
        self.dequeued = Some(signal);
        self
    }

    fn signal_dequeued(&self) {
        if let Some(signal) = &self.dequeued {
            signal.notify_waiters();
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    pub fn counters(&self) -> &QueueCounters {
        &self.counters
    }

    pub fn len(&self) -> usize {
        self.counters.depth()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether new items are still admitted.
    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    /// Last admitted sequence key.
    pub fn last_key(&self) -> Option<i64> {
        self.lock().last_key
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue without sequencing.
    pub async fn enqueue(&self, item: T) -> Result<Admission> {
        self.enqueue_sequenced(item, None).await
    }

    /// Enqueue, refusing keys that do not advance past the last admitted key.
    ///
    /// Under [`AdmissionPolicy::Block`] this suspends while the queue is full and
    /// returns [`TransportError::Shutdown`] if the queue stops accepting meanwhile.
    pub async fn enqueue_sequenced(&self, item: T, key: Option<i64>) -> Result<Admission> {
        let mut item = match self.try_admit(item, key)? {
            TryAdmit::Done(admission) => return Ok(admission),
            TryAdmit::Full(item) => item,
        };

        self.counters.blocked.fetch_add(1, Ordering::Relaxed);
        debug!(queue = %self.name, capacity = self.capacity, "queue full, producer waiting");

        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            item = match self.try_admit(item, key)? {
                TryAdmit::Done(admission) => return Ok(admission),
                TryAdmit::Full(item) => item,
            };
            notified.await;
        }
    }

    /// Enqueue without waiting; a full blocking queue yields [`TransportError::QueueFull`].
    pub fn try_enqueue(&self, item: T, key: Option<i64>) -> Result<Admission> {
        match self.try_admit(item, key)? {
            TryAdmit::Done(admission) => Ok(admission),
            TryAdmit::Full(_) => {
                self.counters.blocked.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::QueueFull {
                    lane: self.name.clone(),
                    capacity: self.capacity,
                })
            }
        }
    }

    fn try_admit(&self, item: T, key: Option<i64>) -> Result<TryAdmit<T>> {
        let mut state = self.lock();
        if !state.accepting {
            return Err(TransportError::Shutdown);
        }
        if let (Some(key), Some(last)) = (key, state.last_key) {
            if key <= last {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                return Err(TransportError::DuplicateOrStale {
                    source_id: self.name.clone(),
                    frame_id: key,
                    last_frame_id: last,
                });
            }
        }

        let admission = if state.items.len() < self.capacity {
            Admission::Queued
        } else {
            match self.policy {
                AdmissionPolicy::Block => return Ok(TryAdmit::Full(item)),
                AdmissionPolicy::DropOldest => {
                    state.items.pop_front();
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(queue = %self.name, "evicted oldest entry");
                    Admission::DisplacedOldest
                }
            }
        };

        state.items.push_back(item);
        if key.is_some() {
            state.last_key = key;
        }
        self.counters.depth.store(state.items.len(), Ordering::Relaxed);
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        drop(state);

        self.not_empty.notify_one();
        Ok(TryAdmit::Done(admission))
    }

    /// Take the next item, suspending while the queue is empty.
    ///
    /// Returns [`TransportError::Shutdown`] once the queue is closed, or once it
    /// stopped accepting and has been drained.
    pub async fn dequeue(&self) -> Result<T> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_dequeue()? {
                return Ok(item);
            }
            notified.await;
        }
    }

    /// Like [`BoundedQueue::dequeue`] but gives up after `timeout` with `Ok(None)`.
    pub async fn poll(&self, timeout: Duration) -> Result<Option<T>> {
        match tokio::time::timeout(timeout, self.dequeue()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Take the next item if one is ready.
    pub fn try_dequeue(&self) -> Result<Option<T>> {
        let mut state = self.lock();
        if state.closed {
            return Err(TransportError::Shutdown);
        }
        match state.items.pop_front() {
            Some(item) => {
                self.counters.depth.store(state.items.len(), Ordering::Relaxed);
                drop(state);
                self.not_full.notify_one();
                self.signal_dequeued();
                Ok(Some(item))
            }
            None if !state.accepting => Err(TransportError::Shutdown),
            None => Ok(None),
        }
    }

    /// Forget the last admitted key so the next key of any value is accepted.
    pub fn reset_sequence(&self) {
        self.lock().last_key = None;
    }

    /// Stop admitting new items. Queued items remain available to consumers.
    pub fn stop_accepting(&self) {
        self.lock().accepting = false;
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
    }

    /// Close the queue, discarding whatever is still queued. Returns the discard count.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut state = self.lock();
            state.accepting = false;
            state.closed = true;
            let discarded = state.items.len();
            state.items.clear();
            self.counters.depth.store(0, Ordering::Relaxed);
            discarded
        };
        self.counters.discarded.fetch_add(discarded as u64, Ordering::Relaxed);
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
        self.signal_dequeued();
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let queue = BoundedQueue::new("cam1", 4, AdmissionPolicy::Block);
        for i in 0..4 {
            queue.enqueue_sequenced(i, Some(i)).await.unwrap();
        }
        for i in 0..4 {
            assert_eq!(queue.dequeue().await.unwrap(), i);
        }
        assert_eq!(queue.counters().admitted(), 4);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn stale_keys_are_refused_and_counted() {
        let queue = BoundedQueue::new("cam1", 4, AdmissionPolicy::Block);
        queue.enqueue_sequenced("a", Some(100)).await.unwrap();
        let dup = queue.enqueue_sequenced("b", Some(100)).await;
        assert!(matches!(
            dup,
            Err(TransportError::DuplicateOrStale { frame_id: 100, last_frame_id: 100, .. })
        ));
        let stale = queue.enqueue_sequenced("c", Some(99)).await;
        assert!(matches!(stale, Err(TransportError::DuplicateOrStale { .. })));
        assert_eq!(queue.counters().duplicates(), 2);
        assert_eq!(queue.len(), 1);

        queue.reset_sequence();
        queue.enqueue_sequenced("d", Some(1)).await.unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn drop_oldest_admits_immediately() {
        let queue = BoundedQueue::new("cam1", 2, AdmissionPolicy::DropOldest);
        queue.enqueue(1).await.unwrap();
        queue.enqueue(2).await.unwrap();
        assert_eq!(queue.enqueue(3).await.unwrap(), Admission::DisplacedOldest);
        assert_eq!(queue.counters().dropped(), 1);
        assert_eq!(queue.dequeue().await.unwrap(), 2);
        assert_eq!(queue.dequeue().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn blocking_enqueue_waits_for_dequeue() {
        let queue = Arc::new(BoundedQueue::new("cam1", 2, AdmissionPolicy::Block));
        queue.enqueue(1).await.unwrap();
        queue.enqueue(2).await.unwrap();
        assert!(matches!(queue.try_enqueue(3, None), Err(TransportError::QueueFull { capacity: 2, .. })));

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(3).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.dequeue().await.unwrap(), 1);
        let admission = tokio::time::timeout(Duration::from_secs(1), producer).await.unwrap().unwrap();
        assert_eq!(admission.unwrap(), Admission::Queued);
        assert_eq!(queue.counters().blocked(), 2, "the refused try and the wait both count");
        assert_eq!(queue.dequeue().await.unwrap(), 2);
        assert_eq!(queue.dequeue().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn poll_times_out_on_empty_queue() {
        let queue: BoundedQueue<u8> = BoundedQueue::new("cam1", 2, AdmissionPolicy::Block);
        assert_eq!(queue.poll(Duration::from_millis(20)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stop_accepting_drains_then_reports_shutdown() {
        let queue = BoundedQueue::new("cam1", 4, AdmissionPolicy::Block);
        queue.enqueue(1).await.unwrap();
        queue.stop_accepting();
        assert!(matches!(queue.enqueue(2).await, Err(TransportError::Shutdown)));
        assert_eq!(queue.dequeue().await.unwrap(), 1);
        assert!(matches!(queue.dequeue().await, Err(TransportError::Shutdown)));
    }

    #[tokio::test]
    async fn close_wakes_blocked_consumers_and_producers() {
        let queue = Arc::new(BoundedQueue::new("cam1", 1, AdmissionPolicy::Block));
        queue.enqueue(0).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.enqueue(1).await })
        };
        let empty = Arc::new(BoundedQueue::<u8>::new("cam2", 1, AdmissionPolicy::Block));
        let consumer = {
            let empty = Arc::clone(&empty);
            tokio::spawn(async move { empty.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(queue.close(), 1);
        empty.close();

        let produced = tokio::time::timeout(Duration::from_secs(1), producer).await.unwrap().unwrap();
        assert!(matches!(produced, Err(TransportError::Shutdown)));
        let consumed = tokio::time::timeout(Duration::from_secs(1), consumer).await.unwrap().unwrap();
        assert!(matches!(consumed, Err(TransportError::Shutdown)));
        assert_eq!(queue.counters().discarded(), 1);
    }
}
