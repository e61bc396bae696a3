//! In-process relay broker.
//!
//! Each attached subscriber owns a bounded queue. Publishing never waits on a
//! subscriber: when a queue is full its oldest record is discarded and the
//! subscriber is told how many records it lost before it sees the next one.

use async_trait::async_trait;
use bridge_core::{RelayError, RelayRecord};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::{RelayMessage, RelaySink};

#[derive(Debug, Default)]
struct QueueState {
    records: VecDeque<RelayRecord>,
    /// Discarded since the last `Dropped` message
    pending_dropped: u64,
    closed: bool,
}

#[derive(Debug)]
struct SubscriberQueue {
    filter: Option<String>,
    capacity: usize,
    state: Mutex<QueueState>,
    dropped_total: AtomicU64,
    notify: Notify,
}

impl SubscriberQueue {
    fn accepts(&self, record: &RelayRecord) -> bool {
        self.filter
            .as_deref()
            .map_or(true, |run_id| run_id == record.run_id)
    }

    fn push(&self, records: &[RelayRecord]) -> usize {
        let mut delivered = 0;
        let mut dropped = 0;
        {
            let mut state = self.state.lock();
            if state.closed {
                return 0;
            }
            for record in records.iter().filter(|r| self.accepts(r)) {
                if state.records.len() >= self.capacity {
                    state.records.pop_front();
                    dropped += 1;
                }
                state.records.push_back(record.clone());
                delivered += 1;
            }
            state.pending_dropped += dropped;
        }
        if dropped > 0 {
            self.dropped_total.fetch_add(dropped, Ordering::Relaxed);
        }
        if delivered > 0 {
            self.notify.notify_one();
        }
        delivered
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }
}

#[derive(Debug)]
struct BrokerInner {
    queue_capacity: usize,
    next_id: AtomicU64,
    published: AtomicU64,
    subscribers: RwLock<HashMap<u64, Arc<SubscriberQueue>>>,
}

/// Fan-out hub. Cheap to clone; clones share subscribers.
#[derive(Debug, Clone)]
pub struct RelayBroker {
    inner: Arc<BrokerInner>,
}

impl RelayBroker {
    /// Create a broker whose subscriber queues hold `queue_capacity` records.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                queue_capacity: queue_capacity.max(1),
                next_id: AtomicU64::new(0),
                published: AtomicU64::new(0),
                subscribers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Attach a subscriber. With a `run_id` filter only that scan's records
    /// are queued. Records published before attaching are never seen.
    ///
    /// Dropping the [`Subscription`] detaches it.
    pub fn attach(&self, run_id: Option<String>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue {
            filter: run_id,
            capacity: self.inner.queue_capacity,
            state: Mutex::new(QueueState::default()),
            dropped_total: AtomicU64::new(0),
            notify: Notify::new(),
        });
        self.inner.subscribers.write().insert(id, Arc::clone(&queue));
        debug!(subscriber = id, filter = ?queue.filter, "Subscriber attached");
        Subscription {
            id,
            queue,
            broker: Arc::downgrade(&self.inner),
        }
    }

    /// Number of attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Records published since creation
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Queue `records` on every matching subscriber. Never waits.
    ///
    /// Returns the number of (record, subscriber) deliveries queued.
    pub fn publish_records(&self, records: &[RelayRecord]) -> usize {
        if records.is_empty() {
            return 0;
        }
        let subscribers: Vec<_> = self.inner.subscribers.read().values().cloned().collect();
        let delivered = subscribers.iter().map(|q| q.push(records)).sum();
        self.inner
            .published
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        trace!(records = records.len(), subscribers = subscribers.len(), "Published batch");
        delivered
    }

    /// Detach everyone. Pending records stay readable, then `recv` ends.
    pub fn close(&self) {
        let drained: Vec<_> = self.inner.subscribers.write().drain().collect();
        for (_, queue) in drained {
            queue.close();
        }
    }
}

#[async_trait]
impl RelaySink for RelayBroker {
    async fn publish(&self, batch: &[RelayRecord]) -> Result<(), RelayError> {
        self.publish_records(batch);
        Ok(())
    }
}

/// One subscriber's end of the broker.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    broker: std::sync::Weak<BrokerInner>,
}

impl Subscription {
    /// Subscriber id, unique per broker
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Total records discarded from this subscriber's queue
    pub fn dropped_total(&self) -> u64 {
        self.queue.dropped_total.load(Ordering::Relaxed)
    }

    /// Next message without waiting.
    pub fn try_recv(&self) -> Option<RelayMessage> {
        let mut state = self.queue.state.lock();
        if state.pending_dropped > 0 {
            let count = std::mem::take(&mut state.pending_dropped);
            return Some(RelayMessage::Dropped { count });
        }
        state.records.pop_front().map(RelayMessage::Record)
    }

    /// Wait for the next message. `None` once the broker closed and the queue
    /// is empty.
    pub async fn recv(&mut self) -> Option<RelayMessage> {
        loop {
            if let Some(message) = self.try_recv() {
                return Some(message);
            }
            if self.queue.state.lock().closed {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            if broker.subscribers.write().remove(&self.id).is_some() {
                debug!(subscriber = self.id, "Subscriber detached");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::{Sample, SampleValue};

    fn record(run_id: &str, seq: u64) -> RelayRecord {
        RelayRecord {
            run_id: run_id.to_string(),
            channel: "det1".to_string(),
            sample: Sample::new(seq, seq as f64, SampleValue::Float(seq as f64)),
        }
    }

    fn seq_of(message: Option<RelayMessage>) -> u64 {
        match message {
            Some(RelayMessage::Record(r)) => r.sample.seq,
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_full_queue_drops_oldest_and_signals() {
        let broker = RelayBroker::new(3);
        let sub = broker.attach(None);

        let batch: Vec<_> = (0..5).map(|i| record("r1", i)).collect();
        broker.publish_records(&batch);

        assert_eq!(sub.try_recv(), Some(RelayMessage::Dropped { count: 2 }));
        assert_eq!(seq_of(sub.try_recv()), 2);
        assert_eq!(seq_of(sub.try_recv()), 3);
        assert_eq!(seq_of(sub.try_recv()), 4);
        assert_eq!(sub.try_recv(), None);
        assert_eq!(sub.dropped_total(), 2);
    }

    #[test]
    fn test_filter_and_detach() {
        let broker = RelayBroker::new(8);
        let only_r2 = broker.attach(Some("r2".to_string()));
        let all = broker.attach(None);
        assert_eq!(broker.subscriber_count(), 2);

        broker.publish_records(&[record("r1", 0), record("r2", 0)]);
        assert!(matches!(only_r2.try_recv(), Some(RelayMessage::Record(r)) if r.run_id == "r2"));
        assert_eq!(only_r2.try_recv(), None);
        assert_eq!(seq_of(all.try_recv()), 0);

        drop(only_r2);
        assert_eq!(broker.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish_and_ends_on_close() {
        let broker = RelayBroker::new(4);
        let mut sub = broker.attach(None);

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            publisher.publish_records(&[record("r1", 0)]);
            publisher.close();
        });

        assert_eq!(seq_of(sub.recv().await), 0);
        assert_eq!(sub.recv().await, None);
    }
}
