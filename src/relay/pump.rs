//! Change feed → relay sink.
//!
//! The pump keeps one cursor per channel: the index of the next sample to
//! publish. A cursor only advances after the sink accepted the batch, so a
//! broker outage suspends fan-out without losing records. Once the broker is
//! back, publishing resumes from the cursor, reading whatever the store holds
//! (ring or archive).

use bridge_core::{BridgeError, BridgeResult, RelayRecord, StreamKey};
use bridge_storage::StreamStore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::RelaySink;

/// Lower bound for the publish attempt made while stopping.
const FINAL_PASS_MIN: Duration = Duration::from_secs(1);

/// Publishes appended samples to a [`RelaySink`] in per-channel order.
pub struct RelayPump {
    store: Arc<StreamStore>,
    sink: Arc<dyn RelaySink>,
    batch_size: usize,
    backoff_min: Duration,
    backoff_max: Duration,
    cursors: HashMap<StreamKey, u64>,
    /// Keys with samples not yet published, in first-change order
    pending: Vec<StreamKey>,
    pending_set: HashSet<StreamKey>,
}

impl std::fmt::Debug for RelayPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPump")
            .field("batch_size", &self.batch_size)
            .field("cursors", &self.cursors.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl RelayPump {
    /// Create a pump. Reconnect backoff doubles from `backoff_min` up to `backoff_max`.
    pub fn new(
        store: Arc<StreamStore>,
        sink: Arc<dyn RelaySink>,
        batch_size: usize,
        backoff_min: Duration,
        backoff_max: Duration,
    ) -> Self {
        Self {
            store,
            sink,
            batch_size: batch_size.max(1),
            backoff_min,
            backoff_max: backoff_max.max(backoff_min),
            cursors: HashMap::new(),
            pending: Vec::new(),
            pending_set: HashSet::new(),
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut backoff = self.backoff_min;
        let mut suspended = false;
        loop {
            if self.pending.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.store.changes().changed() => {}
                }
            }
            self.collect_changes();

            match self.publish_pending().await {
                Ok(()) => {
                    if suspended {
                        info!("Relay broker reachable again, fan-out resumed");
                        suspended = false;
                    }
                    backoff = self.backoff_min;
                }
                Err(e) => {
                    if !suspended {
                        warn!(error = %e, "Relay fan-out suspended");
                        suspended = true;
                    } else {
                        debug!(error = %e, retry_in_ms = backoff.as_millis() as u64, "Relay still unavailable");
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.backoff_max);
                }
            }
        }
        self.final_pass().await;
        debug!(unpublished_channels = self.pending.len(), "Relay pump stopped");
    }

    /// One bounded attempt to publish what was written before shutdown.
    async fn final_pass(&mut self) {
        self.collect_changes();
        if self.pending.is_empty() {
            return;
        }
        let limit = self.backoff_max.max(FINAL_PASS_MIN);
        match tokio::time::timeout(limit, self.publish_pending()).await {
            Ok(Ok(())) => debug!("Relay caught up before stopping"),
            Ok(Err(e)) => warn!(error = %e, "Final relay pass failed"),
            Err(_) => warn!(timeout_ms = limit.as_millis() as u64, "Final relay pass timed out"),
        }
    }

    /// Publish everything currently written for the changed channels.
    ///
    /// Stops at the first sink or store read failure; the failing channel and
    /// those after it stay pending.
    pub async fn publish_pending(&mut self) -> BridgeResult<()> {
        let keys = std::mem::take(&mut self.pending);
        let mut keys = keys.into_iter();
        while let Some(key) = keys.next() {
            if let Err(e) = self.publish_channel(&key).await {
                self.pending.push(key);
                self.pending.extend(keys);
                return Err(e);
            }
            self.pending_set.remove(&key);
        }
        Ok(())
    }

    fn collect_changes(&mut self) {
        for key in self.store.changes().drain() {
            if self.pending_set.insert(key.clone()) {
                self.pending.push(key);
            }
        }
    }

    async fn publish_channel(&mut self, key: &StreamKey) -> BridgeResult<()> {
        let channel = match self.store.channel(key) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(%key, error = %e, "Changed channel vanished from the store");
                self.cursors.remove(key);
                return Ok(());
            }
        };
        let progress = channel.progress();
        let mut cursor = self.cursors.get(key).copied().unwrap_or(0);

        while cursor < progress.written {
            let end = (cursor + self.batch_size as u64).min(progress.written);
            let store = Arc::clone(&self.store);
            let reading = Arc::clone(&channel);
            let samples = tokio::task::spawn_blocking(move || store.read_written(&reading, cursor..end))
                .await
                .map_err(|e| BridgeError::Io(e.into()))?
                .map_err(|e| {
                    warn!(%key, cursor, error = %e, "Could not read samples for relay");
                    e
                })?;
            let batch: Vec<RelayRecord> = samples
                .into_iter()
                .map(|sample| RelayRecord {
                    run_id: key.run_id.clone(),
                    channel: key.channel.clone(),
                    sample,
                })
                .collect();
            self.sink.publish(&batch).await?;
            cursor = end;
            self.cursors.insert(key.clone(), cursor);
        }

        if progress.closed && cursor >= progress.written {
            self.cursors.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{RelayBroker, RelayMessage};
    use async_trait::async_trait;
    use bridge_core::{ChannelSchema, DType, Sample, SampleValue, ScanDefaults, ScanInfo, StartDoc};
    use bridge_core::{RelayError, ScanOutcome, StorageError};
    use bridge_storage::{ArchiveBackend, MemoryArchive, ScanManifest};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Sink that can be switched offline and records what it accepted.
    #[derive(Default)]
    struct FlakySink {
        offline: AtomicBool,
        accepted: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl RelaySink for FlakySink {
        async fn publish(&self, batch: &[RelayRecord]) -> Result<(), RelayError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(RelayError::Unavailable("offline".into()));
            }
            self.accepted.lock().extend(batch.iter().map(|r| r.sample.seq));
            Ok(())
        }
    }

    fn store_with_channel() -> (Arc<StreamStore>, StreamKey) {
        let store = Arc::new(StreamStore::new(Arc::new(MemoryArchive::new()), 4));
        let start = StartDoc::new("count").with_uid("r1");
        store
            .open_scan(ScanInfo::from_start(&start, &ScanDefaults::default()))
            .unwrap();
        store
            .create_channel("r1", ChannelSchema::scalar("det1", DType::Float64))
            .unwrap();
        (store, StreamKey::new("r1", "det1"))
    }

    fn append(store: &StreamStore, key: &StreamKey, range: std::ops::Range<u64>) {
        for seq in range {
            store
                .append(key, Sample::new(seq, 0.0, SampleValue::Float(seq as f64)))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_outage_resumes_without_gaps() {
        let (store, key) = store_with_channel();
        let sink = Arc::new(FlakySink::default());
        let mut pump = RelayPump::new(
            store.clone(),
            sink.clone(),
            3,
            Duration::from_millis(1),
            Duration::from_millis(4),
        );

        append(&store, &key, 0..5);
        pump.collect_changes();
        pump.publish_pending().await.unwrap();

        sink.offline.store(true, Ordering::SeqCst);
        // Ring holds 4, so most of these are served from the archive on resume
        append(&store, &key, 5..15);
        pump.collect_changes();
        assert!(pump.publish_pending().await.is_err());

        sink.offline.store(false, Ordering::SeqCst);
        pump.publish_pending().await.unwrap();
        assert_eq!(*sink.accepted.lock(), (0..15).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_run_publishes_to_broker_until_cancelled() {
        let (store, key) = store_with_channel();
        let broker = RelayBroker::new(64);
        let mut sub = broker.attach(None);
        let pump = RelayPump::new(
            store.clone(),
            Arc::new(broker.clone()),
            8,
            Duration::from_millis(1),
            Duration::from_millis(10),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump.run(cancel.clone()));

        append(&store, &key, 0..3);
        for expected in 0..3 {
            let message = tokio::time::timeout(Duration::from_secs(2), sub.recv())
                .await
                .unwrap();
            assert!(matches!(message, Some(RelayMessage::Record(r)) if r.sample.seq == expected));
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    /// Archive whose reads fail while `broken` is set.
    #[derive(Debug, Default)]
    struct FlakyArchive {
        inner: MemoryArchive,
        broken: AtomicBool,
    }

    impl ArchiveBackend for FlakyArchive {
        fn append(&self, key: &StreamKey, samples: &[Sample]) -> Result<u64, StorageError> {
            self.inner.append(key, samples)
        }

        fn read(&self, key: &StreamKey, range: std::ops::Range<u64>) -> Result<Vec<Sample>, StorageError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StorageError::Codec("disk on fire".into()));
            }
            self.inner.read(key, range)
        }

        fn len(&self, key: &StreamKey) -> Result<u64, StorageError> {
            self.inner.len(key)
        }

        fn put_manifest(&self, manifest: &ScanManifest) -> Result<(), StorageError> {
            self.inner.put_manifest(manifest)
        }

        fn manifests(&self) -> Result<Vec<ScanManifest>, StorageError> {
            self.inner.manifests()
        }
    }

    #[tokio::test]
    async fn test_failed_archive_read_stays_pending_after_close() {
        let archive = Arc::new(FlakyArchive::default());
        let store = Arc::new(StreamStore::new(archive.clone(), 4));
        let start = StartDoc::new("count").with_uid("r1");
        store
            .open_scan(ScanInfo::from_start(&start, &ScanDefaults::default()))
            .unwrap();
        store
            .create_channel("r1", ChannelSchema::scalar("det1", DType::Float64))
            .unwrap();
        let key = StreamKey::new("r1", "det1");
        let sink = Arc::new(FlakySink::default());
        let mut pump = RelayPump::new(
            store.clone(),
            sink.clone(),
            4,
            Duration::from_millis(1),
            Duration::from_millis(4),
        );

        // Most of these left the ring, so the relay has to read the archive
        append(&store, &key, 0..10);
        archive.broken.store(true, Ordering::SeqCst);
        pump.collect_changes();
        assert!(pump.publish_pending().await.is_err());

        // No further appends will ever mark this channel again
        store.close_scan("r1", ScanOutcome::Success, "").unwrap();
        archive.broken.store(false, Ordering::SeqCst);
        pump.collect_changes();
        pump.publish_pending().await.unwrap();
        assert_eq!(*sink.accepted.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_cancel_publishes_tail_before_stopping() {
        let (store, key) = store_with_channel();
        let broker = RelayBroker::new(64);
        let sub = broker.attach(None);
        let pump = RelayPump::new(
            store.clone(),
            Arc::new(broker.clone()),
            8,
            Duration::from_millis(1),
            Duration::from_millis(10),
        );

        // Written right before shutdown; the pump never saw a wake-up for them
        append(&store, &key, 0..6);
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), pump.run(cancel))
            .await
            .unwrap();

        let mut seqs = Vec::new();
        while let Some(message) = sub.try_recv() {
            if let RelayMessage::Record(r) = message {
                seqs.push(r.sample.seq);
            }
        }
        assert_eq!(seqs, (0..6).collect::<Vec<_>>());
    }
}
