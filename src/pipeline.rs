//! Ingestion pipeline: ingestor → per-scan workers → stream store.
//!
//! Documents enter through a bounded queue ([`ServiceHandle::submit`]). A
//! dispatcher task owns the [`Ingestor`] and routes admitted documents to one
//! worker task per Active scan, so scans are translated and written
//! independently while each scan keeps its document order.
//!
//! ```text
//! submit ─► [bounded queue] ─► dispatcher (Ingestor)
//!                                 ├─► [scan queue] ─► worker(run A) ─► StreamStore
//!                                 └─► [scan queue] ─► worker(run B) ─► StreamStore
//! ```

use bridge_core::experiment::now_secs;
use bridge_core::{
    BridgeError, BridgeResult, Document, ScanDefaults, ScanOutcome, StartDoc, StreamKey,
};
use bridge_storage::StreamStore;
use futures::future::{join_all, select_all};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::OwnedPermit;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ingest::Ingestor;
use crate::translate::{ScanTranslator, WriteOp};

/// Counters shared by the dispatcher and the workers.
#[derive(Debug, Default)]
pub struct PipelineStats {
    documents: AtomicU64,
    rejected: AtomicU64,
    samples: AtomicU64,
    scans_opened: AtomicU64,
    scans_failed: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Documents fully applied
    pub documents: u64,
    /// Documents dropped (sequence, validation, type errors, ...)
    pub rejected: u64,
    /// Samples appended
    pub samples: u64,
    /// Scans opened
    pub scans_opened: u64,
    /// Scans closed with a failure forced by the bridge
    pub scans_failed: u64,
}

impl PipelineStats {
    /// Current values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            documents: self.documents.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            scans_opened: self.scans_opened.load(Ordering::Relaxed),
            scans_failed: self.scans_failed.load(Ordering::Relaxed),
        }
    }

    /// Count a document dropped before reaching the pipeline (e.g. unparsable JSON).
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }
}

/// Translates and writes the documents of one scan.
#[derive(Debug)]
pub struct ScanWorker {
    translator: ScanTranslator,
    store: Arc<StreamStore>,
}

impl ScanWorker {
    /// Open the scan for `start` in the store.
    pub fn open(start: &StartDoc, store: Arc<StreamStore>, defaults: &ScanDefaults) -> BridgeResult<Self> {
        let (translator, open) = ScanTranslator::start(start, defaults);
        let mut worker = Self { translator, store };
        worker.apply(vec![open])?;
        Ok(worker)
    }

    /// Run id
    pub fn run_id(&self) -> &str {
        self.translator.run_id()
    }

    /// Translate and write one document. Returns the number of samples appended.
    ///
    /// Scan-fatal errors (schema conflict, storage failure) close the scan with
    /// a failed outcome before the error is returned.
    pub fn handle(&mut self, document: &Document) -> BridgeResult<usize> {
        let result = self
            .translator
            .translate(document)
            .and_then(|ops| self.apply(ops));
        if let Err(e) = &result {
            if e.is_scan_fatal() {
                self.fail(e);
            }
        }
        result
    }

    fn apply(&mut self, ops: Vec<WriteOp>) -> BridgeResult<usize> {
        let run_id = self.translator.run_id().to_string();
        let mut appended = 0;
        for op in ops {
            match op {
                WriteOp::OpenScan(info) => {
                    self.store.open_scan(info)?;
                }
                WriteOp::CreateChannel(schema) => {
                    self.store.create_channel(&run_id, schema)?;
                }
                WriteOp::Append { channel, sample } => {
                    self.store.append(&StreamKey::new(run_id.clone(), channel), sample)?;
                    appended += 1;
                }
                WriteOp::Close {
                    outcome,
                    reason,
                    stop,
                } => {
                    self.store.update_info(&run_id, |info| info.finish(&stop))?;
                    self.store.close_scan(&run_id, outcome, &reason)?;
                }
            }
        }
        Ok(appended)
    }

    fn fail(&mut self, cause: &BridgeError) {
        self.translator.mark_closed();
        let run_id = self.translator.run_id().to_string();
        let reason = cause.to_string();
        let events = self.translator.total_events();

        if let Err(e) = self
            .store
            .update_info(&run_id, |info| info.fail(now_secs(), events, &reason))
        {
            warn!(run_id = %run_id, error = %e, "Could not record failure in scan info");
        }
        match self.store.close_scan(&run_id, ScanOutcome::Failed, &reason) {
            Ok(()) | Err(BridgeError::ScanClosed(_)) => {}
            Err(e) => warn!(run_id = %run_id, error = %e, "Closing failed scan reported an error"),
        }
        warn!(run_id = %run_id, error = %cause, "Scan failed");
    }
}

enum Envelope {
    Document(Document),
    Barrier(oneshot::Sender<()>),
}

/// Cloneable producer side of the pipeline.
#[derive(Clone, Debug)]
pub struct ServiceHandle {
    tx: mpsc::Sender<Envelope>,
    stats: Arc<PipelineStats>,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Envelope::Document(doc) => write!(f, "Document({})", doc.kind()),
            Envelope::Barrier(_) => f.write_str("Barrier"),
        }
    }
}

impl ServiceHandle {
    /// Queue a document. Waits while the queue is full.
    pub async fn submit(&self, document: Document) -> BridgeResult<()> {
        self.tx
            .send(Envelope::Document(document))
            .await
            .map_err(|_| BridgeError::ServiceClosed)
    }

    /// Wait until every document submitted before this call has been applied.
    pub async fn drain(&self) -> BridgeResult<()> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Envelope::Barrier(done))
            .await
            .map_err(|_| BridgeError::ServiceClosed)?;
        wait.await.map_err(|_| BridgeError::ServiceClosed)
    }

    /// Pipeline counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Shared counters
    pub fn stats_handle(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }
}

/// Running pipeline: the dispatcher task plus its workers.
#[derive(Debug)]
pub struct BridgeService {
    handle: ServiceHandle,
    dispatcher: JoinHandle<()>,
}

impl BridgeService {
    /// Spawn the dispatcher on the current runtime.
    pub fn spawn(
        store: Arc<StreamStore>,
        defaults: ScanDefaults,
        queue_capacity: usize,
        scan_queue_capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let stats = Arc::new(PipelineStats::default());
        let dispatcher = Dispatcher {
            store,
            defaults,
            scan_queue_capacity: scan_queue_capacity.max(1),
            stats: Arc::clone(&stats),
            ingestor: Ingestor::new(),
            workers: HashMap::new(),
            retiring: Vec::new(),
        };
        let dispatcher = tokio::spawn(dispatcher.run(rx));
        Self {
            handle: ServiceHandle { tx, stats },
            dispatcher,
        }
    }

    /// Producer handle
    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    /// Stop accepting documents and wait for every queued document to be applied.
    ///
    /// Other clones of the handle must be dropped first, otherwise this waits
    /// for them.
    pub async fn shutdown(self) {
        let Self { handle, dispatcher } = self;
        drop(handle);
        if let Err(e) = dispatcher.await {
            error!(error = %e, "Dispatcher task failed");
        }
    }
}

/// Dispatcher side of one Active scan.
struct WorkerSlot {
    tx: mpsc::Sender<Envelope>,
    handle: JoinHandle<()>,
    /// Envelopes the worker queue had no room for, in arrival order
    backlog: VecDeque<Envelope>,
    /// Stop document routed; retire once the backlog is delivered
    stopping: bool,
}

impl WorkerSlot {
    /// Queue without waiting. Returns false if the worker is gone.
    fn deliver(&mut self, envelope: Envelope) -> bool {
        if !self.backlog.is_empty() {
            self.backlog.push_back(envelope);
            return true;
        }
        match self.tx.try_send(envelope) {
            Ok(()) => true,
            Err(TrySendError::Full(envelope)) => {
                self.backlog.push_back(envelope);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Deliver the whole backlog, waiting on the worker as needed.
    async fn flush(&mut self) {
        while let Some(envelope) = self.backlog.pop_front() {
            if self.tx.send(envelope).await.is_err() {
                self.backlog.clear();
                return;
            }
        }
    }
}

struct Dispatcher {
    store: Arc<StreamStore>,
    defaults: ScanDefaults,
    scan_queue_capacity: usize,
    stats: Arc<PipelineStats>,
    ingestor: Ingestor,
    /// Active scans by run id
    workers: HashMap<String, WorkerSlot>,
    /// Workers that received their stop document and are finishing
    retiring: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::Receiver<Envelope>) {
        loop {
            tokio::select! {
                envelope = rx.recv() => match envelope {
                    Some(Envelope::Barrier(done)) => {
                        self.barrier().await;
                        let _ = done.send(());
                    }
                    Some(Envelope::Document(document)) => self.dispatch(document).await,
                    None => break,
                },
                (run_id, permit) = self.backlog_ready(), if self.has_backlog() => {
                    self.forward_backlog(&run_id, permit);
                }
            }
        }

        debug!(scans = self.workers.len(), "Document queue closed, stopping workers");
        let mut workers: Vec<_> = self.workers.drain().map(|(_, slot)| slot).collect();
        for slot in &mut workers {
            slot.flush().await;
        }
        self.retiring.extend(workers.into_iter().map(|slot| slot.handle));
        join_all(self.retiring.drain(..)).await;
    }

    fn has_backlog(&self) -> bool {
        self.workers.values().any(|slot| !slot.backlog.is_empty())
    }

    /// Resolves once some backlogged worker has room for one more envelope.
    async fn backlog_ready(&self) -> (String, Option<OwnedPermit<Envelope>>) {
        let waits: Vec<_> = self
            .workers
            .iter()
            .filter(|(_, slot)| !slot.backlog.is_empty())
            .map(|(run_id, slot)| {
                let run_id = run_id.clone();
                let tx = slot.tx.clone();
                Box::pin(async move { (run_id, tx.reserve_owned().await.ok()) })
            })
            .collect();
        if waits.is_empty() {
            return futures::future::pending().await;
        }
        select_all(waits).await.0
    }

    fn forward_backlog(&mut self, run_id: &str, permit: Option<OwnedPermit<Envelope>>) {
        let Some(slot) = self.workers.get_mut(run_id) else {
            return;
        };
        match permit {
            Some(permit) => {
                if let Some(envelope) = slot.backlog.pop_front() {
                    permit.send(envelope);
                }
                if slot.backlog.is_empty() && slot.stopping {
                    self.retire(run_id);
                }
            }
            None => {
                let lost = slot.backlog.len() as u64;
                slot.backlog.clear();
                self.stats.rejected.fetch_add(lost, Ordering::Relaxed);
                warn!(run_id = %run_id, lost, "Scan worker gone, dropping its backlog");
                self.retire(run_id);
            }
        }
    }

    fn retire(&mut self, run_id: &str) {
        // The worker exits once its queue is drained and closed
        if let Some(slot) = self.workers.remove(run_id) {
            self.retiring.push(slot.handle);
        }
    }

    async fn dispatch(&mut self, document: Document) {
        self.retiring.retain(|handle| !handle.is_finished());
        let kind = document.kind();
        let admitted = match self.ingestor.admit(document) {
            Ok(admitted) => admitted,
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(%kind, error = %e, "Dropping document");
                return;
            }
        };
        let run_id = admitted.run_id;

        match admitted.document {
            Document::Start(start) => {
                let store = Arc::clone(&self.store);
                let defaults = self.defaults.clone();
                let opened =
                    tokio::task::spawn_blocking(move || ScanWorker::open(&start, store, &defaults))
                        .await;
                match opened {
                    Ok(Ok(worker)) => {
                        let (tx, rx) = mpsc::channel(self.scan_queue_capacity);
                        let handle = tokio::spawn(run_worker(worker, rx, Arc::clone(&self.stats)));
                        let slot = WorkerSlot {
                            tx,
                            handle,
                            backlog: VecDeque::new(),
                            stopping: false,
                        };
                        self.workers.insert(run_id, slot);
                        self.stats.scans_opened.fetch_add(1, Ordering::Relaxed);
                        self.stats.documents.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        self.ingestor.abandon(&run_id);
                        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                        warn!(run_id = %run_id, error = %e, "Dropping start document");
                    }
                    Err(e) => {
                        self.ingestor.abandon(&run_id);
                        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                        error!(run_id = %run_id, error = %e, "Scan open task failed");
                    }
                }
            }
            document => {
                let is_stop = matches!(document, Document::Stop(_));
                let delivered = match self.workers.get_mut(&run_id) {
                    Some(slot) => {
                        let delivered = slot.deliver(Envelope::Document(document));
                        if slot.backlog.len() == 1 {
                            debug!(run_id = %run_id, "Scan queue full, buffering");
                        }
                        slot.stopping |= is_stop;
                        delivered
                    }
                    None => false,
                };
                if !delivered {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(run_id = %run_id, %kind, "No worker for run, dropping document");
                }
                let drained = self
                    .workers
                    .get(&run_id)
                    .map(|slot| slot.backlog.is_empty())
                    .unwrap_or(false);
                if is_stop && (drained || !delivered) {
                    self.retire(&run_id);
                }
            }
        }
    }

    /// Every document routed so far is applied once this returns.
    async fn barrier(&mut self) {
        let mut acks = Vec::with_capacity(self.workers.len());
        for slot in self.workers.values_mut() {
            slot.flush().await;
            let (ack, wait) = oneshot::channel();
            if slot.tx.send(Envelope::Barrier(ack)).await.is_ok() {
                acks.push(wait);
            }
        }
        join_all(acks).await;

        let stopped: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, slot)| slot.stopping)
            .map(|(run_id, _)| run_id.clone())
            .collect();
        for run_id in stopped {
            self.retire(&run_id);
        }
        join_all(self.retiring.drain(..)).await;
    }
}

async fn run_worker(
    mut worker: ScanWorker,
    mut rx: mpsc::Receiver<Envelope>,
    stats: Arc<PipelineStats>,
) {
    let run_id = worker.run_id().to_string();
    debug!(run_id = %run_id, "Scan worker started");
    while let Some(envelope) = rx.recv().await {
        let document = match envelope {
            Envelope::Barrier(ack) => {
                let _ = ack.send(());
                continue;
            }
            Envelope::Document(document) => document,
        };
        let kind = document.kind();
        let joined = tokio::task::spawn_blocking(move || {
            let result = worker.handle(&document);
            (worker, result)
        })
        .await;

        match joined {
            Ok((returned, result)) => {
                worker = returned;
                match result {
                    Ok(samples) => {
                        stats.documents.fetch_add(1, Ordering::Relaxed);
                        stats.samples.fetch_add(samples as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        stats.rejected.fetch_add(1, Ordering::Relaxed);
                        if e.is_scan_fatal() {
                            stats.scans_failed.fetch_add(1, Ordering::Relaxed);
                        }
                        warn!(run_id = %run_id, %kind, error = %e, "Dropping document");
                    }
                }
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Scan worker task failed");
                return;
            }
        }
    }
    info!(run_id = %run_id, "Scan worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::{DataKey, DescriptorDoc, EventDoc, ScanState, StopDoc};
    use bridge_core::{Sample, StorageError};
    use bridge_storage::{ArchiveBackend, MemoryArchive, ScanManifest, StoreRead};
    use parking_lot::{Condvar, Mutex};
    use std::ops::Range;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn store() -> Arc<StreamStore> {
        Arc::new(StreamStore::new(Arc::new(MemoryArchive::new()), 16))
    }

    #[test]
    fn test_worker_applies_documents() {
        let store = store();
        let start = StartDoc::new("count").with_uid("r1");
        let mut worker = ScanWorker::open(&start, store.clone(), &ScanDefaults::default()).unwrap();

        let desc = DescriptorDoc::new("r1", "primary").with_data_key("det1", DataKey::number("sim"));
        let desc_uid = desc.uid.clone();
        worker.handle(&Document::Descriptor(desc)).unwrap();
        let appended = worker
            .handle(&Document::Event(EventDoc::new(&desc_uid, 1).with_datum("det1", 3.5)))
            .unwrap();
        assert_eq!(appended, 2);

        worker.handle(&Document::Stop(StopDoc::success("r1"))).unwrap();
        let scan = store.scan("r1").unwrap();
        assert_eq!(scan.state().outcome(), Some(ScanOutcome::Success));
        assert_eq!(scan.info().end.unwrap().num_events, 1);
    }

    #[test]
    fn test_worker_fails_scan_on_conflict() {
        let store = store();
        let start = StartDoc::new("count").with_uid("r1");
        let mut worker = ScanWorker::open(&start, store.clone(), &ScanDefaults::default()).unwrap();

        let desc = DescriptorDoc::new("r1", "primary").with_data_key("det1", DataKey::number("sim"));
        let desc_uid = desc.uid.clone();
        worker.handle(&Document::Descriptor(desc)).unwrap();
        worker
            .handle(&Document::Event(EventDoc::new(&desc_uid, 1).with_datum("det1", 1.0)))
            .unwrap();

        let conflicting =
            DescriptorDoc::new("r1", "primary").with_data_key("det1", DataKey::integer("sim"));
        let err = worker.handle(&Document::Descriptor(conflicting)).unwrap_err();
        assert!(matches!(err, BridgeError::SchemaConflict { .. }));

        let scan = store.scan("r1").unwrap();
        assert!(matches!(
            scan.state(),
            ScanState::Closed {
                outcome: ScanOutcome::Failed,
                ..
            }
        ));
        // Earlier samples stay readable
        let key = StreamKey::new("r1", "det1");
        assert!(matches!(store.read(&key, 0..1).unwrap(), StoreRead::Samples(s) if s.len() == 1));
        // Later documents are refused
        assert!(worker.handle(&Document::Stop(StopDoc::success("r1"))).is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_event_without_start_is_logged_and_dropped() {
        let store = store();
        let stats = Arc::new(PipelineStats::default());
        let mut dispatcher = Dispatcher {
            store: store.clone(),
            defaults: ScanDefaults::default(),
            scan_queue_capacity: 4,
            stats: stats.clone(),
            ingestor: Ingestor::new(),
            workers: HashMap::new(),
            retiring: Vec::new(),
        };

        let mut event = EventDoc::new("d-unknown", 1).with_datum("det1", 1.0);
        event.run_start = Some("R2".to_string());
        dispatcher.dispatch(Document::Event(event)).await;

        assert!(logs_contain("Dropping document"));
        assert!(logs_contain("R2"));
        assert_eq!(stats.snapshot().rejected, 1);
        assert!(store.scans().is_empty());
        assert!(dispatcher.workers.is_empty());
    }

    /// Archive whose appends for run "slow" block until opened.
    #[derive(Debug, Default)]
    struct GatedArchive {
        inner: MemoryArchive,
        open: Mutex<bool>,
        opened: Condvar,
    }

    impl GatedArchive {
        fn release(&self) {
            *self.open.lock() = true;
            self.opened.notify_all();
        }
    }

    impl ArchiveBackend for GatedArchive {
        fn append(&self, key: &StreamKey, samples: &[Sample]) -> Result<u64, StorageError> {
            if key.run_id == "slow" {
                let mut open = self.open.lock();
                while !*open {
                    self.opened.wait(&mut open);
                }
            }
            self.inner.append(key, samples)
        }

        fn read(&self, key: &StreamKey, range: Range<u64>) -> Result<Vec<Sample>, StorageError> {
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

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stalled_scan_does_not_hold_up_other_scans() {
        let archive = Arc::new(GatedArchive::default());
        // Ring of one: the second sample of a channel already needs the archive
        let store = Arc::new(StreamStore::new(archive.clone(), 1));
        let service = BridgeService::spawn(store.clone(), ScanDefaults::default(), 4, 1);
        let handle = service.handle();

        let slow = DescriptorDoc::new("slow", "primary").with_data_key("det1", DataKey::number("sim"));
        let fast = DescriptorDoc::new("fast", "primary").with_data_key("det1", DataKey::number("sim"));
        let (slow_uid, fast_uid) = (slow.uid.clone(), fast.uid.clone());
        handle.submit(Document::Start(StartDoc::new("count").with_uid("slow"))).await.unwrap();
        handle.submit(Document::Start(StartDoc::new("count").with_uid("fast"))).await.unwrap();
        handle.submit(Document::Descriptor(slow)).await.unwrap();
        handle.submit(Document::Descriptor(fast)).await.unwrap();
        for i in 0..10u64 {
            let event = EventDoc::new(&slow_uid, i + 1).with_datum("det1", i as f64);
            handle.submit(Document::Event(event)).await.unwrap();
        }
        for i in 0..5u64 {
            let event = EventDoc::new(&fast_uid, i + 1).with_datum("det1", i as f64);
            handle.submit(Document::Event(event)).await.unwrap();
        }
        handle.submit(Document::Stop(StopDoc::success("fast"))).await.unwrap();
        handle.submit(Document::Stop(StopDoc::success("slow"))).await.unwrap();

        let fast_closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(scan) = store.scan("fast") {
                    if !scan.state().is_active() {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok();
        let slow_active = store.scan("slow").map(|s| s.state().is_active()).unwrap_or(false);
        archive.release();
        assert!(fast_closed, "fast scan waited on the stalled one");
        assert!(slow_active);

        handle.drain().await.unwrap();
        let key = StreamKey::new("slow", "det1");
        match store.read(&key, 0..10).unwrap() {
            StoreRead::Samples(samples) => {
                let values: Vec<f64> = samples.iter().filter_map(|s| s.value.as_f64()).collect();
                assert_eq!(values, (0..10).map(|i| i as f64).collect::<Vec<_>>());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(store.scan("slow").unwrap().state().outcome(), Some(ScanOutcome::Success));

        drop(handle);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_finished_workers_are_reaped() {
        let store = store();
        let mut dispatcher = Dispatcher {
            store: store.clone(),
            defaults: ScanDefaults::default(),
            scan_queue_capacity: 4,
            stats: Arc::new(PipelineStats::default()),
            ingestor: Ingestor::new(),
            workers: HashMap::new(),
            retiring: Vec::new(),
        };

        for i in 0..10 {
            let run_id = format!("r{}", i);
            dispatcher
                .dispatch(Document::Start(StartDoc::new("count").with_uid(run_id.as_str())))
                .await;
            dispatcher.dispatch(Document::Stop(StopDoc::success(&run_id))).await;
        }
        assert!(dispatcher.workers.is_empty());

        tokio::time::timeout(Duration::from_secs(5), async {
            while !dispatcher.retiring.iter().all(|h| h.is_finished()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Any later document reaps them
        dispatcher.dispatch(Document::Stop(StopDoc::success("unknown"))).await;
        assert!(dispatcher.retiring.is_empty());
    }

    #[tokio::test]
    async fn test_service_drain_and_shutdown() {
        let store = store();
        let service = BridgeService::spawn(store.clone(), ScanDefaults::default(), 8, 4);
        let handle = service.handle();

        let start = StartDoc::new("count").with_uid("r1");
        let desc = DescriptorDoc::new("r1", "primary").with_data_key("det1", DataKey::number("sim"));
        let desc_uid = desc.uid.clone();
        handle.submit(Document::Start(start)).await.unwrap();
        handle.submit(Document::Descriptor(desc)).await.unwrap();
        for i in 0..20 {
            let event = EventDoc::new(&desc_uid, i + 1).with_datum("det1", i as f64);
            handle.submit(Document::Event(event)).await.unwrap();
        }
        handle.drain().await.unwrap();

        let stats = handle.stats();
        assert_eq!(stats.scans_opened, 1);
        assert_eq!(stats.samples, 40);
        assert_eq!(store.channel(&StreamKey::new("r1", "det1")).unwrap().progress().written, 20);

        drop(handle);
        service.shutdown().await;
    }
}
