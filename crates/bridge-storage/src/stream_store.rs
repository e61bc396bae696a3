//! Tiered stream store: per-channel ring buffers in front of an archive.
//!
//! Every channel owns one logical index space `0..written`. The newest samples
//! live in a bounded [`SampleRing`]; everything older has been appended to the
//! [`ArchiveBackend`] before it left the ring. Reads resolve a range across
//! both tiers transparently.
//!
//! # Concurrency
//!
//! - Appends to one channel are serialized by that channel's append lock.
//! - Appends to different channels never contend.
//! - Readers take a short read lock on the tier and never wait on archive
//!   writes done by an append.
//! - Progress (`written`, `closed`) is published on a `watch` channel so
//!   blocking readers wake when new samples land.
//!
//! ```text
//!   append ──► [ ring: first_seq .. written ] ──(full)──► archive.append
//!                       ▲                                      ▲
//!   read(range) ────────┴──────────────(below first_seq)───────┘
//! ```

use bridge_core::{
    BridgeError, BridgeResult, ChannelSchema, Sample, ScanInfo, ScanOutcome, ScanState,
    StreamKey,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, trace, warn};

use crate::archive::{ArchiveBackend, ScanManifest};
use crate::ring_buffer::SampleRing;

/// Default ring capacity per channel (samples).
pub const DEFAULT_RING_CAPACITY: usize = 1024;

/// Published progress of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelProgress {
    /// Number of samples written (`0..written` are readable)
    pub written: u64,
    /// Set once the owning scan closed; `written` is then final
    pub closed: bool,
}

/// Result of a non-blocking read.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreRead {
    /// The whole range was available
    Samples(Vec<Sample>),
    /// The range extends past what an Active scan has written so far
    Pending {
        /// Samples written at the time of the read
        written: u64,
    },
}

#[derive(Debug)]
struct Tier {
    ring: SampleRing,
    /// Samples `0..archived` are durable in the archive
    archived: u64,
}

/// One channel of one scan.
#[derive(Debug)]
pub struct ChannelStream {
    key: StreamKey,
    schema: ChannelSchema,
    append_lock: Mutex<()>,
    tier: RwLock<Tier>,
    progress: watch::Sender<ChannelProgress>,
}

impl ChannelStream {
    fn new(key: StreamKey, schema: ChannelSchema, capacity: usize, start: u64, closed: bool) -> Self {
        let (progress, _) = watch::channel(ChannelProgress {
            written: start,
            closed,
        });
        Self {
            key,
            schema,
            append_lock: Mutex::new(()),
            tier: RwLock::new(Tier {
                ring: SampleRing::starting_at(capacity, start),
                archived: start,
            }),
            progress,
        }
    }

    /// Stream key
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Immutable schema
    pub fn schema(&self) -> &ChannelSchema {
        &self.schema
    }

    /// Current progress snapshot
    pub fn progress(&self) -> ChannelProgress {
        *self.progress.borrow()
    }

    /// Watch progress changes
    pub fn subscribe(&self) -> watch::Receiver<ChannelProgress> {
        self.progress.subscribe()
    }

    /// Number of samples already durable in the archive
    pub fn archived(&self) -> u64 {
        self.tier.read().archived
    }

    /// Samples currently held in memory
    pub fn cached(&self) -> usize {
        self.tier.read().ring.len()
    }

    /// Drop the in-memory window once everything is archived; reads then go
    /// to the archive. Caller holds the append lock.
    fn release_ring(&self) -> bool {
        let mut tier = self.tier.write();
        let archived = tier.archived;
        if tier.ring.next_seq() > archived {
            return false;
        }
        tier.ring.release(archived);
        true
    }

    /// Archive `archived..written`. Caller holds the append lock.
    fn flush_locked(&self, archive: &dyn ArchiveBackend) -> BridgeResult<u64> {
        let (pending, archived) = {
            let tier = self.tier.read();
            let span = tier.ring.span();
            (tier.ring.read(tier.archived..span.end), tier.archived)
        };
        if pending.is_empty() {
            return Ok(0);
        }
        let new_len = archive.append(&self.key, &pending)?;
        let flushed = new_len.saturating_sub(archived);
        self.tier.write().archived = new_len;
        trace!(key = %self.key, flushed, archived = new_len, "Flushed ring tail");
        Ok(flushed)
    }
}

/// One scan: lifecycle, metadata and channels.
#[derive(Debug)]
pub struct ScanStream {
    run_id: String,
    state: RwLock<ScanState>,
    info: RwLock<ScanInfo>,
    channels: RwLock<HashMap<String, Arc<ChannelStream>>>,
    /// Channel names in creation order
    order: RwLock<Vec<String>>,
    manifest_lock: Mutex<()>,
}

impl ScanStream {
    /// Run id
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Lifecycle state
    pub fn state(&self) -> ScanState {
        self.state.read().clone()
    }

    /// Metadata snapshot
    pub fn info(&self) -> ScanInfo {
        self.info.read().clone()
    }

    /// Channel by name
    pub fn channel(&self, name: &str) -> Option<Arc<ChannelStream>> {
        self.channels.read().get(name).cloned()
    }

    /// Channels in creation order
    pub fn channels(&self) -> Vec<Arc<ChannelStream>> {
        let channels = self.channels.read();
        self.order
            .read()
            .iter()
            .filter_map(|name| channels.get(name).cloned())
            .collect()
    }

    fn manifest(&self) -> ScanManifest {
        ScanManifest {
            run_id: self.run_id.clone(),
            state: self.state(),
            channels: self
                .channels()
                .iter()
                .map(|c| c.schema.clone())
                .collect(),
            info: self.info(),
        }
    }
}

/// Keys whose channels received samples since the last drain.
///
/// Single consumer: the relay pump.
#[derive(Debug, Default)]
pub struct ChangeFeed {
    pending: Mutex<(Vec<StreamKey>, HashSet<StreamKey>)>,
    notify: Notify,
}

impl ChangeFeed {
    fn mark(&self, key: &StreamKey) {
        let mut pending = self.pending.lock();
        if pending.1.insert(key.clone()) {
            pending.0.push(key.clone());
        }
        drop(pending);
        self.notify.notify_one();
    }

    /// Take all changed keys, in first-change order.
    pub fn drain(&self) -> Vec<StreamKey> {
        let mut pending = self.pending.lock();
        pending.1.clear();
        std::mem::take(&mut pending.0)
    }

    /// Wait until at least one key changed since the last drain.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

/// The single shared-mutation point of the bridge.
#[derive(Debug)]
pub struct StreamStore {
    archive: Arc<dyn ArchiveBackend>,
    ring_capacity: usize,
    scans: RwLock<HashMap<String, Arc<ScanStream>>>,
    changes: ChangeFeed,
}

impl StreamStore {
    /// Create an empty store over `archive`.
    pub fn new(archive: Arc<dyn ArchiveBackend>, ring_capacity: usize) -> Self {
        Self {
            archive,
            ring_capacity: ring_capacity.max(1),
            scans: RwLock::new(HashMap::new()),
            changes: ChangeFeed::default(),
        }
    }

    /// Create a store and reload every scan the archive has a manifest for.
    ///
    /// Scans that were still Active when the previous process stopped are
    /// closed with a failed outcome; their archived samples stay readable.
    pub fn open(archive: Arc<dyn ArchiveBackend>, ring_capacity: usize) -> BridgeResult<Self> {
        let store = Self::new(archive, ring_capacity);
        for mut manifest in store.archive.manifests()? {
            let interrupted = manifest.state.is_active();
            if interrupted {
                let reason = "bridge restarted before the scan stopped";
                warn!(run_id = %manifest.run_id, "Closing interrupted scan");
                manifest.state = ScanState::Closed {
                    outcome: ScanOutcome::Failed,
                    reason: reason.to_string(),
                };
                let events = manifest
                    .channels
                    .first()
                    .map(|c| store.archive.len(&StreamKey::new(manifest.run_id.clone(), c.name.clone())))
                    .transpose()?
                    .unwrap_or(0);
                manifest.info.fail(bridge_core::experiment::now_secs(), events, reason);
            }

            let mut channels = HashMap::new();
            let mut order = Vec::new();
            for schema in &manifest.channels {
                let key = StreamKey::new(manifest.run_id.clone(), schema.name.clone());
                let len = store.archive.len(&key)?;
                store.archive.release(&key)?;
                let channel =
                    ChannelStream::new(key, schema.clone(), store.ring_capacity, len, true);
                order.push(schema.name.clone());
                channels.insert(schema.name.clone(), Arc::new(channel));
            }

            let scan = Arc::new(ScanStream {
                run_id: manifest.run_id.clone(),
                state: RwLock::new(manifest.state.clone()),
                info: RwLock::new(manifest.info.clone()),
                channels: RwLock::new(channels),
                order: RwLock::new(order),
                manifest_lock: Mutex::new(()),
            });
            if interrupted {
                store.archive.put_manifest(&manifest)?;
            }
            debug!(run_id = %scan.run_id, channels = manifest.channels.len(), "Recovered scan");
            store.scans.write().insert(manifest.run_id, scan);
        }
        Ok(store)
    }

    /// Change feed for live fan-out
    pub fn changes(&self) -> &ChangeFeed {
        &self.changes
    }

    /// Ring capacity per channel
    pub fn ring_capacity(&self) -> usize {
        self.ring_capacity
    }

    /// Open a new Active scan.
    pub fn open_scan(&self, info: ScanInfo) -> BridgeResult<Arc<ScanStream>> {
        let run_id = info.uid.clone();
        let scan = {
            let mut scans = self.scans.write();
            if scans.contains_key(&run_id) {
                return Err(BridgeError::sequence(run_id, "scan already exists"));
            }
            let scan = Arc::new(ScanStream {
                run_id: run_id.clone(),
                state: RwLock::new(ScanState::Active),
                info: RwLock::new(info),
                channels: RwLock::new(HashMap::new()),
                order: RwLock::new(Vec::new()),
                manifest_lock: Mutex::new(()),
            });
            scans.insert(run_id.clone(), Arc::clone(&scan));
            scan
        };
        self.persist_manifest(&scan)?;
        info!(run_id = %run_id, "Scan opened");
        Ok(scan)
    }

    /// Scan by run id
    pub fn scan(&self, run_id: &str) -> BridgeResult<Arc<ScanStream>> {
        self.scans
            .read()
            .get(run_id)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownScan(run_id.to_string()))
    }

    /// All scans, sorted by run id
    pub fn scans(&self) -> Vec<Arc<ScanStream>> {
        let mut all: Vec<_> = self.scans.read().values().cloned().collect();
        all.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        all
    }

    /// Channel by key
    pub fn channel(&self, key: &StreamKey) -> BridgeResult<Arc<ChannelStream>> {
        self.scan(&key.run_id)?
            .channel(&key.channel)
            .ok_or_else(|| BridgeError::UnknownChannel {
                run_id: key.run_id.clone(),
                channel: key.channel.clone(),
            })
    }

    /// Create a channel on an Active scan.
    ///
    /// Redefining an existing channel with the same dtype and shape returns the
    /// existing channel; anything else is a `SchemaConflict`.
    pub fn create_channel(
        &self,
        run_id: &str,
        schema: ChannelSchema,
    ) -> BridgeResult<Arc<ChannelStream>> {
        let scan = self.scan(run_id)?;
        let state = scan.state.read();
        if !state.is_active() {
            return Err(BridgeError::ScanClosed(run_id.to_string()));
        }

        let channel = {
            let mut channels = scan.channels.write();
            if let Some(existing) = channels.get(&schema.name) {
                if existing.schema.is_compatible(&schema) {
                    return Ok(Arc::clone(existing));
                }
                return Err(BridgeError::SchemaConflict {
                    run_id: run_id.to_string(),
                    channel: schema.name.clone(),
                    existing: existing.schema.describe(),
                    requested: schema.describe(),
                });
            }
            let key = StreamKey::new(run_id, schema.name.clone());
            let channel = Arc::new(ChannelStream::new(
                key,
                schema.clone(),
                self.ring_capacity,
                0,
                false,
            ));
            channels.insert(schema.name.clone(), Arc::clone(&channel));
            scan.order.write().push(schema.name.clone());
            channel
        };
        drop(state);

        scan.info.write().add_channel(&schema);
        self.persist_manifest(&scan)?;
        debug!(
            run_id = %run_id,
            channel = %schema.name,
            dtype = %schema.dtype,
            shape = ?schema.shape,
            "Channel created"
        );
        Ok(channel)
    }

    /// Append one sample to a channel of an Active scan.
    ///
    /// `sample.seq` must equal the channel's current length. When the ring is
    /// full, its unarchived samples are archived before the oldest is evicted.
    pub fn append(&self, key: &StreamKey, sample: Sample) -> BridgeResult<u64> {
        let scan = self.scan(&key.run_id)?;
        let channel = scan
            .channel(&key.channel)
            .ok_or_else(|| BridgeError::UnknownChannel {
                run_id: key.run_id.clone(),
                channel: key.channel.clone(),
            })?;

        let _guard = channel.append_lock.lock();
        if !scan.state.read().is_active() {
            return Err(BridgeError::ScanClosed(key.run_id.clone()));
        }

        let expected = channel.tier.read().ring.next_seq();
        if sample.seq != expected {
            return Err(BridgeError::sequence(
                key.run_id.clone(),
                format!(
                    "channel '{}' expected seq {}, got {}",
                    key.channel, expected, sample.seq
                ),
            ));
        }

        let needs_flush = {
            let tier = channel.tier.read();
            tier.ring.is_full() && tier.ring.first_seq() >= tier.archived
        };
        if needs_flush {
            channel.flush_locked(self.archive.as_ref())?;
        }

        let seq = sample.seq;
        {
            let mut tier = channel.tier.write();
            if tier.ring.is_full() {
                let upto = (tier.ring.first_seq() + 1).min(tier.archived);
                tier.ring.evict_until(upto);
            }
            tier.ring.push(sample);
        }
        channel.progress.send_modify(|p| p.written = seq + 1);
        self.changes.mark(key);
        trace!(run_id = %key.run_id, channel = %key.channel, seq, "Sample appended");
        Ok(seq)
    }

    /// Non-blocking read of `range`.
    ///
    /// Ranges past the end of an Active channel give `Pending`; past the final
    /// end of a closed channel give `Range`.
    pub fn read(&self, key: &StreamKey, range: Range<u64>) -> BridgeResult<StoreRead> {
        if range.start > range.end {
            return Err(BridgeError::InvalidRange {
                start: range.start,
                end: range.end,
            });
        }
        let channel = self.channel(key)?;
        let progress = channel.progress();
        if range.end > progress.written {
            if progress.closed {
                return Err(BridgeError::Range {
                    run_id: key.run_id.clone(),
                    channel: key.channel.clone(),
                    requested_end: range.end,
                    final_len: progress.written,
                });
            }
            return Ok(StoreRead::Pending {
                written: progress.written,
            });
        }
        self.read_written(&channel, range).map(StoreRead::Samples)
    }

    /// Read a range known to be below the channel's written count.
    pub fn read_written(&self, channel: &ChannelStream, range: Range<u64>) -> BridgeResult<Vec<Sample>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let (ring_part, ring_start) = {
            let tier = channel.tier.read();
            let ring_start = tier.ring.first_seq();
            (tier.ring.read(range.clone()), ring_start)
        };
        if range.start >= ring_start {
            return Ok(ring_part);
        }

        // Everything below the ring's window was archived before eviction
        let archived_end = range.end.min(ring_start);
        let mut samples = self.archive.read(&channel.key, range.start..archived_end)?;
        samples.extend(ring_part);
        Ok(samples)
    }

    /// Archive every ring's unarchived tail. Returns the number of samples written.
    pub fn flush_all(&self) -> BridgeResult<u64> {
        let mut total = 0;
        for scan in self.scans() {
            for channel in scan.channels() {
                let _guard = channel.append_lock.lock();
                total += channel.flush_locked(self.archive.as_ref())?;
            }
        }
        if total > 0 {
            self.archive.sync()?;
            debug!(samples = total, "Flushed stream store");
        }
        Ok(total)
    }

    /// Replace a scan's metadata in place.
    pub fn update_info(&self, run_id: &str, update: impl FnOnce(&mut ScanInfo)) -> BridgeResult<()> {
        let scan = self.scan(run_id)?;
        {
            let mut info = scan.info.write();
            update(&mut *info);
        }
        self.persist_manifest(&scan)
    }

    /// Close an Active scan. Happens exactly once; a second close is `ScanClosed`.
    ///
    /// Every channel is flushed to the archive and marked final.
    pub fn close_scan(&self, run_id: &str, outcome: ScanOutcome, reason: &str) -> BridgeResult<()> {
        let scan = self.scan(run_id)?;
        {
            let mut state = scan.state.write();
            if !state.is_active() {
                return Err(BridgeError::ScanClosed(run_id.to_string()));
            }
            *state = ScanState::Closed {
                outcome,
                reason: reason.to_string(),
            };
        }

        let mut flush_error = None;
        for channel in scan.channels() {
            let _guard = channel.append_lock.lock();
            if let Err(e) = channel.flush_locked(self.archive.as_ref()) {
                warn!(key = %channel.key, error = %e, "Flush on close failed");
                flush_error.get_or_insert(e);
            }
            channel.progress.send_modify(|p| p.closed = true);
        }
        self.archive.sync()?;
        self.persist_manifest(&scan)?;
        if flush_error.is_none() {
            self.release_closed(&scan)?;
        }
        info!(run_id = %run_id, %outcome, reason, "Scan closed");
        match flush_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Free rings and archive write state of a closed scan whose channels are
    /// fully archived.
    fn release_closed(&self, scan: &ScanStream) -> BridgeResult<()> {
        for channel in scan.channels() {
            let _guard = channel.append_lock.lock();
            if channel.release_ring() {
                self.archive.release(&channel.key)?;
            }
        }
        debug!(run_id = %scan.run_id, "Released closed scan");
        Ok(())
    }

    fn persist_manifest(&self, scan: &ScanStream) -> BridgeResult<()> {
        let _guard = scan.manifest_lock.lock();
        self.archive.put_manifest(&scan.manifest())?;
        Ok(())
    }
}
