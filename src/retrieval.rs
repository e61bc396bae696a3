//! Read access to scans, independent of which tier holds the samples.
//!
//! A read names a channel and an index range. What happens when the range is
//! not fully written yet depends on the caller:
//!
//! | scan   | range            | `Wait`                    | `NoWait`          |
//! |--------|------------------|---------------------------|-------------------|
//! | any    | within written   | samples                   | samples           |
//! | Active | past written     | block until written       | `NotYetAvailable` |
//! | Closed | past final index | `Range` error             | `Range` error     |
//!
//! Blocking reads take a [`CancellationToken`] and return
//! [`ReadResult::Cancelled`] as soon as it fires.

use bridge_core::{
    BridgeError, BridgeResult, ChannelSchema, Sample, ScanInfo, ScanState, StreamKey,
};
use bridge_storage::{ChannelProgress, StoreRead, StreamStore};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Caller intent for ranges an Active scan has not written yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Streaming: block until available
    Wait,
    /// One-shot: answer immediately
    #[default]
    NoWait,
}

/// Outcome of a read that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadResult {
    /// All requested samples, in index order
    Ready(Vec<Sample>),
    /// The scan is Active and has not reached the end of the range
    NotYetAvailable {
        /// Samples written when the read returned
        written: u64,
    },
    /// The blocking read was cancelled
    Cancelled,
}

/// One line of a scan listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    /// Run id
    pub run_id: String,
    /// Scan name (plan name)
    pub name: String,
    /// Scan number
    pub scan_nb: i64,
    /// Lifecycle state
    pub state: ScanState,
    /// Number of channels
    pub channels: usize,
}

/// Channel schema with its current progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelView {
    /// Schema fixed at creation
    pub schema: ChannelSchema,
    /// Samples written
    pub written: u64,
    /// `written` is final
    pub closed: bool,
}

/// Run a store read on the blocking pool; ranges below the ring hit archive files.
async fn off_runtime<T, F>(store: &Arc<StreamStore>, read: F) -> BridgeResult<T>
where
    F: FnOnce(&StreamStore) -> BridgeResult<T> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || read(&store))
        .await
        .map_err(|e| BridgeError::Io(e.into()))?
}

/// Read-only view of the stream store.
#[derive(Debug, Clone)]
pub struct RetrievalFacade {
    store: Arc<StreamStore>,
}

impl RetrievalFacade {
    /// Facade over `store`
    pub fn new(store: Arc<StreamStore>) -> Self {
        Self { store }
    }

    /// Read `range` of a channel.
    pub async fn read(
        &self,
        run_id: &str,
        channel: &str,
        range: Range<u64>,
        mode: ReadMode,
        cancel: &CancellationToken,
    ) -> BridgeResult<ReadResult> {
        let key = StreamKey::new(run_id, channel);
        let stream = self.store.channel(&key)?;
        // Subscribe before the first check so no append slips between the two
        let mut progress = stream.subscribe();

        loop {
            let (read_key, read_range) = (key.clone(), range.clone());
            let read = off_runtime(&self.store, move |store| store.read(&read_key, read_range)).await?;
            match read {
                StoreRead::Samples(samples) => return Ok(ReadResult::Ready(samples)),
                StoreRead::Pending { written } => {
                    if mode == ReadMode::NoWait {
                        return Ok(ReadResult::NotYetAvailable { written });
                    }
                    trace!(%key, written, end = range.end, "Waiting for samples");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(ReadResult::Cancelled),
                        changed = progress.changed() => {
                            if changed.is_err() {
                                return Ok(ReadResult::NotYetAvailable { written });
                            }
                        }
                    }
                }
            }
        }
    }

    /// Scan metadata
    pub fn scan_info(&self, run_id: &str) -> BridgeResult<ScanInfo> {
        Ok(self.store.scan(run_id)?.info())
    }

    /// Scan lifecycle state
    pub fn scan_state(&self, run_id: &str) -> BridgeResult<ScanState> {
        Ok(self.store.scan(run_id)?.state())
    }

    /// Every known scan, sorted by run id
    pub fn list_scans(&self) -> Vec<ScanSummary> {
        self.store
            .scans()
            .iter()
            .map(|scan| {
                let info = scan.info();
                ScanSummary {
                    run_id: scan.run_id().to_string(),
                    name: info.name,
                    scan_nb: info.scan_nb,
                    state: scan.state(),
                    channels: scan.channels().len(),
                }
            })
            .collect()
    }

    /// Channels of a scan in creation order
    pub fn channels(&self, run_id: &str) -> BridgeResult<Vec<ChannelView>> {
        Ok(self
            .store
            .scan(run_id)?
            .channels()
            .iter()
            .map(|channel| {
                let ChannelProgress { written, closed } = channel.progress();
                ChannelView {
                    schema: channel.schema().clone(),
                    written,
                    closed,
                }
            })
            .collect())
    }

    /// Sequential reader over one channel, starting at index 0.
    pub fn cursor(&self, run_id: &str, channel: &str) -> BridgeResult<StreamCursor> {
        let key = StreamKey::new(run_id, channel);
        self.store.channel(&key)?;
        Ok(StreamCursor {
            store: Arc::clone(&self.store),
            key,
            position: 0,
        })
    }
}

/// Follows one channel from a position.
///
/// [`fetch`](Self::fetch) does not move the cursor; the caller
/// [`acknowledge`](Self::acknowledge)s what it consumed, so a fetch that is
/// dropped halfway loses nothing.
#[derive(Debug)]
pub struct StreamCursor {
    store: Arc<StreamStore>,
    key: StreamKey,
    position: u64,
}

impl StreamCursor {
    /// Index of the next unconsumed sample
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Up to `max` samples from the current position.
    ///
    /// With `Wait`, blocks until at least one sample is available or the
    /// channel is closed. `Ready` with no samples means the channel is
    /// closed and fully consumed.
    pub async fn fetch(
        &self,
        max: usize,
        mode: ReadMode,
        cancel: &CancellationToken,
    ) -> BridgeResult<ReadResult> {
        let channel = self.store.channel(&self.key)?;
        let mut rx = channel.subscribe();
        loop {
            let progress = *rx.borrow_and_update();
            if progress.written > self.position {
                let end = progress.written.min(self.position + max.max(1) as u64);
                let (reading, range) = (Arc::clone(&channel), self.position..end);
                let samples =
                    off_runtime(&self.store, move |store| store.read_written(&reading, range)).await?;
                return Ok(ReadResult::Ready(samples));
            }
            if progress.closed {
                return Ok(ReadResult::Ready(Vec::new()));
            }
            if mode == ReadMode::NoWait {
                return Ok(ReadResult::NotYetAvailable {
                    written: progress.written,
                });
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(ReadResult::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(ReadResult::NotYetAvailable { written: progress.written });
                    }
                }
            }
        }
    }

    /// Mark `count` fetched samples as consumed.
    pub fn acknowledge(&mut self, count: usize) {
        self.position += count as u64;
    }

    /// Whether the channel is closed and every sample was acknowledged
    pub fn is_finished(&self) -> BridgeResult<bool> {
        let progress = self.store.channel(&self.key)?.progress();
        Ok(progress.closed && self.position >= progress.written)
    }
}
