//! Archival storage capability.
//!
//! The stream store only needs an append-capable, randomly readable backend
//! addressed by `(run id, channel, index range)`, plus a place to keep each
//! scan's manifest so scans can be reopened after a restart.

use bridge_core::{ChannelSchema, Sample, ScanInfo, ScanState, StorageError, StreamKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

/// Persistent description of one scan: lifecycle, channel schemas and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanManifest {
    /// Run id
    pub run_id: String,
    /// Lifecycle state
    pub state: ScanState,
    /// Channel schemas in creation order
    pub channels: Vec<ChannelSchema>,
    /// Scan metadata
    pub info: ScanInfo,
}

/// Append-capable, randomly readable sample storage.
///
/// Every channel stream is a contiguous sequence `0..len`. Appends must start at
/// or below the current length; the overlapping prefix is skipped so a retried
/// flush is harmless.
pub trait ArchiveBackend: Send + Sync + std::fmt::Debug {
    /// Append `samples` (contiguous, ascending) and return the new length.
    fn append(&self, key: &StreamKey, samples: &[Sample]) -> Result<u64, StorageError>;

    /// Read `range`, which must lie within `0..len`.
    fn read(&self, key: &StreamKey, range: Range<u64>) -> Result<Vec<Sample>, StorageError>;

    /// Number of archived samples (0 for unknown keys).
    fn len(&self, key: &StreamKey) -> Result<u64, StorageError>;

    /// Store or replace a scan manifest.
    fn put_manifest(&self, manifest: &ScanManifest) -> Result<(), StorageError>;

    /// All stored manifests.
    fn manifests(&self) -> Result<Vec<ScanManifest>, StorageError>;

    /// Make previous appends durable.
    fn sync(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// The stream will not be appended to again. Backends may drop per-stream
    /// write state; reads and `len` must keep working.
    fn release(&self, _key: &StreamKey) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Skip the part of `samples` already archived and check the rest continues at `len`.
pub(crate) fn unarchived_tail<'a>(
    key: &StreamKey,
    len: u64,
    samples: &'a [Sample],
) -> Result<&'a [Sample], StorageError> {
    let Some(first) = samples.first() else {
        return Ok(samples);
    };
    if first.seq > len {
        return Err(StorageError::NonContiguous {
            key: key.to_string(),
            expected: len,
            got: first.seq,
        });
    }
    let skip = ((len - first.seq) as usize).min(samples.len());
    Ok(&samples[skip..])
}

pub(crate) fn check_bounds(key: &StreamKey, range: &Range<u64>, len: u64) -> Result<(), StorageError> {
    if range.start > range.end || range.end > len {
        return Err(StorageError::OutOfBounds {
            key: key.to_string(),
            start: range.start,
            end: range.end,
            len,
        });
    }
    Ok(())
}

/// One stream of a [`MemoryArchive`]: immutable chunks, one per append.
///
/// Readers clone the `Arc`s of the chunks they need and copy after the lock
/// is gone, so a large read never holds up an append.
#[derive(Debug, Default)]
struct ChunkedStream {
    /// First sequence number of each chunk
    starts: Vec<u64>,
    chunks: Vec<Arc<[Sample]>>,
    len: u64,
}

impl ChunkedStream {
    fn push(&mut self, samples: &[Sample]) {
        if samples.is_empty() {
            return;
        }
        self.starts.push(self.len);
        self.chunks.push(Arc::from(samples));
        self.len += samples.len() as u64;
    }

    fn view(&self, range: Range<u64>) -> ChunkView {
        let first = self.starts.partition_point(|&start| start <= range.start).saturating_sub(1);
        let mut parts = Vec::new();
        for (start, chunk) in self.starts[first..].iter().zip(&self.chunks[first..]) {
            if *start >= range.end {
                break;
            }
            parts.push((*start, Arc::clone(chunk)));
        }
        ChunkView { range, parts }
    }
}

/// Chunks covering a read range, detached from the archive lock.
#[derive(Debug)]
struct ChunkView {
    range: Range<u64>,
    parts: Vec<(u64, Arc<[Sample]>)>,
}

impl ChunkView {
    fn copy_out(self) -> Vec<Sample> {
        let mut out = Vec::with_capacity((self.range.end - self.range.start) as usize);
        for (start, chunk) in &self.parts {
            let lo = self.range.start.saturating_sub(*start) as usize;
            let hi = ((self.range.end - start) as usize).min(chunk.len());
            if lo < hi {
                out.extend_from_slice(&chunk[lo..hi]);
            }
        }
        out
    }
}

/// In-process archive. Contents are lost with the process.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    streams: RwLock<HashMap<StreamKey, ChunkedStream>>,
    manifests: RwLock<HashMap<String, ScanManifest>>,
}

impl MemoryArchive {
    /// Create an empty archive
    pub fn new() -> Self {
        Self::default()
    }

    fn view(&self, key: &StreamKey, range: Range<u64>) -> Result<ChunkView, StorageError> {
        let streams = self.streams.read();
        let len = streams.get(key).map(|s| s.len).unwrap_or(0);
        check_bounds(key, &range, len)?;
        Ok(match streams.get(key) {
            Some(stream) => stream.view(range),
            None => ChunkView {
                range,
                parts: Vec::new(),
            },
        })
    }
}

impl ArchiveBackend for MemoryArchive {
    fn append(&self, key: &StreamKey, samples: &[Sample]) -> Result<u64, StorageError> {
        let mut streams = self.streams.write();
        let stream = streams.entry(key.clone()).or_default();
        let tail = unarchived_tail(key, stream.len, samples)?;
        stream.push(tail);
        Ok(stream.len)
    }

    fn read(&self, key: &StreamKey, range: Range<u64>) -> Result<Vec<Sample>, StorageError> {
        Ok(self.view(key, range)?.copy_out())
    }

    fn len(&self, key: &StreamKey) -> Result<u64, StorageError> {
        Ok(self.streams.read().get(key).map(|s| s.len).unwrap_or(0))
    }

    fn put_manifest(&self, manifest: &ScanManifest) -> Result<(), StorageError> {
        self.manifests
            .write()
            .insert(manifest.run_id.clone(), manifest.clone());
        Ok(())
    }

    fn manifests(&self) -> Result<Vec<ScanManifest>, StorageError> {
        let mut all: Vec<ScanManifest> = self.manifests.read().values().cloned().collect();
        all.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::SampleValue;

    fn samples(range: Range<u64>) -> Vec<Sample> {
        range
            .map(|seq| Sample::new(seq, 0.0, SampleValue::Int(seq as i64)))
            .collect()
    }

    #[test]
    fn test_overlapping_append_is_skipped() {
        let archive = MemoryArchive::new();
        let key = StreamKey::new("r1", "det1");

        assert_eq!(archive.append(&key, &samples(0..3)).unwrap(), 3);
        assert_eq!(archive.append(&key, &samples(1..5)).unwrap(), 5);

        let read = archive.read(&key, 0..5).unwrap();
        assert_eq!(read.iter().map(|s| s.seq).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_gap_is_rejected() {
        let archive = MemoryArchive::new();
        let key = StreamKey::new("r1", "det1");
        archive.append(&key, &samples(0..2)).unwrap();

        let err = archive.append(&key, &samples(3..4)).unwrap_err();
        assert!(matches!(err, StorageError::NonContiguous { expected: 2, got: 3, .. }));
    }

    #[test]
    fn test_read_out_of_bounds() {
        let archive = MemoryArchive::new();
        let key = StreamKey::new("r1", "det1");
        archive.append(&key, &samples(0..2)).unwrap();

        assert!(matches!(
            archive.read(&key, 1..3),
            Err(StorageError::OutOfBounds { len: 2, .. })
        ));
        assert_eq!(archive.len(&StreamKey::new("r1", "other")).unwrap(), 0);
    }

    #[test]
    fn test_read_spans_chunks() {
        let archive = MemoryArchive::new();
        let key = StreamKey::new("r1", "det1");
        for chunk in [0..3, 3..4, 4..9] {
            archive.append(&key, &samples(chunk)).unwrap();
        }

        assert_eq!(archive.read(&key, 2..7).unwrap(), samples(2..7));
        assert_eq!(archive.read(&key, 3..4).unwrap(), samples(3..4));
        assert!(archive.read(&key, 5..5).unwrap().is_empty());
    }

    #[test]
    fn test_pending_read_does_not_hold_the_stream() {
        let archive = MemoryArchive::new();
        let key = StreamKey::new("r1", "det1");
        archive.append(&key, &samples(0..1000)).unwrap();

        // The view is taken; appends go ahead before it is copied out
        let view = archive.view(&key, 0..1000).unwrap();
        assert!(archive.streams.try_write().is_some());
        assert_eq!(archive.append(&key, &samples(1000..1010)).unwrap(), 1010);
        assert_eq!(view.copy_out(), samples(0..1000));
    }
}
