//! File-backed archive: one append-only segment file per channel.
//!
//! Layout under the archive root:
//!
//! ```text
//! <root>/<run id>/_manifest.json
//! <root>/<run id>/<channel>.seg
//! ```
//!
//! Path components are percent-escaped. A segment starts with a 5 byte header
//! (magic + version) followed by records:
//!
//! ```text
//! [length: 4 bytes LE][sample: N bytes bincode][crc32: 4 bytes LE]
//! ```
//!
//! The offset index is rebuilt when a segment is first opened. A record that
//! fails its length, checksum or decode check ends the valid prefix and the file
//! is truncated there.

use bridge_core::{Sample, StorageError, StreamKey};
use crc32fast::Hasher;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::archive::{check_bounds, unarchived_tail, ArchiveBackend, ScanManifest};

/// Magic bytes identifying a segment file.
pub const SEGMENT_MAGIC: [u8; 4] = *b"BBSG";
const SEGMENT_VERSION: u8 = 1;
const HEADER_LEN: u64 = 5;
const MANIFEST_FILE: &str = "_manifest.json";
const SEGMENT_EXT: &str = "seg";

/// Reject records larger than this (64 MB) as corrupt framing.
const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Encode one framed record.
pub fn encode_record(sample: &Sample) -> Result<Vec<u8>, StorageError> {
    let data = bincode::serialize(sample).map_err(|e| StorageError::Codec(e.to_string()))?;
    let mut hasher = Hasher::new();
    hasher.update(&data);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(4 + data.len() + 4);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Decode one framed record. `Ok(None)` means a clean end of file.
fn decode_record(reader: &mut impl Read) -> Result<Option<(Sample, u64)>, String> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.to_string()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_RECORD_SIZE {
        return Err(format!("record length {} exceeds maximum", len));
    }

    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .map_err(|e| format!("truncated record body: {}", e))?;
    let mut crc_bytes = [0u8; 4];
    reader
        .read_exact(&mut crc_bytes)
        .map_err(|e| format!("truncated record checksum: {}", e))?;

    let stored = u32::from_le_bytes(crc_bytes);
    let mut hasher = Hasher::new();
    hasher.update(&data);
    let computed = hasher.finalize();
    if stored != computed {
        return Err(format!(
            "CRC mismatch: stored={:08x}, computed={:08x}",
            stored, computed
        ));
    }

    let sample: Sample =
        bincode::deserialize(&data).map_err(|e| format!("decode failed: {}", e))?;
    Ok(Some((sample, (4 + len + 4) as u64)))
}

/// Percent-escape a name into a single safe path component.
fn escape_component(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// One open segment with its offset index.
#[derive(Debug)]
struct Segment {
    path: PathBuf,
    file: File,
    /// Byte offset of record `i`
    offsets: Vec<u64>,
    /// Byte offset where the next record goes
    end: u64,
}

impl Segment {
    fn open(path: PathBuf) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.metadata()?.len() < HEADER_LEN {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&SEGMENT_MAGIC)?;
            file.write_all(&[SEGMENT_VERSION])?;
            return Ok(Self {
                path,
                file,
                offsets: Vec::new(),
                end: HEADER_LEN,
            });
        }

        file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        if header[..4] != SEGMENT_MAGIC || header[4] != SEGMENT_VERSION {
            return Err(StorageError::Corrupted {
                path: path.display().to_string(),
                offset: 0,
                reason: format!("bad segment header {:?}", header),
            });
        }

        let mut offsets = Vec::new();
        let mut pos = HEADER_LEN;
        let mut expected_seq = 0u64;
        {
            let mut reader = BufReader::new(&file);
            loop {
                match decode_record(&mut reader) {
                    Ok(None) => break,
                    Ok(Some((sample, size))) if sample.seq == expected_seq => {
                        offsets.push(pos);
                        pos += size;
                        expected_seq += 1;
                    }
                    Ok(Some((sample, _))) => {
                        warn!(
                            path = %path.display(),
                            offset = pos,
                            expected_seq,
                            found_seq = sample.seq,
                            "Out-of-order record in segment, truncating"
                        );
                        break;
                    }
                    Err(reason) => {
                        warn!(
                            path = %path.display(),
                            offset = pos,
                            %reason,
                            "Corrupted segment tail, truncating"
                        );
                        break;
                    }
                }
            }
        }

        if file.metadata()?.len() > pos {
            file.set_len(pos)?;
        }
        debug!(path = %path.display(), records = offsets.len(), "Opened segment");
        Ok(Self {
            path,
            file,
            offsets,
            end: pos,
        })
    }

    fn len(&self) -> u64 {
        self.offsets.len() as u64
    }

    fn append(&mut self, samples: &[Sample]) -> Result<(), StorageError> {
        if samples.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.end))?;
        let mut writer = BufWriter::new(&self.file);
        let mut new_offsets = Vec::with_capacity(samples.len());
        let mut pos = self.end;
        for sample in samples {
            let record = encode_record(sample)?;
            writer.write_all(&record)?;
            new_offsets.push(pos);
            pos += record.len() as u64;
        }
        writer.flush()?;
        drop(writer);

        self.offsets.extend(new_offsets);
        self.end = pos;
        Ok(())
    }

    fn read_plan(&self, range: Range<u64>) -> ReadPlan {
        ReadPlan::new(&self.path, &self.offsets, self.end, range)
    }

    /// Sync and split off the offset index. The file closes with the last
    /// reference to the segment.
    fn seal(&self) -> Result<SealedSegment, StorageError> {
        self.file.sync_data()?;
        Ok(SealedSegment {
            path: self.path.clone(),
            offsets: self.offsets.clone(),
            end: self.end,
        })
    }
}

/// Offset index of a segment that takes no more appends. Holds no file handle.
#[derive(Debug)]
struct SealedSegment {
    path: PathBuf,
    offsets: Vec<u64>,
    end: u64,
}

impl SealedSegment {
    fn len(&self) -> u64 {
        self.offsets.len() as u64
    }

    fn read_plan(&self, range: Range<u64>) -> ReadPlan {
        ReadPlan::new(&self.path, &self.offsets, self.end, range)
    }
}

/// Byte span of a record range, resolved under the segment lock and decoded
/// after it is released through a separate read-only handle.
///
/// Records below the segment end are never rewritten, so the span stays valid
/// while appends continue.
#[derive(Debug)]
struct ReadPlan {
    path: PathBuf,
    range: Range<u64>,
    /// Byte offset of each record in `range`, plus the end of the last one
    offsets: Vec<u64>,
}

impl ReadPlan {
    fn new(path: &Path, offsets: &[u64], end: u64, range: Range<u64>) -> Self {
        let lo = (range.start as usize).min(offsets.len());
        let hi = (range.end as usize).min(offsets.len());
        let mut span = offsets[lo..hi].to_vec();
        if hi > lo {
            span.push(offsets.get(hi).copied().unwrap_or(end));
        }
        Self {
            path: path.to_path_buf(),
            range,
            offsets: span,
        }
    }

    fn execute(self) -> Result<Vec<Sample>, StorageError> {
        let (Some(&start), Some(&end)) = (self.offsets.first(), self.offsets.last()) else {
            return Ok(Vec::new());
        };
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(start))?;
        let mut bytes = vec![0u8; (end - start) as usize];
        file.read_exact(&mut bytes)?;

        let mut reader = bytes.as_slice();
        let mut out = Vec::with_capacity((self.range.end - self.range.start) as usize);
        for (seq, offset) in self.range.clone().zip(&self.offsets) {
            match decode_record(&mut reader) {
                Ok(Some((sample, _))) if sample.seq == seq => out.push(sample),
                Ok(_) => {
                    return Err(StorageError::Corrupted {
                        path: self.path.display().to_string(),
                        offset: *offset,
                        reason: format!("record {} missing or out of order", seq),
                    })
                }
                Err(reason) => {
                    return Err(StorageError::Corrupted {
                        path: self.path.display().to_string(),
                        offset: *offset,
                        reason,
                    })
                }
            }
        }
        Ok(out)
    }
}

/// Archive that keeps one segment file per channel under a root directory.
///
/// Channels still being written keep their segment file open. Released
/// channels keep only their offset index.
#[derive(Debug)]
pub struct FileArchive {
    root: PathBuf,
    segments: Mutex<HashMap<StreamKey, Arc<Mutex<Segment>>>>,
    sealed: RwLock<HashMap<StreamKey, Arc<SealedSegment>>>,
}

impl FileArchive {
    /// Open (or create) an archive rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            segments: Mutex::new(HashMap::new()),
            sealed: RwLock::new(HashMap::new()),
        })
    }

    /// Archive root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of segments currently holding an open file
    pub fn open_segments(&self) -> usize {
        self.segments.lock().len()
    }

    /// Directory of one scan
    fn scan_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(escape_component(run_id))
    }

    /// Segment file path of one channel
    pub fn segment_path(&self, key: &StreamKey) -> PathBuf {
        self.scan_dir(&key.run_id)
            .join(format!("{}.{}", escape_component(&key.channel), SEGMENT_EXT))
    }

    fn segment(&self, key: &StreamKey) -> Result<Arc<Mutex<Segment>>, StorageError> {
        let mut segments = self.segments.lock();
        if let Some(segment) = segments.get(key) {
            return Ok(Arc::clone(segment));
        }
        let segment = Arc::new(Mutex::new(Segment::open(self.segment_path(key))?));
        self.sealed.write().remove(key);
        segments.insert(key.clone(), Arc::clone(&segment));
        Ok(segment)
    }

    fn sealed(&self, key: &StreamKey) -> Option<Arc<SealedSegment>> {
        self.sealed.read().get(key).cloned()
    }

    fn has_segment(&self, key: &StreamKey) -> bool {
        self.segments.lock().contains_key(key) || self.segment_path(key).exists()
    }
}

impl ArchiveBackend for FileArchive {
    fn append(&self, key: &StreamKey, samples: &[Sample]) -> Result<u64, StorageError> {
        let segment = self.segment(key)?;
        let mut segment = segment.lock();
        let tail = unarchived_tail(key, segment.len(), samples)?;
        segment.append(tail)?;
        Ok(segment.len())
    }

    fn read(&self, key: &StreamKey, range: Range<u64>) -> Result<Vec<Sample>, StorageError> {
        let plan = if let Some(sealed) = self.sealed(key) {
            check_bounds(key, &range, sealed.len())?;
            sealed.read_plan(range)
        } else if self.has_segment(key) {
            let segment = self.segment(key)?;
            let segment = segment.lock();
            check_bounds(key, &range, segment.len())?;
            segment.read_plan(range)
        } else {
            check_bounds(key, &range, 0)?;
            return Ok(Vec::new());
        };
        plan.execute()
    }

    fn len(&self, key: &StreamKey) -> Result<u64, StorageError> {
        if let Some(sealed) = self.sealed(key) {
            return Ok(sealed.len());
        }
        if !self.has_segment(key) {
            return Ok(0);
        }
        Ok(self.segment(key)?.lock().len())
    }

    fn release(&self, key: &StreamKey) -> Result<(), StorageError> {
        let Some(segment) = self.segments.lock().remove(key) else {
            return Ok(());
        };
        let sealed = segment.lock().seal()?;
        debug!(key = %key, records = sealed.len(), "Released segment");
        self.sealed.write().insert(key.clone(), Arc::new(sealed));
        Ok(())
    }

    fn put_manifest(&self, manifest: &ScanManifest) -> Result<(), StorageError> {
        let dir = self.scan_dir(&manifest.run_id);
        fs::create_dir_all(&dir)?;
        let bytes = serde_json::to_vec_pretty(manifest)
            .map_err(|e| StorageError::Codec(e.to_string()))?;

        // Write-then-rename
        let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, dir.join(MANIFEST_FILE))?;
        Ok(())
    }

    fn manifests(&self) -> Result<Vec<ScanManifest>, StorageError> {
        let mut all = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path().join(MANIFEST_FILE);
            if !path.is_file() {
                continue;
            }
            let bytes = fs::read(&path)?;
            match serde_json::from_slice::<ScanManifest>(&bytes) {
                Ok(manifest) => all.push(manifest),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable scan manifest"),
            }
        }
        all.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(all)
    }

    fn sync(&self) -> Result<(), StorageError> {
        let segments: Vec<_> = self.segments.lock().values().cloned().collect();
        for segment in segments {
            segment.lock().file.sync_data()?;
        }
        Ok(())
    }
}
