//! `bridge-storage`
//!
//! Persistent, replayable channel streams for the bluesky bridge.
//!
//! - [`StreamStore`]: per-scan, per-channel streams with stable indices
//! - [`SampleRing`]: bounded in-memory tier
//! - [`ArchiveBackend`]: archival tier capability, with [`MemoryArchive`] and
//!   the segment-file based [`FileArchive`]

pub mod archive;
pub mod ring_buffer;
pub mod segment;
pub mod stream_store;

pub use archive::{ArchiveBackend, MemoryArchive, ScanManifest};
pub use ring_buffer::SampleRing;
pub use segment::FileArchive;
pub use stream_store::{
    ChangeFeed, ChannelProgress, ChannelStream, ScanStream, StoreRead, StreamStore,
    DEFAULT_RING_CAPACITY,
};
