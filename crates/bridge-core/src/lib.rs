//! `bridge-core`
//!
//! Shared types for the bluesky bridge: the run engine document model, the
//! scan / channel / sample model of the data service, scan metadata, and the
//! error types used across the workspace.
//!
//! ## Key Types
//!
//! - [`Document`]: start / descriptor / event / stop documents
//! - [`ChannelSchema`] and [`SampleValue`]: typed channel data
//! - [`ScanState`]: `Active → Closed` lifecycle
//! - [`ScanInfo`]: metadata served with each scan
//! - [`BridgeError`]: error type with recovery guidance

pub mod error;
pub mod experiment;
pub mod model;
pub mod scan_info;

pub use error::{BridgeError, BridgeResult, RelayError, StorageError};
pub use experiment::{DataKey, DescriptorDoc, Document, DocumentKind, EventDoc, ExitStatus, StartDoc, StopDoc};
pub use model::{
    ChannelSchema, DType, RelayRecord, Sample, SampleValue, ScanOutcome, ScanState, StreamKey,
};
pub use scan_info::{ScanDefaults, ScanInfo};
