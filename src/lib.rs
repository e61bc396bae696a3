//! # bluesky-bridge
//!
//! Bridges the document stream of a Bluesky run engine into a scan-oriented
//! stream store, so that readers built for a beamline data service can follow
//! Bluesky scans live and replay them afterwards.
//!
//! ## Crate Structure
//!
//! - **`ingest`**: document sequencing and run lifecycle (`Ingestor`)
//! - **`translate`**: documents → scans, channels and samples (`ScanTranslator`)
//! - **`pipeline`**: bounded intake queue, one worker per running scan
//! - **`relay`**: live fan-out to subscribers, in-process or through a broker process
//! - **`retrieval`**: tier-independent reads with wait / no-wait semantics
//! - **`server`**: TCP JSON-lines listeners for documents and retrieval
//! - **`context`**: wiring of one bridge instance from its configuration
//! - **`config`** / **`logging`**: figment configuration and tracing setup
//!
//! Shared types live in `bridge-core`; the ring/archive store lives in
//! `bridge-storage`. Both are re-exported.

pub mod config;
pub mod context;
pub mod ingest;
pub mod logging;
pub mod pipeline;
pub mod relay;
pub mod retrieval;
pub mod server;
pub mod translate;

pub use bridge_core;
pub use bridge_storage;

pub use context::BridgeContext;
pub use pipeline::{BridgeService, ServiceHandle};
pub use retrieval::{ReadMode, ReadResult, RetrievalFacade};
