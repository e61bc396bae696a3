//! Error types for the bridge.
//!
//! `BridgeError` is the single error type surfaced by the ingestor, the translator,
//! the stream store and the retrieval façade. Storage and relay failures have their
//! own enums (`StorageError`, `RelayError`) which convert into `BridgeError` with `?`.
//!
//! ## Error Categories
//!
//! 1. **Document errors** - `Sequence`, `InvalidDocument`, `TypeMismatch`, `UnknownChannel`
//!    - Raised while admitting or translating one document
//!    - Recovery: the document is dropped and logged, ingestion continues
//!
//! 2. **Scan-fatal errors** - `SchemaConflict`
//!    - The offending scan is forced Closed with a failure outcome
//!    - Recovery: none for that scan, other scans are unaffected
//!
//! 3. **Read errors** - `Range`, `InvalidRange`, `UnknownScan`, `UnknownChannel`
//!    - Returned to the reader, never retried by the bridge
//!
//! 4. **Infrastructure errors** - `Storage`, `Relay`, `Io`
//!    - Storage failures fail the scan being written
//!    - Relay failures suspend fan-out, persistence continues

use thiserror::Error;

/// Convenience alias for results using the bridge error type.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Primary error type for the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A document references a run that is not Active (unknown or already closed),
    /// or a start document reuses an existing run id.
    ///
    /// **Recovery**: drop the document, log at `warn`, continue ingesting.
    #[error("Sequence error for run '{run_id}': {reason}")]
    Sequence {
        /// Run id carried (or resolved) by the rejected document
        run_id: String,
        /// What was out of order
        reason: String,
    },

    /// A descriptor redefines an existing channel with a different dtype or shape.
    ///
    /// **Recovery**: fatal to the scan. It is closed with a failure outcome;
    /// samples written before the conflict stay readable.
    #[error(
        "Schema conflict in run '{run_id}' for channel '{channel}': existing {existing}, requested {requested}"
    )]
    SchemaConflict {
        /// Run whose channel was redefined
        run_id: String,
        /// Channel name
        channel: String,
        /// Schema fixed at channel creation
        existing: String,
        /// Schema requested by the later descriptor
        requested: String,
    },

    /// Read past the final index of a closed scan's channel.
    ///
    /// **Recovery**: none. The requested range will never exist.
    #[error(
        "Range error for '{run_id}/{channel}': requested end {requested_end} exceeds final length {final_len}"
    )]
    Range {
        /// Run id
        run_id: String,
        /// Channel name
        channel: String,
        /// Exclusive end of the request
        requested_end: u64,
        /// Number of samples the channel was closed with
        final_len: u64,
    },

    /// Malformed range (start after end).
    #[error("Invalid range {start}..{end}")]
    InvalidRange {
        /// Inclusive start
        start: u64,
        /// Exclusive end
        end: u64,
    },

    /// Channel not declared for the scan.
    #[error("Unknown channel '{channel}' in run '{run_id}'")]
    UnknownChannel {
        /// Run id
        run_id: String,
        /// Channel name
        channel: String,
    },

    /// No scan with this run id has ever been opened.
    #[error("Unknown scan '{0}'")]
    UnknownScan(String),

    /// An event value does not match the declared channel dtype or shape.
    ///
    /// **Recovery**: the whole event is rejected, the scan stays Active.
    #[error("Type mismatch for channel '{channel}': expected {expected}, got {actual}")]
    TypeMismatch {
        /// Channel name
        channel: String,
        /// Declared dtype/shape
        expected: String,
        /// Description of the received value
        actual: String,
    },

    /// Document failed structural validation.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// Append attempted on a closed scan.
    #[error("Scan '{0}' is closed")]
    ScanClosed(String),

    /// Persistent storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Relay transport failure.
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// Network or file I/O outside the archive.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The ingestion pipeline has shut down and accepts no more documents.
    #[error("Bridge service is shut down")]
    ServiceClosed,
}

impl BridgeError {
    /// Build a `Sequence` error
    pub fn sequence(run_id: impl Into<String>, reason: impl Into<String>) -> Self {
        BridgeError::Sequence {
            run_id: run_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error forces the scan it occurred in to close.
    pub fn is_scan_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::SchemaConflict { .. } | BridgeError::Storage(_)
        )
    }

    /// Short machine-readable label, used in retrieval responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Sequence { .. } => "sequence_error",
            BridgeError::SchemaConflict { .. } => "schema_conflict",
            BridgeError::Range { .. } => "range_error",
            BridgeError::InvalidRange { .. } => "invalid_range",
            BridgeError::UnknownChannel { .. } => "unknown_channel",
            BridgeError::UnknownScan(_) => "unknown_scan",
            BridgeError::TypeMismatch { .. } => "type_mismatch",
            BridgeError::InvalidDocument(_) => "invalid_document",
            BridgeError::ScanClosed(_) => "scan_closed",
            BridgeError::Storage(_) => "storage_error",
            BridgeError::Relay(_) => "relay_error",
            BridgeError::Io(_) => "io_error",
            BridgeError::ServiceClosed => "service_closed",
        }
    }
}

/// Archival storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// File system failure.
    #[error("Archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded.
    #[error("Archive codec error: {0}")]
    Codec(String),

    /// Checksum or framing mismatch in a segment.
    #[error("Archive segment '{path}' corrupted at offset {offset}: {reason}")]
    Corrupted {
        /// Segment path
        path: String,
        /// Byte offset of the bad record
        offset: u64,
        /// What failed
        reason: String,
    },

    /// Append would leave a hole in the channel's index space.
    #[error("Non-contiguous archive append for '{key}': expected seq {expected}, got {got}")]
    NonContiguous {
        /// Stream key, `run/channel`
        key: String,
        /// Next sequence number the archive holds
        expected: u64,
        /// First sequence number of the rejected batch
        got: u64,
    },

    /// Requested index range is not present in the archive.
    #[error("Archive range {start}..{end} out of bounds for '{key}' (len {len})")]
    OutOfBounds {
        /// Stream key, `run/channel`
        key: String,
        /// Inclusive start
        start: u64,
        /// Exclusive end
        end: u64,
        /// Archived length
        len: u64,
    },
}

/// Relay transport errors.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Broker not reachable. Fan-out is suspended and retried with backoff.
    #[error("Relay broker unavailable: {0}")]
    Unavailable(String),

    /// Broker or subscription closed.
    #[error("Relay closed")]
    Closed,

    /// Malformed relay message.
    #[error("Relay codec error: {0}")]
    Codec(String),
}
