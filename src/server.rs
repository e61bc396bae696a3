//! TCP listeners: document intake and the retrieval API.
//!
//! Both speak newline-delimited JSON.
//!
//! Documents: one `{"name": "start"|"descriptor"|"event"|"stop", "doc": {..}}`
//! per line. Nothing is sent back; malformed lines are logged and counted.
//!
//! Retrieval: one request per line, one response per line.
//! ```text
//! → {"op":"read","scan_id":"r1","channel":"det1","start":0,"end":2,"mode":"wait","timeout_ms":1000}
//! ← {"status":"ok","samples":[{"seq":0,"timestamp":..,"value":1.0}, ..]}
//! ← {"status":"not_yet_available","written":1}
//! ← {"status":"cancelled"}
//! ← {"status":"error","code":"range_error","message":".."}
//! ```
//! Other ops: `scan_info`, `scan_state`, `list_scans`, `channels`.

use bridge_core::{BridgeError, Document, Sample, ScanInfo, ScanState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pipeline::ServiceHandle;
use crate::retrieval::{ChannelView, ReadMode, ReadResult, RetrievalFacade, ScanSummary};

/// Accept document producers until `cancel` fires.
pub async fn serve_documents(
    listener: TcpListener,
    service: ServiceHandle,
    cancel: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Document listener ready");
    }
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    let service = service.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_producer(socket, addr, service, cancel).await {
                            warn!(%addr, error = %e, "Document connection ended with error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "Accept error on document port"),
            }
        }
    }
}

async fn handle_producer(
    socket: TcpStream,
    addr: SocketAddr,
    service: ServiceHandle,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    info!(%addr, "Document producer connected");
    let stats = service.stats_handle();
    let mut lines = BufReader::new(socket).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match Document::from_json(line) {
            Ok(document) => {
                if service.submit(document).await.is_err() {
                    warn!(%addr, "Bridge service stopped, closing producer connection");
                    break;
                }
            }
            Err(e) => {
                stats.record_rejected();
                warn!(%addr, error = %e, "Dropping undecodable document");
            }
        }
    }
    info!(%addr, "Document producer disconnected");
    Ok(())
}

/// Retrieval operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalOp {
    /// Samples of a channel range
    #[default]
    Read,
    /// Scan metadata
    ScanInfo,
    /// Scan lifecycle state
    ScanState,
    /// All scans
    ListScans,
    /// Channels of a scan
    Channels,
}

/// One retrieval request line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalRequest {
    /// Operation, `read` when omitted
    pub op: RetrievalOp,
    /// Run id
    pub scan_id: Option<String>,
    /// Channel name (`read`)
    pub channel: Option<String>,
    /// Inclusive start index (`read`)
    pub start: u64,
    /// Exclusive end index (`read`)
    pub end: Option<u64>,
    /// Blocking intent (`read`)
    pub mode: ReadMode,
    /// Upper bound for a `wait` read; the configured default when omitted
    pub timeout_ms: Option<u64>,
}

/// Sample as sent to retrieval clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleView {
    /// Index in the channel
    pub seq: u64,
    /// Event time, seconds since the epoch
    pub timestamp: f64,
    /// Value as plain JSON
    pub value: Value,
}

impl From<&Sample> for SampleView {
    fn from(sample: &Sample) -> Self {
        Self {
            seq: sample.seq,
            timestamp: sample.timestamp,
            value: sample.value.to_json(),
        }
    }
}

/// Payload of a successful response; only the field matching the op is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OkBody {
    /// `read`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples: Option<Vec<SampleView>>,
    /// `scan_info`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan: Option<Box<ScanInfo>>,
    /// `scan_state`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ScanState>,
    /// `list_scans`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scans: Option<Vec<ScanSummary>>,
    /// `channels`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<ChannelView>>,
}

/// One retrieval response line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RetrievalResponse {
    /// Request served
    Ok(OkBody),
    /// The range is not written yet
    NotYetAvailable {
        /// Samples written so far
        written: u64,
    },
    /// The read was cancelled (connection closing or service shutdown)
    Cancelled,
    /// Request failed
    Error {
        /// Machine-readable error code
        code: String,
        /// Human-readable message
        message: String,
    },
}

impl RetrievalResponse {
    fn error(code: &str, message: impl Into<String>) -> Self {
        RetrievalResponse::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<BridgeError> for RetrievalResponse {
    fn from(e: BridgeError) -> Self {
        RetrievalResponse::error(e.code(), e.to_string())
    }
}

/// Serves retrieval requests against a [`RetrievalFacade`].
#[derive(Debug, Clone)]
pub struct RetrievalServer {
    facade: Arc<RetrievalFacade>,
    default_timeout: Duration,
}

impl RetrievalServer {
    /// Server with `default_timeout` for `wait` reads without `timeout_ms`
    pub fn new(facade: Arc<RetrievalFacade>, default_timeout: Duration) -> Self {
        Self {
            facade,
            default_timeout,
        }
    }

    /// Accept retrieval clients until `cancel` fires.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Retrieval listener ready");
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        let server = self.clone();
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_client(socket, addr, cancel).await {
                                debug!(%addr, error = %e, "Retrieval connection ended with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Accept error on retrieval port"),
                }
            }
        }
    }

    async fn handle_client(
        &self,
        socket: TcpStream,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> std::io::Result<()> {
        debug!(%addr, "Retrieval client connected");
        let (read, mut write) = socket.into_split();
        let mut lines = BufReader::new(read).lines();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<RetrievalRequest>(&line) {
                Ok(request) => self.handle(request, &cancel).await,
                Err(e) => RetrievalResponse::error("invalid_request", e.to_string()),
            };
            let mut out = serde_json::to_vec(&response)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            out.push(b'\n');
            write.write_all(&out).await?;
        }
        debug!(%addr, "Retrieval client disconnected");
        Ok(())
    }

    /// Serve one request.
    pub async fn handle(
        &self,
        request: RetrievalRequest,
        cancel: &CancellationToken,
    ) -> RetrievalResponse {
        if request.op == RetrievalOp::ListScans {
            return RetrievalResponse::Ok(OkBody {
                scans: Some(self.facade.list_scans()),
                ..OkBody::default()
            });
        }
        let Some(scan_id) = request.scan_id.as_deref() else {
            return RetrievalResponse::error("invalid_request", "missing scan_id");
        };

        let result = match request.op {
            RetrievalOp::ScanInfo => self.facade.scan_info(scan_id).map(|info| RetrievalResponse::Ok(OkBody {
                scan: Some(Box::new(info)),
                ..OkBody::default()
            })),
            RetrievalOp::ScanState => self.facade.scan_state(scan_id).map(|state| RetrievalResponse::Ok(OkBody {
                state: Some(state),
                ..OkBody::default()
            })),
            RetrievalOp::Channels => self.facade.channels(scan_id).map(|channels| RetrievalResponse::Ok(OkBody {
                channels: Some(channels),
                ..OkBody::default()
            })),
            RetrievalOp::ListScans => Ok(RetrievalResponse::Ok(OkBody::default())),
            RetrievalOp::Read => return self.read(scan_id, &request, cancel).await,
        };
        result.unwrap_or_else(RetrievalResponse::from)
    }

    async fn read(
        &self,
        scan_id: &str,
        request: &RetrievalRequest,
        cancel: &CancellationToken,
    ) -> RetrievalResponse {
        let (Some(channel), Some(end)) = (request.channel.as_deref(), request.end) else {
            return RetrievalResponse::error("invalid_request", "read needs channel and end");
        };
        let range = request.start..end;
        let limit = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let read = self
            .facade
            .read(scan_id, channel, range.clone(), request.mode, cancel);
        let result = match request.mode {
            ReadMode::NoWait => read.await,
            ReadMode::Wait => match tokio::time::timeout(limit, read).await {
                Ok(result) => result,
                Err(_) => {
                    // Answer with the progress at the deadline
                    return match self
                        .facade
                        .read(scan_id, channel, range, ReadMode::NoWait, cancel)
                        .await
                    {
                        Ok(result) => Self::read_response(result),
                        Err(e) => e.into(),
                    };
                }
            },
        };
        match result {
            Ok(result) => Self::read_response(result),
            Err(e) => e.into(),
        }
    }

    fn read_response(result: ReadResult) -> RetrievalResponse {
        match result {
            ReadResult::Ready(samples) => RetrievalResponse::Ok(OkBody {
                samples: Some(samples.iter().map(SampleView::from).collect()),
                ..OkBody::default()
            }),
            ReadResult::NotYetAvailable { written } => RetrievalResponse::NotYetAvailable { written },
            ReadResult::Cancelled => RetrievalResponse::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::{ChannelSchema, DType, SampleValue, ScanDefaults, StartDoc, StreamKey};
    use bridge_storage::{MemoryArchive, StreamStore};
    use serde_json::json;

    fn server() -> (Arc<StreamStore>, RetrievalServer) {
        let store = Arc::new(StreamStore::new(Arc::new(MemoryArchive::new()), 8));
        let start = StartDoc::new("count").with_uid("r1");
        store
            .open_scan(ScanInfo::from_start(&start, &ScanDefaults::default()))
            .unwrap();
        store
            .create_channel("r1", ChannelSchema::scalar("det1", DType::Float64))
            .unwrap();
        let facade = Arc::new(RetrievalFacade::new(store.clone()));
        (store, RetrievalServer::new(facade, Duration::from_millis(20)))
    }

    fn request(value: Value) -> RetrievalRequest {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_read_request_and_response_shape() {
        let (store, server) = server();
        let key = StreamKey::new("r1", "det1");
        store
            .append(&key, Sample::new(0, 10.0, SampleValue::Float(1.0)))
            .unwrap();
        let cancel = CancellationToken::new();

        let response = server
            .handle(
                request(json!({"scan_id": "r1", "channel": "det1", "start": 0, "end": 1})),
                &cancel,
            )
            .await;
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"status": "ok", "samples": [{"seq": 0, "timestamp": 10.0, "value": 1.0}]})
        );

        let response = server
            .handle(
                request(json!({"scan_id": "r1", "channel": "det1", "end": 3, "mode": "no_wait"})),
                &cancel,
            )
            .await;
        assert_eq!(response, RetrievalResponse::NotYetAvailable { written: 1 });
    }

    #[tokio::test]
    async fn test_wait_times_out_as_not_yet_available() {
        let (_store, server) = server();
        let cancel = CancellationToken::new();
        let response = server
            .handle(
                request(json!({"scan_id": "r1", "channel": "det1", "end": 1, "mode": "wait", "timeout_ms": 10})),
                &cancel,
            )
            .await;
        assert_eq!(response, RetrievalResponse::NotYetAvailable { written: 0 });
    }

    #[tokio::test]
    async fn test_errors_carry_codes() {
        let (_store, server) = server();
        let cancel = CancellationToken::new();

        let response = server
            .handle(request(json!({"op": "scan_info", "scan_id": "missing"})), &cancel)
            .await;
        assert!(matches!(response, RetrievalResponse::Error { ref code, .. } if code == "unknown_scan"));

        let response = server
            .handle(request(json!({"scan_id": "r1", "channel": "det1", "start": 3, "end": 1})), &cancel)
            .await;
        assert!(matches!(response, RetrievalResponse::Error { ref code, .. } if code == "invalid_range"));

        let response = server.handle(request(json!({"op": "list_scans"})), &cancel).await;
        assert!(matches!(response, RetrievalResponse::Ok(OkBody { scans: Some(ref s), .. }) if s.len() == 1));
    }

    #[tokio::test]
    async fn test_ok_body_is_flattened_under_status() {
        let (_store, server) = server();
        let cancel = CancellationToken::new();
        let response = server
            .handle(request(json!({"op": "scan_state", "scan_id": "r1"})), &cancel)
            .await;

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "ok");
        assert!(value.get("state").is_some());
        assert!(value.get("samples").is_none());

        let back: RetrievalResponse = serde_json::from_value(value).unwrap();
        assert_eq!(back, response);
    }
}
