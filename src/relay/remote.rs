//! Relay over TCP, for a broker running as its own process.
//!
//! Both ports speak JSON lines.
//!
//! Publish port (bridge → broker):
//! ```text
//! → {"records":[{"run_id":..,"channel":..,"sample":{..}}, ..]}
//! ← {"ack":<records accepted>}
//! ```
//!
//! Subscribe port (broker → subscriber): the subscriber sends one attach line
//! (`{}` or `{"run_id":"..."}`), then receives [`RelayMessage`] lines until it
//! disconnects. Disconnecting detaches.

use bridge_core::{RelayError, RelayRecord};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{RelayBroker, RelayMessage, RelaySink};
use async_trait::async_trait;

const ACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
struct PublishFrame {
    records: Vec<RelayRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AckFrame {
    ack: usize,
}

/// Subscriber attach request
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AttachRequest {
    /// Only relay this scan's records
    #[serde(default)]
    pub run_id: Option<String>,
}

fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, RelayError> {
    let mut line = serde_json::to_vec(value).map_err(|e| RelayError::Codec(e.to_string()))?;
    line.push(b'\n');
    Ok(line)
}

/// [`RelaySink`] that forwards batches to a remote [`BrokerServer`].
///
/// Connects lazily and reconnects on the next publish after any failure.
#[derive(Debug)]
pub struct RemoteBrokerSink {
    addr: String,
    connection: Mutex<Option<BufReader<TcpStream>>>,
}

impl RemoteBrokerSink {
    /// Sink for the broker publish port at `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connection: Mutex::new(None),
        }
    }

    async fn send(
        connection: &mut BufReader<TcpStream>,
        line: &[u8],
        expected: usize,
    ) -> Result<(), RelayError> {
        connection
            .get_mut()
            .write_all(line)
            .await
            .map_err(|e| RelayError::Unavailable(e.to_string()))?;

        let mut reply = String::new();
        let read = tokio::time::timeout(ACK_TIMEOUT, connection.read_line(&mut reply))
            .await
            .map_err(|_| RelayError::Unavailable("timed out waiting for ack".to_string()))?
            .map_err(|e| RelayError::Unavailable(e.to_string()))?;
        if read == 0 {
            return Err(RelayError::Unavailable("broker closed the connection".to_string()));
        }
        let ack: AckFrame =
            serde_json::from_str(reply.trim()).map_err(|e| RelayError::Codec(e.to_string()))?;
        if ack.ack != expected {
            return Err(RelayError::Codec(format!(
                "broker acknowledged {} of {} records",
                ack.ack, expected
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RelaySink for RemoteBrokerSink {
    async fn publish(&self, batch: &[RelayRecord]) -> Result<(), RelayError> {
        if batch.is_empty() {
            return Ok(());
        }
        let line = encode_line(&PublishFrame {
            records: batch.to_vec(),
        })?;

        let mut connection = self.connection.lock().await;
        if connection.is_none() {
            let stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| RelayError::Unavailable(format!("{}: {}", self.addr, e)))?;
            info!(broker = %self.addr, "Connected to relay broker");
            *connection = Some(BufReader::new(stream));
        }
        let Some(stream) = connection.as_mut() else {
            return Err(RelayError::Closed);
        };

        let result = Self::send(stream, &line, batch.len()).await;
        if result.is_err() {
            *connection = None;
        }
        result
    }
}

/// TCP front end of a [`RelayBroker`].
#[derive(Debug, Clone)]
pub struct BrokerServer {
    broker: RelayBroker,
}

impl BrokerServer {
    /// Serve `broker`
    pub fn new(broker: RelayBroker) -> Self {
        Self { broker }
    }

    /// Underlying broker
    pub fn broker(&self) -> &RelayBroker {
        &self.broker
    }

    /// Accept publishers on `listener` until `cancel` fires.
    pub async fn serve_publishers(self, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        let broker = self.broker.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_publisher(socket, addr, broker, cancel).await {
                                warn!(%addr, error = %e, "Publisher connection ended with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Accept error on publish port"),
                }
            }
        }
    }

    /// Accept subscribers on `listener` until `cancel` fires.
    pub async fn serve_subscribers(self, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        let broker = self.broker.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_subscriber(socket, addr, broker, cancel).await {
                                debug!(%addr, error = %e, "Subscriber connection ended with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Accept error on subscribe port"),
                }
            }
        }
    }
}

async fn handle_publisher(
    socket: TcpStream,
    addr: SocketAddr,
    broker: RelayBroker,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    info!(%addr, "Publisher connected");
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line.map_err(|e| RelayError::Unavailable(e.to_string()))?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let frame: PublishFrame =
            serde_json::from_str(&line).map_err(|e| RelayError::Codec(e.to_string()))?;
        broker.publish_records(&frame.records);
        let ack = encode_line(&AckFrame {
            ack: frame.records.len(),
        })?;
        write
            .write_all(&ack)
            .await
            .map_err(|e| RelayError::Unavailable(e.to_string()))?;
    }
    info!(%addr, "Publisher disconnected");
    Ok(())
}

async fn handle_subscriber(
    socket: TcpStream,
    addr: SocketAddr,
    broker: RelayBroker,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    let (read, mut write) = socket.into_split();
    let mut reader = BufReader::new(read);

    let mut line = String::new();
    if reader
        .read_line(&mut line)
        .await
        .map_err(|e| RelayError::Unavailable(e.to_string()))?
        == 0
    {
        return Ok(());
    }
    let attach: AttachRequest = if line.trim().is_empty() {
        AttachRequest::default()
    } else {
        serde_json::from_str(line.trim()).map_err(|e| RelayError::Codec(e.to_string()))?
    };

    let mut subscription = broker.attach(attach.run_id);
    info!(%addr, subscriber = subscription.id(), "Subscriber connected");
    let mut ignored = String::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            // Subscribers send nothing after attaching; EOF means detach
            read = reader.read_line(&mut ignored) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => ignored.clear(),
                }
            }
            message = subscription.recv() => {
                let Some(message) = message else { break };
                let out = encode_line(&message)?;
                if let Err(e) = write.write_all(&out).await {
                    debug!(%addr, error = %e, "Subscriber write failed");
                    break;
                }
            }
        }
    }
    info!(%addr, subscriber = subscription.id(), dropped = subscription.dropped_total(), "Subscriber disconnected");
    Ok(())
}

/// Client for the broker subscribe port.
#[derive(Debug)]
pub struct RemoteSubscriber {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    _write: tokio::net::tcp::OwnedWriteHalf,
}

impl RemoteSubscriber {
    /// Connect and attach, optionally to a single scan.
    pub async fn connect(addr: &str, run_id: Option<String>) -> Result<Self, RelayError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RelayError::Unavailable(format!("{}: {}", addr, e)))?;
        let (read, mut write) = stream.into_split();
        let attach = encode_line(&AttachRequest { run_id })?;
        write
            .write_all(&attach)
            .await
            .map_err(|e| RelayError::Unavailable(e.to_string()))?;
        Ok(Self {
            reader: BufReader::new(read),
            _write: write,
        })
    }

    /// Next message, `None` when the broker closed the connection.
    pub async fn recv(&mut self) -> Result<Option<RelayMessage>, RelayError> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| RelayError::Unavailable(e.to_string()))?;
            if read == 0 {
                return Ok(None);
            }
            if !line.trim().is_empty() {
                break;
            }
        }
        serde_json::from_str(line.trim())
            .map(Some)
            .map_err(|e| RelayError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::{Sample, SampleValue};

    fn record(seq: u64) -> RelayRecord {
        RelayRecord {
            run_id: "r1".to_string(),
            channel: "det1".to_string(),
            sample: Sample::new(seq, 1.5, SampleValue::FloatArray(vec![seq as f64, 0.5])),
        }
    }

    #[test]
    fn test_message_wire_format() {
        let dropped = serde_json::to_value(RelayMessage::Dropped { count: 3 }).unwrap();
        assert_eq!(dropped, serde_json::json!({"type": "dropped", "count": 3}));

        let line = serde_json::to_string(&RelayMessage::Record(record(7))).unwrap();
        assert!(line.contains("\"type\":\"record\""));
        let back: RelayMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(back, RelayMessage::Record(record(7)));
    }

    #[tokio::test]
    async fn test_publish_through_remote_broker() {
        let broker = RelayBroker::new(16);
        let server = BrokerServer::new(broker.clone());
        let cancel = CancellationToken::new();

        let publish = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let subscribe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let publish_addr = publish.local_addr().unwrap().to_string();
        let subscribe_addr = subscribe.local_addr().unwrap().to_string();
        tokio::spawn(server.clone().serve_publishers(publish, cancel.clone()));
        tokio::spawn(server.serve_subscribers(subscribe, cancel.clone()));

        let mut subscriber = RemoteSubscriber::connect(&subscribe_addr, None).await.unwrap();
        // Attach is processed asynchronously by the server
        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.subscriber_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let sink = RemoteBrokerSink::new(publish_addr);
        sink.publish(&[record(0), record(1)]).await.unwrap();

        for expected in 0..2 {
            let message = tokio::time::timeout(Duration::from_secs(2), subscriber.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(message, Some(RelayMessage::Record(r)) if r.sample.seq == expected));
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_unavailable() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let sink = RemoteBrokerSink::new(addr);
        let err = sink.publish(&[record(0)]).await.unwrap_err();
        assert!(matches!(err, RelayError::Unavailable(_)));
    }
}
