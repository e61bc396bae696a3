//! Live fan-out of appended samples.
//!
//! The [`RelayPump`] follows the stream store's change feed and publishes
//! every appended sample, in per-channel order, to a [`RelaySink`]. Two sinks
//! exist:
//!
//! - [`RelayBroker`]: in-process broker with one bounded queue per subscriber
//! - [`RemoteBrokerSink`]: forwards batches to a broker running as its own
//!   process (see [`BrokerServer`])
//!
//! ```text
//! StreamStore ─(change feed)─► RelayPump ─► RelaySink
//!                                             ├─ RelayBroker ─► [queue] ─► subscriber
//!                                             └─ RemoteBrokerSink ─tcp─► BrokerServer
//! ```

pub mod broker;
pub mod pump;
pub mod remote;

use async_trait::async_trait;
use bridge_core::{RelayError, RelayRecord};
use serde::{Deserialize, Serialize};

pub use broker::{RelayBroker, Subscription};
pub use pump::RelayPump;
pub use remote::{BrokerServer, RemoteBrokerSink, RemoteSubscriber};

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// One appended sample
    Record(RelayRecord),
    /// Records were discarded from this subscriber's queue since the last message
    Dropped {
        /// Number of records discarded
        count: u64,
    },
}

/// Destination of the relay pump.
#[async_trait]
pub trait RelaySink: Send + Sync {
    /// Publish a batch of records, in order.
    ///
    /// On error the batch is considered undelivered and will be offered again.
    async fn publish(&self, batch: &[RelayRecord]) -> Result<(), RelayError>;
}
