//! Process context: everything one running bridge instance owns.
//!
//! [`BridgeContext::build`] wires the store, the ingestion pipeline, the
//! relay and the retrieval façade from a [`BridgeConfig`]. Nothing is global;
//! two contexts in one process are independent.

use anyhow::{Context as _, Result};
use bridge_storage::{ArchiveBackend, FileArchive, MemoryArchive, StreamStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BridgeConfig, RelayMode, StorageBackend, StorageConfig};
use crate::pipeline::{BridgeService, ServiceHandle};
use crate::relay::{BrokerServer, RelayBroker, RelayPump, RelaySink, RemoteBrokerSink};
use crate::retrieval::RetrievalFacade;
use crate::server::{serve_documents, RetrievalServer};

/// Open the archive named by the storage config and load the store over it.
pub fn open_store(storage: &StorageConfig) -> Result<Arc<StreamStore>> {
    let archive: Arc<dyn ArchiveBackend> = match storage.backend {
        StorageBackend::Memory => Arc::new(MemoryArchive::new()),
        StorageBackend::File => Arc::new(
            FileArchive::open(&storage.archive_dir).with_context(|| {
                format!("opening archive at {}", storage.archive_dir.display())
            })?,
        ),
    };
    let store = StreamStore::open(archive, storage.ring_capacity)
        .context("loading scans from the archive")?;
    Ok(Arc::new(store))
}

/// A running bridge instance.
#[derive(Debug)]
pub struct BridgeContext {
    config: BridgeConfig,
    store: Arc<StreamStore>,
    service: BridgeService,
    facade: Arc<RetrievalFacade>,
    broker: Option<RelayBroker>,
    /// Listeners
    cancel: CancellationToken,
    listeners: Vec<JoinHandle<()>>,
    /// Relay pump and flusher, stopped after the pipeline drained
    background: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeContext {
    /// Build the store, the pipeline and the relay link. Must run inside a
    /// Tokio runtime; background tasks are spawned on it.
    pub fn build(config: BridgeConfig) -> Result<Self> {
        config
            .validate()
            .map_err(anyhow::Error::msg)
            .context("invalid configuration")?;
        let store = open_store(&config.storage)?;
        let background = CancellationToken::new();
        let mut tasks = Vec::new();

        let (broker, sink): (Option<RelayBroker>, Option<Arc<dyn RelaySink>>) =
            match config.relay.mode {
                RelayMode::Local => {
                    let broker = RelayBroker::new(config.relay.subscriber_queue_capacity);
                    (Some(broker.clone()), Some(Arc::new(broker)))
                }
                RelayMode::Remote => {
                    let addr = format!("{}:{}", config.relay.broker_host, config.relay.publish_port);
                    info!(broker = %addr, "Relaying to remote broker");
                    (None, Some(Arc::new(RemoteBrokerSink::new(addr))))
                }
                RelayMode::Disabled => (None, None),
            };
        if let Some(sink) = sink {
            let pump = RelayPump::new(
                Arc::clone(&store),
                sink,
                config.relay.batch_size,
                Duration::from_millis(config.relay.reconnect_min_ms),
                Duration::from_millis(config.relay.reconnect_max_ms),
            );
            tasks.push(tokio::spawn(pump.run(background.child_token())));
        }

        if config.storage.flush_interval_ms > 0 {
            tasks.push(tokio::spawn(flush_periodically(
                Arc::clone(&store),
                Duration::from_millis(config.storage.flush_interval_ms),
                background.child_token(),
            )));
        }

        let service = BridgeService::spawn(
            Arc::clone(&store),
            config.scan.clone(),
            config.ingest.queue_capacity,
            config.ingest.scan_queue_capacity,
        );
        let facade = Arc::new(RetrievalFacade::new(Arc::clone(&store)));

        info!(
            name = %config.application.name,
            backend = ?config.storage.backend,
            relay = ?config.relay.mode,
            recovered_scans = store.scans().len(),
            "Bridge context ready"
        );
        Ok(Self {
            config,
            store,
            service,
            facade,
            broker,
            cancel: CancellationToken::new(),
            listeners: Vec::new(),
            background,
            tasks,
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Stream store
    pub fn store(&self) -> &Arc<StreamStore> {
        &self.store
    }

    /// Document producer handle
    pub fn handle(&self) -> ServiceHandle {
        self.service.handle()
    }

    /// Retrieval façade
    pub fn facade(&self) -> &Arc<RetrievalFacade> {
        &self.facade
    }

    /// In-process broker (local relay mode only)
    pub fn broker(&self) -> Option<&RelayBroker> {
        self.broker.as_ref()
    }

    /// Token cancelled on shutdown; blocking reads can use child tokens of it
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Bind the configured listeners and serve until Ctrl-C, then shut down.
    pub async fn serve(mut self) -> Result<()> {
        let ingest_addr = format!("{}:{}", self.config.ingest.host, self.config.ingest.port);
        let listener = TcpListener::bind(&ingest_addr)
            .await
            .with_context(|| format!("binding document listener on {}", ingest_addr))?;
        self.listeners.push(tokio::spawn(serve_documents(
            listener,
            self.handle(),
            self.cancel.child_token(),
        )));

        if self.config.retrieval.enabled {
            let addr = format!("{}:{}", self.config.retrieval.host, self.config.retrieval.port);
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("binding retrieval listener on {}", addr))?;
            let server = RetrievalServer::new(
                Arc::clone(&self.facade),
                Duration::from_millis(self.config.retrieval.default_timeout_ms),
            );
            self.listeners
                .push(tokio::spawn(server.serve(listener, self.cancel.child_token())));
        }

        if let Some(broker) = &self.broker {
            let addr = format!(
                "{}:{}",
                self.config.relay.broker_host, self.config.relay.subscribe_port
            );
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("binding relay subscriber port on {}", addr))?;
            info!(%addr, "Local relay accepting subscribers");
            let server = BrokerServer::new(broker.clone());
            self.listeners.push(tokio::spawn(
                server.serve_subscribers(listener, self.cancel.child_token()),
            ));
        }

        tokio::signal::ctrl_c()
            .await
            .context("waiting for Ctrl-C")?;
        info!("Shutdown requested");
        self.shutdown().await
    }

    /// Stop listeners, apply every queued document, stop the relay and flush
    /// all rings to the archive.
    ///
    /// Handles obtained from [`handle`](Self::handle) must be dropped first.
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            store,
            service,
            broker,
            cancel,
            listeners,
            background,
            tasks,
            ..
        } = self;

        // Listeners first so no producer connection holds a service handle
        cancel.cancel();
        for task in listeners {
            if let Err(e) = task.await {
                warn!(error = %e, "Listener task failed");
            }
        }
        service.shutdown().await;

        background.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task failed");
            }
        }

        let flushed = tokio::task::spawn_blocking(move || store.flush_all())
            .await
            .context("flush task panicked")?
            .context("flushing stream store")?;
        if let Some(broker) = broker {
            broker.close();
        }
        info!(flushed, "Bridge stopped");
        Ok(())
    }
}

async fn flush_periodically(store: Arc<StreamStore>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let store = Arc::clone(&store);
                match tokio::task::spawn_blocking(move || store.flush_all()).await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(flushed)) => debug!(flushed, "Periodic flush"),
                    Ok(Err(e)) => error!(error = %e, "Periodic flush failed"),
                    Err(e) => error!(error = %e, "Flush task failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_and_shutdown_with_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BridgeConfig::default();
        config.storage.archive_dir = dir.path().join("archive");
        config.relay.mode = RelayMode::Local;

        let ctx = BridgeContext::build(config).unwrap();
        assert!(ctx.broker().is_some());
        assert!(ctx.store().scans().is_empty());
        ctx.shutdown().await.unwrap();
        assert!(dir.path().join("archive").exists());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = BridgeConfig::default();
        config.storage.backend = StorageBackend::Memory;
        config.storage.ring_capacity = 0;
        assert!(BridgeContext::build(config).is_err());
    }
}
