//! Monitoring service
//!
//! Owns the wiring between the broker worker, the measurement buffer, the
//! aggregation cycle, the delivery dispatcher and the WebSocket server.

pub mod aggregator;
pub mod broker;
pub mod buffer;
pub mod dispatcher;
pub mod gateway;
pub mod message;
pub mod registry;
pub mod risk;
pub mod server;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::storage::{MedicalRecordStore, Storage};
use aggregator::AggregationCycle;
use broker::BrokerWorker;
use buffer::MeasurementBuffer;
use dispatcher::{create_dispatcher, DispatcherHandle, DispatcherLoop};
use gateway::IngestionGateway;
use registry::ClientRegistry;
use server::ServerContext;

pub struct Monitor {
    config: Config,
    storage: Arc<Storage>,
    buffer: Arc<MeasurementBuffer>,
    registry: Arc<ClientRegistry>,
    /// Cloneable producer half of the dispatch queue
    dispatcher: DispatcherHandle,
    /// Consumer half; taken out when the service starts running
    dispatch_loop: Option<DispatcherLoop>,
}

impl Monitor {
    pub async fn new(config: Config) -> Result<Self> {
        tracing::info!("initializing monitoring service");

        let storage = Arc::new(Storage::new(&config.database).await?);

        let buffer = Arc::new(MeasurementBuffer::new());
        let registry = Arc::new(ClientRegistry::new());
        let (dispatcher, dispatch_loop) =
            create_dispatcher(registry.clone(), config.server.dispatch_queue);

        tracing::info!("monitoring service initialized");
        Ok(Self {
            config,
            storage,
            buffer,
            registry,
            dispatcher,
            dispatch_loop: Some(dispatch_loop),
        })
    }

    /// Run until Ctrl+C or SIGTERM, then wind the tasks down.
    pub async fn run(mut self) -> Result<()> {
        let store: Arc<dyn MedicalRecordStore> = self.storage.clone();

        let dispatch_loop = self
            .dispatch_loop
            .take()
            .ok_or_else(|| anyhow!("dispatcher already running"))?;
        let dispatch_handle = tokio::spawn(dispatch_loop.run());

        // Optional raw-history path: its own writer task, so a slow insert
        // never backs up onto the broker worker.
        let raw_tx = if self.config.aggregation.persist_raw_history {
            let (raw_tx, raw_rx) = mpsc::channel(self.config.aggregation.raw_queue);
            tokio::spawn(gateway::raw_history_writer(store.clone(), raw_rx));
            Some(raw_tx)
        } else {
            None
        };

        let ingestion = IngestionGateway::new(
            self.buffer.clone(),
            self.dispatcher.clone(),
            self.registry.clone(),
            raw_tx,
        );

        let stop = Arc::new(AtomicBool::new(false));
        let (publisher, worker) = BrokerWorker::connect(&self.config.broker, ingestion, stop.clone());
        let mut broker_handle = tokio::task::spawn_blocking(move || worker.run_supervised());

        let (agg_shutdown_tx, agg_shutdown_rx) = mpsc::channel(1);
        let cycle = AggregationCycle::new(
            self.buffer.clone(),
            store,
            self.dispatcher.clone(),
            Duration::from_secs(self.config.aggregation.interval_secs),
            agg_shutdown_rx,
        );
        let aggregation_handle = tokio::spawn(cycle.run());

        let listener = TcpListener::bind(self.config.server.bind).await?;
        let server_handle = tokio::spawn(server::run(
            listener,
            ServerContext {
                registry: self.registry.clone(),
                buffer: self.buffer.clone(),
                publisher: Arc::new(publisher.clone()),
            },
        ));

        tracing::info!("monitoring service running");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl+C, shutting down");
            }
            _ = Self::wait_for_term_signal() => {
                tracing::info!("received TERM signal, shutting down");
            }
            result = &mut broker_handle => {
                // The supervised worker only exits on its own when even the
                // subscribe request fails; without ingestion the service has
                // nothing to do.
                match result {
                    Ok(Ok(())) => tracing::warn!("broker worker exited"),
                    Ok(Err(e)) => tracing::error!(error = %e, "broker worker failed"),
                    Err(e) => tracing::error!(error = %e, "broker worker panicked"),
                }
                return Err(anyhow!("broker worker terminated unexpectedly"));
            }
        }

        // Stop ingestion first so the final flush sees a quiescent buffer.
        stop.store(true, Ordering::SeqCst);
        publisher.disconnect();

        if let Err(e) = agg_shutdown_tx.send(()).await {
            tracing::warn!(error = %e, "aggregation shutdown signal failed");
        }
        self.dispatcher.shutdown().await;
        server_handle.abort();

        for (name, handle) in [
            ("aggregation cycle", aggregation_handle),
            ("dispatcher", dispatch_handle),
        ] {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => tracing::info!("{name} stopped"),
                Ok(Err(e)) => tracing::error!(error = %e, "{name} task failed"),
                Err(_) => tracing::warn!("{name} shutdown timed out"),
            }
        }

        match tokio::time::timeout(Duration::from_secs(5), broker_handle).await {
            Ok(Ok(Ok(()))) => tracing::info!("broker worker stopped"),
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "broker worker stopped with error"),
            Ok(Err(e)) => tracing::error!(error = %e, "broker worker task failed"),
            Err(_) => tracing::warn!("broker worker shutdown timed out"),
        }

        tracing::info!("monitoring service stopped");
        Ok(())
    }

    async fn wait_for_term_signal() {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            if let Ok(mut term) = signal(SignalKind::terminate()) {
                term.recv().await;
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    }

    pub fn get_storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn get_buffer(&self) -> &Arc<MeasurementBuffer> {
        &self.buffer
    }

    pub fn get_registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }
}
