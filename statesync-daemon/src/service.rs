//! Service assembly: one store root, its fan-out, coordinator and watcher.
//!
//! Everything is owned by the [`StateService`] value; there are no
//! process-wide registries, so tests can run several services side by side.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use statesync_core::StoreConfig;
use statesync_fanout::{EventBus, Fanout, FileChannel};
use statesync_store::{DocumentStore, OptimisticCoordinator};

use crate::error::DaemonError;
use crate::watcher::ChangeWatcher;

pub struct StateService {
    config: StoreConfig,
    fanout: Arc<Fanout>,
    store: Arc<DocumentStore>,
    coordinator: Arc<OptimisticCoordinator>,
    shutdown_tx: broadcast::Sender<()>,
    watcher: Option<JoinHandle<Result<(), DaemonError>>>,
}

impl StateService {
    /// Open the store and spawn the watcher. Must be called from within a
    /// Tokio runtime.
    pub fn start(config: StoreConfig) -> Result<Self, DaemonError> {
        let bus = Arc::new(EventBus::new(config.bus_capacity));
        let fanout = Arc::new(Fanout::new(bus));
        if let Some(log) = &config.change_log {
            let log = if log.is_relative() {
                config.root.join(log)
            } else {
                log.clone()
            };
            tracing::info!(path = %log.display(), "change log enabled");
            fanout.add_channel(Arc::new(FileChannel::new(log)));
        }

        let store = Arc::new(DocumentStore::new(&config, fanout.clone())?);
        let coordinator = Arc::new(OptimisticCoordinator::from_config(store.clone(), &config));

        let (shutdown_tx, _) = broadcast::channel::<()>(4);
        let watcher = ChangeWatcher::new(store.clone(), config.debounce())?;
        let handle = {
            let shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move { watcher.run(shutdown_rx).await })
        };

        tracing::info!(root = %store.root().display(), "state service started");
        Ok(Self {
            config,
            fanout,
            store,
            coordinator,
            shutdown_tx,
            watcher: Some(handle),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        self.fanout.bus()
    }

    pub fn fanout(&self) -> &Arc<Fanout> {
        &self.fanout
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<OptimisticCoordinator> {
        &self.coordinator
    }

    /// Stop the watcher, wait for it, then close every notification channel.
    pub async fn shutdown(mut self) -> Result<(), DaemonError> {
        let _ = self.shutdown_tx.send(());
        let result = match self.watcher.take() {
            Some(handle) => handle_join("watcher", handle.await),
            None => Ok(()),
        };
        self.fanout.close();
        tracing::info!(root = %self.store.root().display(), "state service stopped");
        result
    }
}

impl Drop for StateService {
    fn drop(&mut self) {
        // Watcher exits on its own if shutdown() was never awaited.
        let _ = self.shutdown_tx.send(());
    }
}

fn handle_join(
    task: &'static str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(source) => Err(DaemonError::Join { task, source }),
    }
}
