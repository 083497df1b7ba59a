//! Filesystem watcher that folds external edits into the store.
//!
//! Raw `notify` events are filtered (document files only), debounced per
//! path, and handed to [`DocumentStore::ingest_external`] on the blocking
//! pool. The store broadcasts any resulting change through fan-out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};

use statesync_core::paths::is_ignored_file;
use statesync_store::DocumentStore;

use crate::error::DaemonError;

/// Per-path trailing-edge debounce.
///
/// Every event moves the path's deadline to `now + window`; a path is due
/// once its deadline passes without another event.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    deadlines: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadlines: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record an event for `path`, replacing any earlier deadline.
    pub fn touch(&mut self, path: PathBuf, now: Instant) {
        self.deadlines.insert(path, now + self.window);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every path whose deadline is at or before `now`.
    pub fn due(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut ready: Vec<PathBuf> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &ready {
            self.deadlines.remove(path);
        }
        ready.sort();
        ready
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

/// Recursive watch on a store root.
///
/// The OS watch is registered in [`ChangeWatcher::new`], so edits made
/// after construction are observed even before [`ChangeWatcher::run`] is
/// first polled.
pub struct ChangeWatcher {
    store: Arc<DocumentStore>,
    root: PathBuf,
    debouncer: Debouncer,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    _watcher: RecommendedWatcher,
}

impl ChangeWatcher {
    pub fn new(store: Arc<DocumentStore>, window: Duration) -> Result<Self, DaemonError> {
        let root = store.root().to_path_buf();
        let (event_tx, events) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
            let _ = event_tx.send(event);
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        tracing::info!(root = %root.display(), window_ms = window.as_millis() as u64, "watching store root");

        Ok(Self {
            store,
            root,
            debouncer: Debouncer::new(window),
            events,
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Process events until `shutdown_rx` fires.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), DaemonError> {
        loop {
            let deadline = self.debouncer.next_deadline();
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                event = self.events.recv() => {
                    let Some(event) = event else {
                        return Err(DaemonError::ChannelClosed("watcher events"));
                    };
                    let event = match event {
                        Ok(event) => event,
                        Err(err) => {
                            tracing::warn!(error = %err, "watcher event error");
                            continue;
                        }
                    };
                    if !is_relevant_event_kind(&event.kind) {
                        continue;
                    }
                    let now = Instant::now();
                    for path in event.paths {
                        if is_ignored_file(&self.root, &path) {
                            continue;
                        }
                        self.debouncer.touch(path, now);
                    }
                }
                _ = wait_until(deadline) => {
                    for path in self.debouncer.due(Instant::now()) {
                        ingest(self.store.clone(), path).await;
                    }
                }
            }
        }

        tracing::info!(root = %self.root.display(), "watcher stopped");
        Ok(())
    }
}

async fn ingest(store: Arc<DocumentStore>, path: PathBuf) {
    let file = path.clone();
    match tokio::task::spawn_blocking(move || store.ingest_external(&file)).await {
        Ok(Some(change)) => tracing::debug!(
            path = %change.document_path,
            operation = %change.operation,
            "external change ingested",
        ),
        Ok(None) => {}
        Err(err) => tracing::error!(file = %path.display(), error = %err, "ingest task failed"),
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}
