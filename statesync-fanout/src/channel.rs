//! External notification sinks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use statesync_core::ChangeRecord;

use crate::error::ChannelError;

/// A sink outside the process (a file, a socket, a WebSocket bridge).
///
/// Implementations use interior mutability; fan-out shares them behind
/// `Arc` and calls them from whichever thread performed the mutation.
pub trait NotificationChannel: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    fn notify(&self, change: &ChangeRecord) -> Result<(), ChannelError>;

    fn close(&self) -> Result<(), ChannelError>;
}

/// Keeps every delivered change in memory.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    received: Mutex<Vec<ChangeRecord>>,
    closed: AtomicBool,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<ChangeRecord> {
        self.received
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl NotificationChannel for MemoryChannel {
    fn name(&self) -> &str {
        "memory"
    }

    fn notify(&self, change: &ChangeRecord) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed(self.name().to_owned()));
        }
        self.received
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(change.clone());
        Ok(())
    }

    fn close(&self) -> Result<(), ChannelError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
