//! Newline-delimited JSON change feed over a Unix socket.
//!
//! The channel connects lazily on first delivery and reconnects on the
//! next delivery after a failed write. A missing listener is a channel
//! error, which fan-out logs and skips.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use statesync_core::ChangeRecord;

use crate::channel::NotificationChannel;
use crate::error::{io_err, ChannelError};

const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct SocketChannel {
    socket: PathBuf,
    state: Mutex<SocketState>,
}

enum SocketState {
    Disconnected,
    Connected(UnixStream),
    Closed,
}

impl SocketChannel {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            state: Mutex::new(SocketState::Disconnected),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn connect(&self) -> Result<UnixStream, ChannelError> {
        let stream = UnixStream::connect(&self.socket).map_err(|e| io_err(&self.socket, e))?;
        stream
            .set_write_timeout(Some(WRITE_TIMEOUT))
            .map_err(|e| io_err(&self.socket, e))?;
        tracing::debug!(socket = %self.socket.display(), "socket channel connected");
        Ok(stream)
    }
}

impl NotificationChannel for SocketChannel {
    fn name(&self) -> &str {
        "socket"
    }

    fn notify(&self, change: &ChangeRecord) -> Result<(), ChannelError> {
        let mut payload = serde_json::to_vec(change)?;
        payload.push(b'\n');

        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let needs_connect = match &*state {
            SocketState::Closed => return Err(ChannelError::Closed(self.name().to_owned())),
            SocketState::Disconnected => true,
            SocketState::Connected(_) => false,
        };
        if needs_connect {
            *state = SocketState::Connected(self.connect()?);
        }

        let SocketState::Connected(stream) = &mut *state else {
            return Err(ChannelError::Closed(self.name().to_owned()));
        };
        let written = stream.write_all(&payload).and_then(|()| stream.flush());
        if let Err(err) = written {
            *state = SocketState::Disconnected;
            return Err(io_err(&self.socket, err));
        }
        Ok(())
    }

    fn close(&self) -> Result<(), ChannelError> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if let SocketState::Connected(stream) =
            std::mem::replace(&mut *state, SocketState::Closed)
        {
            // Peer may already be gone.
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        Ok(())
    }
}
