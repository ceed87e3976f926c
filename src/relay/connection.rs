use std::fmt;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::relay::{error::RelayError, Frame};

/// Opaque, process-unique identifier of one client session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        ConnectionId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        ConnectionId(id)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        ConnectionId(id.to_string())
    }
}

/// A send-capable handle to one client's live channel.
///
/// Outbound frames go through a bounded queue that is drained by the
/// connection's writer task. Sending never waits: a full queue means the
/// client is not keeping up, a closed queue means the client is gone, and
/// both are reported as a terminal `SendFailure`.
///
/// Cloning a `Connection` clones the handle, not the channel. The writer
/// closes the socket once every clone has been dropped. Clones also share the
/// eviction signal, so the session owning the connection learns when a room
/// has dropped it.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::Sender<Frame>,
    evicted: CancellationToken,
}

impl Connection {
    pub fn new(id: ConnectionId, outbound: mpsc::Sender<Frame>) -> Connection {
        Connection {
            id,
            outbound,
            evicted: CancellationToken::new(),
        }
    }

    /// Creates a connection together with the receiving end of its queue.
    pub fn channel(id: ConnectionId, buffer: usize) -> (Connection, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Connection::new(id, tx), rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn send(&self, frame: Frame) -> Result<(), RelayError> {
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                Err(RelayError::SendFailure(self.id.clone()))
            }
        }
    }

    /// Whether the writer side has gone away.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Marks the connection as thrown out of its room.
    pub fn evict(&self) {
        self.evicted.cancel();
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }

    /// Resolves once any clone of this connection has been evicted.
    pub fn evicted(&self) -> WaitForCancellationFuture<'_> {
        self.evicted.cancelled()
    }
}
