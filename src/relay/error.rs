use thiserror::Error;

use crate::relay::connection::ConnectionId;

/// Everything the room registry can refuse to do.
///
/// Only `CapacityExceeded` is ever reported to a client. The other variants
/// are expected outcomes of joins and leaves racing with each other and are
/// handled as no-ops by the session loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("room '{room}' is full ({capacity} members)")]
    CapacityExceeded { room: String, capacity: usize },

    #[error("room '{0}' does not exist")]
    RoomNotFound(String),

    #[error("connection {id} is not a member of room '{room}'")]
    NotFound { room: String, id: ConnectionId },

    #[error("failed to send to connection {0}")]
    SendFailure(ConnectionId),

    #[error("connection {id} is already a member of room '{room}'")]
    DuplicateConnection { room: String, id: ConnectionId },

    #[error("room name must not be empty")]
    InvalidRoomName,
}
