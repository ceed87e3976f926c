use std::{fmt::Display, sync::Arc, time::Duration};

use futures_util::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::relay::{
    appstate::Registry,
    connection::{Connection, ConnectionId},
    error::RelayError,
    Frame, ResponsePacket,
};

/// Where a session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Joined,
    Reading,
    Closed,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The connection never entered the room.
    Rejected(RelayError),
    /// The connection was in the room until its read loop stopped.
    Closed {
        /// Number of frames read from the client and broadcast.
        relayed: usize,
    },
}

/// One client session: join a room, relay everything the client sends to
/// the other members, leave when the client goes away.
///
/// The `Client` owns its `Connection` for the whole session and drops it when
/// `run` returns. Once the room has dropped its handle too, the writer task
/// sees the queue close and shuts the socket.
#[derive(Debug)]
pub struct Client {
    id: ConnectionId,
    room_name: String,
    registry: Arc<Registry>,
    connection: Connection,
    idle_timeout: Option<Duration>,
    state: SessionState,
}

impl Client {
    pub fn new(registry: Arc<Registry>, connection: Connection, room_name: impl Into<String>) -> Client {
        Client {
            id: connection.id().clone(),
            room_name: room_name.into(),
            registry,
            connection,
            idle_timeout: None,
            state: SessionState::Connecting,
        }
    }

    /// Ends the read loop when the client has been silent for `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Client {
        self.idle_timeout = timeout;
        self
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug!(id = %self.id, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// Runs the whole session over `incoming`.
    ///
    /// The stream ending or yielding an error ends the read loop, and so
    /// does being evicted from the room. Leaving the room happens exactly
    /// once, after the loop, whichever way it ended.
    pub async fn run<S, E>(mut self, incoming: S) -> SessionOutcome
    where
        S: Stream<Item = Result<Frame, E>> + Unpin,
        E: Display,
    {
        if let Err(error) = self.handle_join().await {
            self.reject(&error);
            self.transition(SessionState::Closed);
            return SessionOutcome::Rejected(error);
        }

        self.transition(SessionState::Reading);
        let relayed = self.read_loop(incoming).await;

        self.handle_close().await;
        SessionOutcome::Closed { relayed }
    }

    async fn handle_join(&mut self) -> Result<(), RelayError> {
        self.registry
            .join(&self.room_name, self.connection.clone())
            .await?;
        self.transition(SessionState::Joined);
        Ok(())
    }

    /// Tells the client why it could not join.
    fn reject(&self, error: &RelayError) {
        match error {
            RelayError::CapacityExceeded { .. } => {
                info!(id = %self.id, room = %self.room_name, "{error}");
                let packet = ResponsePacket::Error {
                    message: error.to_string(),
                };
                match packet.to_frame() {
                    Ok(frame) => {
                        if let Err(error) = self.connection.send(frame) {
                            debug!("{error}");
                        }
                    }
                    Err(error) => warn!("Failed to serialize error packet: {error}"),
                }
            }
            _ => warn!(id = %self.id, room = %self.room_name, "join failed: {error}"),
        }
    }

    async fn read_loop<S, E>(&self, mut incoming: S) -> usize
    where
        S: Stream<Item = Result<Frame, E>> + Unpin,
        E: Display,
    {
        let mut relayed = 0;

        loop {
            let read = async {
                match self.idle_timeout {
                    Some(limit) => tokio::time::timeout(limit, incoming.next())
                        .await
                        .map_err(|_| limit),
                    None => Ok(incoming.next().await),
                }
            };

            let next = tokio::select! {
                biased;
                _ = self.connection.evicted() => {
                    info!(id = %self.id, "evicted from room, closing");
                    break;
                }
                read = read => match read {
                    Ok(next) => next,
                    Err(limit) => {
                        info!(id = %self.id, "no message for {limit:?}, closing");
                        break;
                    }
                },
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(error)) => {
                    warn!(id = %self.id, "Failed to read message from client: {error}");
                    break;
                }
                None => break,
            };

            debug!(id = %self.id, bytes = frame.len(), "received");

            match self.registry.broadcast(&self.room_name, &self.id, &frame).await {
                Ok(report) if report.sender_present => relayed += 1,
                Ok(_) => {
                    info!(id = %self.id, "no longer in the room, closing");
                    break;
                }
                // The room only disappears once it is empty, so this session
                // has already been evicted.
                Err(error) => {
                    info!(id = %self.id, "{error}, closing");
                    break;
                }
            }
        }

        relayed
    }

    async fn handle_close(&mut self) {
        match self.registry.leave(&self.id, &self.room_name).await {
            Ok(()) => {}
            Err(error @ (RelayError::NotFound { .. } | RelayError::RoomNotFound(_))) => {
                debug!(id = %self.id, "already gone: {error}");
            }
            Err(error) => warn!(id = %self.id, "{error}"),
        }

        self.transition(SessionState::Closed);
    }
}
