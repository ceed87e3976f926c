use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::relay::{
    connection::{Connection, ConnectionId},
    error::RelayError,
    Frame,
};

/// What happened during one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Number of members the frame was queued for.
    pub delivered: usize,
    /// Members whose send failed. They are no longer in the room.
    pub failed: Vec<ConnectionId>,
    /// Membership after the failed members were evicted.
    pub remaining: usize,
    /// Whether the sender was a live member. When this is `false` nothing
    /// was sent.
    pub sender_present: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Members {
    connections: HashMap<ConnectionId, Connection>,
    /// Set once the registry has decided to drop this room. A retired room
    /// refuses joins so nobody lands in a room the registry no longer
    /// references.
    retired: bool,
}

/// A `Room` is a named, bounded set of connections that receive each other's
/// messages.
///
/// All membership changes and broadcasts for one room are serialized by the
/// room's own lock. Rooms never touch the registry; when a broadcast empties
/// a room, the caller is told through `BroadcastReport::remaining` and prunes
/// it.
#[derive(Debug)]
pub struct Room {
    name: String,
    capacity: usize,
    members: Mutex<Members>,
}

impl Room {
    /// The maximum number of members of a room unless configured otherwise.
    pub const DEFAULT_CAPACITY: usize = 10;

    /// Creates an empty room holding at most `capacity` members.
    pub fn new(name: impl Into<String>, capacity: usize) -> Room {
        Room {
            name: name.into(),
            capacity,
            members: Mutex::new(Members::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Adds `connection` to the room and returns the new member count.
    ///
    /// A full room and an id that is already present are both rejected
    /// without touching the membership. A retired room answers with
    /// `RoomNotFound`.
    pub async fn join(&self, connection: Connection) -> Result<usize, RelayError> {
        let mut members = self.members.lock().await;

        if members.retired {
            return Err(RelayError::RoomNotFound(self.name.clone()));
        }

        if members.connections.len() >= self.capacity {
            return Err(RelayError::CapacityExceeded {
                room: self.name.clone(),
                capacity: self.capacity,
            });
        }

        if members.connections.contains_key(connection.id()) {
            return Err(RelayError::DuplicateConnection {
                room: self.name.clone(),
                id: connection.id().clone(),
            });
        }

        members
            .connections
            .insert(connection.id().clone(), connection);
        Ok(members.connections.len())
    }

    /// Removes a member and returns its handle.
    pub async fn leave(&self, id: &ConnectionId) -> Result<Connection, RelayError> {
        let mut members = self.members.lock().await;
        self.remove_member(&mut members, id)
    }

    fn remove_member(&self, members: &mut Members, id: &ConnectionId) -> Result<Connection, RelayError> {
        members.connections.remove(id).ok_or_else(|| RelayError::NotFound {
            room: self.name.clone(),
            id: id.clone(),
        })
    }

    /// Queues `frame` for every member except `sender`.
    ///
    /// Only members are relayed. A sender whose own queue has closed is
    /// evicted instead of relayed. Members whose send fails are evicted before
    /// the lock is released and their sessions are told through
    /// `Connection::evicted`.
    pub async fn broadcast(&self, sender: &ConnectionId, frame: &Frame) -> BroadcastReport {
        let mut members = self.members.lock().await;
        let mut report = BroadcastReport::default();

        match members.connections.get(sender) {
            None => {
                debug!(room = %self.name, from = %sender, "not a member, dropping frame");
            }
            Some(connection) if connection.is_closed() => {
                warn!(room = %self.name, "{sender} is gone, evicting");
                report.failed.push(sender.clone());
            }
            Some(_) => {
                report.sender_present = true;

                for (id, member) in members.connections.iter() {
                    if id == sender {
                        continue;
                    }

                    match member.send(frame.clone()) {
                        Ok(()) => report.delivered += 1,
                        Err(error) => {
                            warn!(room = %self.name, "{error}, evicting");
                            report.failed.push(id.clone());
                        }
                    }
                }
            }
        }

        for id in &report.failed {
            if let Ok(connection) = self.remove_member(&mut members, id) {
                connection.evict();
            }
        }

        report.remaining = members.connections.len();
        debug!(
            room = %self.name,
            from = %sender,
            delivered = report.delivered,
            evicted = report.failed.len(),
            "broadcast"
        );
        report
    }

    /// Marks the room as retired if it has no members.
    ///
    /// Returns `true` if the room is retired, after which every join is
    /// refused.
    pub async fn retire_if_empty(&self) -> bool {
        let mut members = self.members.lock().await;
        if members.connections.is_empty() {
            members.retired = true;
        }
        members.retired
    }

    #[cfg(test)]
    pub(crate) async fn lock_members(&self) -> tokio::sync::MutexGuard<'_, Members> {
        self.members.lock().await
    }

    /// A point-in-time copy of the members.
    pub async fn members(&self) -> Vec<Connection> {
        self.members
            .lock()
            .await
            .connections
            .values()
            .cloned()
            .collect()
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.members.lock().await.connections.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.lock().await.connections.is_empty()
    }
}
