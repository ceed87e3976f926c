use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::relay::{
    connection::{Connection, ConnectionId},
    error::RelayError,
    room::{BroadcastReport, Room},
    Frame,
};

/// Name and member count of one room at the moment it was read.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RoomSummary {
    pub name: String,
    pub members: usize,
}

/// Lookup table from room name to `Room`.
///
/// Rooms are created on the first join and removed as soon as their last
/// member leaves. The registry lock only guards the map; membership is
/// guarded by each room's own lock, so traffic in one room never waits on
/// another. The registry lock is never held while waiting for a room lock.
#[derive(Debug)]
pub struct Registry {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    capacity: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Registry {
            rooms: Mutex::new(HashMap::new()),
            capacity: Room::DEFAULT_CAPACITY,
        }
    }
}

impl Registry {
    /// Creates an empty registry whose rooms hold at most `capacity` members.
    ///
    /// The registry is returned behind an `Arc` because every session task
    /// shares it.
    pub fn new(capacity: usize) -> Arc<Registry> {
        Arc::new(Registry {
            rooms: Mutex::new(HashMap::new()),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the room called `name`, creating it if needed.
    pub async fn get_or_create(&self, name: &str) -> Arc<Room> {
        let mut rooms = self.rooms.lock().await;
        self.get_or_insert(&mut rooms, name)
    }

    fn get_or_insert(&self, rooms: &mut HashMap<String, Arc<Room>>, name: &str) -> Arc<Room> {
        rooms
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(room = name, "room created");
                Arc::new(Room::new(name, self.capacity))
            })
            .clone()
    }

    pub async fn lookup(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.lock().await.get(name).cloned()
    }

    /// Drops the room called `name` if nobody is in it.
    ///
    /// The room is retired under its own lock first, so a join racing the
    /// removal is refused and retried against a fresh room. Returns `true` if
    /// the room was removed.
    pub async fn prune_if_empty(&self, name: &str) -> bool {
        let Some(room) = self.lookup(name).await else {
            return false;
        };

        if !room.retire_if_empty().await {
            return false;
        }

        self.remove_room(name, &room).await;
        true
    }

    /// Removes `room` from the map unless it has already been replaced.
    async fn remove_room(&self, name: &str, room: &Arc<Room>) {
        let mut rooms = self.rooms.lock().await;
        if rooms.get(name).is_some_and(|current| Arc::ptr_eq(current, room)) {
            rooms.remove(name);
            info!(room = name, "room removed");
        }
    }

    /// Adds `connection` to the room called `room_name`, creating the room if
    /// it does not exist yet.
    ///
    /// The registry lock is released before the room lock is taken. If a
    /// concurrent prune retired the room in between, the stale entry is
    /// dropped and the join starts over. If the join is rejected and the room
    /// is empty, the room is removed again.
    pub async fn join(&self, room_name: &str, connection: Connection) -> Result<Arc<Room>, RelayError> {
        if room_name.is_empty() {
            return Err(RelayError::InvalidRoomName);
        }

        let id = connection.id().clone();

        loop {
            let room = self.get_or_create(room_name).await;

            match room.join(connection.clone()).await {
                Ok(members) => {
                    info!(room = room_name, %id, members, "joined");
                    return Ok(room);
                }
                Err(RelayError::RoomNotFound(_)) => {
                    debug!(room = room_name, %id, "room retired while joining, retrying");
                    self.remove_room(room_name, &room).await;
                }
                Err(error) => {
                    self.prune_if_empty(room_name).await;
                    return Err(error);
                }
            }
        }
    }

    /// Removes a connection from a room and drops the room if it is now empty.
    pub async fn leave(&self, id: &ConnectionId, room_name: &str) -> Result<(), RelayError> {
        let room = self
            .lookup(room_name)
            .await
            .ok_or_else(|| RelayError::RoomNotFound(room_name.to_string()))?;

        let result = room.leave(id).await.map(|_| ());
        if result.is_ok() {
            info!(room = room_name, %id, "left");
        }

        self.prune_if_empty(room_name).await;
        result
    }

    /// Queues `frame` for every member of `room_name` except `sender`.
    ///
    /// Members that could not be reached are evicted, and the room is dropped
    /// if that leaves it empty.
    pub async fn broadcast(
        &self,
        room_name: &str,
        sender: &ConnectionId,
        frame: &Frame,
    ) -> Result<BroadcastReport, RelayError> {
        let room = self
            .lookup(room_name)
            .await
            .ok_or_else(|| RelayError::RoomNotFound(room_name.to_string()))?;

        let report = room.broadcast(sender, frame).await;
        if report.remaining == 0 {
            self.prune_if_empty(room_name).await;
        }

        Ok(report)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// A point-in-time listing of all rooms, sorted by name.
    pub async fn rooms(&self) -> Vec<RoomSummary> {
        let rooms: Vec<Arc<Room>> = self.rooms.lock().await.values().cloned().collect();

        let mut summaries = Vec::with_capacity(rooms.len());
        for room in rooms {
            summaries.push(RoomSummary {
                name: room.name().to_string(),
                members: room.len().await,
            });
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("listed {} rooms", summaries.len());
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    fn member(id: &str) -> (Connection, Receiver<Frame>) {
        Connection::channel(id.into(), 8)
    }

    #[test]
    fn test_new() {
        let registry = Registry::new(3);

        assert!(Arc::ptr_eq(&registry, &registry.clone()));
        assert_eq!(registry.capacity(), 3);
        assert_eq!(Registry::default().capacity(), Room::DEFAULT_CAPACITY);
    }

    #[tokio::test]
    async fn test_join_creates_room() {
        let registry = Registry::new(Room::DEFAULT_CAPACITY);
        let (player, _rx) = member("player1");

        registry.join("room1", player).await.unwrap();

        let room = registry.lookup("room1").await.expect("room was not created");
        assert!(room.contains(&"player1".into()).await);
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_room() {
        let registry = Registry::new(4);

        let first = registry.get_or_create("alpha").await;
        let second = registry.get_or_create("alpha").await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create() {
        let registry = Registry::new(4);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create("shared").await })
            })
            .collect();

        let mut rooms = Vec::new();
        for handle in handles {
            rooms.push(handle.await.unwrap());
        }

        assert!(rooms.iter().all(|room| Arc::ptr_eq(room, &rooms[0])));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_lookup_does_not_create() {
        let registry = Registry::new(4);

        assert!(registry.lookup("nowhere").await.is_none());
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_prune_only_empty_rooms() {
        let registry = Registry::new(4);
        registry.get_or_create("empty").await;
        let (a, _rx) = member("a");
        registry.join("busy", a).await.unwrap();

        assert!(registry.prune_if_empty("empty").await);
        assert!(!registry.prune_if_empty("busy").await);
        assert!(!registry.prune_if_empty("missing").await);
        assert!(registry.lookup("busy").await.is_some());
    }

    #[tokio::test]
    async fn test_room_limit() {
        let registry = Registry::new(Room::DEFAULT_CAPACITY);
        let mut receivers = Vec::new();

        for i in 0..Room::DEFAULT_CAPACITY {
            let (player, rx) = member(&format!("player{i}"));
            receivers.push(rx);
            registry.join("beta", player).await.unwrap();
        }

        let (extra, _rx) = member("player_extra");
        let result = registry.join("beta", extra).await;

        assert!(matches!(result, Err(RelayError::CapacityExceeded { capacity: 10, .. })));
        let room = registry.lookup("beta").await.unwrap();
        assert_eq!(room.len().await, 10);
        assert!(!room.contains(&"player_extra".into()).await);
    }

    #[tokio::test]
    async fn test_rejected_join_leaves_no_room_behind() {
        let registry = Registry::new(0);
        let (a, _rx) = member("a");

        assert!(registry.join("void", a).await.is_err());
        assert!(registry.lookup("void").await.is_none());
    }

    #[tokio::test]
    async fn test_empty_room_name_is_rejected() {
        let registry = Registry::new(4);
        let (a, _rx) = member("a");

        assert_eq!(registry.join("", a).await.err(), Some(RelayError::InvalidRoomName));
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_alpha_scenario() {
        let registry = Registry::new(Room::DEFAULT_CAPACITY);
        let (a, mut a_rx) = member("A");
        let (b, mut b_rx) = member("B");

        registry.join("alpha", a).await.unwrap();
        registry.join("alpha", b).await.unwrap();

        let room = registry.lookup("alpha").await.unwrap();
        let mut ids: Vec<String> = room
            .members()
            .await
            .iter()
            .map(|c| c.id().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["A", "B"]);

        let report = registry
            .broadcast("alpha", &"A".into(), &Frame::text("hi"))
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(b_rx.try_recv().unwrap(), Frame::text("hi"));
        assert!(a_rx.try_recv().is_err());

        registry.leave(&"A".into(), "alpha").await.unwrap();
        let room = registry.lookup("alpha").await.unwrap();
        assert_eq!(room.len().await, 1);
        assert!(room.contains(&"B".into()).await);

        registry.leave(&"B".into(), "alpha").await.unwrap();
        assert!(registry.lookup("alpha").await.is_none());
    }

    #[tokio::test]
    async fn test_leave_twice_is_not_found() {
        let registry = Registry::new(4);
        let (a, _a_rx) = member("a");
        let (b, _b_rx) = member("b");
        registry.join("alpha", a).await.unwrap();
        registry.join("alpha", b).await.unwrap();

        registry.leave(&"a".into(), "alpha").await.unwrap();
        assert!(matches!(
            registry.leave(&"a".into(), "alpha").await,
            Err(RelayError::NotFound { .. })
        ));
        assert_eq!(registry.lookup("alpha").await.unwrap().len().await, 1);
    }

    #[tokio::test]
    async fn test_leave_after_room_removed() {
        let registry = Registry::new(4);
        let (a, _rx) = member("a");
        registry.join("alpha", a).await.unwrap();
        registry.leave(&"a".into(), "alpha").await.unwrap();

        assert_eq!(
            registry.leave(&"a".into(), "alpha").await,
            Err(RelayError::RoomNotFound("alpha".to_string()))
        );
    }

    #[tokio::test]
    async fn test_broadcast_stays_in_room() {
        let registry = Registry::new(4);
        let (a, _a_rx) = member("a");
        let (b, mut b_rx) = member("b");
        let (other, mut other_rx) = member("other");
        registry.join("alpha", a).await.unwrap();
        registry.join("alpha", b).await.unwrap();
        registry.join("gamma", other).await.unwrap();

        registry
            .broadcast("alpha", &"a".into(), &Frame::text("only alpha"))
            .await
            .unwrap();

        assert_eq!(b_rx.try_recv().unwrap(), Frame::text("only alpha"));
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_to_missing_room() {
        let registry = Registry::new(4);

        assert_eq!(
            registry
                .broadcast("nowhere", &"a".into(), &Frame::text("hi"))
                .await,
            Err(RelayError::RoomNotFound("nowhere".to_string()))
        );
    }

    #[tokio::test]
    async fn test_broadcast_prunes_room_emptied_by_evictions() {
        let registry = Registry::new(4);
        let (gone, gone_rx) = member("gone");
        registry.join("alpha", gone).await.unwrap();
        drop(gone_rx);

        let report = registry
            .broadcast("alpha", &"gone".into(), &Frame::text("anyone?"))
            .await
            .unwrap();

        assert_eq!(report.failed, vec![ConnectionId::from("gone")]);
        assert_eq!(report.remaining, 0);
        assert!(registry.lookup("alpha").await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_keeps_room_of_live_sender() {
        let registry = Registry::new(4);
        let (a, _a_rx) = member("a");
        let (b, b_rx) = member("b");
        let (c, c_rx) = member("c");
        registry.join("alpha", a).await.unwrap();
        registry.join("alpha", b).await.unwrap();
        registry.join("alpha", c).await.unwrap();
        drop(b_rx);
        drop(c_rx);

        let report = registry
            .broadcast("alpha", &"a".into(), &Frame::text("hello?"))
            .await
            .unwrap();

        assert!(report.sender_present);
        assert_eq!(report.delivered, 0);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.remaining, 1);
        let room = registry.lookup("alpha").await.unwrap();
        assert!(room.contains(&"a".into()).await);
    }

    #[tokio::test]
    async fn test_join_replaces_retired_room() {
        let registry = Registry::new(4);
        let stale = registry.get_or_create("alpha").await;
        // A prune has retired the room but not yet dropped it from the map.
        assert!(stale.retire_if_empty().await);

        let (a, _rx) = member("a");
        let room = registry.join("alpha", a).await.unwrap();

        assert!(!Arc::ptr_eq(&room, &stale));
        assert!(room.contains(&"a".into()).await);
        assert!(Arc::ptr_eq(&registry.lookup("alpha").await.unwrap(), &room));

        // The stale prune finishing late must not drop the new room.
        registry.remove_room("alpha", &stale).await;
        assert!(registry.lookup("alpha").await.is_some());
    }

    #[tokio::test]
    async fn test_join_into_busy_room_does_not_block_other_rooms() {
        let registry = Registry::new(4);
        let (a, _a_rx) = member("a");
        let (q, _q_rx) = member("q");
        let busy = registry.join("busy", a).await.unwrap();
        registry.join("quiet", q).await.unwrap();

        // A join into the busy room waits on its lock...
        let guard = busy.lock_members().await;
        let (b, _b_rx) = member("b");
        let waiting = tokio::spawn({
            let registry = registry.clone();
            async move { registry.join("busy", b).await.map(|_| ()) }
        });
        tokio::task::yield_now().await;

        // ...while traffic in another room goes on.
        let quiet = tokio::time::timeout(
            Duration::from_secs(1),
            registry.broadcast("quiet", &"q".into(), &Frame::text("hi")),
        )
        .await;
        drop(guard);

        assert!(matches!(quiet, Ok(Ok(_))));
        assert_eq!(waiting.await.unwrap(), Ok(()));
        assert_eq!(busy.len().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_failing_broadcasts_and_leaves() {
        let registry = Registry::new(Room::DEFAULT_CAPACITY);
        let mut ids = Vec::new();
        let mut live_receivers = Vec::new();

        for i in 0..Room::DEFAULT_CAPACITY {
            let id = format!("p{i}");
            let (connection, rx) = Connection::channel(id.as_str().into(), 1024);
            registry.join("stormy", connection).await.unwrap();
            if i % 2 == 0 {
                drop(rx);
            } else {
                live_receivers.push(rx);
            }
            ids.push(ConnectionId::from(id));
        }

        let broadcasters: Vec<_> = ids
            .iter()
            .cloned()
            .enumerate()
            .filter(|(i, _)| i % 2 == 1)
            .map(|(_, sender)| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let mut evicted = Vec::new();
                    for _ in 0..20 {
                        match registry.broadcast("stormy", &sender, &Frame::text("storm")).await {
                            Ok(report) => evicted.extend(report.failed),
                            Err(_) => break,
                        }
                        tokio::task::yield_now().await;
                    }
                    evicted
                })
            })
            .collect();

        let leavers: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    registry.leave(&id, "stormy").await.ok().map(|()| id)
                })
            })
            .collect();

        let mut removed = Vec::new();
        for handle in broadcasters {
            removed.extend(handle.await.unwrap());
        }
        for handle in leavers {
            removed.extend(handle.await.unwrap());
        }

        // Every member left the room exactly once, by eviction or by leaving.
        removed.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(removed, expected);
        assert!(registry.lookup("stormy").await.is_none());
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_rooms_listing() {
        let registry = Registry::new(4);
        let (a, _a_rx) = member("a");
        let (b, _b_rx) = member("b");
        let (c, _c_rx) = member("c");
        registry.join("beta", a).await.unwrap();
        registry.join("alpha", b).await.unwrap();
        registry.join("alpha", c).await.unwrap();

        assert_eq!(
            registry.rooms().await,
            vec![
                RoomSummary {
                    name: "alpha".to_string(),
                    members: 2
                },
                RoomSummary {
                    name: "beta".to_string(),
                    members: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_join_and_leave_never_exceed_capacity() {
        let registry = Registry::new(Room::DEFAULT_CAPACITY);

        let handles: Vec<_> = (0..40)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let (connection, _rx) = member(&format!("p{i}"));
                    let id = connection.id().clone();
                    if registry.join("crowded", connection).await.is_ok() {
                        let room = registry.lookup("crowded").await.unwrap();
                        assert!(room.len().await <= Room::DEFAULT_CAPACITY);
                        if i % 2 == 0 {
                            registry.leave(&id, "crowded").await.unwrap();
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        if let Some(room) = registry.lookup("crowded").await {
            let members = room.len().await;
            assert!(members > 0 && members <= Room::DEFAULT_CAPACITY);
        }
    }
}
