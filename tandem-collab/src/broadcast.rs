//! Fan-out from a room actor to its connections.
//!
//! One tokio broadcast channel per document. Every event goes to every member,
//! including the one that caused it: the connection task decides what its
//! client sees (an `Ack` for its own op, nothing for its own cursor). Going
//! through the same channel keeps a client's ack ordered with everyone
//! else's ops.
//!
//! A receiver that falls more than `capacity` events behind gets `Lagged`
//! and must resync.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tandem_core::Operation;
use tokio::sync::broadcast;

use crate::presence::PresenceEntry;
use crate::protocol::{ConnectionId, ServerMessage};

/// Something that happened in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    Applied {
        origin: ConnectionId,
        version: u64,
        op: Operation,
    },
    Presence(PresenceEntry),
    PresenceLeft(ConnectionId),
}

impl RoomEvent {
    /// What `connection` should be told about this event, if anything.
    pub fn for_connection(&self, connection: ConnectionId) -> Option<ServerMessage> {
        match self {
            RoomEvent::Applied {
                origin,
                version,
                op,
            } if *origin == connection => Some(ServerMessage::Ack {
                version: *version,
                op: op.clone(),
            }),
            RoomEvent::Applied {
                origin,
                version,
                op,
            } => Some(ServerMessage::Op {
                origin: *origin,
                version: *version,
                op: op.clone(),
            }),
            RoomEvent::Presence(entry) if entry.connection_id == connection => None,
            RoomEvent::Presence(entry) => Some(ServerMessage::Presence(entry.clone())),
            RoomEvent::PresenceLeft(id) if *id == connection => None,
            RoomEvent::PresenceLeft(id) => Some(ServerMessage::PresenceLeft {
                connection_id: *id,
            }),
        }
    }
}

pub type RoomReceiver = broadcast::Receiver<Arc<RoomEvent>>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub events_sent: u64,
    /// Events published while nobody was listening.
    pub events_unheard: u64,
    pub active_members: usize,
}

/// Membership and fan-out for one document. Owned by the room actor, so no
/// locking.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RoomEvent>>,
    members: HashMap<ConnectionId, Instant>,
    capacity: usize,
    stats: BroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many events a member may fall behind before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: HashMap::new(),
            capacity,
            stats: BroadcastStats::default(),
        }
    }

    /// Add (or re-add) a member. The receiver sees every event published
    /// after this call.
    pub fn add_member(&mut self, connection: ConnectionId) -> RoomReceiver {
        self.members.entry(connection).or_insert_with(Instant::now);
        self.sender.subscribe()
    }

    /// Returns whether the connection was a member.
    pub fn remove_member(&mut self, connection: &ConnectionId) -> bool {
        self.members.remove(connection).is_some()
    }

    /// Returns how many receivers got the event.
    pub fn publish(&mut self, event: RoomEvent) -> usize {
        self.stats.events_sent += 1;
        match self.sender.send(Arc::new(event)) {
            Ok(count) => count,
            Err(_) => {
                self.stats.events_unheard += 1;
                0
            }
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn has_member(&self, connection: &ConnectionId) -> bool {
        self.members.contains_key(connection)
    }

    /// Members, longest-connected first.
    pub fn members(&self) -> Vec<ConnectionId> {
        let mut members: Vec<(ConnectionId, Instant)> =
            self.members.iter().map(|(id, at)| (*id, *at)).collect();
        members.sort_by_key(|(id, at)| (*at, *id));
        members.into_iter().map(|(id, _)| id).collect()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            active_members: self.members.len(),
            ..self.stats.clone()
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
