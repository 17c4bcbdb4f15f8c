//! Cursor presence: who is looking where in a document.
//!
//! Presence is ephemeral. Entries are keyed by connection, last write wins,
//! nothing is versioned or persisted, and an entry disappears when its
//! connection leaves or drops.
//!
//! ```text
//! ┌──────────────┐   Cursor{start,end}   ┌───────────────┐
//! │ SyncClient   │ ────────────────────► │ PresenceTable │ (room actor)
//! │              │ ◄──────────────────── │               │
//! │ RemoteCursors│  Presence / Left      └───────────────┘
//! └──────────────┘
//! ```
//!
//! Both sides shift stored ranges through every applied operation so a cursor
//! stays attached to the text around it between updates.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tandem_core::{Operation, Side};

use crate::protocol::ConnectionId;

/// One connection's cursor or selection, in chars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub connection_id: ConnectionId,
    pub cursor_start: usize,
    pub cursor_end: usize,
    /// Stable per connection; feed it to [`CursorColor::from_seed`].
    pub color_seed: u32,
}

impl PresenceEntry {
    pub fn new(connection_id: ConnectionId, cursor_start: usize, cursor_end: usize) -> Self {
        Self {
            connection_id,
            cursor_start,
            cursor_end,
            color_seed: color_seed(&connection_id),
        }
    }

    pub fn is_caret(&self) -> bool {
        self.cursor_start == self.cursor_end
    }

    /// Shift the range through `op`. Text typed at the cursor by its owner
    /// lands before it; anybody else's lands after it.
    pub fn transform(&mut self, op: &Operation, origin: ConnectionId) {
        let side = if origin == self.connection_id {
            Side::Right
        } else {
            Side::Left
        };
        self.cursor_start = op.transform_position(self.cursor_start, side);
        self.cursor_end = op.transform_position(self.cursor_end, side);
    }
}

/// 32-bit string hash of the connection id: `h = h * 31 + unit` over UTF-16
/// units with wrapping, then the absolute value.
pub fn color_seed(id: &ConnectionId) -> u32 {
    let hash = id
        .to_string()
        .encode_utf16()
        .fold(0i32, |hash, unit| {
            hash.wrapping_shl(5)
                .wrapping_sub(hash)
                .wrapping_add(i32::from(unit))
        });
    hash.unsigned_abs()
}

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

const PALETTE: [[u8; 3]; 10] = [
    [0xe6, 0x19, 0x4b],
    [0x3c, 0xb4, 0x4b],
    [0x43, 0x63, 0xd8],
    [0xf5, 0x82, 0x31],
    [0x91, 0x1e, 0xb4],
    [0x46, 0xf0, 0xf0],
    [0xf0, 0x32, 0xe6],
    [0xbc, 0xf6, 0x0c],
    [0x00, 0x80, 0x80],
    [0x9a, 0x63, 0x24],
];

impl CursorColor {
    /// Pick one of ten palette colors. Everyone computes the same color for
    /// the same seed.
    pub fn from_seed(seed: u32) -> Self {
        let [r, g, b] = PALETTE[seed as usize % PALETTE.len()];
        Self::rgba(
            f32::from(r) / 255.0,
            f32::from(g) / 255.0,
            f32::from(b) / 255.0,
            1.0,
        )
    }

    /// Selections are drawn with the cursor's color at reduced alpha.
    pub fn selection(self) -> Self {
        Self { a: 0.3, ..self }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }
}

/// Server-side presence for one document. Owned by the room actor.
#[derive(Debug, Clone, Default)]
pub struct PresenceTable {
    entries: HashMap<ConnectionId, PresenceEntry>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cursor move, returning the entry to broadcast.
    pub fn update(&mut self, connection: ConnectionId, start: usize, end: usize) -> PresenceEntry {
        let entry = PresenceEntry::new(connection, start.min(end), start.max(end));
        self.entries.insert(connection, entry.clone());
        entry
    }

    pub fn remove(&mut self, connection: &ConnectionId) -> Option<PresenceEntry> {
        self.entries.remove(connection)
    }

    /// Shift every stored range through an applied operation.
    pub fn transform(&mut self, op: &Operation, origin: ConnectionId) {
        for entry in self.entries.values_mut() {
            entry.transform(op, origin);
        }
    }

    /// Everyone's entry but `connection`'s, ordered by connection id.
    pub fn others(&self, connection: &ConnectionId) -> Vec<PresenceEntry> {
        let mut others: Vec<PresenceEntry> = self
            .entries
            .values()
            .filter(|e| &e.connection_id != connection)
            .cloned()
            .collect();
        others.sort_by_key(|e| e.connection_id);
        others
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Client-side view of everyone else's cursor.
///
/// Never holds the local connection's own entry.
#[derive(Debug, Clone, Default)]
pub struct RemoteCursors {
    own: Option<ConnectionId>,
    entries: HashMap<ConnectionId, PresenceEntry>,
}

impl RemoteCursors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start over from a snapshot's presence list.
    pub fn reset(&mut self, own: ConnectionId, entries: Vec<PresenceEntry>) {
        self.own = Some(own);
        self.entries.clear();
        for entry in entries {
            self.upsert(entry);
        }
    }

    /// Returns `false` for the local connection's own entry, which is dropped.
    pub fn upsert(&mut self, entry: PresenceEntry) -> bool {
        if Some(entry.connection_id) == self.own {
            return false;
        }
        self.entries.insert(entry.connection_id, entry);
        true
    }

    pub fn remove(&mut self, connection: &ConnectionId) -> Option<PresenceEntry> {
        self.entries.remove(connection)
    }

    /// Shift every remote range through an operation applied locally.
    pub fn transform(&mut self, op: &Operation, origin: ConnectionId) {
        for entry in self.entries.values_mut() {
            entry.transform(op, origin);
        }
    }

    pub fn clear(&mut self) {
        self.own = None;
        self.entries.clear();
    }

    pub fn get(&self, connection: &ConnectionId) -> Option<&PresenceEntry> {
        self.entries.get(connection)
    }

    /// Remote entries, ordered by connection id.
    pub fn entries(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.connection_id);
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
