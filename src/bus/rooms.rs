//! Room backlog.
//!
//! The server remembers the last `limit` accepted messages together with the
//! rooms they were broadcast to. A subscriber joining with a known mtime gets
//! the room's newer messages replayed in FIFO order: a bounded catch-up
//! window, not an unbounded log.

use std::collections::VecDeque;

use super::message::ChangeMessage;

struct Entry {
    rooms: Vec<String>,
    msg: ChangeMessage,
}

/// Bounded, room-tagged message history with a high-water mtime.
pub struct Backlog {
    limit: usize,
    entries: VecDeque<Entry>,
    high_water: i64,
}

impl Backlog {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            entries: VecDeque::new(),
            high_water: 0,
        }
    }

    /// Record an accepted message and the rooms it went to.
    pub fn record(&mut self, rooms: &[String], msg: &ChangeMessage) {
        self.high_water = self.high_water.max(msg.mtime);
        self.entries.push_back(Entry {
            rooms: rooms.to_vec(),
            msg: msg.clone(),
        });
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    /// Messages broadcast to `room` since `since`, oldest first.
    pub fn replay(&self, room: &str, since: i64) -> Vec<ChangeMessage> {
        self.entries
            .iter()
            .filter(|entry| entry.msg.mtime > since && entry.rooms.iter().any(|r| r == room))
            .map(|entry| entry.msg.clone())
            .collect()
    }

    /// Newest mtime ever recorded, survives entries aging out of the window.
    pub fn high_water(&self) -> i64 {
        self.high_water
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
