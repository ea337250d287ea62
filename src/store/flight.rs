//! Per-key in-flight write coalescing.
//!
//! Concurrent writers to one key never race on the durable tier: the first
//! write opens a flight, later writes replace the flight's pending value, and
//! a single writer loop drains the latest value per round. N sets racing
//! ahead of the first durable write collapse into one write of the last
//! value. Callers are released when the write covering their value completes.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use super::error::StoreError;
use super::lock::mutex_lock;
use super::resource::Resource;

const SOURCE: &str = "store::flight";

pub(crate) type WriteResult = Result<(), StoreError>;

#[derive(Default)]
struct Flight {
    pending: Option<Resource>,
    waiters: Vec<oneshot::Sender<WriteResult>>,
}

/// Table of open flights, one per key with an outstanding durable write.
#[derive(Default)]
pub(crate) struct WriteFlights {
    flights: Mutex<HashMap<String, Flight>>,
}

impl WriteFlights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `resource` as the latest value for `key`.
    ///
    /// Returns the completion receiver and whether the caller must spawn a
    /// writer loop (true exactly when this enqueue opened the flight).
    pub fn enqueue(&self, key: &str, resource: Resource) -> (oneshot::Receiver<WriteResult>, bool) {
        let (tx, rx) = oneshot::channel();
        let mut flights = mutex_lock(&self.flights, SOURCE, "enqueue");
        let opened = !flights.contains_key(key);
        let flight = flights.entry(key.to_string()).or_default();
        flight.pending = Some(resource);
        flight.waiters.push(tx);
        (rx, opened)
    }

    /// Take the next value to write for `key`, with the waiters it covers.
    /// Returns `None`, atomically closing the flight, when nothing newer
    /// is queued, ending the writer loop.
    pub fn next_round(&self, key: &str) -> Option<(Resource, Vec<oneshot::Sender<WriteResult>>)> {
        let mut flights = mutex_lock(&self.flights, SOURCE, "next_round");
        let flight = flights.get_mut(key)?;
        let round = flight
            .pending
            .take()
            .map(|resource| (resource, std::mem::take(&mut flight.waiters)));
        if round.is_none() {
            flights.remove(key);
        }
        round
    }

    /// Whether a flight is open for `key` (write outstanding or queued).
    pub fn is_inflight(&self, key: &str) -> bool {
        mutex_lock(&self.flights, SOURCE, "is_inflight").contains_key(key)
    }
}
