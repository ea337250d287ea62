//! Invalidation bus: room-based pub/sub for resource-change messages.
//!
//! A producer publishes one message per mutation; the server rebroadcasts it
//! to the wildcard room and to the changed subtree's room, keeping a bounded
//! backlog so late joiners catch up from their last-known mtime. Every
//! subscribing process (the producer's own included) feeds received
//! messages into its local store, advancing the invalidation cascade one hop
//! per delivery.

pub mod client;
pub mod error;
pub mod message;
pub mod rooms;
pub mod server;

pub use client::{BusClient, BusState, ClientOptions, Publisher, ReconnectConfig};
pub use error::BusError;
pub use message::{ChangeMessage, ClientFrame, JoinFrame, LeaveFrame, Method};
pub use rooms::Backlog;
pub use server::{BusServerState, ServerOptions};
