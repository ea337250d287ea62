//! veille: cache-coherence layer for derived web resources.
//!
//! Producers register resources with explicit dependency edges on the
//! resources they were built from. When a leaf changes, the store invalidates
//! every transitive dependent and the bus tells every interested process,
//! other instances included, with per-key mtime monotonicity guaranteeing
//! that reordered or duplicated delivery never resurrects stale content.
//!
//! The two core pieces:
//!
//! - [`store`]: two-tier resource store (bounded adaptive-replacement fast
//!   tier over a shared SQLite durable tier) with variant-aware keys, write
//!   coalescing and the cascading `invalidate_parents` walk.
//! - [`bus`]: room-based pub/sub with join-time backlog replay.
//!
//! [`proxy`] carries the in-tree producers (HTTP middleware, remote fetcher,
//! file watcher); [`config`] and [`infra`] the process plumbing.

pub mod bus;
pub mod config;
pub mod infra;
pub mod proxy;
pub mod store;

pub use bus::{BusClient, ChangeMessage, Publisher};
pub use store::{Resource, ResourceStore, StoreOptions, VariantConfig};
