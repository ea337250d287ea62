//! Resource store: two-tier cache with dependency-graph invalidation.
//!
//! - **FastTier**: bounded in-process cache (adaptive replacement).
//! - **DurableTier**: shared SQLite store, the source of truth across
//!   restarts and across instances.
//! - **RelationGraph**: in-memory parent/child edge bookkeeping.
//! - **ResourceStore**: the orchestrator: read-through, write coalescing,
//!   lazy expiry and the cascading `invalidate_parents` walk.
//!
//! Keys are variant-aware: `key` combines the resource url with normalized
//! content-negotiation dimensions (see [`key`]).

pub mod durable;
pub mod error;
pub mod fast;
mod flight;
pub mod graph;
pub mod key;
pub(crate) mod lock;
pub mod resource;
#[allow(clippy::module_inception)]
mod store;

pub use durable::DurableTier;
pub use error::StoreError;
pub use fast::FastTier;
pub use graph::RelationGraph;
pub use key::VariantConfig;
pub use resource::{MAXAGE_FOREVER, Resource};
pub use store::{ResourceStore, StoreOptions};
