//! Producer-side proxies: thin consumers of the store and the bus.
//!
//! Each proxy owns one source of truth (an inner HTTP handler, a remote
//! origin, the local filesystem) and folds its changes into the shared
//! store, publishing one change message per mutation. They all degrade
//! cache-aside: a store failure rebuilds from source instead of failing the
//! producer's own pipeline.

pub mod local;
pub mod middleware;
pub mod remote;

pub use local::{FileWatcher, LOCAL_BUILDER};
pub use middleware::{PROXY_BUILDER, ProxyState, resource_cache_layer};
pub use remote::{FetchOptions, REMOTE_BUILDER, RemoteFetcher};
