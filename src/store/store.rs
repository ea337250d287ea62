//! Resource store orchestration.
//!
//! Glues the fast tier, the relation graph and the durable tier together and
//! owns the only mutation paths into them. Writes are coalesced per key
//! through [`WriteFlights`]; a `limbo` map keeps every value visible from the
//! moment `set` accepts it until its durable write lands, so eviction can
//! never hide data that has not reached the durable tier.
//!
//! `invalidate_parents` is the cascade: one hop invalidates the direct
//! parents of the last-walked key and re-publishes one message per parent.
//! Every subscribed process advances the walk for the parents it knows,
//! which is what makes the cascade complete when no instance holds the full
//! graph in memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::bus::client::Publisher;
use crate::bus::message::ChangeMessage;

use super::durable::DurableTier;
use super::error::StoreError;
use super::fast::{CacheEntry, FastTier};
use super::flight::WriteFlights;
use super::graph::RelationGraph;
use super::key::VariantConfig;
use super::lock::mutex_lock;
use super::resource::{Resource, now_millis};

const SOURCE: &str = "store";

const METRIC_FAST_HIT: &str = "veille_store_fast_hit_total";
const METRIC_FAST_MISS: &str = "veille_store_fast_miss_total";
const METRIC_FAST_EVICT: &str = "veille_store_fast_evict_total";
const METRIC_DURABLE_WRITE_MS: &str = "veille_store_durable_write_ms";
const METRIC_CASCADE_FANOUT: &str = "veille_store_cascade_fanout_total";

/// Store construction knobs.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Fast-tier capacity, in entries.
    pub cache_size: usize,
    /// Variant dimensions shared by every key derivation site.
    pub variants: VariantConfig,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            cache_size: 500,
            variants: VariantConfig::default(),
        }
    }
}

struct State {
    fast: FastTier,
    graph: RelationGraph,
    /// Values accepted by `set` whose durable write has not completed.
    limbo: HashMap<String, Resource>,
}

struct Inner {
    state: Mutex<State>,
    flights: WriteFlights,
    durable: DurableTier,
    publisher: Publisher,
    variants: VariantConfig,
}

/// The resource store. Cheap to clone; construct once and hand to every
/// producer and to the bus subscriber.
#[derive(Clone)]
pub struct ResourceStore {
    inner: Arc<Inner>,
}

impl ResourceStore {
    pub fn new(durable: DurableTier, publisher: Publisher, options: StoreOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    fast: FastTier::new(options.cache_size),
                    graph: RelationGraph::new(),
                    limbo: HashMap::new(),
                }),
                flights: WriteFlights::new(),
                durable,
                publisher,
                variants: options.variants,
            }),
        }
    }

    /// The variant configuration every producer must derive keys with.
    pub fn variants(&self) -> &VariantConfig {
        &self.inner.variants
    }

    /// The bus handle producers publish their own change messages through.
    pub fn publisher(&self) -> &Publisher {
        &self.inner.publisher
    }

    /// Direct access to the durable tier (maintenance paths and tests).
    pub fn durable(&self) -> &DurableTier {
        &self.inner.durable
    }

    fn lock(&self, op: &'static str) -> MutexGuard<'_, State> {
        mutex_lock(&self.inner.state, SOURCE, op)
    }

    /// Fetch a resource, fast tier first. Expired entries (`maxage` elapsed)
    /// are deleted lazily and reported as absent. Invalid resources are
    /// returned as-is; callers must check `valid` before serving.
    pub async fn get(&self, key: &str) -> Result<Option<Resource>, StoreError> {
        let now = now_millis();
        let resident = {
            let mut state = self.lock("get");
            let found = if let Some(entry) = state.fast.get_mut(key) {
                Some(entry.resource.clone())
            } else {
                state.limbo.get(key).cloned()
            };
            found.map(|mut res| {
                // edges always come from the graph; resident copies may
                // predate a del/depend on a related key
                res.resources = state.graph.children_of(key);
                res.parents = state.graph.parents_of(key).into_iter().collect();
                res
            })
        };

        if let Some(res) = resident {
            if res.expired(now) {
                debug!(key, "lazy expiry on fast-tier hit");
                self.del(key).await?;
                return Ok(None);
            }
            counter!(METRIC_FAST_HIT).increment(1);
            return Ok(Some(res));
        }
        counter!(METRIC_FAST_MISS).increment(1);

        let Some(mut res) = self.inner.durable.get(key).await? else {
            return Ok(None);
        };
        if res.expired(now) {
            debug!(key, "lazy expiry on durable-tier hit");
            self.del(key).await?;
            return Ok(None);
        }

        {
            let mut state = self.lock("get");
            state.graph.set_children(key, res.resources.clone());
            let evicted = state.fast.insert(key, res.clone(), false);
            absorb_evictions(&self.inner, &mut state, evicted);
            res.parents.extend(state.graph.parents_of(key));
        }
        Ok(Some(res))
    }

    /// Store a resource, repairing edges on both sides of any diff against
    /// the previous declaration, and coalescing the durable write with any
    /// other write already in flight for this key.
    pub async fn set(&self, key: &str, mut res: Resource) -> Result<Resource, StoreError> {
        if key.is_empty() {
            return Err(StoreError::validation("empty resource key"));
        }
        res.key = key.to_string();
        if res.resources.iter().any(|c| c == key) {
            let err = StoreError::graph(format!("resource `{key}` cannot depend on itself"));
            warn!(key, error = %err, "dropping self-edge");
            res.resources.retain(|c| c != key);
        }
        let mut seen = std::collections::HashSet::new();
        res.resources.retain(|c| seen.insert(c.clone()));
        res.normalize_for_save();

        let rx = {
            let mut state = self.lock("set");
            state.graph.set_children(key, res.resources.clone());

            let mut evicted = Vec::new();
            for child in &res.resources {
                if !state.fast.contains(child) && !state.limbo.contains_key(child) {
                    evicted.extend(state.fast.insert(child, Resource::stub(child.clone()), false));
                }
            }
            evicted.extend(state.fast.insert(key, res.clone(), true));
            state.limbo.insert(key.to_string(), res.clone());
            absorb_evictions(&self.inner, &mut state, evicted);

            let (rx, opened) = self.inner.flights.enqueue(key, res.clone());
            if opened {
                spawn_writer(self.inner.clone(), key.to_string());
            }
            rx
        };

        match rx.await {
            Ok(result) => result?,
            Err(_) => return Err(StoreError::transient("durable writer vanished")),
        }
        Ok(res)
    }

    /// Remove a resource and sever its edges in both directions.
    pub async fn del(&self, key: &str) -> Result<(), StoreError> {
        {
            let mut state = self.lock("del");
            state.fast.remove(key);
            state.limbo.remove(key);
            state.graph.remove_key(key);
        }
        self.inner.durable.delete(key).await
    }

    /// Mark stale without removing data or touching edges.
    pub async fn invalidate(&self, key: &str) -> Result<(), StoreError> {
        {
            let mut state = self.lock("invalidate");
            if let Some(entry) = state.fast.get_mut(key) {
                entry.resource.valid = false;
            }
            if let Some(res) = state.limbo.get_mut(key) {
                res.valid = false;
            }
        }
        self.inner.durable.invalidate(key).await
    }

    /// One cascade hop: invalidate the direct parents of the last-walked key
    /// and re-publish the message once per newly invalidated parent.
    ///
    /// Monotonic per key: a parent whose mtime is already at or past the
    /// message's is left untouched and not re-published, which makes
    /// duplicate and reordered delivery idempotent. A failure on one parent
    /// is logged and never stops the rest of the fan-out.
    pub async fn invalidate_parents(&self, msg: &ChangeMessage) -> Result<(), StoreError> {
        if msg.key.is_empty() {
            return Err(StoreError::validation("invalidation message without a key"));
        }
        let walked = msg.target().to_string();

        let mut candidates = {
            let state = self.lock("invalidate_parents");
            state.graph.parents_of(&walked)
        };
        // The durable edge table sees parents declared by other instances
        // (and by evicted residents), so it is consulted on every hop.
        match self.inner.durable.parents_of(&walked).await {
            Ok(parents) => {
                for parent in parents {
                    if !candidates.contains(&parent) {
                        candidates.push(parent);
                    }
                }
            }
            Err(err) => warn!(
                key = %walked,
                error = %err,
                "cold-path parent lookup failed; cascading over resident edges only"
            ),
        }

        let mut fanout = 0_u64;
        for parent in candidates {
            // cycle / duplicate guard: never walk a key twice
            if parent == msg.key || msg.parents.iter().any(|p| p == &parent) {
                continue;
            }
            let resident = {
                let mut state = self.lock("invalidate_parents");
                apply_resident(&mut state, &parent, msg.mtime)
            };
            if resident == Some(false) {
                continue;
            }
            let stored = match self.inner.durable.invalidate_if_older(&parent, msg.mtime).await {
                Ok(applied) => applied,
                Err(err) => {
                    warn!(parent = %parent, error = %err, "cascade hop failed; continuing fan-out");
                    false
                }
            };
            if resident == Some(true) || stored {
                self.inner.publisher.send(msg.child(&parent));
                fanout += 1;
            }
        }
        counter!(METRIC_CASCADE_FANOUT).increment(fanout);
        debug!(key = %msg.key, walked = %walked, fanout, "cascade hop complete");
        Ok(())
    }

    /// Declare a single dependency edge without rewriting the parent's full
    /// child set. Sugar for rendering workers assembling composite resources.
    pub async fn depend(&self, parent: &str, child: &str) -> Result<(), StoreError> {
        if parent.is_empty() || child.is_empty() {
            return Err(StoreError::validation("depend requires both keys"));
        }
        if parent == child {
            let err = StoreError::graph(format!("resource `{parent}` cannot depend on itself"));
            warn!(key = parent, error = %err, "rejecting self-edge");
            return Err(err);
        }
        {
            let mut state = self.lock("depend");
            state.graph.add_child(parent, child);
            if let Some(entry) = state.fast.get_mut(parent)
                && !entry.resource.resources.iter().any(|c| c == child)
            {
                entry.resource.resources.push(child.to_string());
            }
            if let Some(res) = state.limbo.get_mut(parent)
                && !res.resources.iter().any(|c| c == child)
            {
                res.resources.push(child.to_string());
            }
            if !state.fast.contains(child) && !state.limbo.contains_key(child) {
                let evicted = state.fast.insert(child, Resource::stub(child), false);
                absorb_evictions(&self.inner, &mut state, evicted);
            }
        }
        self.inner.durable.add_edge(parent, child).await
    }

    /// Migrate a resource whose effective variant changed: the payload and
    /// declared children move to the new canonical key, the old entry is
    /// retired. Parents of the old key lose the edge; their producers
    /// re-declare it against the new key on their next build.
    pub async fn rekey(&self, old_key: &str, new_key: &str) -> Result<Option<Resource>, StoreError> {
        if new_key.is_empty() {
            return Err(StoreError::validation("empty rekey target"));
        }
        if old_key == new_key {
            return self.get(old_key).await;
        }
        let Some(mut res) = self.get(old_key).await? else {
            return Ok(None);
        };
        debug!(old_key, new_key, "migrating resource to new variant key");
        res.parents.clear();
        let stored = self.set(new_key, res).await?;
        self.del(old_key).await?;
        Ok(Some(stored))
    }

    /// Garbage-collect durable resources tagged with `builder` whose
    /// `mtime + maxage` has passed. Resident copies age out lazily.
    pub async fn expire(&self, builder: &str) -> Result<u64, StoreError> {
        let removed = self.inner.durable.expire(builder).await?;
        if removed > 0 {
            info!(builder, removed, "expired builder-tagged resources");
        }
        Ok(removed)
    }
}

/// Apply an invalidation to resident copies of `key`.
///
/// `None` = not resident; `Some(true)` = applied; `Some(false)` = resident
/// but the message is not newer, so the hop must be dropped.
fn apply_resident(state: &mut State, key: &str, mtime: i64) -> Option<bool> {
    let mut present = false;
    let mut applied = false;
    if let Some(entry) = state.fast.get_mut(key) {
        present = true;
        if entry.resource.mtime < mtime {
            entry.resource.valid = false;
            entry.resource.mtime = mtime;
            applied = true;
        }
    }
    if let Some(res) = state.limbo.get_mut(key) {
        present = true;
        if res.mtime < mtime {
            res.valid = false;
            res.mtime = mtime;
            applied = true;
        }
    }
    present.then_some(applied)
}

/// Fold evictions back into the store: drop the evicted key's declared
/// edges and schedule a write-back for entries the durable tier has not
/// seen yet.
fn absorb_evictions(inner: &Arc<Inner>, state: &mut State, evicted: Vec<(String, CacheEntry)>) {
    for (key, entry) in evicted {
        counter!(METRIC_FAST_EVICT).increment(1);
        state.graph.remove_declared(&key);
        if entry.dirty {
            debug!(key, "dirty eviction; scheduling write-back");
            state.limbo.insert(key.clone(), entry.resource.clone());
            let (_rx, opened) = inner.flights.enqueue(&key, entry.resource);
            if opened {
                spawn_writer(inner.clone(), key);
            }
        }
    }
}

/// Writer loop for one key's flight: drain the latest pending value per
/// round, then clear the in-flight marking once nothing newer is queued.
fn spawn_writer(inner: Arc<Inner>, key: String) {
    tokio::spawn(async move {
        let mut last_ok = true;
        while let Some((resource, waiters)) = inner.flights.next_round(&key) {
            let started = Instant::now();
            let result = inner.durable.put(&resource).await;
            histogram!(METRIC_DURABLE_WRITE_MS)
                .record(started.elapsed().as_secs_f64() * 1000.0);
            if let Err(err) = &result {
                warn!(key = %key, error = %err, "durable write failed");
            }
            last_ok = result.is_ok();
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
        let mut state = mutex_lock(&inner.state, SOURCE, "writer_cleanup");
        if !inner.flights.is_inflight(&key) {
            state.limbo.remove(&key);
            if last_ok {
                state.fast.mark_clean(&key);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    async fn durable() -> DurableTier {
        DurableTier::connect("sqlite::memory:", 1)
            .await
            .expect("in-memory durable tier")
    }

    async fn store() -> (ResourceStore, mpsc::UnboundedReceiver<ChangeMessage>) {
        store_with(durable().await, 64)
    }

    fn store_with(
        durable: DurableTier,
        cache_size: usize,
    ) -> (ResourceStore, mpsc::UnboundedReceiver<ChangeMessage>) {
        let (publisher, rx) = Publisher::channel();
        let options = StoreOptions {
            cache_size,
            ..Default::default()
        };
        (ResourceStore::new(durable, publisher, options), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ChangeMessage>) -> Vec<ChangeMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn set_then_get_roundtrip() {
        let (store, _rx) = store().await;
        let res = Resource::new("http://x/a")
            .with_data("payload")
            .with_header("content-type", "text/html");

        let stored = store.set("http://x/a", res).await.expect("set");
        assert!(stored.valid);
        assert!(stored.mtime > 0);

        let got = store.get("http://x/a").await.expect("get").expect("hit");
        assert_eq!(got.data.as_deref(), Some(b"payload".as_slice()));
        assert!(got.valid);
    }

    #[tokio::test]
    async fn edge_symmetry_after_set_and_rediff() {
        let (store, _rx) = store().await;
        store
            .set("a", Resource::new("a").with_data("x").with_children(["b"]))
            .await
            .expect("set a");

        let b = store.get("b").await.expect("get").expect("stub");
        assert!(b.parents.contains("a"));
        assert!(!b.valid);

        // redeclare: b drops off, c joins
        store
            .set("a", Resource::new("a").with_data("x").with_children(["c"]))
            .await
            .expect("reset a");

        let b = store.get("b").await.expect("get").expect("stub");
        assert!(b.parents.is_empty());
        let c = store.get("c").await.expect("get").expect("stub");
        assert!(c.parents.contains("a"));
    }

    #[tokio::test]
    async fn self_edge_is_dropped_but_set_proceeds() {
        let (store, _rx) = store().await;
        let stored = store
            .set("a", Resource::new("a").with_data("x").with_children(["a", "b"]))
            .await
            .expect("set");
        assert_eq!(stored.resources, vec!["b"]);
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let (store, _rx) = store().await;
        let err = store.set("", Resource::new("")).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
    }

    #[tokio::test]
    async fn lazy_expiry_deletes_on_get() {
        let (store, _rx) = store().await;
        let mut res = Resource::new("k").with_data("x").with_maxage(5);
        res.mtime = now_millis() - 6_000;
        store.set("k", res).await.expect("set");

        assert!(store.get("k").await.expect("get").is_none());
        // the implicit del reached the durable tier too
        let (other, _rx2) = store_with(store.durable().clone(), 64);
        assert!(other.get("k").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn second_instance_reads_through_durable_tier() {
        let shared = durable().await;
        let (one, _rx1) = store_with(shared.clone(), 64);
        let (two, _rx2) = store_with(shared, 64);

        one.set("k", Resource::new("k").with_data("shared"))
            .await
            .expect("set");

        let got = two.get("k").await.expect("get").expect("hit");
        assert_eq!(got.data.as_deref(), Some(b"shared".as_slice()));
    }

    #[tokio::test]
    async fn invalidate_keeps_data() {
        let (store, _rx) = store().await;
        store
            .set("k", Resource::new("k").with_data("x"))
            .await
            .expect("set");

        store.invalidate("k").await.expect("invalidate");

        let got = store.get("k").await.expect("get").expect("hit");
        assert!(!got.valid);
        assert_eq!(got.data.as_deref(), Some(b"x".as_slice()));
    }

    #[tokio::test]
    async fn del_severs_edges_both_ways() {
        let (store, _rx) = store().await;
        store
            .set("a", Resource::new("a").with_data("x").with_children(["b"]))
            .await
            .expect("set a");
        store
            .set("b", Resource::new("b").with_data("x"))
            .await
            .expect("set b");

        store.del("b").await.expect("del");

        let a = store.get("a").await.expect("get").expect("hit");
        assert!(a.resources.is_empty());
        assert!(store.get("b").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn invalidate_parents_single_hop_scenario() {
        let (store, mut rx) = store().await;
        let mut b = Resource::new("http://x/b").with_data("leaf");
        b.mtime = 50;
        store.set("http://x/b", b).await.expect("set b");
        let mut a = Resource::new("http://x/a")
            .with_data("page")
            .with_children(["http://x/b"]);
        a.mtime = 50;
        store.set("http://x/a", a).await.expect("set a");

        let msg = ChangeMessage::put("http://x/b").with_mtime(100);
        store.invalidate_parents(&msg).await.expect("cascade");

        let published = drain(&mut rx);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key, "http://x/b");
        assert_eq!(published[0].parents, vec!["http://x/a"]);
        assert_eq!(published[0].mtime, 100);

        let a = store.get("http://x/a").await.expect("get").expect("hit");
        assert!(!a.valid);
        assert_eq!(a.mtime, 100);
    }

    #[tokio::test]
    async fn invalidation_is_idempotent_and_monotonic() {
        let (store, mut rx) = store().await;
        let mut b = Resource::new("b").with_data("x");
        b.mtime = 50;
        store.set("b", b).await.expect("set b");
        let mut a = Resource::new("a").with_data("x").with_children(["b"]);
        a.mtime = 50;
        store.set("a", a).await.expect("set a");

        let msg = ChangeMessage::put("b").with_mtime(100);
        store.invalidate_parents(&msg).await.expect("first");
        assert_eq!(drain(&mut rx).len(), 1);

        // duplicate delivery: no further effect, nothing re-published
        store.invalidate_parents(&msg).await.expect("second");
        assert!(drain(&mut rx).is_empty());

        // reordered older message: dropped
        let stale = ChangeMessage::put("b").with_mtime(80);
        store.invalidate_parents(&stale).await.expect("stale");
        assert!(drain(&mut rx).is_empty());

        let a = store.get("a").await.expect("get").expect("hit");
        assert_eq!(a.mtime, 100);
    }

    #[tokio::test]
    async fn cascade_chain_completes_with_exact_fanout() {
        let (store, mut rx) = store().await;
        for (key, children) in [("c", vec![]), ("b", vec!["c"]), ("a", vec!["b"])] {
            let mut res = Resource::new(key).with_data("x").with_children(children);
            res.mtime = 10;
            store.set(key, res).await.expect("set");
        }

        store
            .invalidate_parents(&ChangeMessage::put("c").with_mtime(100))
            .await
            .expect("hop 1");

        // pump re-published messages back in, as the bus loopback would
        let mut total = 0;
        let mut queue = drain(&mut rx);
        while let Some(msg) = queue.pop() {
            total += 1;
            store.invalidate_parents(&msg).await.expect("pump");
            queue.extend(drain(&mut rx));
        }
        assert_eq!(total, 2);

        for key in ["a", "b"] {
            let res = store.get(key).await.expect("get").expect("hit");
            assert!(!res.valid, "{key} should be invalidated");
            assert_eq!(res.mtime, 100);
        }
        let c = store.get("c").await.expect("get").expect("hit");
        assert!(c.valid, "the changed leaf itself is the producer's to update");
    }

    #[tokio::test]
    async fn concurrent_sets_coalesce_to_last_value() {
        let (store, _rx) = store().await;
        let (r1, r2, r3) = tokio::join!(
            store.set("k", Resource::new("k").with_data("v1")),
            store.set("k", Resource::new("k").with_data("v2")),
            store.set("k", Resource::new("k").with_data("v3")),
        );
        r1.expect("set 1");
        r2.expect("set 2");
        r3.expect("set 3");

        let row = store
            .inner
            .durable
            .get("k")
            .await
            .expect("durable get")
            .expect("row");
        assert_eq!(row.data.as_deref(), Some(b"v3".as_slice()));
    }

    #[tokio::test]
    async fn depend_declares_edge_and_cascades_through_it() {
        let (store, mut rx) = store().await;
        let mut p = Resource::new("p").with_data("x");
        p.mtime = 10;
        store.set("p", p).await.expect("set p");

        store.depend("p", "c").await.expect("depend");

        let p = store.get("p").await.expect("get").expect("hit");
        assert_eq!(p.resources, vec!["c"]);

        store
            .invalidate_parents(&ChangeMessage::put("c").with_mtime(100))
            .await
            .expect("cascade");
        assert_eq!(drain(&mut rx).len(), 1);
        assert!(!store.get("p").await.expect("get").expect("hit").valid);
    }

    #[tokio::test]
    async fn rekey_migrates_data_and_edges() {
        let (store, _rx) = store().await;
        let mut res = Resource::new("http://x/a")
            .with_data("payload")
            .with_children(["http://x/b"]);
        res.mtime = 42;
        store.set("http://x/a", res).await.expect("set");

        let moved = store
            .rekey("http://x/a", "type=json http://x/a")
            .await
            .expect("rekey")
            .expect("migrated");
        assert_eq!(moved.key, "type=json http://x/a");
        assert_eq!(moved.url, "http://x/a");
        assert_eq!(moved.mtime, 42);
        assert_eq!(moved.resources, vec!["http://x/b"]);

        assert!(store.get("http://x/a").await.expect("get").is_none());
        let b = store.get("http://x/b").await.expect("get").expect("stub");
        assert!(b.parents.contains("type=json http://x/a"));
        assert!(!b.parents.contains("http://x/a"));
    }

    #[tokio::test]
    async fn depend_rejects_self_edge() {
        let (store, _rx) = store().await;
        let err = store.depend("p", "p").await.unwrap_err();
        assert!(matches!(err, StoreError::GraphIntegrity { .. }));
    }

    #[tokio::test]
    async fn variant_keys_are_independent_entries() {
        let (store, mut rx) = store().await;
        let variants = store.variants().clone();
        let headers = |ct: &str| {
            [
                ("content-type".to_string(), ct.to_string()),
                ("vary".to_string(), "content-type".to_string()),
            ]
            .into_iter()
            .collect()
        };
        let json_key = variants.derive("http://x/a", &headers("application/json"), None);
        let html_key = variants.derive("http://x/a", &headers("text/html"), None);
        assert_ne!(json_key, html_key);

        let mut json = Resource::new(&json_key).with_data("{}");
        json.mtime = 10;
        store.set(&json_key, json).await.expect("set json");
        let mut html = Resource::new(&html_key).with_data("<p>");
        html.mtime = 10;
        store.set(&html_key, html).await.expect("set html");

        // invalidating one variant leaves the other untouched
        store
            .invalidate_parents(&ChangeMessage::put(json_key.clone()).with_mtime(100))
            .await
            .expect("cascade");
        assert!(drain(&mut rx).is_empty(), "no parents, no fan-out");

        store.invalidate(&json_key).await.expect("invalidate");
        assert!(!store.get(&json_key).await.expect("get").expect("hit").valid);
        assert!(store.get(&html_key).await.expect("get").expect("hit").valid);
    }
}
