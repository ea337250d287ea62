//! Remote fetcher: a revalidating HTTP poller producing cached resources.
//!
//! `fetch` serves from the store while the resource is fresh, and otherwise
//! issues a conditional GET (`If-None-Match` from the stored etag):
//!
//! - 200 with a changed body → `set`, and publish `put` when an older copy
//!   existed (its dependents must rebuild)
//! - 304 → the cached copy stands
//! - 404 → `del` and publish `delete`
//! - 5xx / transport failure → serve the stale copy when one exists
//!
//! Concurrent in-process fetches of one key coalesce onto a single request,
//! and a positive `maxage` schedules one background re-poll per key.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::bus::message::ChangeMessage;
use crate::store::error::StoreError;
use crate::store::lock::mutex_lock;
use crate::store::resource::{MAXAGE_FOREVER, Resource, now_millis};
use crate::store::ResourceStore;

const SOURCE: &str = "proxy::remote";

/// Builder tag recorded on resources this fetcher creates.
pub const REMOTE_BUILDER: &str = "remote";

type FetchResult = Result<Option<Resource>, StoreError>;

/// Per-request knobs.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Extra request headers; also feed key derivation (`Accept` and friends).
    pub headers: BTreeMap<String, String>,
    /// Freshness window in seconds; 0 revalidates on every fetch.
    pub maxage: i64,
}

struct RemoteInner {
    store: ResourceStore,
    http: reqwest::Client,
    /// Coalesced in-process fetches: key → callers awaiting the leader.
    inflight: Mutex<HashMap<String, Vec<oneshot::Sender<FetchResult>>>>,
    /// Keys with a scheduled background re-poll.
    pollers: Mutex<HashMap<String, FetchOptions>>,
}

/// Revalidating fetcher over a shared resource store.
#[derive(Clone)]
pub struct RemoteFetcher {
    inner: Arc<RemoteInner>,
}

impl RemoteFetcher {
    pub fn new(store: ResourceStore) -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                store,
                http: reqwest::Client::new(),
                inflight: Mutex::new(HashMap::new()),
                pollers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Fetch `url`, serving the cached resource while fresh.
    pub async fn fetch(&self, url: &str, opts: FetchOptions) -> FetchResult {
        let key = self
            .inner
            .store
            .variants()
            .derive_request(url, &opts.headers, None);

        let cached = match self.inner.store.get(&key).await {
            Ok(cached) => cached,
            Err(err) => {
                warn!(key, error = %err, "store read failed; fetching from origin");
                None
            }
        };
        if let Some(res) = &cached
            && is_fresh(res, now_millis())
        {
            debug!(key, "serving fresh remote resource");
            return Ok(cached);
        }

        // coalesce concurrent revalidations of the same key
        let waiter = {
            let mut inflight = mutex_lock(&self.inner.inflight, SOURCE, "fetch");
            match inflight.entry(key.clone()) {
                Entry::Occupied(mut followers) => {
                    let (tx, rx) = oneshot::channel();
                    followers.get_mut().push(tx);
                    Some(rx)
                }
                Entry::Vacant(lead) => {
                    lead.insert(Vec::new());
                    None
                }
            }
        };
        if let Some(rx) = waiter {
            return match rx.await {
                Ok(result) => result,
                Err(_) => Err(StoreError::transient("remote fetch leader vanished")),
            };
        }

        let result = self.load(url, &key, cached, &opts).await;
        let waiters = mutex_lock(&self.inner.inflight, SOURCE, "fetch_done")
            .remove(&key)
            .unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(result.clone());
        }

        if opts.maxage > 0 && opts.maxage != MAXAGE_FOREVER {
            self.schedule_poll(url, &key, &opts);
        }
        result
    }

    async fn load(
        &self,
        url: &str,
        key: &str,
        cached: Option<Resource>,
        opts: &FetchOptions,
    ) -> FetchResult {
        let mut request = self.inner.http.get(url);
        for (name, value) in &opts.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(etag) = cached.as_ref().and_then(|res| res.headers.get("etag")) {
            request = request.header("if-none-match", etag.as_str());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(url, error = %err, "origin unreachable");
                return match cached {
                    Some(res) => Ok(Some(res)),
                    None => Err(StoreError::transient(err.to_string())),
                };
            }
        };

        let status = response.status();
        if status.as_u16() == 304 {
            debug!(key, "origin revalidated cached copy");
            return Ok(cached);
        }
        if status.as_u16() == 404 {
            debug!(key, "origin dropped the resource");
            self.inner.store.del(key).await?;
            self.inner
                .store
                .publisher()
                .send(ChangeMessage::delete(key));
            return Ok(None);
        }
        if status.is_server_error() {
            warn!(url, status = status.as_u16(), "origin failing; serving stale");
            return match cached {
                Some(res) => Ok(Some(res)),
                None => Err(StoreError::transient(format!("origin status {status}"))),
            };
        }
        if !status.is_success() {
            return Err(StoreError::validation(format!("origin status {status}")));
        }

        let headers = response_headers(&response);
        let body = response
            .bytes()
            .await
            .map_err(|err| StoreError::transient(err.to_string()))?;

        let unchanged = cached
            .as_ref()
            .and_then(|res| res.data.as_ref())
            .is_some_and(|data| data == &body);
        if unchanged {
            debug!(key, "origin body unchanged");
            return Ok(cached);
        }

        let had_data = cached.as_ref().is_some_and(|res| res.data.is_some());
        let mut res = Resource::new(key)
            .with_data(Bytes::from(body))
            .with_builder(REMOTE_BUILDER)
            .with_maxage(opts.maxage);
        res.url = url.to_string();
        res.code = status.as_u16();
        res.headers = headers;

        let stored = self.inner.store.set(key, res).await?;
        if had_data {
            // a known copy changed under its dependents
            self.inner
                .store
                .publisher()
                .send(ChangeMessage::put(key).with_mtime(stored.mtime));
        }
        Ok(Some(stored))
    }

    /// Arrange one background re-poll per key, `maxage` seconds out.
    fn schedule_poll(&self, url: &str, key: &str, opts: &FetchOptions) {
        {
            let mut pollers = mutex_lock(&self.inner.pollers, SOURCE, "schedule_poll");
            if pollers.contains_key(key) {
                return;
            }
            pollers.insert(key.to_string(), opts.clone());
        }
        let fetcher = self.clone();
        let url = url.to_string();
        let key = key.to_string();
        let delay = Duration::from_secs(opts.maxage.max(1) as u64);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let opts = mutex_lock(&fetcher.inner.pollers, SOURCE, "poll_fire").remove(&key);
            if let Some(opts) = opts {
                debug!(key, "re-polling remote resource");
                if let Err(err) = fetcher.fetch(&url, opts).await {
                    warn!(key, error = %err, "re-poll failed");
                }
            }
        });
    }
}

fn is_fresh(res: &Resource, now: i64) -> bool {
    if !res.valid || res.data.is_none() {
        return false;
    }
    res.maxage == MAXAGE_FOREVER || (res.maxage > 0 && res.mtime + res.maxage * 1000 > now)
}

fn response_headers(response: &reqwest::Response) -> BTreeMap<String, String> {
    response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(maxage: i64, mtime: i64, valid: bool) -> Resource {
        let mut res = Resource::new("http://x/a").with_data("x").with_maxage(maxage);
        res.mtime = mtime;
        res.valid = valid;
        res
    }

    #[test]
    fn freshness_honours_window_and_validity() {
        let now = 1_000_000;
        assert!(is_fresh(&resource(10, now - 5_000, true), now));
        assert!(!is_fresh(&resource(10, now - 15_000, true), now));
        assert!(!is_fresh(&resource(10, now - 5_000, false), now));
        // maxage 0 always revalidates
        assert!(!is_fresh(&resource(0, now, true), now));
        // the forever sentinel never revalidates
        assert!(is_fresh(&resource(MAXAGE_FOREVER, 1, true), now));
    }

    #[test]
    fn fresh_resource_without_payload_is_not_served() {
        let now = 1_000_000;
        let mut res = resource(10, now, true);
        res.data = None;
        res.valid = true;
        assert!(!is_fresh(&res, now));
    }
}
