//! HTTP cache middleware.
//!
//! Serves GET requests from the store when a valid variant is cached, and
//! populates it from the inner handler's response otherwise, keyed by the
//! response's own `Vary` declaration. Mutating verbs that succeed invalidate
//! the resource for the request url and publish a change message so every
//! instance (and every dependent resource) hears about it.
//!
//! A store failure on the read path falls back to running the inner handler
//! (cache-aside), never failing the request.

use std::collections::BTreeMap;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{debug, instrument, warn};

use crate::bus::message::ChangeMessage;
use crate::store::{Resource, ResourceStore};

const MAX_CACHED_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Builder tag recorded on resources this middleware creates.
pub const PROXY_BUILDER: &str = "proxy";

/// Shared state for the cache middleware.
#[derive(Clone)]
pub struct ProxyState {
    pub store: ResourceStore,
}

/// Middleware caching successful GET responses as resources.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn resource_cache_layer(
    State(proxy): State<ProxyState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let url = request_url(&request);

    if request.method() != Method::GET {
        let mutating = [Method::POST, Method::PUT, Method::DELETE, Method::PATCH]
            .contains(request.method());
        let deleted = request.method() == Method::DELETE;
        let response = next.run(request).await;
        if mutating && response.status().is_success() {
            if let Err(err) = proxy.store.invalidate(&url).await {
                warn!(url, error = %err, "post-write invalidation failed");
            }
            let msg = if deleted {
                ChangeMessage::delete(&url)
            } else {
                ChangeMessage::put(&url)
            };
            proxy.store.publisher().send(msg);
        }
        return response;
    }

    let request_headers = header_map(request.headers());
    let key = proxy
        .store
        .variants()
        .derive_request(&url, &request_headers, None);

    match proxy.store.get(&key).await {
        Ok(Some(res)) if res.valid && res.data.is_some() => {
            debug!(key, outcome = "hit", "serving cached resource");
            return build_response(&res);
        }
        Ok(_) => debug!(key, outcome = "miss", "executing handler"),
        Err(err) => warn!(key, error = %err, "store read failed; rebuilding from source"),
    }

    let response = next.run(request).await;
    if response.status() != StatusCode::OK {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_CACHED_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let response_headers = header_map(&parts.headers);
    let response_key = proxy
        .store
        .variants()
        .derive(&url, &response_headers, None);

    let mut res = Resource::new(&response_key)
        .with_data(bytes.clone())
        .with_builder(PROXY_BUILDER);
    res.url = url;
    res.code = parts.status.as_u16();
    res.headers = response_headers;
    res.maxage = max_age_from(&parts.headers).unwrap_or(0);

    if let Err(err) = proxy.store.set(&response_key, res).await {
        warn!(key = response_key, error = %err, "caching response failed");
    }

    Response::from_parts(parts, Body::from(bytes))
}

fn request_url(request: &Request<Body>) -> String {
    match request.uri().query() {
        Some(query) => format!("{}?{}", request.uri().path(), query),
        None => request.uri().path().to_string(),
    }
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

fn max_age_from(headers: &HeaderMap) -> Option<i64> {
    let cache_control = headers.get("cache-control")?.to_str().ok()?;
    cache_control.split(',').find_map(|directive| {
        directive
            .trim()
            .strip_prefix("max-age=")
            .and_then(|age| age.parse().ok())
    })
}

/// Rebuild an HTTP response from a cached resource.
fn build_response(res: &Resource) -> Response {
    use axum::http::HeaderValue;

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(res.code).unwrap_or(StatusCode::OK));
    for (name, value) in &res.headers {
        if let Ok(header_value) = HeaderValue::from_str(value) {
            builder = builder.header(name.as_str(), header_value);
        }
    }
    if let Some(stamp) = imf_fixdate(res.mtime) {
        builder = builder.header("last-modified", stamp);
    }

    let body = res.data.clone().map(Body::from).unwrap_or_else(Body::empty);
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn imf_fixdate(mtime: i64) -> Option<String> {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(mtime) * 1_000_000)
        .ok()?
        .format(&format)
        .ok()
}
