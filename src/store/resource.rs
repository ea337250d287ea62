//! The cached resource record.
//!
//! A `Resource` is the unit of caching: an opaque payload with headers, a
//! monotonic modification time, and explicit dependency edges on the child
//! resources it was built from.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use time::OffsetDateTime;

use super::key;

/// Sentinel `maxage` meaning "never expires automatically".
///
/// Stored as-is in the durable tier; any `maxage <= 0` disables passive
/// expiry, but the sentinel is kept distinct so callers can tell "no maxage
/// was ever set" (0) from "pinned forever" (-1).
pub const MAXAGE_FOREVER: i64 = -1;

/// Current wall clock in unix milliseconds, the resolution of every `mtime`
/// in the system (wire messages included).
pub fn now_millis() -> i64 {
    let now = OffsetDateTime::now_utc();
    now.unix_timestamp() * 1000 + i64::from(now.millisecond())
}

/// The unit of caching.
///
/// `parents` is maintained by the store as the inverse of the `resources`
/// edge sets declared on other entries; callers never set it directly.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// Canonical identity: url plus normalized variant prefix (see `key`).
    pub key: String,
    /// Logical address the resource was fetched or built from.
    pub url: String,
    /// Last-modified, unix milliseconds. Monotonic per key.
    pub mtime: i64,
    /// Seconds until passive re-validation; 0 = explicit invalidation only,
    /// [`MAXAGE_FOREVER`] = never expires.
    pub maxage: i64,
    /// False means the payload is present but must be rebuilt before serving.
    pub valid: bool,
    /// Status code recorded with the payload.
    pub code: u16,
    /// Opaque payload.
    pub data: Option<Bytes>,
    /// Content-type, etag and other cache-relevant headers.
    pub headers: BTreeMap<String, String>,
    /// Ordered child keys this resource was built from (outgoing edges).
    pub resources: Vec<String>,
    /// Keys depending on this resource (incoming edges, store-maintained).
    pub parents: BTreeSet<String>,
    /// Tag of the producer able to regenerate this resource on demand.
    pub builder: Option<String>,
}

impl Resource {
    /// A bare resource for `key` with no payload and no edges.
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        let url = key::parse(&key).0.to_string();
        Self {
            key,
            url,
            mtime: 0,
            maxage: 0,
            valid: true,
            code: 200,
            data: None,
            headers: BTreeMap::new(),
            resources: Vec::new(),
            parents: BTreeSet::new(),
            builder: None,
        }
    }

    /// A stub entry standing in for a child referenced before being cached.
    /// Stubs carry no payload and are never valid.
    pub fn stub(key: impl Into<String>) -> Self {
        let mut res = Self::new(key);
        res.valid = false;
        res
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = children.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_maxage(mut self, maxage: i64) -> Self {
        self.maxage = maxage;
        self
    }

    pub fn with_builder(mut self, builder: impl Into<String>) -> Self {
        self.builder = Some(builder.into());
        self
    }

    /// Save-time normalization: stamp a missing mtime, derive a missing url
    /// back out of the key, and never persist a payload-less entry as valid.
    pub(crate) fn normalize_for_save(&mut self) {
        if self.url.is_empty() {
            self.url = key::parse(&self.key).0.to_string();
        }
        if self.mtime == 0 {
            self.mtime = now_millis();
        }
        if self.data.is_none() {
            self.valid = false;
        }
    }

    /// True when `maxage` is positive and `mtime + maxage` lies in the past.
    pub fn expired(&self, now: i64) -> bool {
        self.maxage > 0 && self.mtime + self.maxage * 1000 < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_stamps_mtime_and_url() {
        let mut res = Resource::new("type=json http://x/a");
        res.data = Some(Bytes::from("{}"));
        res.url.clear();
        assert_eq!(res.mtime, 0);

        res.normalize_for_save();

        assert!(res.mtime > 0);
        assert_eq!(res.url, "http://x/a");
        assert!(res.valid);
    }

    #[test]
    fn normalize_marks_payloadless_invalid() {
        let mut res = Resource::new("http://x/a");
        assert!(res.valid);

        res.normalize_for_save();

        assert!(!res.valid);
    }

    #[test]
    fn explicit_mtime_is_preserved() {
        let mut res = Resource::new("http://x/a").with_data("x");
        res.mtime = 1234;

        res.normalize_for_save();

        assert_eq!(res.mtime, 1234);
    }

    #[test]
    fn expiry_window() {
        let mut res = Resource::new("http://x/a").with_data("x").with_maxage(5);
        res.mtime = 1_000_000;

        assert!(!res.expired(1_000_000 + 4_999));
        assert!(res.expired(1_000_000 + 5_001));
    }

    #[test]
    fn forever_never_expires() {
        let mut res = Resource::new("http://x/a")
            .with_data("x")
            .with_maxage(MAXAGE_FOREVER);
        res.mtime = 1;

        assert!(!res.expired(i64::MAX));
    }

    #[test]
    fn zero_maxage_never_expires_passively() {
        let mut res = Resource::new("http://x/a").with_data("x");
        res.mtime = 1;

        assert!(!res.expired(i64::MAX));
    }
}
