//! Variant-aware cache key derivation.
//!
//! A key is the resource url prefixed, when content negotiation is in play,
//! by a canonical query-string of variant dimensions:
//!
//! ```text
//! [<urlencoded-sorted-dimension=value&...> ' ']<url>
//! ```
//!
//! Two logically-equivalent header sets always yield byte-identical keys:
//! dimensions are sorted by name, their values normalized (deduplicated,
//! lower-cased where applicable), and serialized with `form_urlencoded`.
//! A resource without a `Vary` declaration collapses to `key == url`.
//!
//! One [`VariantConfig`] names the recognized dimensions and the header each
//! is read from, on both the response side ([`derive`]) and the request side
//! ([`derive_request`]), so the two can never drift apart.

use std::collections::BTreeMap;

use url::form_urlencoded;

/// Dimension names as they appear in the key prefix.
pub const DIM_TYPE: &str = "type";
pub const DIM_RIGHTS: &str = "rights";
pub const DIM_AUTHOR: &str = "author";
pub const DIM_NAMESPACE: &str = "namespace";

/// Maps variant dimensions to the headers they are read from.
///
/// Shared by response-side and request-side derivation; the `Vary` response
/// header selects which of these dimensions participate in the key.
#[derive(Debug, Clone)]
pub struct VariantConfig {
    /// Response header carrying the payload type (type-family dimension).
    pub type_response: String,
    /// Request header negotiating the payload type (same dimension).
    pub type_request: String,
    /// Rights-grant set header (sorted, comma-joined).
    pub rights: String,
    /// Author / identity tag header.
    pub author: String,
    /// Namespace header distinguishing same-path resources across
    /// independent deployments sharing one bus.
    pub namespace: String,
}

impl Default for VariantConfig {
    fn default() -> Self {
        Self {
            type_response: "content-type".into(),
            type_request: "accept".into(),
            rights: "x-grants".into(),
            author: "x-author".into(),
            namespace: "x-namespace".into(),
        }
    }
}

impl VariantConfig {
    /// Dimension name for a header named in a `Vary` declaration, if any.
    fn dimension_for(&self, header: &str) -> Option<&'static str> {
        let header = header.trim().to_ascii_lowercase();
        if header == self.type_response || header == self.type_request {
            Some(DIM_TYPE)
        } else if header == self.rights {
            Some(DIM_RIGHTS)
        } else if header == self.author {
            Some(DIM_AUTHOR)
        } else if header == self.namespace {
            Some(DIM_NAMESPACE)
        } else {
            None
        }
    }

    fn dimension_value(
        &self,
        dim: &'static str,
        headers: &BTreeMap<String, String>,
        request_side: bool,
    ) -> Option<String> {
        let lookup = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        };
        match dim {
            DIM_TYPE => {
                let header = if request_side {
                    &self.type_request
                } else {
                    &self.type_response
                };
                lookup(header).and_then(type_family)
            }
            DIM_RIGHTS => lookup(&self.rights).map(normalize_rights),
            DIM_AUTHOR => lookup(&self.author).map(|v| v.trim().to_string()),
            DIM_NAMESPACE => lookup(&self.namespace).map(|v| v.trim().to_string()),
            _ => None,
        }
        .filter(|v| !v.is_empty())
    }

    fn derive_side(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        vary: Option<&str>,
        request_side: bool,
    ) -> String {
        let vary = vary.or_else(|| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("vary"))
                .map(|(_, v)| v.as_str())
        });
        let mut dims: BTreeMap<&'static str, String> = BTreeMap::new();
        match vary.map(str::trim) {
            Some("*") => {
                for dim in [DIM_TYPE, DIM_RIGHTS, DIM_AUTHOR, DIM_NAMESPACE] {
                    if let Some(value) = self.dimension_value(dim, headers, request_side) {
                        dims.insert(dim, value);
                    }
                }
            }
            Some(vary) => {
                for header in vary.split(',') {
                    if let Some(dim) = self.dimension_for(header)
                        && let Some(value) = self.dimension_value(dim, headers, request_side)
                    {
                        dims.insert(dim, value);
                    }
                }
            }
            None => {}
        }
        if dims.is_empty() {
            return url.to_string();
        }
        let mut prefix = form_urlencoded::Serializer::new(String::new());
        for (dim, value) in &dims {
            prefix.append_pair(dim, value);
        }
        format!("{} {}", prefix.finish(), url)
    }

    /// Response-side derivation: the `Vary` header (from `headers` unless
    /// given explicitly) declares which dimensions participate.
    pub fn derive(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        vary: Option<&str>,
    ) -> String {
        self.derive_side(url, headers, vary, false)
    }

    /// Request-side derivation. With `vary: None` every configured dimension
    /// present on the request participates, which matches the response-side
    /// key whenever the response varies on everything the client sent.
    pub fn derive_request(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        vary: Option<&str>,
    ) -> String {
        self.derive_side(url, headers, vary.or(Some("*")), true)
    }
}

/// Collapse a media type (or `Accept` list) to its family: `json`, `html`,
/// `xml`, `text`. Structured-syntax suffixes win, so
/// `application/vnd.api+json` is `json`.
pub fn type_family(value: &str) -> Option<String> {
    for item in value.split(',') {
        let mime = item.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        if mime.is_empty() || mime == "*/*" {
            continue;
        }
        let family = if mime.ends_with("+json") || mime == "application/json" {
            "json"
        } else if mime.ends_with("+xml")
            || mime == "application/xml"
            || mime == "text/xml"
        {
            "xml"
        } else if mime == "text/html" || mime == "application/xhtml" {
            "html"
        } else if mime.starts_with("text/") {
            "text"
        } else {
            // unrecognized family: keep the subtype so distinct payloads
            // still key apart
            return Some(mime.split('/').next_back().unwrap_or(&mime).to_string());
        };
        return Some(family.to_string());
    }
    None
}

fn normalize_rights(value: &str) -> String {
    let mut grants: Vec<String> = value
        .split(',')
        .map(|g| g.trim().to_ascii_lowercase())
        .filter(|g| !g.is_empty())
        .collect();
    grants.sort();
    grants.dedup();
    grants.join(",")
}

/// Inverse of derivation: split a key into its url and variant dimensions.
///
/// Tolerates prefix-free keys (they equal their url). The prefix boundary is
/// the last whitespace preceding an `http(s)://` tail, so urls containing
/// encoded spaces never confuse it.
pub fn parse(key: &str) -> (&str, BTreeMap<String, String>) {
    let boundary = [" http://", " https://"]
        .iter()
        .filter_map(|sep| key.rfind(sep))
        .max();
    match boundary {
        Some(pos) => {
            let prefix = &key[..pos];
            let url = &key[pos + 1..];
            let dims = form_urlencoded::parse(prefix.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            (url, dims)
        }
        None => (key, BTreeMap::new()),
    }
}
