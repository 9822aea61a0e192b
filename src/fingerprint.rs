//! Request fingerprinting for deterministic cache keys
//!
//! A fingerprint is the hex SHA-256 of a canonical, length-prefixed encoding
//! of the request. The recording store and anything inspecting recordings
//! must derive keys through [`fingerprint`] so both sides agree.

use std::fmt;

use http::Uri;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::message::{default_port, Request};

/// Headers that vary between otherwise identical requests.
///
/// None of them take part in a fingerprint unless named in
/// [`FingerprintPolicy::include_headers`].
pub const VOLATILE_HEADERS: &[&str] = &[
    "date",
    "x-request-id",
    "x-correlation-id",
    "traceparent",
    "tracestate",
    "x-b3-traceid",
    "x-amzn-trace-id",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

const NORMALIZED_TAG: &[u8] = b"genproxy/v1";
const RAW_TAG: &[u8] = b"genproxy/raw/v1";

/// Which parts of a request beyond method and URL form the key.
///
/// The default is method + normalized URL only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintPolicy {
    /// Header names whose values are part of the key
    #[serde(default)]
    pub include_headers: Vec<String>,
    /// Whether the request body is part of the key
    #[serde(default)]
    pub include_body: bool,
}

impl FingerprintPolicy {
    /// Included header names, lower-cased, sorted and deduplicated
    fn header_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .include_headers
            .iter()
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Included header names that are known to be volatile
    #[must_use]
    pub fn volatile_inclusions(&self) -> Vec<String> {
        self.header_names()
            .into_iter()
            .filter(|name| VOLATILE_HEADERS.contains(&name.as_str()))
            .collect()
    }
}

/// Stable cache key for a request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    key: String,
    degraded: bool,
}

impl Fingerprint {
    /// Wrap an existing key, e.g. one listed from storage
    #[must_use]
    pub fn from_key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            degraded: false,
        }
    }

    /// The key as a hex string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// True when the URL could not be normalized and a raw key was used
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Abbreviated key for log lines
    #[must_use]
    pub fn short(&self) -> &str {
        self.key.get(..16).unwrap_or(&self.key)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Normalized URL components
#[derive(Debug, Clone, PartialEq, Eq)]
struct CanonicalUrl {
    scheme: String,
    host: String,
    port: Option<u16>,
    path: String,
    query: Vec<(String, String)>,
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        f.write_str(&self.path)?;
        for (i, (key, value)) in self.query.iter().enumerate() {
            f.write_str(if i == 0 { "?" } else { "&" })?;
            write!(
                f,
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(value)
            )?;
        }
        Ok(())
    }
}

/// Compute the fingerprint of a request
///
/// Never fails: a URL without a host falls back to a raw-string key over the
/// method and URI as received.
#[must_use]
pub fn fingerprint(request: &Request, policy: &FingerprintPolicy) -> Fingerprint {
    let mut hasher = Sha256::new();
    let method = request.method.as_str().to_ascii_uppercase();

    let degraded = if let Some(url) = normalize_url(&request.uri) {
        update_field(&mut hasher, NORMALIZED_TAG);
        update_field(&mut hasher, method.as_bytes());
        update_field(&mut hasher, url.scheme.as_bytes());
        update_field(&mut hasher, url.host.as_bytes());
        hasher.update(url.port.unwrap_or(0).to_le_bytes());
        update_field(&mut hasher, url.path.as_bytes());
        hasher.update((url.query.len() as u32).to_le_bytes());
        for (key, value) in &url.query {
            update_field(&mut hasher, key.as_bytes());
            update_field(&mut hasher, value.as_bytes());
        }
        false
    } else {
        update_field(&mut hasher, RAW_TAG);
        update_field(&mut hasher, method.as_bytes());
        update_field(&mut hasher, request.uri.to_string().as_bytes());
        true
    };

    for name in policy.header_names() {
        update_field(&mut hasher, name.as_bytes());
        let values: Vec<&[u8]> = request
            .headers
            .get_all(name.as_str())
            .iter()
            .map(|value| value.as_bytes())
            .collect();
        hasher.update((values.len() as u32).to_le_bytes());
        for value in values {
            update_field(&mut hasher, trim_ascii(value));
        }
    }

    if policy.include_body {
        hasher.update([1u8]);
        hasher.update(Sha256::digest(&request.body));
    } else {
        hasher.update([0u8]);
    }

    Fingerprint {
        key: hex::encode(hasher.finalize()),
        degraded,
    }
}

/// Human-readable canonical form of the request, for logs
#[must_use]
pub fn canonical_form(request: &Request, policy: &FingerprintPolicy) -> String {
    let method = request.method.as_str().to_ascii_uppercase();
    let mut out = match normalize_url(&request.uri) {
        Some(url) => format!("{method} {url}"),
        None => format!("{method} raw:{}", request.uri),
    };

    for name in policy.header_names() {
        for value in request.headers.get_all(name.as_str()) {
            out.push_str(&format!(
                "\n{name}: {}",
                String::from_utf8_lossy(trim_ascii(value.as_bytes()))
            ));
        }
    }

    if policy.include_body {
        out.push_str(&format!("\nbody-sha256: {}", hex::encode(Sha256::digest(&request.body))));
    }

    out
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u32).to_le_bytes());
    hasher.update(bytes);
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn normalize_url(uri: &Uri) -> Option<CanonicalUrl> {
    let scheme = uri.scheme_str()?.to_ascii_lowercase();
    let host = uri.host()?.to_ascii_lowercase();
    if host.is_empty() {
        return None;
    }

    let port = uri
        .port_u16()
        .filter(|port| Some(*port) != default_port(&scheme));

    Some(CanonicalUrl {
        scheme,
        host,
        port,
        path: normalize_path(uri.path()),
        query: normalize_query(uri.query().unwrap_or("")),
    })
}

/// Normalize a URL path
///
/// Trailing slashes are significant: `/a` and `/a/` are different keys.
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();

    if trimmed.is_empty() || !trimmed.starts_with('/') {
        format!("/{trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Decode query pairs and stably sort them by name
fn normalize_query(query: &str) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let (key, value) = segment.split_once('=').unwrap_or((segment, ""));
            (decode_component(key), decode_component(value))
        })
        .collect();

    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs
}

/// Form-style decoding: `+` is a space, `%2B` a literal plus
fn decode_component(raw: &str) -> String {
    let raw = raw.replace('+', " ");
    urlencoding::decode(&raw).map_or_else(|_| raw.clone(), |decoded| decoded.into_owned())
}
