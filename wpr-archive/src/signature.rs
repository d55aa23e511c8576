use std::{collections::BTreeMap, fmt};

use bytes::Bytes;

/// Request headers that take part in the signature. Everything else (cookies, dates,
/// conditional headers, user agents, referers) is volatile between a record and a replay run.
pub const SIGNATURE_HEADERS: [&str; 3] = ["accept", "accept-encoding", "content-type"];

/// The scheme of the client connection a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub const fn default_port(&self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    pub(crate) const fn to_u8(self) -> u8 {
        match self {
            Self::Http => 0,
            Self::Https => 1,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Http),
            1 => Some(Self::Https),
            _ => None,
        }
    }
}

/// The canonical key of a request in the archive.
///
/// A signature is a pure function of the request: the method is upper-cased, the host is
/// lower-cased with its default port and trailing dot removed, and only the
/// [`SIGNATURE_HEADERS`] are kept, in a sorted map, so the order in which a client sends its
/// headers never changes the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub(crate) method: String,
    pub(crate) scheme: Scheme,
    pub(crate) host: String,
    pub(crate) path: String,
    pub(crate) query: Option<String>,
    pub(crate) headers: BTreeMap<String, String>,
    pub(crate) body: Bytes,
}

impl Signature {
    /// Starts a signature for a request. `path_and_query` is the request target in origin form,
    /// e.g. `/search?q=rust`.
    pub fn builder(
        method: &str,
        scheme: Scheme,
        host: &str,
        path_and_query: &str,
    ) -> SignatureBuilder {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (path_and_query, None),
        };

        let path = if path.is_empty() { "/".to_string() } else { path.to_string() };

        SignatureBuilder {
            method: method.to_ascii_uppercase(),
            scheme,
            host: normalize_host(host, scheme),
            path,
            query,
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the request target in origin form.
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    /// Returns the key used by the fallback lookup: identical to `self` except that the query
    /// parameters are sorted, so `?a=1&b=2` and `?b=2&a=1` compare equal.
    pub fn loosened(&self) -> Self {
        let mut loose = self.clone();
        loose.query = self.query.as_deref().map(|query| {
            let mut pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
            pairs.sort_unstable();
            pairs.join("&")
        });

        loose
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = self.scheme.as_str();
        write!(f, "{} {scheme}://{}{}", self.method, self.host, self.path_and_query())
    }
}

/// Builder returned by [`Signature::builder`].
#[derive(Debug)]
pub struct SignatureBuilder {
    method: String,
    scheme: Scheme,
    host: String,
    path: String,
    query: Option<String>,
    headers: BTreeMap<String, String>,
    body: Bytes,
}

impl SignatureBuilder {
    /// Adds a request header. Headers outside of [`SIGNATURE_HEADERS`] are ignored. Repeated
    /// headers are combined with their values sorted, which keeps the result independent of
    /// arrival order.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if !SIGNATURE_HEADERS.contains(&name.as_str()) {
            return self;
        }

        let value = value.trim();
        match self.headers.get_mut(&name) {
            Some(existing) => {
                let mut values: Vec<&str> = existing.split(", ").collect();
                values.push(value);
                values.sort_unstable();
                *existing = values.join(", ");
            }
            None => {
                self.headers.insert(name, value.to_string());
            }
        }

        self
    }

    /// Sets the request body.
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> Signature {
        Signature {
            method: self.method,
            scheme: self.scheme,
            host: self.host,
            path: self.path,
            query: self.query,
            headers: self.headers,
            body: self.body,
        }
    }
}

fn normalize_host(host: &str, scheme: Scheme) -> String {
    let host = host.trim().to_ascii_lowercase();
    let (name, port) = split_port(&host);
    let name = name.trim_end_matches('.');

    match port {
        Some(port) if port != scheme.default_port() => format!("{name}:{port}"),
        _ => name.to_string(),
    }
}

/// Splits an authority into host and port. Bracketed IPv6 literals keep their brackets.
fn split_port(host: &str) -> (&str, Option<u16>) {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => {
                let port = host[end + 1..].strip_prefix(':').and_then(|p| p.parse().ok());
                (&host[..=end], port)
            }
            None => (host, None),
        };
    }

    match host.rsplit_once(':') {
        // A bare IPv6 literal has more than one colon and no port.
        Some((name, port)) if !name.contains(':') => match port.parse() {
            Ok(port) => (name, Some(port)),
            Err(_) => (host, None),
        },
        _ => (host, None),
    }
}
