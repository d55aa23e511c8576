use bytes::Bytes;
use wpr_archive::{Scheme, Signature};

/// Paths of the form `/web-page-replay-generate-NNN` are answered with status `NNN`.
pub const GENERATE_PREFIX: &str = "/web-page-replay-generate-";

/// Connection-level headers that are never forwarded or replayed.
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// A fully read client request, independent of the protocol it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: String,
    pub scheme: Scheme,
    /// `host[:port]` the client addressed.
    pub authority: String,
    /// Request target in origin form.
    pub path_and_query: String,
    /// Header names (lower-case) and raw values in arrival order.
    pub headers: Vec<(String, Bytes)>,
    pub body: Bytes,
}

impl ProxyRequest {
    /// The archive key of this request.
    pub fn signature(&self) -> Signature {
        let builder =
            Signature::builder(&self.method, self.scheme, &self.authority, &self.path_and_query);

        self.headers
            .iter()
            .filter_map(|(name, value)| Some((name, std::str::from_utf8(value).ok()?)))
            .fold(builder, |builder, (name, value)| builder.header(name, value))
            .body(self.body.clone())
            .build()
    }

    /// The status requested through [`GENERATE_PREFIX`], if any.
    pub fn generated_status(&self) -> Option<u16> {
        let path = self.path_and_query.split('?').next().unwrap_or_default();
        let code = path.strip_prefix(GENERATE_PREFIX)?;
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        code.parse().ok().filter(|status| (100..600).contains(status))
    }

    /// The origin host and port to connect to.
    pub fn origin(&self) -> (&str, u16) {
        let default = self.scheme.default_port();
        let authority = self.authority.as_str();

        if let Some(rest) = authority.strip_prefix('[') {
            if let Some((host, port)) = rest.split_once(']') {
                let port = port.strip_prefix(':').and_then(|p| p.parse().ok());
                return (host, port.unwrap_or(default));
            }
        }

        match authority.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, port.parse().unwrap_or(default)),
            _ => (authority, default),
        }
    }

    pub fn header(&self, name: &str) -> Option<&Bytes> {
        self.headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v)
    }
}
