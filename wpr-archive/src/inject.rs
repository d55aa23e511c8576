//! Determinism injection.
//!
//! Pages that read `Math.random()` or the current date load different resources on every run,
//! which defeats replay. The [`Injector`] inserts a script overriding both with fixed-seed
//! versions into HTML responses, right after the opening `<head>` tag (or `<html>` when there
//! is no head).

use std::{
    borrow::Cow,
    io::{self, Read as _, Write as _},
};

use bytes::Bytes;
use flate2::{
    read::{GzDecoder, ZlibDecoder},
    write::{GzEncoder, ZlibEncoder},
    Compression,
};
use tracing::{debug, warn};

use crate::RecordedResponse;

/// Script replacing the browser's entropy sources with deterministic ones.
pub const DETERMINISTIC_SCRIPT: &str = r#"(function () {
  var seed = 0.462;
  Math.random = function () {
    seed = (seed * 9301 + 49297) % 233280;
    return seed / 233280;
  };
  var epoch = 1204251968254;
  var started = null;
  var NativeDate = Date;
  Date = function () {
    if (this instanceof Date) {
      if (arguments.length === 0) {
        if (started === null) { started = new NativeDate().getTime(); }
        return new NativeDate(epoch + (new NativeDate().getTime() - started));
      }
      return new (Function.prototype.bind.apply(NativeDate, [null].concat([].slice.call(arguments))))();
    }
    return new NativeDate(epoch).toString();
  };
  Date.prototype = NativeDate.prototype;
  Date.UTC = NativeDate.UTC;
  Date.parse = NativeDate.parse;
  Date.now = function () { return new Date().getTime(); };
})();"#;

/// Why a response was passed through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skipped {
    NotHtml,
    AlreadyInjected,
    UnsupportedEncoding,
    NoInsertionPoint,
    Undecodable,
}

/// Inserts a script into HTML responses.
#[derive(Debug, Clone)]
pub struct Injector {
    /// The full `<script>…</script>` element.
    tag: Bytes,
}

impl Default for Injector {
    fn default() -> Self {
        Self::deterministic()
    }
}

impl Injector {
    /// Creates an injector for an arbitrary script body.
    pub fn new(script: &str) -> Self {
        Self { tag: Bytes::from(format!("<script>{script}</script>")) }
    }

    /// Creates an injector for [`DETERMINISTIC_SCRIPT`].
    pub fn deterministic() -> Self {
        Self::new(DETERMINISTIC_SCRIPT)
    }

    /// Returns the response with the script inserted, or the response itself when it does not
    /// qualify. Applying the injector to its own output returns it unchanged.
    pub fn apply<'a>(&self, response: &'a RecordedResponse) -> Cow<'a, RecordedResponse> {
        match self.try_apply(response) {
            Ok(injected) => Cow::Owned(injected),
            Err(reason) => {
                debug!(?reason, status = response.status, "skipped script injection");
                Cow::Borrowed(response)
            }
        }
    }

    /// Like [`Injector::apply`] but reports why a response was skipped.
    pub fn try_apply(&self, response: &RecordedResponse) -> Result<RecordedResponse, Skipped> {
        let is_html = response
            .header_str("content-type")
            .is_some_and(|ct| ct.trim_start().to_ascii_lowercase().starts_with("text/html"));
        if !is_html {
            return Err(Skipped::NotHtml);
        }

        let encoding = match response.header_str("content-encoding").map(str::trim) {
            None | Some("") | Some("identity") => Encoding::Identity,
            Some(e) if e.eq_ignore_ascii_case("gzip") => Encoding::Gzip,
            Some(e) if e.eq_ignore_ascii_case("deflate") => Encoding::Deflate,
            Some(_) => return Err(Skipped::UnsupportedEncoding),
        };

        let body = encoding.decode(&response.body()).map_err(|_| Skipped::Undecodable)?;

        if contains(&body, &self.tag) {
            return Err(Skipped::AlreadyInjected);
        }

        let Some(at) = insertion_point(&body) else {
            warn!(status = response.status, "no <head> or <html> tag, not injecting");
            return Err(Skipped::NoInsertionPoint);
        };

        let mut edited = Vec::with_capacity(body.len() + self.tag.len());
        edited.extend_from_slice(&body[..at]);
        edited.extend_from_slice(&self.tag);
        edited.extend_from_slice(&body[at..]);

        let encoded = encoding.encode(&edited).map_err(|_| Skipped::Undecodable)?;

        Ok(response.with_body(Bytes::from(encoded)))
    }
}

#[derive(Debug, Clone, Copy)]
enum Encoding {
    Identity,
    Gzip,
    Deflate,
}

impl Encoding {
    fn decode(self, body: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(body.len() * 2);
        match self {
            Self::Identity => out.extend_from_slice(body),
            Self::Gzip => {
                GzDecoder::new(body).read_to_end(&mut out)?;
            }
            Self::Deflate => {
                ZlibDecoder::new(body).read_to_end(&mut out)?;
            }
        }

        Ok(out)
    }

    fn encode(self, body: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Self::Identity => Ok(body.to_vec()),
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(body)?;
                encoder.finish()
            }
            Self::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(body)?;
                encoder.finish()
            }
        }
    }
}

/// Returns the offset right after the first `<head …>` tag, else after the first `<html …>`.
fn insertion_point(body: &[u8]) -> Option<usize> {
    find_tag_end(body, b"head").or_else(|| find_tag_end(body, b"html"))
}

/// Finds the first opening tag `<name` (case-insensitive, followed by `>` or whitespace) and
/// returns the offset after its closing `>`.
fn find_tag_end(body: &[u8], name: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(pos) = body[from..].iter().position(|b| *b == b'<') {
        let start = from + pos + 1;
        let end = start + name.len();

        if end <= body.len() && body[start..end].eq_ignore_ascii_case(name) {
            match body.get(end) {
                Some(b'>') => return Some(end + 1),
                Some(b) if b.is_ascii_whitespace() => {
                    if let Some(p) = body[end..].iter().position(|b| *b == b'>') {
                        return Some(end + p + 1);
                    }
                }
                _ => {}
            }
        }

        from = start;
    }

    None
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}
