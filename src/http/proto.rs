//! HTTP/1.1 message grammar: heads, trailers and transfer framing.
//!
//! Only what a client connection needs: serializing request heads,
//! incrementally parsing response heads and chunked trailers off a
//! [`Stream`], validating transfer-coding lists, and deciding how an entity
//! body is delimited. Compression codings and multipart bodies are the
//! business of stream filters outside this crate; the grammar only checks
//! that they are spelled legally.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::stream::Stream;

/// Longest accepted head line. Anything bigger is a malformed (or hostile)
/// peer.
const MAX_LINE: usize = 16 * 1024;
/// Upper bound on header count per message head.
const MAX_HEADERS: usize = 256;

////////////////////////////////////////////////////////////////////////////////
// Method / Version
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Trace,
    Connect,
}

impl Method {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Connect => "CONNECT",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Self::Get),
            "HEAD" => Ok(Self::Head),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "OPTIONS" => Ok(Self::Options),
            "TRACE" => Ok(Self::Trace),
            "CONNECT" => Ok(Self::Connect),
            _ => Err(Error::BadMessageHeader),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const HTTP_10: Version = Version { major: 1, minor: 0 };
    pub const HTTP_11: Version = Version { major: 1, minor: 1 };
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s.strip_prefix("HTTP/").ok_or(Error::BadMessageHeader)?;
        let mut parts = rest.splitn(2, '.');
        let major = parts.next().and_then(|p| p.parse().ok());
        let minor = parts.next().and_then(|p| p.parse().ok());
        match (major, minor) {
            (Some(major), Some(minor)) => Ok(Version { major, minor }),
            _ => Err(Error::BadMessageHeader),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Headers
////////////////////////////////////////////////////////////////////////////////

/// An ordered multimap of header fields. Lookup is case-insensitive;
/// insertion order is preserved for serialization.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field, keeping any fields of the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every field of this name with a single one.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.add(name, value.into());
    }

    /// The first value of the field, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Removes every field of this name; `true` if any was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// All elements of a comma-separated list field, in order across
    /// multiple fields of the same name, trimmed, empties dropped.
    pub fn list_values(&self, name: &str) -> Vec<String> {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect()
    }

    /// Whether a list field contains the token (case-insensitive).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.list_values(name)
            .iter()
            .any(|v| v.eq_ignore_ascii_case(token))
    }

    /// The transfer-coding list, lowercased, parameters stripped.
    pub fn transfer_encoding(&self) -> Vec<String> {
        self.list_values("Transfer-Encoding")
            .iter()
            .map(|coding| {
                coding
                    .split(';')
                    .next()
                    .unwrap_or("")
                    .trim()
                    .to_ascii_lowercase()
            })
            .collect()
    }

    /// Parsed `Content-Length`, or `None` when absent.
    pub fn content_length(&self) -> Result<Option<u64>> {
        match self.get("Content-Length") {
            None => Ok(None),
            Some(v) => v
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| Error::BadMessageHeader),
        }
    }

    fn validate_for_serialization(&self) -> Result<()> {
        for (name, value) in self.iter() {
            if !is_token(name) {
                return Err(Error::BadMessageHeader);
            }
            if value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0) {
                return Err(Error::BadMessageHeader);
            }
        }
        Ok(())
    }
}

/// The `boundary` parameter of a multipart content-type. Errors when the
/// type is multipart but the parameter is missing; `Ok(None)` when the
/// entity is not multipart at all.
pub fn multipart_boundary(headers: &Headers) -> Result<Option<String>> {
    let content_type = match headers.get("Content-Type") {
        Some(v) => v,
        None => return Ok(None),
    };
    let mut params = content_type.split(';');
    let media_type = params.next().unwrap_or("").trim();
    if !media_type.to_ascii_lowercase().starts_with("multipart/") {
        return Ok(None);
    }
    for param in params {
        let mut kv = param.splitn(2, '=');
        let key = kv.next().unwrap_or("").trim();
        if key.eq_ignore_ascii_case("boundary") {
            let value = kv.next().unwrap_or("").trim().trim_matches('"');
            if !value.is_empty() {
                return Ok(Some(value.to_string()));
            }
        }
    }
    Err(Error::MissingMultipartBoundary)
}

////////////////////////////////////////////////////////////////////////////////
// Message heads
////////////////////////////////////////////////////////////////////////////////

/// A request head. `version` defaults to 1.1; the connection normalizes
/// keep-alive headers before transmission.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub version: Version,
    pub headers: Headers,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Request {
            method,
            uri: uri.into(),
            version: Version::HTTP_11,
            headers: Headers::new(),
        }
    }

    /// Convenience: `new` plus a `Host` header.
    pub fn with_host(method: Method, uri: impl Into<String>, host: impl Into<String>) -> Self {
        let mut request = Self::new(method, uri);
        request.headers.add("Host", host.into());
        request
    }
}

/// A response head.
#[derive(Debug, Clone)]
pub struct Response {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

/// Serializes a request head, CRLF line endings, blank line included.
pub(crate) fn serialize_request_head(request: &Request) -> Result<Vec<u8>> {
    request.headers.validate_for_serialization()?;
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            request.method, request.uri, request.version
        )
        .as_bytes(),
    );
    for (name, value) in request.headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    Ok(out)
}

/// Reads one CRLF-terminated line, byte at a time, CRLF stripped.
/// Stream EOF mid-line (or before any byte) is an incomplete head.
fn read_line(stream: &dyn Stream) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte)? {
            0 => return Err(Error::IncompleteMessageHeader),
            _ => {}
        }
        if byte[0] == b'\n' {
            if line.last() != Some(&b'\r') {
                return Err(Error::BadMessageHeader);
            }
            line.pop();
            return String::from_utf8(line).map_err(|_| Error::BadMessageHeader);
        }
        if line.len() >= MAX_LINE {
            return Err(Error::BadMessageHeader);
        }
        line.push(byte[0]);
    }
}

/// Reads header fields up to and including the blank line. Also used for
/// chunked trailers, which share the grammar.
pub(crate) fn read_header_fields(stream: &dyn Stream) -> Result<Headers> {
    let mut headers = Headers::new();
    loop {
        let line = read_line(stream)?;
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADERS {
            return Err(Error::BadMessageHeader);
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Obsolete line folding: continuation of the previous value.
            match headers.entries.last_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => return Err(Error::BadMessageHeader),
            }
            continue;
        }
        let (name, value) = match line.find(':') {
            Some(idx) => (&line[..idx], line[idx + 1..].trim()),
            None => return Err(Error::BadMessageHeader),
        };
        if !is_token(name) {
            return Err(Error::BadMessageHeader);
        }
        headers.add(name, value);
    }
}

/// Reads and parses a response head: status line plus header fields.
pub(crate) fn read_response_head(stream: &dyn Stream) -> Result<Response> {
    let status_line = read_line(stream)?;
    let mut parts = status_line.splitn(3, ' ');
    let version: Version = parts.next().unwrap_or("").parse()?;
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(Error::BadMessageHeader)?;
    if !(100..=599).contains(&status) {
        return Err(Error::BadMessageHeader);
    }
    let reason = parts.next().unwrap_or("").to_string();
    let headers = read_header_fields(stream)?;
    Ok(Response {
        version,
        status,
        reason,
        headers,
    })
}

////////////////////////////////////////////////////////////////////////////////
// Body framing
////////////////////////////////////////////////////////////////////////////////

/// How an entity body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyKind {
    /// No entity body at all.
    None,
    /// Exactly this many bytes.
    Length(u64),
    /// Chunked transfer coding, trailer at the end.
    Chunked,
    /// Delimited by connection close (responses only).
    ToEof,
}

/// Checks a transfer-coding list: chunked must come last, exactly once,
/// and every other coding must be one we could hand to a filter.
pub(crate) fn validate_transfer_encoding(codings: &[String]) -> Result<()> {
    let last = match codings.last() {
        Some(last) => last,
        None => return Ok(()),
    };
    if last != "chunked" {
        return Err(Error::InvalidTransferEncoding(
            "the final transfer-coding is not chunked".into(),
        ));
    }
    for coding in &codings[..codings.len() - 1] {
        match coding.as_str() {
            "chunked" => {
                return Err(Error::InvalidTransferEncoding(
                    "chunked transfer-coding applied multiple times".into(),
                ))
            }
            "gzip" | "x-gzip" | "deflate" => {}
            "identity" | "compress" | "x-compress" => {
                return Err(Error::InvalidTransferEncoding(format!(
                    "{} transfer-coding is unsupported",
                    coding
                )))
            }
            other => {
                return Err(Error::InvalidTransferEncoding(format!(
                    "unrecognized transfer-coding: {}",
                    other
                )))
            }
        }
    }
    Ok(())
}

/// Body framing of a request, from its headers.
pub(crate) fn request_body_kind(request: &Request) -> Result<BodyKind> {
    let codings = request.headers.transfer_encoding();
    if !codings.is_empty() {
        validate_transfer_encoding(&codings)?;
        return Ok(BodyKind::Chunked);
    }
    match request.headers.content_length()? {
        Some(0) | None => Ok(BodyKind::None),
        Some(n) => Ok(BodyKind::Length(n)),
    }
}

/// Body framing of a response, per RFC 7230 §3.3.3: status and request
/// method first, then transfer-coding, then content-length, otherwise
/// read-to-close.
pub(crate) fn response_body_kind(
    method: Method,
    status: u16,
    headers: &Headers,
) -> Result<BodyKind> {
    if method == Method::Head
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Ok(BodyKind::None);
    }
    let codings = headers.transfer_encoding();
    if !codings.is_empty() {
        validate_transfer_encoding(&codings)?;
        return Ok(BodyKind::Chunked);
    }
    match headers.content_length()? {
        Some(0) => Ok(BodyKind::None),
        Some(n) => Ok(BodyKind::Length(n)),
        None => Ok(BodyKind::ToEof),
    }
}

/// Reads a chunk-size line; extensions after `;` are ignored.
pub(crate) fn read_chunk_size(stream: &dyn Stream) -> Result<u64> {
    let line = read_line(stream)?;
    let size_part = line.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size_part, 16).map_err(|_| Error::BadMessageHeader)
}

pub(crate) fn chunk_header(len: usize) -> String {
    format!("{:X}\r\n", len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::CloseMode;
    use pretty_assertions::assert_eq;
    use std::io;
    use std::sync::Mutex;

    /// A canned byte source implementing the stream contract.
    struct Scripted {
        data: Mutex<Vec<u8>>,
    }

    impl Scripted {
        fn new(data: &str) -> Self {
            Scripted {
                data: Mutex::new(data.as_bytes().to_vec()),
            }
        }
    }

    impl Stream for Scripted {
        fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
            let mut data = self.data.lock().unwrap();
            let n = buf.len().min(data.len());
            buf[..n].copy_from_slice(&data[..n]);
            data.drain(..n);
            Ok(n)
        }

        fn write(&self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn close(&self, _mode: CloseMode) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn serializes_a_request_head() {
        let mut request = Request::with_host(Method::Get, "/index.html", "example.com");
        request.headers.add("Accept", "*/*");
        let bytes = serialize_request_head(&request).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "GET /index.html HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn rejects_header_values_with_line_breaks() {
        let mut request = Request::new(Method::Get, "/");
        request.headers.add("X-Evil", "a\r\nInjected: yes");
        assert!(matches!(
            serialize_request_head(&request),
            Err(Error::BadMessageHeader)
        ));
    }

    #[test]
    fn parses_a_response_head() {
        let stream = Scripted::new(
            "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: keep-alive\r\n\r\nhello",
        );
        let response = read_response_head(&stream).unwrap();
        assert_eq!(response.version, Version::HTTP_11);
        assert_eq!(response.status, 200);
        assert_eq!(response.reason, "OK");
        assert_eq!(response.headers.content_length().unwrap(), Some(5));
        // The body must still be on the stream.
        let mut rest = [0u8; 5];
        assert_eq!(Stream::read(&stream, &mut rest).unwrap(), 5);
        assert_eq!(&rest, b"hello");
    }

    #[test]
    fn truncated_head_is_incomplete() {
        let stream = Scripted::new("HTTP/1.1 200 OK\r\nContent-Le");
        assert!(matches!(
            read_response_head(&stream),
            Err(Error::IncompleteMessageHeader)
        ));
    }

    #[test]
    fn garbage_status_line_is_bad() {
        let stream = Scripted::new("ICY 200 OK\r\n\r\n");
        assert!(matches!(
            read_response_head(&stream),
            Err(Error::BadMessageHeader)
        ));
    }

    #[test]
    fn bare_lf_is_bad() {
        let stream = Scripted::new("HTTP/1.1 200 OK\n\n");
        assert!(matches!(
            read_response_head(&stream),
            Err(Error::BadMessageHeader)
        ));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.add("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert!(headers.has_token("CONTENT-TYPE", "Text/Plain"));
    }

    #[test]
    fn list_values_split_across_fields() {
        let mut headers = Headers::new();
        headers.add("Connection", "keep-alive, TE");
        headers.add("Connection", "close");
        assert_eq!(headers.list_values("Connection"), ["keep-alive", "TE", "close"]);
        assert!(headers.has_token("Connection", "close"));
    }

    #[test]
    fn transfer_encoding_validation() {
        let ok = vec!["gzip".to_string(), "chunked".to_string()];
        assert!(validate_transfer_encoding(&ok).is_ok());

        let not_last = vec!["chunked".to_string(), "gzip".to_string()];
        assert!(matches!(
            validate_transfer_encoding(&not_last),
            Err(Error::InvalidTransferEncoding(_))
        ));

        let doubled = vec!["chunked".to_string(), "chunked".to_string()];
        assert!(matches!(
            validate_transfer_encoding(&doubled),
            Err(Error::InvalidTransferEncoding(_))
        ));

        let unsupported = vec!["compress".to_string(), "chunked".to_string()];
        assert!(matches!(
            validate_transfer_encoding(&unsupported),
            Err(Error::InvalidTransferEncoding(_))
        ));
    }

    #[test]
    fn response_body_framing() {
        let mut headers = Headers::new();
        assert_eq!(
            response_body_kind(Method::Get, 200, &headers).unwrap(),
            BodyKind::ToEof
        );
        assert_eq!(
            response_body_kind(Method::Get, 204, &headers).unwrap(),
            BodyKind::None
        );
        assert_eq!(
            response_body_kind(Method::Head, 200, &headers).unwrap(),
            BodyKind::None
        );

        headers.set("Content-Length", "42");
        assert_eq!(
            response_body_kind(Method::Get, 200, &headers).unwrap(),
            BodyKind::Length(42)
        );

        headers.set("Transfer-Encoding", "chunked");
        assert_eq!(
            response_body_kind(Method::Get, 200, &headers).unwrap(),
            BodyKind::Chunked
        );
    }

    #[test]
    fn chunk_size_lines() {
        let stream = Scripted::new("1A;ext=1\r\n");
        assert_eq!(read_chunk_size(&stream).unwrap(), 26);
        assert_eq!(chunk_header(26), "1A\r\n");
    }

    #[test]
    fn multipart_boundary_extraction() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "text/plain");
        assert_eq!(multipart_boundary(&headers).unwrap(), None);

        headers.set("Content-Type", "multipart/form-data; boundary=\"xyz\"");
        assert_eq!(multipart_boundary(&headers).unwrap(), Some("xyz".into()));

        headers.set("Content-Type", "multipart/form-data");
        assert!(matches!(
            multipart_boundary(&headers),
            Err(Error::MissingMultipartBoundary)
        ));
    }

    #[test]
    fn trailer_fields_parse_until_blank_line() {
        let stream = Scripted::new("X-Checksum: abc\r\nX-Count: 2\r\n\r\n");
        let trailer = read_header_fields(&stream).unwrap();
        assert_eq!(trailer.get("X-Checksum"), Some("abc"));
        assert_eq!(trailer.get("X-Count"), Some("2"));
        assert_eq!(trailer.len(), 2);
    }
}
