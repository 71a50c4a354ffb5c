//! Streaming HTTP/1.x request reader.
//!
//! The head is parsed by `httparse`; the decoders here frame it and the body
//! as `monoio_codec` decoders over the session input. [`RequestReader::feed`]
//! may be called with any number of fragments; it takes what it can from the
//! buffer and keeps its place between calls, so a request split at arbitrary
//! byte boundaries reassembles to the same [`HttpRequest`] as one delivered
//! whole.
use std::io;

use bytes::{Buf, Bytes, BytesMut};
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use httparse::Status;
use monoio_codec::{Decoded, Decoder};
use polymux_core::config::HttpConfig;

// chunk-size lines carry at most a size and short extensions
const MAX_CHUNK_LINE: usize = 4096;
const MAX_HEADERS: usize = 128;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    #[error("request head exceeds {0} bytes")]
    HeaderTooLarge(usize),
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error("malformed request: {0}")]
    Malformed(&'static str),
    #[error("unsupported http version")]
    UnsupportedVersion,
    #[error("unsupported transfer coding: {0}")]
    UnsupportedEncoding(String),
    #[error("io error: {0:?}")]
    Io(io::ErrorKind),
}

impl From<io::Error> for HttpError {
    fn from(e: io::Error) -> Self {
        HttpError::Io(e.kind())
    }
}

impl HttpError {
    pub fn status(&self) -> StatusCode {
        match self {
            HttpError::HeaderTooLarge(_) => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            HttpError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            HttpError::Malformed(_) => StatusCode::BAD_REQUEST,
            HttpError::UnsupportedVersion => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            HttpError::UnsupportedEncoding(_) => StatusCode::NOT_IMPLEMENTED,
            HttpError::Io(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// Request line and headers.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    /// First value of `name` as text, if present and visible ASCII.
    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether a comma-separated header carries `token`, ignoring case.
    pub fn header_has_token(&self, name: impl header::AsHeaderName, token: &str) -> bool {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    head: RequestHead,
    body: Bytes,
}

impl HttpRequest {
    pub fn from_parts(head: RequestHead, body: Bytes) -> Self {
        Self { head, body }
    }

    #[inline]
    pub fn method(&self) -> &Method {
        &self.head.method
    }

    /// Raw request path, without the query string.
    #[inline]
    pub fn path(&self) -> &str {
        &self.head.path
    }

    #[inline]
    pub fn query(&self) -> Option<&str> {
        self.head.query.as_deref()
    }

    /// Query string decoded as `application/x-www-form-urlencoded` pairs.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        match self.query() {
            Some(q) => url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect(),
            None => Vec::new(),
        }
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.head.version
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.head.header(name)
    }

    #[inline]
    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    #[inline]
    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Decodes a request head, stray leading CRLFs included.
#[derive(Debug, Clone, Copy)]
pub struct HeadDecoder {
    max_header_bytes: usize,
}

impl HeadDecoder {
    pub fn new(max_header_bytes: usize) -> Self {
        Self { max_header_bytes }
    }
}

impl Decoder for HeadDecoder {
    type Item = RequestHead;
    type Error = HttpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<RequestHead>, HttpError> {
        match peek_request_head(&src[..], self.max_header_bytes)? {
            Some((head, len)) => {
                src.advance(len);
                Ok(Decoded::Some(head))
            }
            None => Ok(Decoded::Insufficient),
        }
    }
}

/// Body sized by `Content-Length`.
#[derive(Debug)]
pub struct FixedBodyDecoder {
    remaining: usize,
    body: BytesMut,
}

impl FixedBodyDecoder {
    pub fn new(length: usize) -> Self {
        Self {
            remaining: length,
            body: BytesMut::with_capacity(length.min(8192)),
        }
    }
}

impl Decoder for FixedBodyDecoder {
    type Item = Bytes;
    type Error = HttpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<Bytes>, HttpError> {
        let n = self.remaining.min(src.len());
        self.body.extend_from_slice(&src.split_to(n));
        self.remaining -= n;
        if self.remaining > 0 {
            return Ok(Decoded::Insufficient);
        }
        Ok(Decoded::Some(self.body.split().freeze()))
    }
}

#[derive(Debug, Clone, Copy)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailers,
}

/// Chunked body; extensions and trailer fields are dropped.
#[derive(Debug)]
pub struct ChunkedBodyDecoder {
    max_body_bytes: usize,
    max_trailer_bytes: usize,
    state: ChunkState,
    body: BytesMut,
}

impl ChunkedBodyDecoder {
    pub fn new(max_body_bytes: usize, max_trailer_bytes: usize) -> Self {
        Self {
            max_body_bytes,
            max_trailer_bytes,
            state: ChunkState::Size,
            body: BytesMut::new(),
        }
    }
}

impl Decoder for ChunkedBodyDecoder {
    type Item = Bytes;
    type Error = HttpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<Bytes>, HttpError> {
        loop {
            match self.state {
                ChunkState::Size => match httparse::parse_chunk_size(&src[..]) {
                    Ok(Status::Complete((used, size))) => {
                        let size = usize::try_from(size)
                            .map_err(|_| HttpError::BodyTooLarge(self.max_body_bytes))?;
                        if self.body.len().saturating_add(size) > self.max_body_bytes {
                            return Err(HttpError::BodyTooLarge(self.max_body_bytes));
                        }
                        src.advance(used);
                        self.state = if size == 0 {
                            ChunkState::Trailers
                        } else {
                            ChunkState::Data(size)
                        };
                    }
                    Ok(Status::Partial) if src.len() > MAX_CHUNK_LINE => {
                        return Err(HttpError::Malformed("chunk size line too long"))
                    }
                    Ok(Status::Partial) => return Ok(Decoded::Insufficient),
                    Err(_) => return Err(HttpError::Malformed("bad chunk size")),
                },
                ChunkState::Data(remaining) => {
                    let n = remaining.min(src.len());
                    self.body.extend_from_slice(&src.split_to(n));
                    if n < remaining {
                        self.state = ChunkState::Data(remaining - n);
                        return Ok(Decoded::Insufficient);
                    }
                    self.state = ChunkState::DataEnd;
                }
                ChunkState::DataEnd => match &src[..] {
                    [b'\r', b'\n', ..] => {
                        src.advance(2);
                        self.state = ChunkState::Size;
                    }
                    [b'\n', ..] => {
                        src.advance(1);
                        self.state = ChunkState::Size;
                    }
                    [] | [b'\r'] => return Ok(Decoded::Insufficient),
                    _ => return Err(HttpError::Malformed("chunk data not followed by CRLF")),
                },
                ChunkState::Trailers => {
                    let mut fields = [httparse::EMPTY_HEADER; MAX_HEADERS];
                    let parsed = match httparse::parse_headers(&src[..], &mut fields) {
                        Ok(Status::Complete((used, _))) => Ok(Some(used)),
                        Ok(Status::Partial) => Ok(None),
                        Err(e) => Err(e),
                    };
                    return match parsed {
                        Ok(Some(used)) => {
                            src.advance(used);
                            self.state = ChunkState::Size;
                            Ok(Decoded::Some(self.body.split().freeze()))
                        }
                        Ok(None) if src.len() > self.max_trailer_bytes => {
                            Err(HttpError::HeaderTooLarge(self.max_trailer_bytes))
                        }
                        Ok(None) => Ok(Decoded::Insufficient),
                        Err(httparse::Error::TooManyHeaders) => {
                            Err(HttpError::HeaderTooLarge(self.max_trailer_bytes))
                        }
                        Err(_) => Err(HttpError::Malformed("bad trailer field")),
                    };
                }
            }
        }
    }
}

#[derive(Debug)]
enum BodyDecoder {
    Fixed(FixedBodyDecoder),
    Chunked(ChunkedBodyDecoder),
}

impl Decoder for BodyDecoder {
    type Item = Bytes;
    type Error = HttpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<Bytes>, HttpError> {
        match self {
            BodyDecoder::Fixed(decoder) => decoder.decode(src),
            BodyDecoder::Chunked(decoder) => decoder.decode(src),
        }
    }
}

enum ReaderState {
    Head,
    Body {
        head: RequestHead,
        body: BodyDecoder,
    },
}

/// Whole-request decoder: a head, then the body its framing headers ask for.
pub struct RequestReader {
    head: HeadDecoder,
    max_header_bytes: usize,
    max_body_bytes: usize,
    state: ReaderState,
}

impl RequestReader {
    pub fn new(config: &HttpConfig) -> Self {
        Self {
            head: HeadDecoder::new(config.max_header_bytes),
            max_header_bytes: config.max_header_bytes,
            max_body_bytes: config.max_body_bytes,
            state: ReaderState::Head,
        }
    }

    /// Consumes bytes from `input`. Returns the request once complete; bytes
    /// after it are left in `input`.
    pub fn feed(&mut self, input: &mut BytesMut) -> Result<Option<HttpRequest>, HttpError> {
        Ok(match self.decode(input)? {
            Decoded::Some(request) => Some(request),
            _ => None,
        })
    }

    /// Whether a request has started but is not complete yet.
    pub fn in_progress(&self) -> bool {
        matches!(self.state, ReaderState::Body { .. })
    }
}

impl Decoder for RequestReader {
    type Item = HttpRequest;
    type Error = HttpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<HttpRequest>, HttpError> {
        if let ReaderState::Head = self.state {
            let head = match self.head.decode(src)? {
                Decoded::Some(head) => head,
                _ => return Ok(Decoded::Insufficient),
            };
            let body = match body_framing(&head.headers, self.max_body_bytes)? {
                Framing::Chunked => BodyDecoder::Chunked(ChunkedBodyDecoder::new(
                    self.max_body_bytes,
                    self.max_header_bytes,
                )),
                Framing::Length(n) => BodyDecoder::Fixed(FixedBodyDecoder::new(n)),
            };
            self.state = ReaderState::Body { head, body };
        }

        let ReaderState::Body { body, .. } = &mut self.state else {
            return Ok(Decoded::Insufficient);
        };
        let body = match body.decode(src)? {
            Decoded::Some(body) => body,
            _ => return Ok(Decoded::Insufficient),
        };
        match std::mem::replace(&mut self.state, ReaderState::Head) {
            ReaderState::Body { head, .. } => Ok(Decoded::Some(HttpRequest::from_parts(head, body))),
            ReaderState::Head => Ok(Decoded::Insufficient),
        }
    }
}

enum Framing {
    Length(usize),
    Chunked,
}

fn body_framing(headers: &HeaderMap, max_body_bytes: usize) -> Result<Framing, HttpError> {
    let mut codings = Vec::new();
    for value in headers.get_all(header::TRANSFER_ENCODING) {
        let value = value
            .to_str()
            .map_err(|_| HttpError::Malformed("bad transfer-encoding"))?;
        codings.extend(
            value
                .split(',')
                .map(|c| c.trim().to_ascii_lowercase())
                .filter(|c| !c.is_empty()),
        );
    }
    // chunked framing wins over any content-length
    if !codings.is_empty() {
        return match codings.as_slice() {
            [only] if only == "chunked" => Ok(Framing::Chunked),
            _ => Err(HttpError::UnsupportedEncoding(codings.join(", "))),
        };
    }

    let mut length: Option<usize> = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let value = value
            .to_str()
            .map_err(|_| HttpError::Malformed("bad content-length"))?;
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(HttpError::Malformed("bad content-length"));
            }
            let n = part
                .parse::<usize>()
                .map_err(|_| HttpError::BodyTooLarge(max_body_bytes))?;
            match length {
                Some(prev) if prev != n => {
                    return Err(HttpError::Malformed("conflicting content-length"))
                }
                _ => length = Some(n),
            }
        }
    }
    let length = length.unwrap_or(0);
    if length > max_body_bytes {
        return Err(HttpError::BodyTooLarge(max_body_bytes));
    }
    Ok(Framing::Length(length))
}

/// Parses a request head from the start of `buf` without consuming it.
///
/// Returns the head and the number of bytes it spans (stray leading CRLFs
/// included), `None` while the head is incomplete.
pub fn peek_request_head(
    buf: &[u8],
    max_header_bytes: usize,
) -> Result<Option<(RequestHead, usize)>, HttpError> {
    let skipped = buf
        .iter()
        .take_while(|b| **b == b'\r' || **b == b'\n')
        .count();
    let rest = &buf[skipped..];

    let mut fields = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut fields);
    match request.parse(rest) {
        Ok(Status::Complete(len)) if len > max_header_bytes => {
            Err(HttpError::HeaderTooLarge(max_header_bytes))
        }
        Ok(Status::Complete(len)) => Ok(Some((build_head(&request)?, skipped + len))),
        Ok(Status::Partial) if rest.len() > max_header_bytes => {
            Err(HttpError::HeaderTooLarge(max_header_bytes))
        }
        Ok(Status::Partial) => Ok(None),
        Err(httparse::Error::TooManyHeaders) => Err(HttpError::HeaderTooLarge(max_header_bytes)),
        Err(httparse::Error::Version) if names_http_version(rest) => {
            Err(HttpError::UnsupportedVersion)
        }
        Err(httparse::Error::Version) => Err(HttpError::Malformed("bad http version")),
        Err(httparse::Error::HeaderName) => Err(HttpError::Malformed("bad header name")),
        Err(httparse::Error::HeaderValue) => Err(HttpError::Malformed("bad header value")),
        Err(httparse::Error::NewLine) => Err(HttpError::Malformed("bad line ending")),
        Err(_) => Err(HttpError::Malformed("bad request line")),
    }
}

/// Whether the request line ends in an `HTTP/x.y` token, even one httparse
/// does not speak.
fn names_http_version(buf: &[u8]) -> bool {
    let line = buf.split(|b| *b == b'\n').next().unwrap_or_default();
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    line.rsplit(|b| *b == b' ')
        .next()
        .is_some_and(|token| token.starts_with(b"HTTP/"))
}

fn build_head(request: &httparse::Request<'_, '_>) -> Result<RequestHead, HttpError> {
    let method = request.method.unwrap_or_default();
    let method =
        Method::from_bytes(method.as_bytes()).map_err(|_| HttpError::Malformed("bad method"))?;
    let version = match request.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(HttpError::UnsupportedVersion),
    };
    let (path, query) = split_target(request.path.unwrap_or_default())?;

    let mut headers = HeaderMap::with_capacity(request.headers.len());
    for field in request.headers.iter() {
        let name = HeaderName::from_bytes(field.name.as_bytes())
            .map_err(|_| HttpError::Malformed("bad header name"))?;
        let value = HeaderValue::from_bytes(field.value)
            .map_err(|_| HttpError::Malformed("bad header value"))?;
        headers.append(name, value);
    }

    Ok(RequestHead {
        method,
        path,
        query,
        version,
        headers,
    })
}

fn split_target(target: &str) -> Result<(String, Option<String>), HttpError> {
    if target.starts_with('/') {
        let target = target.split('#').next().unwrap_or(target);
        return Ok(match target.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (target.to_string(), None),
        });
    }
    if target == "*" {
        return Ok((target.to_string(), None));
    }
    // absolute-form, as sent to proxies
    match url::Url::parse(target) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {
            Ok((url.path().to_string(), url.query().map(str::to_string)))
        }
        _ => Err(HttpError::Malformed("bad request target")),
    }
}
