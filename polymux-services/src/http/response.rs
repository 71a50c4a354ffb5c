use std::fmt::Write;

use bytes::{BufMut, Bytes, BytesMut};
use http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};

pub const CLOSE: &str = "close";
pub const UPGRADE: &str = "upgrade";

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// 200 with a plain text body.
    pub fn text(body: impl Into<String>) -> Self {
        Self::new(StatusCode::OK)
            .with_header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            )
            .with_body(body.into())
    }

    /// Status line only, with the canonical reason as body.
    pub fn error(status: StatusCode) -> Self {
        let reason = status.canonical_reason().unwrap_or("Error");
        Self::new(status)
            .with_header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            )
            .with_body(format!("{} {reason}\n", status.as_u16()))
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[inline]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Serializes a complete response. `Content-Length` and
    /// `Connection: close` are always set; `head_only` drops the body.
    pub fn encode(&self, head_only: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(128 + self.body.len());
        self.write_head(&mut buf, Some(self.body.len()), CLOSE);
        if !head_only {
            buf.put_slice(&self.body);
        }
        buf.freeze()
    }

    /// Serializes a protocol switch (101) head.
    pub fn encode_upgrade(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        self.write_head(&mut buf, None, UPGRADE);
        buf.freeze()
    }

    /// Serializes the head of a body streamed until the connection closes.
    pub fn encode_stream_head(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        self.write_head(&mut buf, None, CLOSE);
        buf.freeze()
    }

    fn write_head(&self, buf: &mut BytesMut, content_length: Option<usize>, connection: &str) {
        let reason = self.status.canonical_reason().unwrap_or("");
        let _ = write!(buf, "HTTP/1.1 {} {reason}\r\n", self.status.as_u16());
        for (name, value) in self.headers.iter() {
            if name == header::CONTENT_LENGTH || name == header::CONNECTION {
                continue;
            }
            buf.put_slice(name.as_str().as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        if let Some(len) = content_length {
            let _ = write!(buf, "content-length: {len}\r\n");
        }
        let _ = write!(buf, "connection: {connection}\r\n\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_sets_length_and_close() {
        let response = HttpResponse::text("hi")
            .with_header(header::CONNECTION, HeaderValue::from_static("keep-alive"))
            .with_header(header::CONTENT_LENGTH, HeaderValue::from_static("99"));
        let wire = response.encode(false);
        assert_eq!(
            wire.as_ref(),
            b"HTTP/1.1 200 OK\r\n\
              content-type: text/plain; charset=utf-8\r\n\
              content-length: 2\r\n\
              connection: close\r\n\r\nhi"
        );
        // HEAD keeps the length of the body it omits
        assert!(response.encode(true).ends_with(b"content-length: 2\r\nconnection: close\r\n\r\n"));
    }

    #[test]
    fn test_error_and_upgrade_heads() {
        let not_found = HttpResponse::error(StatusCode::NOT_FOUND);
        assert_eq!(not_found.body().as_ref(), b"404 Not Found\n");
        assert!(not_found.encode(false).starts_with(b"HTTP/1.1 404 Not Found\r\n"));

        let switching = HttpResponse::new(StatusCode::SWITCHING_PROTOCOLS)
            .with_header(header::UPGRADE, HeaderValue::from_static("websocket"))
            .encode_upgrade();
        assert_eq!(
            switching.as_ref(),
            b"HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\nconnection: upgrade\r\n\r\n"
        );
    }
}
