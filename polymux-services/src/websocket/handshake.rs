use base64::{engine::general_purpose::STANDARD, Engine as _};
use http::{header, HeaderValue, Method, StatusCode, Version};
use sha1::{Digest, Sha1};

use crate::http::{HttpResponse, RequestHead};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub const SUPPORTED_VERSION: &str = "13";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("upgrade requires GET")]
    Method,
    #[error("upgrade requires HTTP/1.1")]
    HttpVersion,
    #[error("missing `Upgrade: websocket`")]
    MissingUpgrade,
    #[error("missing `Connection: upgrade`")]
    MissingConnectionUpgrade,
    #[error("unsupported websocket version {0:?}")]
    UnsupportedVersion(Option<String>),
    #[error("invalid Sec-WebSocket-Key")]
    InvalidKey,
}

impl HandshakeError {
    /// Rejection sent before the connection closes.
    pub fn response(&self) -> HttpResponse {
        match self {
            HandshakeError::UnsupportedVersion(_) => HttpResponse::error(StatusCode::UPGRADE_REQUIRED)
                .with_header(
                    header::SEC_WEBSOCKET_VERSION,
                    HeaderValue::from_static(SUPPORTED_VERSION),
                ),
            _ => HttpResponse::error(StatusCode::BAD_REQUEST),
        }
    }
}

pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Whether the head asks for a protocol switch to websocket at all.
pub fn is_upgrade_request(head: &RequestHead) -> bool {
    head.method == Method::GET && head.header_has_token(header::UPGRADE, "websocket")
}

/// Checks an upgrade request and returns the `Sec-WebSocket-Accept` value.
pub fn validate(head: &RequestHead) -> Result<String, HandshakeError> {
    if head.method != Method::GET {
        return Err(HandshakeError::Method);
    }
    if head.version != Version::HTTP_11 {
        return Err(HandshakeError::HttpVersion);
    }
    if !head.header_has_token(header::UPGRADE, "websocket") {
        return Err(HandshakeError::MissingUpgrade);
    }
    if !head.header_has_token(header::CONNECTION, "upgrade") {
        return Err(HandshakeError::MissingConnectionUpgrade);
    }
    match head.header(header::SEC_WEBSOCKET_VERSION) {
        Some(v) if v.trim() == SUPPORTED_VERSION => {}
        other => {
            return Err(HandshakeError::UnsupportedVersion(
                other.map(str::to_string),
            ))
        }
    }
    let key = head
        .header(header::SEC_WEBSOCKET_KEY)
        .map(str::trim)
        .ok_or(HandshakeError::InvalidKey)?;
    match STANDARD.decode(key) {
        Ok(raw) if raw.len() == 16 => Ok(accept_key(key)),
        _ => Err(HandshakeError::InvalidKey),
    }
}

/// The 101 response completing the handshake.
pub fn switching_protocols(accept: &str) -> HttpResponse {
    let mut response = HttpResponse::new(StatusCode::SWITCHING_PROTOCOLS)
        .with_header(header::UPGRADE, HeaderValue::from_static("websocket"));
    if let Ok(value) = HeaderValue::from_str(accept) {
        response = response.with_header(header::SEC_WEBSOCKET_ACCEPT, value);
    }
    response
}
