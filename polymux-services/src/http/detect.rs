use std::sync::Arc;

use polymux_core::{
    config::{HttpConfig, PROTOCOL_HTTP},
    mapping::PathMapping,
    worker::WorkerPool,
    Detection, ProtocolDetector, SessionContext,
};
use tracing::debug;

use super::{HttpHandler, Route};

const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
const METHODS: [&[u8]; 9] = [
    b"GET", b"HEAD", b"POST", b"PUT", b"DELETE", b"CONNECT", b"OPTIONS", b"TRACE", b"PATCH",
];
const MAX_METHOD_LEN: usize = 7;

/// Outcome of looking for an HTTP/1.x request-line method at the start of a
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodPrefix {
    Partial,
    Method,
    Other,
}

/// Recognizes `<METHOD> SP` after optional leading blank lines.
pub fn sniff_method(prefix: &[u8]) -> MethodPrefix {
    let start = prefix
        .iter()
        .position(|b| *b != b'\r' && *b != b'\n')
        .unwrap_or(prefix.len());
    let prefix = &prefix[start..];
    if prefix.is_empty() {
        return MethodPrefix::Partial;
    }
    if PREFACE.starts_with(&prefix[..prefix.len().min(PREFACE.len())]) {
        // HTTP/2 prior knowledge is not served
        return if prefix.len() < 4 {
            MethodPrefix::Partial
        } else {
            MethodPrefix::Other
        };
    }

    match prefix.iter().position(|b| *b == b' ') {
        Some(end) if METHODS.iter().any(|m| *m == &prefix[..end]) => MethodPrefix::Method,
        Some(_) => MethodPrefix::Other,
        None if prefix.len() > MAX_METHOD_LEN => MethodPrefix::Other,
        None if METHODS.iter().any(|m| m.starts_with(prefix)) => MethodPrefix::Partial,
        None => MethodPrefix::Other,
    }
}

pub struct HttpDetector {
    routes: Arc<PathMapping<Route>>,
    pool: Arc<WorkerPool>,
    config: HttpConfig,
}

impl HttpDetector {
    pub fn new(routes: Arc<PathMapping<Route>>, pool: Arc<WorkerPool>, config: HttpConfig) -> Self {
        Self {
            routes,
            pool,
            config,
        }
    }
}

impl ProtocolDetector for HttpDetector {
    fn name(&self) -> &'static str {
        PROTOCOL_HTTP
    }

    fn supports(&self, protocols: &[String]) -> bool {
        protocols.iter().any(|p| p == PROTOCOL_HTTP)
    }

    fn determine_handler(&self, prefix: &[u8], session: &SessionContext) -> Detection {
        match sniff_method(prefix) {
            MethodPrefix::Partial => Detection::NeedMoreData,
            MethodPrefix::Other => Detection::NoMatch,
            MethodPrefix::Method => {
                debug!("session {} speaks http", session.id());
                Detection::Matched(Box::new(HttpHandler::new(
                    self.routes.clone(),
                    self.pool.clone(),
                    &self.config,
                )))
            }
        }
    }
}
