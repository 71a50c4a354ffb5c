use std::sync::Arc;

use polymux_core::{
    config::{HttpConfig, WebSocketConfig, PROTOCOL_WEBSOCKET},
    mapping::PathMapping,
    Detection, ProtocolDetector, SessionContext,
};
use tracing::debug;

use super::{handshake::is_upgrade_request, WebSocketEndpoint, WebSocketHandler};
use crate::http::{peek_request_head, sniff_method, MethodPrefix};

/// Claims HTTP requests asking for `Upgrade: websocket`. Anything else is
/// left to the detectors after it.
pub struct WebSocketDetector {
    endpoints: Arc<PathMapping<Arc<dyn WebSocketEndpoint>>>,
    http: HttpConfig,
    config: WebSocketConfig,
}

impl WebSocketDetector {
    pub fn new(
        endpoints: Arc<PathMapping<Arc<dyn WebSocketEndpoint>>>,
        http: HttpConfig,
        config: WebSocketConfig,
    ) -> Self {
        Self {
            endpoints,
            http,
            config,
        }
    }
}

impl ProtocolDetector for WebSocketDetector {
    fn name(&self) -> &'static str {
        PROTOCOL_WEBSOCKET
    }

    fn supports(&self, protocols: &[String]) -> bool {
        protocols.iter().any(|p| p == PROTOCOL_WEBSOCKET)
    }

    fn determine_handler(&self, prefix: &[u8], session: &SessionContext) -> Detection {
        match sniff_method(prefix) {
            MethodPrefix::Partial => return Detection::NeedMoreData,
            MethodPrefix::Other => return Detection::NoMatch,
            MethodPrefix::Method => {}
        }
        match peek_request_head(prefix, self.http.max_header_bytes) {
            Ok(None) => Detection::NeedMoreData,
            Ok(Some((head, _))) if is_upgrade_request(&head) => {
                debug!("session {} asks for websocket", session.id());
                Detection::Matched(Box::new(WebSocketHandler::new(
                    self.endpoints.clone(),
                    &self.http,
                    &self.config,
                )))
            }
            // malformed heads are answered by the plain http handler
            Ok(Some(_)) | Err(_) => Detection::NoMatch,
        }
    }
}
