use std::sync::Arc;

use http::{header, Method};
use polymux_core::{
    config::{HttpConfig, SseConfig, PROTOCOL_SSE},
    mapping::PathMapping,
    Detection, ProtocolDetector, SessionContext,
};
use tracing::debug;

use super::{EventSource, SseHandler};
use crate::http::{peek_request_head, sniff_method, MethodPrefix, RequestHead};

const EVENT_STREAM: &str = "text/event-stream";

pub struct SseDetector {
    sources: Arc<PathMapping<Arc<dyn EventSource>>>,
    http: HttpConfig,
    config: SseConfig,
}

impl SseDetector {
    pub fn new(
        sources: Arc<PathMapping<Arc<dyn EventSource>>>,
        http: HttpConfig,
        config: SseConfig,
    ) -> Self {
        Self {
            sources,
            http,
            config,
        }
    }
}

fn accepts_event_stream(head: &RequestHead) -> bool {
    head.method == Method::GET
        && head
            .headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|media| {
                let essence = media.split(';').next().unwrap_or_default();
                essence.trim().eq_ignore_ascii_case(EVENT_STREAM)
            })
}

impl ProtocolDetector for SseDetector {
    fn name(&self) -> &'static str {
        PROTOCOL_SSE
    }

    fn supports(&self, protocols: &[String]) -> bool {
        protocols.iter().any(|p| p == PROTOCOL_SSE)
    }

    fn determine_handler(&self, prefix: &[u8], session: &SessionContext) -> Detection {
        match sniff_method(prefix) {
            MethodPrefix::Partial => return Detection::NeedMoreData,
            MethodPrefix::Other => return Detection::NoMatch,
            MethodPrefix::Method => {}
        }
        match peek_request_head(prefix, self.http.max_header_bytes) {
            Ok(None) => Detection::NeedMoreData,
            Ok(Some((head, _))) if accepts_event_stream(&head) => {
                debug!("session {} asks for an event stream", session.id());
                Detection::Matched(Box::new(SseHandler::new(
                    self.sources.clone(),
                    &self.http,
                    &self.config,
                )))
            }
            Ok(Some(_)) | Err(_) => Detection::NoMatch,
        }
    }
}
