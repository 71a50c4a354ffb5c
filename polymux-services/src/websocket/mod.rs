//! WebSocket module: upgrade handshake, then RFC 6455 framing on the same
//! Session.
use std::sync::Arc;

use polymux_core::{
    config::{HttpConfig, ServerConfig, WebSocketConfig},
    context::ServerContextBuilder,
    mapping::{Mapping, MappingError, PathMapping},
    module::ServerModule,
    AnyResult,
};
use service_async::Param;

pub use self::{
    detect::WebSocketDetector,
    frame::{close_code, Frame, FrameDecoder, FrameEncoder, OpCode, WebSocketError},
    handler::{WebSocketEndpoint, WebSocketHandler, WebSocketSession},
    handshake::{accept_key, HandshakeError},
    message::{Inbound, Message, MessageAssembler},
};

mod detect;
mod frame;
mod handler;
mod handshake;
mod message;

#[derive(Default)]
pub struct WebSocketModule {
    endpoints: Arc<PathMapping<Arc<dyn WebSocketEndpoint>>>,
}

impl WebSocketModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(
        &mut self,
        path: &str,
        endpoint: impl WebSocketEndpoint,
    ) -> Result<&mut Self, MappingError> {
        Arc::get_mut(&mut self.endpoints)
            .ok_or(MappingError::Frozen)?
            .add(path, Arc::new(endpoint))?;
        Ok(self)
    }
}

impl ServerModule for WebSocketModule {
    type Target = Arc<dyn WebSocketEndpoint>;

    fn name(&self) -> &'static str {
        "websocket"
    }

    fn initialize(
        &mut self,
        config: &ServerConfig,
        context: &mut ServerContextBuilder,
    ) -> AnyResult<()> {
        let http: HttpConfig = config.param();
        let websocket: WebSocketConfig = config.param();
        tracing::info!("websocket module serves {} paths", self.endpoints.len());
        context.register_detector(Arc::new(WebSocketDetector::new(
            self.endpoints.clone(),
            http,
            websocket,
        )));
        Ok(())
    }

    fn find_target(&self, path: &str) -> Option<Mapping<'_, Self::Target>> {
        self.endpoints.find_mapping(path)
    }
}
