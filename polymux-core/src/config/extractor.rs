use service_async::Param;

use super::{HttpConfig, ServerConfig, SessionConfig, SseConfig, WebSocketConfig};

impl Param<SessionConfig> for ServerConfig {
    fn param(&self) -> SessionConfig {
        self.session
    }
}

impl Param<HttpConfig> for ServerConfig {
    fn param(&self) -> HttpConfig {
        self.http
    }
}

impl Param<WebSocketConfig> for ServerConfig {
    fn param(&self) -> WebSocketConfig {
        self.websocket
    }
}

impl Param<SseConfig> for ServerConfig {
    fn param(&self) -> SseConfig {
        self.sse
    }
}
