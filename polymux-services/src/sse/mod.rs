//! Server-Sent Events: an HTTP response whose body is an open-ended
//! `text/event-stream`.
use std::sync::Arc;

use polymux_core::{
    config::{HttpConfig, ServerConfig, SseConfig},
    context::ServerContextBuilder,
    mapping::{Mapping, MappingError, PathMapping},
    module::ServerModule,
    AnyResult,
};
use service_async::Param;

pub use self::{
    codec::{SseDecoder, SseEncoder, SseError, SseEvent, DEFAULT_MAX_LINE_BYTES},
    detect::SseDetector,
    handler::{EventSource, SseEmitter, SseHandler},
};

mod codec;
mod detect;
mod handler;

#[derive(Default)]
pub struct SseModule {
    sources: Arc<PathMapping<Arc<dyn EventSource>>>,
}

impl SseModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(
        &mut self,
        path: &str,
        source: impl EventSource,
    ) -> Result<&mut Self, MappingError> {
        Arc::get_mut(&mut self.sources)
            .ok_or(MappingError::Frozen)?
            .add(path, Arc::new(source))?;
        Ok(self)
    }
}

impl ServerModule for SseModule {
    type Target = Arc<dyn EventSource>;

    fn name(&self) -> &'static str {
        "sse"
    }

    fn initialize(
        &mut self,
        config: &ServerConfig,
        context: &mut ServerContextBuilder,
    ) -> AnyResult<()> {
        let http: HttpConfig = config.param();
        let sse: SseConfig = config.param();
        tracing::info!("sse module serves {} paths", self.sources.len());
        context.register_detector(Arc::new(SseDetector::new(
            self.sources.clone(),
            http,
            sse,
        )));
        Ok(())
    }

    fn find_target(&self, path: &str) -> Option<Mapping<'_, Self::Target>> {
        self.sources.find_mapping(path)
    }
}
