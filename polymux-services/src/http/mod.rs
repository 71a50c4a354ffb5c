//! HTTP/1.1 request/response module.
//!
//! Every connection carries exactly one exchange: the request is read, routed
//! through the module's [`PathMapping`], answered, and the connection closes.
use std::sync::Arc;

use polymux_core::{
    config::{HttpConfig, ServerConfig},
    context::ServerContextBuilder,
    mapping::{Mapping, MappingError, PathMapping},
    module::ServerModule,
    AnyResult,
};
use service_async::Param;

pub use self::{
    detect::{sniff_method, HttpDetector, MethodPrefix},
    handler::{Dispatch, HttpHandler, HttpTarget, Route},
    request::{
        peek_request_head, ChunkedBodyDecoder, FixedBodyDecoder, HeadDecoder, HttpError,
        HttpRequest, RequestHead, RequestReader,
    },
    response::{HttpResponse, CLOSE, UPGRADE},
};

mod detect;
mod handler;
mod request;
mod response;

#[derive(Debug, Default)]
pub struct HttpModule {
    routes: Arc<PathMapping<Route>>,
}

impl HttpModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a target that runs on the loop thread.
    pub fn route(
        &mut self,
        path: &str,
        target: impl HttpTarget,
    ) -> Result<&mut Self, MappingError> {
        self.add(path, Route::new(target, Dispatch::Inline))
    }

    /// Registers a target that may block; it runs on the worker pool.
    pub fn route_blocking(
        &mut self,
        path: &str,
        target: impl HttpTarget,
    ) -> Result<&mut Self, MappingError> {
        self.add(path, Route::new(target, Dispatch::Blocking))
    }

    fn add(&mut self, path: &str, route: Route) -> Result<&mut Self, MappingError> {
        Arc::get_mut(&mut self.routes)
            .ok_or(MappingError::Frozen)?
            .add(path, route)?;
        Ok(self)
    }
}

impl ServerModule for HttpModule {
    type Target = Route;

    fn name(&self) -> &'static str {
        "http"
    }

    fn initialize(
        &mut self,
        config: &ServerConfig,
        context: &mut ServerContextBuilder,
    ) -> AnyResult<()> {
        let http: HttpConfig = config.param();
        tracing::info!("http module serves {} paths", self.routes.len());
        context.register_detector(Arc::new(HttpDetector::new(
            self.routes.clone(),
            context.worker_pool().clone(),
            http,
        )));
        Ok(())
    }

    fn find_target(&self, path: &str) -> Option<Mapping<'_, Route>> {
        self.routes.find_mapping(path)
    }
}
