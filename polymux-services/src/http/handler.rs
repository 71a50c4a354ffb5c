use std::{collections::VecDeque, fmt, sync::Arc};

use async_channel::{Receiver, Sender, TryRecvError};
use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode};
use polymux_core::{
    config::{HttpConfig, PROTOCOL_HTTP},
    mapping::{PathMapping, PathParams},
    worker::WorkerPool,
    AnyError, AnyResult, ChannelAction, IoHandler, Notifier, SessionContext, SessionId,
};
use tracing::{debug, error, warn};

use super::{HttpError, HttpRequest, HttpResponse, RequestReader};

/// Application logic behind an HTTP route.
pub trait HttpTarget: Send + Sync + 'static {
    fn call(&self, request: &HttpRequest, params: &PathParams) -> AnyResult<HttpResponse>;
}

impl<F> HttpTarget for F
where
    F: Fn(&HttpRequest, &PathParams) -> AnyResult<HttpResponse> + Send + Sync + 'static,
{
    fn call(&self, request: &HttpRequest, params: &PathParams) -> AnyResult<HttpResponse> {
        self(request, params)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Runs on the loop thread; must not block.
    Inline,
    /// Runs on the worker pool.
    Blocking,
}

#[derive(Clone)]
pub struct Route {
    target: Arc<dyn HttpTarget>,
    dispatch: Dispatch,
}

impl Route {
    pub fn new(target: impl HttpTarget, dispatch: Dispatch) -> Self {
        Self {
            target: Arc::new(target),
            dispatch,
        }
    }

    #[inline]
    pub fn dispatch(&self) -> Dispatch {
        self.dispatch
    }

    pub fn call(&self, request: &HttpRequest, params: &PathParams) -> AnyResult<HttpResponse> {
        self.target.call(request, params)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("dispatch", &self.dispatch)
            .finish()
    }
}

type Job = (Route, HttpRequest, PathParams);

enum Exchange {
    Reading,
    /// Waiting for a worker pool slot to hand back the response.
    Offloaded(Receiver<HttpResponse>),
    Ready(HttpResponse),
    Written,
}

/// One request, one response, then the connection closes.
pub struct HttpHandler {
    routes: Arc<PathMapping<Route>>,
    pool: Arc<WorkerPool>,
    reader: RequestReader,
    exchange: Exchange,
    head_only: bool,
    input_closed: bool,
    notifier: Option<Notifier>,
    session_id: SessionId,
}

impl HttpHandler {
    pub fn new(routes: Arc<PathMapping<Route>>, pool: Arc<WorkerPool>, config: &HttpConfig) -> Self {
        Self {
            routes,
            pool,
            reader: RequestReader::new(config),
            exchange: Exchange::Reading,
            head_only: false,
            input_closed: false,
            notifier: None,
            session_id: 0,
        }
    }

    fn dispatch(&mut self, request: HttpRequest) {
        debug!(
            "session {} {} {}",
            self.session_id,
            request.method(),
            request.path()
        );
        self.head_only = request.method() == Method::HEAD;
        let Some(mapping) = self.routes.find_mapping(request.path()) else {
            self.exchange = Exchange::Ready(HttpResponse::error(StatusCode::NOT_FOUND));
            return;
        };
        let route = mapping.target.clone();
        let params = mapping.params;

        self.exchange = match route.dispatch() {
            Dispatch::Inline => Exchange::Ready(respond(self.session_id, &route, &request, &params)),
            Dispatch::Blocking => self.offload((route, request, params)),
        };
    }

    fn offload(&mut self, job: Job) -> Exchange {
        let Some(notifier) = self.notifier.clone() else {
            error!("session {} offloads before deploy", self.session_id);
            return Exchange::Ready(HttpResponse::error(StatusCode::INTERNAL_SERVER_ERROR));
        };
        let (tx, rx) = async_channel::bounded(1);
        let session_id = self.session_id;

        let (on_success, on_failure) = deliver(session_id, tx.clone(), notifier.clone());
        match self.pool.try_assign(run_route, job, on_success, on_failure) {
            Ok(Ok(())) => Exchange::Offloaded(rx),
            // every slot is busy: wait for one without blocking the loop
            Ok(Err(job)) => {
                let (on_success, on_failure) = deliver(session_id, tx, notifier);
                let pool = self.pool.clone();
                monoio::spawn(async move {
                    if let Err(e) = pool.assign_async(run_route, job, on_success, on_failure).await {
                        warn!("session {session_id} offload failed: {e}");
                    }
                });
                Exchange::Offloaded(rx)
            }
            Err(e) => {
                warn!("session {session_id} offload failed: {e}");
                Exchange::Ready(HttpResponse::error(StatusCode::SERVICE_UNAVAILABLE))
            }
        }
    }
}

fn respond(
    session_id: SessionId,
    route: &Route,
    request: &HttpRequest,
    params: &PathParams,
) -> HttpResponse {
    match route.call(request, params) {
        Ok(response) => response,
        Err(e) => {
            warn!("session {session_id} target failed: {e:#}");
            HttpResponse::error(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn run_route((route, request, params): Job) -> AnyResult<HttpResponse> {
    route.call(&request, &params)
}

/// Continuations handing a worker result back to the Session.
fn deliver(
    session_id: SessionId,
    tx: Sender<HttpResponse>,
    notifier: Notifier,
) -> (
    impl FnOnce(HttpResponse) + Send + 'static,
    impl FnOnce(AnyError) + Send + 'static,
) {
    let failed = (tx.clone(), notifier.clone());
    let on_success = move |response: HttpResponse| {
        if tx.try_send(response).is_ok() {
            notifier.notify();
        }
    };
    let on_failure = move |e: AnyError| {
        warn!("session {session_id} target failed: {e:#}");
        let (tx, notifier) = failed;
        if tx
            .try_send(HttpResponse::error(StatusCode::INTERNAL_SERVER_ERROR))
            .is_ok()
        {
            notifier.notify();
        }
    };
    (on_success, on_failure)
}

impl IoHandler for HttpHandler {
    fn protocol(&self) -> &'static str {
        PROTOCOL_HTTP
    }

    fn deploy(&mut self, session: &SessionContext) {
        self.session_id = session.id();
        self.notifier = Some(session.notifier().clone());
    }

    fn consume(&mut self, input: &mut BytesMut) -> AnyResult<ChannelAction> {
        if !matches!(self.exchange, Exchange::Reading) {
            input.clear();
            return Ok(ChannelAction::CloseInput);
        }
        match self.reader.feed(input)? {
            Some(request) => {
                self.dispatch(request);
                Ok(ChannelAction::CloseInput)
            }
            None => Ok(ChannelAction::KeepOpen),
        }
    }

    fn produce(&mut self, output: &mut VecDeque<Bytes>) -> AnyResult<ChannelAction> {
        let received = match &self.exchange {
            Exchange::Offloaded(rx) => Some(rx.try_recv()),
            _ => None,
        };
        match received {
            Some(Ok(response)) => self.exchange = Exchange::Ready(response),
            Some(Err(TryRecvError::Empty)) => return Ok(ChannelAction::KeepOpen),
            Some(Err(TryRecvError::Closed)) => {
                self.exchange =
                    Exchange::Ready(HttpResponse::error(StatusCode::SERVICE_UNAVAILABLE))
            }
            None => {}
        }

        match std::mem::replace(&mut self.exchange, Exchange::Written) {
            Exchange::Ready(response) => {
                debug!(
                    "session {} responds {}",
                    self.session_id,
                    response.status()
                );
                output.push_back(response.encode(self.head_only));
                Ok(ChannelAction::KeepOpen)
            }
            Exchange::Reading => {
                self.exchange = Exchange::Reading;
                // the peer hung up before finishing its request
                if self.input_closed {
                    Ok(ChannelAction::CloseAll)
                } else {
                    Ok(ChannelAction::KeepOpen)
                }
            }
            other => {
                self.exchange = other;
                Ok(ChannelAction::KeepOpen)
            }
        }
    }

    fn write_successful(&mut self, _bytes_written: usize) -> ChannelAction {
        match self.exchange {
            Exchange::Written => ChannelAction::CloseAll,
            _ => ChannelAction::KeepOpen,
        }
    }

    fn on_read_error(&mut self, error: &AnyError) -> ChannelAction {
        match error.downcast_ref::<HttpError>() {
            Some(e) if matches!(self.exchange, Exchange::Reading) => {
                self.exchange = Exchange::Ready(HttpResponse::error(e.status()));
                ChannelAction::CloseInput
            }
            _ => ChannelAction::CloseAll,
        }
    }

    fn handle_closed_input(&mut self) {
        self.input_closed = true;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use polymux_core::session::Wakeups;

    use super::*;

    fn route<F>(dispatch: Dispatch, f: F) -> Route
    where
        F: Fn(&HttpRequest, &PathParams) -> AnyResult<HttpResponse> + Send + Sync + 'static,
    {
        Route::new(f, dispatch)
    }

    fn routes() -> Arc<PathMapping<Route>> {
        let mut routes = PathMapping::new();
        routes
            .add(
                "/service",
                route(Dispatch::Inline, |_, _| Ok(HttpResponse::text("service"))),
            )
            .unwrap();
        routes
            .add(
                "/greet/{name}",
                route(Dispatch::Inline, |req, params| {
                    let name = params.get("name").unwrap_or("nobody");
                    let greeting = req
                        .query_pairs()
                        .into_iter()
                        .find(|(k, _)| k == "greeting")
                        .map(|(_, v)| v)
                        .unwrap_or_else(|| "hello".to_string());
                    Ok(HttpResponse::text(format!("{greeting} {name}")))
                }),
            )
            .unwrap();
        routes
            .add(
                "/fail",
                route(Dispatch::Inline, |_, _| Err(anyhow::anyhow!("database down"))),
            )
            .unwrap();
        routes
            .add(
                "/slow/{ms}",
                route(Dispatch::Blocking, |_, params| {
                    let ms: u64 = params.get("ms").unwrap_or("0").parse()?;
                    std::thread::sleep(Duration::from_millis(ms));
                    Ok(HttpResponse::text(format!("slept {ms}")))
                }),
            )
            .unwrap();
        Arc::new(routes)
    }

    fn deployed() -> (HttpHandler, Wakeups) {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let mut handler = HttpHandler::new(routes(), pool, &HttpConfig::default());
        let (notifier, wakeups) = Notifier::channel();
        handler.deploy(&SessionContext::new(
            1,
            "127.0.0.1:5000".parse().unwrap(),
            notifier,
        ));
        (handler, wakeups)
    }

    /// Runs one consume/produce/write cycle, returning the wire response.
    fn exchange(handler: &mut HttpHandler, request: &[u8]) -> String {
        let mut input = BytesMut::from(request);
        let action = match handler.consume(&mut input) {
            Ok(action) => action,
            Err(e) => handler.on_read_error(&e),
        };
        assert_eq!(action, ChannelAction::CloseInput);
        written(handler)
    }

    fn written(handler: &mut HttpHandler) -> String {
        let mut output = VecDeque::new();
        assert_eq!(
            handler.produce(&mut output).unwrap(),
            ChannelAction::KeepOpen
        );
        assert_eq!(output.len(), 1);
        assert_eq!(handler.write_successful(output[0].len()), ChannelAction::CloseAll);
        String::from_utf8(output[0].to_vec()).unwrap()
    }

    #[test]
    fn test_exact_route() {
        let (mut handler, _wakeups) = deployed();
        let response = exchange(&mut handler, b"GET /service HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("content-length: 7\r\n"));
        assert!(response.contains("connection: close\r\n"));
        assert!(response.ends_with("\r\n\r\nservice"));
    }

    #[test]
    fn test_template_route_with_query() {
        let (mut handler, _wakeups) = deployed();
        let response = exchange(
            &mut handler,
            b"GET /greet/ada?greeting=good%20day HTTP/1.1\r\n\r\n",
        );
        assert!(response.ends_with("good day ada"));
    }

    #[test]
    fn test_head_omits_body() {
        let (mut handler, _wakeups) = deployed();
        let response = exchange(&mut handler, b"HEAD /service HTTP/1.1\r\n\r\n");
        assert!(response.contains("content-length: 7\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_unknown_path_and_failing_target() {
        let (mut handler, _wakeups) = deployed();
        let response = exchange(&mut handler, b"GET /nope HTTP/1.1\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));

        let (mut handler, _wakeups) = deployed();
        let response = exchange(&mut handler, b"GET /fail HTTP/1.1\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }

    #[test]
    fn test_protocol_error_answers_mapped_status() {
        let (mut handler, _wakeups) = deployed();
        let response = exchange(&mut handler, b"GET / HTTP/3.0\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 505 HTTP Version Not Supported\r\n"));
    }

    #[test]
    fn test_partial_request_waits_then_closes_on_eof() {
        let (mut handler, _wakeups) = deployed();
        let mut input = BytesMut::from(&b"GET /serv"[..]);
        assert_eq!(handler.consume(&mut input).unwrap(), ChannelAction::KeepOpen);
        let mut output = VecDeque::new();
        assert_eq!(handler.produce(&mut output).unwrap(), ChannelAction::KeepOpen);
        assert!(output.is_empty());

        handler.handle_closed_input();
        assert_eq!(handler.produce(&mut output).unwrap(), ChannelAction::CloseAll);
        assert!(output.is_empty());
    }

    #[test]
    fn test_blocking_route_wakes_session() {
        let (mut handler, wakeups) = deployed();
        let mut input = BytesMut::from(&b"GET /slow/20 HTTP/1.1\r\n\r\n"[..]);
        assert_eq!(handler.consume(&mut input).unwrap(), ChannelAction::CloseInput);

        wakeups.recv_blocking().unwrap();
        let response = written(&mut handler);
        assert!(response.ends_with("slept 20"));
    }
}
