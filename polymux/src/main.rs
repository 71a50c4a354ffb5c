use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use polymux_core::{
    config::Config, context::ServerContext, mapping::PathParams, server::Server, AnyResult,
};
use polymux_services::{
    http::{HttpModule, HttpRequest, HttpResponse},
    sse::{SseEmitter, SseEvent, SseModule},
    websocket::{Message, WebSocketEndpoint, WebSocketModule, WebSocketSession},
};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

const DEFAULT_LISTENER: &str = "0.0.0.0:8080";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file
    #[clap(short, long, value_parser)]
    config: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = match args.config {
        Some(path) => Config::load(path)?,
        None => Config::new(DEFAULT_LISTENER.parse()?),
    };

    let mut websocket = WebSocketModule::new();
    websocket.endpoint("/ws/echo", Echo)?;

    let mut sse = SseModule::new();
    sse.source("/events/ticker", ticker)?;

    let mut http = HttpModule::new();
    http.route("/service", service)?
        .route("/greet/{name}", greet)?
        .route_blocking("/slow/{ms}", slow)?;

    // upgrade-style protocols first, plain http catches the rest
    let mut builder = ServerContext::builder(config.server)?;
    builder.install(&mut websocket)?;
    builder.install(&mut sse)?;
    builder.install(&mut http)?;

    let handle = Server::start(&config.runtime, builder.build())?;
    tracing::info!("polymux serving on {}", handle.local_addr());
    handle.join()
}

fn service(_: &HttpRequest, _: &PathParams) -> AnyResult<HttpResponse> {
    Ok(HttpResponse::text("polymux\n"))
}

fn greet(request: &HttpRequest, params: &PathParams) -> AnyResult<HttpResponse> {
    let name = params.get("name").unwrap_or("stranger");
    let greeting = request
        .query_pairs()
        .into_iter()
        .find_map(|(k, v)| (k == "greeting").then_some(v))
        .unwrap_or_else(|| "hello".to_string());
    Ok(HttpResponse::text(format!("{greeting}, {name}\n")))
}

fn slow(_: &HttpRequest, params: &PathParams) -> AnyResult<HttpResponse> {
    let ms: u64 = params.get("ms").unwrap_or("0").parse()?;
    std::thread::sleep(Duration::from_millis(ms.min(10_000)));
    Ok(HttpResponse::text(format!("slept {ms}ms\n")))
}

fn ticker(_: &HttpRequest, _: &PathParams, emitter: SseEmitter) -> AnyResult<()> {
    std::thread::Builder::new()
        .name(format!("ticker-{}", emitter.id()))
        .spawn(move || {
            for tick in 0u64.. {
                let event = SseEvent::message(format!("tick {tick}"))
                    .with_event("tick")
                    .with_id(tick.to_string());
                if !emitter.send(event) {
                    break;
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        })?;
    Ok(())
}

struct Echo;

impl WebSocketEndpoint for Echo {
    fn on_message(&self, session: &WebSocketSession, message: Message) {
        match message {
            Message::Text(text) => session.send_text(text),
            Message::Binary(data) => session.send_binary(data),
        };
    }
}
