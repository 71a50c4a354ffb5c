use std::{
    io::{Read, Write},
    net::TcpStream,
    time::Duration,
};

use bytes::BytesMut;
use monoio_codec::{Decoded, Decoder};
use polymux_core::{
    config::{RuntimeConfig, RuntimeType, ServerConfig},
    context::ServerContext,
    mapping::PathParams,
    server::{Server, ServerHandle},
    AnyResult,
};
use polymux_services::{
    http::{HttpModule, HttpRequest, HttpResponse},
    sse::{SseDecoder, SseEmitter, SseEvent, SseModule},
    websocket::{close_code, Frame, FrameDecoder, Message, OpCode, WebSocketEndpoint, WebSocketModule, WebSocketSession},
};

const KEY: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

struct Echo;

impl WebSocketEndpoint for Echo {
    fn on_message(&self, session: &WebSocketSession, message: Message) {
        match message {
            Message::Text(text) => session.send_text(format!("echo: {text}")),
            Message::Binary(data) => session.send_binary(data),
        };
    }
}

fn start() -> ServerHandle {
    let mut config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
    config.worker_pool.capacity = 2;
    config.shutdown_grace_ms = 200;
    let mut builder = ServerContext::builder(config).unwrap();

    let mut websocket = WebSocketModule::new();
    websocket.endpoint("/ws/echo", Echo).unwrap();

    let mut sse = SseModule::new();
    sse.source(
        "/events/{topic}",
        |_: &HttpRequest, params: &PathParams, emitter: SseEmitter| -> AnyResult<()> {
            let topic = params.get("topic").unwrap_or_default();
            emitter.send(SseEvent::message(format!("{topic} 1")).with_id("1"));
            emitter.send(SseEvent::message(format!("{topic} 2")).with_id("2"));
            // dropping the emitter ends the stream
            Ok(())
        },
    )
    .unwrap();

    let mut http = HttpModule::new();
    http.route(
        "/service",
        |_: &HttpRequest, _: &PathParams| -> AnyResult<HttpResponse> {
            Ok(HttpResponse::text("service ok"))
        },
    )
    .unwrap()
    .route_blocking(
        "/slow/{ms}",
        |_: &HttpRequest, params: &PathParams| -> AnyResult<HttpResponse> {
            let ms: u64 = params.get("ms").unwrap_or("0").parse()?;
            std::thread::sleep(Duration::from_millis(ms));
            Ok(HttpResponse::text(format!("slept {ms}")))
        },
    )
    .unwrap();

    builder.install(&mut websocket).unwrap();
    builder.install(&mut sse).unwrap();
    builder.install(&mut http).unwrap();

    let runtime = RuntimeConfig {
        worker_threads: 1,
        runtime_type: RuntimeType::Legacy,
        cpu_affinity: false,
        ..Default::default()
    };
    Server::start(&runtime, builder.build()).unwrap()
}

fn stop(mut handle: ServerHandle) {
    handle.shutdown();
    handle.join().unwrap();
}

fn connect(handle: &ServerHandle) -> TcpStream {
    let stream = TcpStream::connect(handle.local_addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Sends `request` and reads until the server closes the connection.
fn exchange(handle: &ServerHandle, request: &[u8]) -> String {
    let mut client = connect(handle);
    client.write_all(request).unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).unwrap();
    String::from_utf8(response).unwrap()
}

fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

fn read_frame(stream: &mut TcpStream) -> Frame {
    let mut decoder = FrameDecoder::client(1 << 16);
    let mut buf = BytesMut::new();
    let mut chunk = [0u8; 256];
    loop {
        if let Decoded::Some(frame) = decoder.decode(&mut buf).unwrap() {
            return frame;
        }
        let n = stream.read(&mut chunk).unwrap();
        assert_ne!(n, 0, "connection closed mid-frame");
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[test]
fn test_http_exact_route_and_missing_path() {
    let handle = start();

    let response = exchange(&handle, b"GET /service HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("connection: close\r\n"));
    assert!(response.ends_with("\r\n\r\nservice ok"));

    let response = exchange(&handle, b"GET /missing HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(response.ends_with("404 Not Found\n"));

    stop(handle);
}

#[test]
fn test_http_fragmented_request_and_body() {
    let handle = start();

    let mut client = connect(&handle);
    for part in [&b"PO"[..], b"ST /serv", b"ice HTTP/1.1\r\nContent-Le", b"ngth: 4\r\n\r\nab", b"cd"] {
        client.write_all(part).unwrap();
        std::thread::sleep(Duration::from_millis(20));
    }
    let mut response = String::new();
    client.read_to_string(&mut response).unwrap();
    assert!(response.ends_with("service ok"));

    let response = exchange(
        &handle,
        b"GET /service HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));

    stop(handle);
}

#[test]
fn test_blocking_route_runs_on_worker_pool() {
    let handle = start();
    let response = exchange(&handle, b"GET /slow/30 HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("slept 30"));
    stop(handle);
}

#[test]
fn test_websocket_echo_and_close() {
    let handle = start();
    let mut client = connect(&handle);
    client
        .write_all(
            b"GET /ws/echo HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
              Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();
    let head = read_head(&mut client);
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(head.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

    // a message split over two frames
    client
        .write_all(&Frame::new(false, OpCode::Text, "hel").encode_masked(KEY))
        .unwrap();
    client
        .write_all(&Frame::new(true, OpCode::Continuation, "lo").encode_masked(KEY))
        .unwrap();
    assert_eq!(read_frame(&mut client), Frame::text("echo: hello"));

    client
        .write_all(&Frame::ping("still there?").encode_masked(KEY))
        .unwrap();
    assert_eq!(read_frame(&mut client), Frame::pong("still there?"));

    client
        .write_all(&Frame::close(Some(close_code::NORMAL), "bye").encode_masked(KEY))
        .unwrap();
    let echoed = read_frame(&mut client);
    assert_eq!(echoed.opcode, OpCode::Close);
    assert_eq!(echoed.payload.as_ref(), b"\x03\xe8");

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    stop(handle);
}

#[test]
fn test_sse_stream_ends_with_emitter() {
    let handle = start();
    let response = exchange(
        &handle,
        b"GET /events/news HTTP/1.1\r\nAccept: text/event-stream\r\n\r\n",
    );
    let (head, body) = response.split_once("\r\n\r\n").unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("content-type: text/event-stream\r\n"));

    let events = SseDecoder::default()
        .decode_all(&mut BytesMut::from(body.as_bytes()))
        .unwrap();
    assert_eq!(
        events,
        vec![
            SseEvent::message("news 1").with_id("1"),
            SseEvent::message("news 2").with_id("2"),
        ]
    );

    stop(handle);
}

#[test]
fn test_unrecognized_bytes_close_silently() {
    let handle = start();

    let mut client = connect(&handle);
    client.write_all(b"\x00\x01 not a protocol\r\n\r\n").unwrap();
    let mut buf = [0u8; 64];
    // a reset is as good as an orderly close here
    assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));

    // the server keeps serving
    let response = exchange(&handle, b"GET /service HTTP/1.1\r\n\r\n");
    assert!(response.ends_with("service ok"));

    stop(handle);
}
