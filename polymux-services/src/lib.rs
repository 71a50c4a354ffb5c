//! Protocol modules for the polymux engine.
//!
//! Each module owns a routing table, registers a detector on the
//! [`ServerContextBuilder`](polymux_core::context::ServerContextBuilder) and
//! hands out one handler per detected connection. Install WebSocket and SSE
//! before plain HTTP: all three start with an HTTP request head and the
//! first matching detector wins.
pub mod http;
pub mod sse;
pub mod websocket;
