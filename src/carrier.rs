//! the WebSocket collaborator boundary.
//!
//! RFC 6455 handshake, bit-level framing, ping/pong and compression are all
//! external concerns this crate never reimplements — it only needs a
//! capability set to send binary messages, close with a code, receive the
//! next inbound event, and suspend until the send buffer has drained. a
//! real deployment plugs in the teacher's own `ws-tool` codec (or
//! `tokio-tungstenite`) behind this trait; tests plug in an in-memory
//! recorder. two concrete relays (client-side, server-side) share the core
//! in this crate by composing whatever `WsCarrier` their runtime provides.

use async_trait::async_trait;

/// clean shutdown; the purpose the connection served has been fulfilled.
pub const CLOSE_NORMAL: u16 = 1000;
/// application-range code for a tunnel-layer protocol violation (unexpected
/// RST in IDLE, for instance).
pub const CLOSE_PROTOCOL_ERROR: u16 = 3001;

/// the next thing to happen on the carrier: either a payload, or the
/// connection going away. this re-expresses the source's callback-style
/// `onMessage`/`onClose` pair as a single pollable event, which is the
/// natural shape for an async Rust run loop.
#[derive(Debug, Clone)]
pub enum Incoming {
    Message(Vec<u8>),
    Closed {
        was_clean: bool,
        code: u16,
        reason: String,
    },
}

/// everything the relay core needs from the surrounding WebSocket runtime.
#[async_trait]
pub trait WsCarrier: Send {
    /// queue a binary message for sending. implementations typically buffer
    /// rather than block; [`WsCarrier::drain`] is the actual suspension
    /// point.
    async fn send_message(&mut self, payload: Vec<u8>) -> std::io::Result<()>;

    /// suspend until every previously queued message has been flushed to
    /// the socket. this is the pump's backpressure primitive — never send
    /// another DAT frame before this returns.
    async fn drain(&mut self) -> std::io::Result<()>;

    /// close the carrier with the given application close code.
    async fn send_close(&mut self, code: u16) -> std::io::Result<()>;

    /// await the next message or close event.
    async fn recv(&mut self) -> std::io::Result<Incoming>;
}
