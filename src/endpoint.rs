//! the tunnel endpoint facade: composes the cryptor, frame codec, state
//! machine and pump behind the five operations a surrounding WebSocket
//! runtime calls into.
//!
//! `TunnelEndpoint` is generic over the local stream halves (`R`/`W`) and
//! the carrier (`C: WsCarrier`) so the same core serves both the
//! client-side relay (local app ↔ SOCKS) and the server-side relay (local
//! ↔ real target) — the two concrete tunnels the source describes sharing
//! one relay mixin.

use std::sync::Arc;

use rand::Rng;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::carrier::{Incoming, WsCarrier, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR};
use crate::config::Config;
use crate::crypto::Cryptor;
use crate::diagnostics::{DiagnosticsRegistry, LiveToken};
use crate::errors::{FrameError, RelayError};
use crate::frame::{
    make_dat_frame, make_relay_header_now, make_reset_message, now_f64, parse_dat_frame,
    parse_relay_header, parse_reset_message, CMD_REQ, CMD_RST,
};
use crate::pump::{self, PumpEvent, PumpHandle};
use crate::socks_addr::SocksAddr;
use crate::state::TunnelState;

/// the cryptor and carrier, bundled so the pump task (spawned separately
/// from the endpoint's own main loop) can reach both without the endpoint
/// itself needing `Send + 'static` shared ownership of anything else.
///
/// this is the one place the source's single-threaded-event-loop model is
/// deliberately not realized literally: `tokio`'s default runtime may poll
/// the endpoint and the pump on different OS threads, so the two really do
/// need a lock here. see DESIGN.md for the residual race this implies.
pub struct Shared<C> {
    pub carrier: C,
    pub cryptor: Cryptor,
}

/// everything that exists only while `state = USING`, bundled so that one
/// `Option` witnesses all three of the source's `pump_task` / `local_reader`
/// / `local_writer` being simultaneously present or absent. `local_reader`
/// itself is owned by the spawned pump task, not stored here — `pump` is
/// its only remaining trace in the endpoint.
struct Active<W> {
    writer: W,
    pump: PumpHandle,
}

/// outcome of one iteration of the endpoint's drive loop, surfaced to the
/// caller (a real WebSocket runtime would typically loop calling
/// [`TunnelEndpoint::poll_once`] until it returns `Closed`).
#[derive(Debug)]
pub enum EndpointEvent {
    /// a REQ frame arrived while IDLE: the caller should dial `addr:port`
    /// and, once connected, call [`TunnelEndpoint::set_proxy`] with the
    /// resulting stream halves.
    Requested {
        addr: SocksAddr,
        port: u16,
        remain: Vec<u8>,
    },
    /// the tunnel completed a reset (either direction) and is back to IDLE,
    /// ready for the next logical connection.
    Reset,
    /// the carrier is gone; the endpoint is now inert.
    Closed {
        was_clean: bool,
        code: u16,
        reason: String,
    },
}

/// composes the relay core (C1–C4) behind the operations a WebSocket
/// runtime invokes.
pub struct TunnelEndpoint<C, W> {
    shared: Arc<Mutex<Shared<C>>>,
    state: TunnelState,
    active: Option<Active<W>>,
    config: Config,
    buf_size: usize,
    _diag_token: Option<LiveToken>,
}

impl<C, W> TunnelEndpoint<C, W>
where
    C: WsCarrier + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// construct an endpoint in `Idle` state over a freshly-opened carrier.
    /// `nonce` seeds the cryptor's CTR stream; `registry` is consulted only
    /// when `config.debug` is set.
    pub fn new(config: Config, carrier: C, nonce: [u8; 16], registry: Option<&DiagnosticsRegistry>) -> Self {
        let cryptor = Cryptor::from_config(&config, nonce);
        let buf_size = rand::thread_rng().gen_range(4096..8192);
        let diag_token = if config.debug {
            registry.map(|r| r.register())
        } else {
            None
        };
        Self {
            shared: Arc::new(Mutex::new(Shared { carrier, cryptor })),
            state: TunnelState::Idle,
            active: None,
            config,
            buf_size,
            _diag_token: diag_token,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// hand the endpoint a connected local stream and start relaying.
    /// precondition: `state = Idle`.
    pub async fn set_proxy<R>(&mut self, reader: R, writer: W) -> Result<(), RelayError>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        if self.state != TunnelState::Idle {
            return Err(RelayError::InvalidState(self.state.as_str()));
        }
        let pump = pump::spawn(reader, self.shared.clone(), self.buf_size);
        self.active = Some(Active { writer, pump });
        self.state = TunnelState::Using;
        debug!("tunnel entered USING");
        Ok(())
    }

    /// send a REQ frame for a new logical connection, server-side dialing
    /// is the caller's concern. intended to be called by the client-side
    /// relay before [`TunnelEndpoint::set_proxy`] on the peer end.
    pub async fn send_request(&mut self, addr: &SocksAddr, port: u16, remain: &[u8]) -> Result<(), RelayError> {
        let mut guard = self.shared.lock().await;
        let frame = make_relay_header_now(&mut guard.cryptor, addr, port, remain);
        guard.carrier.send_message(frame).await?;
        guard.carrier.drain().await?;
        Ok(())
    }

    /// locally-initiated teardown: send RST, cancel the pump, close the
    /// local writer, move to `Resetting`. If not `Using`, the tunnel is in
    /// a state that never expected this call — close with 3001.
    pub async fn reset_tunnel(&mut self, reason: &str) -> Result<(), RelayError> {
        if self.state != TunnelState::Using {
            let mut guard = self.shared.lock().await;
            guard.carrier.send_close(CLOSE_PROTOCOL_ERROR).await?;
            return Err(RelayError::InvalidState(self.state.as_str()));
        }
        self.send_rst_and_teardown(reason).await?;
        self.state = TunnelState::Resetting;
        debug!("tunnel entered RESETTING");
        Ok(())
    }

    /// inbound RST dispatch. mirrors [`TunnelEndpoint::reset_tunnel`]'s
    /// teardown when `Using`; when already `Resetting`, this RST is the
    /// peer's confirmation of our own in-flight reset — accept it without
    /// sending a second RST, resolving the simultaneous-RST race
    /// symmetrically. when `Idle`, an RST was never expected: close 3001.
    async fn on_reset_tunnel(&mut self) -> Result<EndpointEvent, RelayError> {
        match self.state {
            TunnelState::Using => {
                self.send_rst_and_teardown("").await?;
                self.succeed_reset();
                Ok(EndpointEvent::Reset)
            }
            TunnelState::Resetting => {
                self.succeed_reset();
                Ok(EndpointEvent::Reset)
            }
            TunnelState::Idle => {
                let mut guard = self.shared.lock().await;
                guard.carrier.send_close(CLOSE_PROTOCOL_ERROR).await?;
                Err(RelayError::InvalidState(self.state.as_str()))
            }
        }
    }

    /// clear the active local stream/pump and return to `Idle`, ready for
    /// the next `set_proxy`.
    fn succeed_reset(&mut self) {
        self.active = None;
        self.state = TunnelState::Idle;
        debug!("tunnel succeeded reset, back to IDLE");
    }

    /// shared teardown body for both reset paths: send RST, abort the
    /// pump, half-close the local writer. RST is sent before the pump is
    /// touched — there is no suspension point between the two, so the
    /// pump can never squeeze a DAT frame out after this RST.
    async fn send_rst_and_teardown(&mut self, reason: &str) -> Result<(), RelayError> {
        {
            let mut guard = self.shared.lock().await;
            let mut rng = rand::thread_rng();
            let frame = make_reset_message(&mut guard.cryptor, reason, &mut rng);
            guard.carrier.send_message(frame).await?;
            guard.carrier.drain().await?;
        }
        if let Some(mut active) = self.active.take() {
            active.pump.closing.store(true, std::sync::atomic::Ordering::Release);
            active.pump.task.abort();
            let _ = active.writer.shutdown().await;
        }
        Ok(())
    }

    /// terminal cleanup, called for every tunnel regardless of cause.
    /// unconditionally closes the local writer and cancels the pump if one
    /// is present; logs at warning level for anything but a clean 1000.
    pub async fn on_close(&mut self, was_clean: bool, code: u16, reason: &str) {
        if !was_clean || code != CLOSE_NORMAL {
            warn!(code, was_clean, reason, "tunnel carrier closed abnormally");
        }
        if let Some(mut active) = self.active.take() {
            active.pump.closing.store(true, std::sync::atomic::Ordering::Release);
            active.pump.task.abort();
            let _ = active.writer.shutdown().await;
        }
        self.state = TunnelState::Idle;
    }

    /// drive one iteration: wait for whichever happens first, a carrier
    /// event or (while `Using`) the pump reporting its local reader is
    /// done, and dispatch it.
    ///
    /// the two branches of the underlying `select!` never call back into
    /// `self` while the pump's event receiver is borrowed — both arms only
    /// ever touch disjoint fields (`self.active`, `self.shared`) — so the
    /// actual state transition happens after the select resolves, once
    /// that borrow is gone.
    pub async fn poll_once(&mut self) -> Result<EndpointEvent, RelayError> {
        loop {
            let fired = if let Some(active) = self.active.as_mut() {
                tokio::select! {
                    biased;
                    pump_event = active.pump.events.recv() => {
                        match pump_event {
                            Some(PumpEvent::Eof) => Fired::PumpEof,
                            Some(PumpEvent::Broken) => Fired::PumpBroken,
                            None => Fired::Incoming(recv_shared(&self.shared).await?),
                        }
                    }
                    incoming = recv_shared(&self.shared) => Fired::Incoming(incoming?),
                }
            } else {
                Fired::Incoming(recv_shared(&self.shared).await?)
            };

            match fired {
                Fired::PumpEof => {
                    self.reset_tunnel("").await?;
                    return Ok(EndpointEvent::Reset);
                }
                Fired::PumpBroken => {
                    self.reset_tunnel("connection to target broken").await?;
                    return Ok(EndpointEvent::Reset);
                }
                Fired::Incoming(Incoming::Closed { was_clean, code, reason }) => {
                    self.on_close(was_clean, code, &reason).await;
                    return Ok(EndpointEvent::Closed { was_clean, code, reason });
                }
                Fired::Incoming(Incoming::Message(raw)) => {
                    if let Some(event) = self.dispatch(raw).await? {
                        return Ok(event);
                    }
                    // a DAT frame was simply forwarded; keep polling.
                }
            }
        }
    }

    /// dispatch one inbound frame according to the state it arrived in.
    /// returns `Some(event)` when the caller should stop polling and act
    /// (a new request, or a completed reset); `None` to keep looping (a
    /// DAT frame was simply forwarded to the local writer).
    async fn dispatch(&mut self, raw: Vec<u8>) -> Result<Option<EndpointEvent>, RelayError> {
        match self.state {
            TunnelState::Idle => match raw.first() {
                Some(&CMD_REQ) => {
                    let mut guard = self.shared.lock().await;
                    let now = now_f64();
                    let (addr, port, remain) =
                        parse_relay_header(&mut guard.cryptor, &raw, self.config.tun_ssl, now)?;
                    drop(guard);
                    Ok(Some(EndpointEvent::Requested { addr, port, remain }))
                }
                _ => {
                    // an RST (or anything else) while IDLE was never
                    // expected from the peer.
                    let event = self.on_reset_tunnel().await;
                    match event {
                        Ok(e) => Ok(Some(e)),
                        Err(RelayError::InvalidState(_)) => Ok(Some(EndpointEvent::Closed {
                            was_clean: false,
                            code: CLOSE_PROTOCOL_ERROR,
                            reason: "unexpected frame while idle".into(),
                        })),
                        Err(e) => Err(e),
                    }
                }
            },
            TunnelState::Using => {
                let mut guard = self.shared.lock().await;
                if guard.cryptor.keyed() {
                    // speculative parse: RST first, since its digest check
                    // fails safely without mutating decryptor state; fall
                    // back to DAT (which always succeeds structurally)
                    // otherwise. only sound when a trailer is actually
                    // being checked, i.e. the cryptor is keyed.
                    match parse_reset_message(&mut guard.cryptor, &raw) {
                        Ok(_reason) => {
                            drop(guard);
                            Ok(Some(self.on_reset_tunnel().await?))
                        }
                        Err(FrameError::AuthFailed) | Err(FrameError::DigestLength(_)) => {
                            let payload = parse_dat_frame(&mut guard.cryptor, &raw);
                            drop(guard);
                            if let Some(active) = self.active.as_mut() {
                                active.writer.write_all(&payload).await?;
                            }
                            Ok(None)
                        }
                        Err(e) => Err(e.into()),
                    }
                } else {
                    // unkeyed (TLS-carried) mode: there is no HMAC trailer,
                    // so parse_reset_message can't discriminate by failure —
                    // it would "succeed" on any non-empty buffer. encrypt/
                    // decrypt are identity here, so the cleartext CMD byte
                    // is the reliable signal instead.
                    match raw.first() {
                        Some(&CMD_RST) => {
                            let _reason = parse_reset_message(&mut guard.cryptor, &raw)?;
                            drop(guard);
                            Ok(Some(self.on_reset_tunnel().await?))
                        }
                        _ => {
                            let payload = parse_dat_frame(&mut guard.cryptor, &raw);
                            drop(guard);
                            if let Some(active) = self.active.as_mut() {
                                active.writer.write_all(&payload).await?;
                            }
                            Ok(None)
                        }
                    }
                }
            }
            TunnelState::Resetting => {
                let mut guard = self.shared.lock().await;
                let _reason = parse_reset_message(&mut guard.cryptor, &raw)?;
                drop(guard);
                Ok(Some(self.on_reset_tunnel().await?))
            }
        }
    }
}

/// outcome of one `select!` race inside [`TunnelEndpoint::poll_once`],
/// resolved before any state-mutating call is made.
enum Fired {
    PumpEof,
    PumpBroken,
    Incoming(Incoming),
}

async fn recv_shared<C: WsCarrier>(shared: &Arc<Mutex<Shared<C>>>) -> Result<Incoming, RelayError> {
    let mut guard = shared.lock().await;
    Ok(guard.carrier.recv().await?)
}
