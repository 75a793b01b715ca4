//! the payload pump: copies bytes from the local TCP reader into DAT
//! frames and writes them to the tunnel with cooperative backpressure.
//!
//! runs as its own `tokio` task so the endpoint's main loop stays free to
//! react to inbound frames while a transfer is in flight — the single
//! event loop the source assumes is realized here as a shared, mutex-guarded
//! [`crate::endpoint::Shared`] rather than true single-threading, since
//! `tokio`'s default runtime schedules tasks across OS threads. See
//! DESIGN.md for the race this implies and how `closing` bounds it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::carrier::WsCarrier;
use crate::crypto::Cryptor;
use crate::endpoint::Shared;
use crate::frame::make_dat_frame;

/// reported by the pump when the local reader is done, so the endpoint's
/// main loop can run the normal `reset_tunnel` path (it owns `local_writer`
/// and `state`, neither of which the pump touches).
#[derive(Debug)]
pub enum PumpEvent {
    /// local reader returned EOF.
    Eof,
    /// local reader errored.
    Broken,
}

/// handle to a running pump: the task itself plus the channel it reports
/// termination on.
pub struct PumpHandle {
    pub task: JoinHandle<()>,
    pub events: mpsc::Receiver<PumpEvent>,
    pub closing: Arc<AtomicBool>,
}

/// start the pump loop against `reader`, sharing `shared` with the
/// endpoint's main loop for cipher/carrier access.
pub fn spawn<C, R>(mut reader: R, shared: Arc<Mutex<Shared<C>>>, buf_size: usize) -> PumpHandle
where
    C: WsCarrier + 'static,
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    let closing = Arc::new(AtomicBool::new(false));
    let task_closing = closing.clone();

    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; buf_size];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    let _ = tx.send(PumpEvent::Eof).await;
                    return;
                }
                Ok(n) => n,
                Err(_) => {
                    let _ = tx.send(PumpEvent::Broken).await;
                    return;
                }
            };

            // fast-path guard against the reset-tunnel race: once a reset has
            // begun, never emit another DAT frame, even if this read already
            // completed. `pump_task.abort()` remains the hard backstop.
            if task_closing.load(Ordering::Acquire) {
                return;
            }

            let mut guard = shared.lock().await;
            if task_closing.load(Ordering::Acquire) {
                return;
            }
            let frame = make_dat_frame(&mut guard.cryptor, &buf[..n]);
            if guard.carrier.send_message(frame).await.is_err() {
                return;
            }
            if guard.carrier.drain().await.is_err() {
                return;
            }
            drop(guard);
        }
    });

    PumpHandle {
        task,
        events: rx,
        closing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::Mutex as StdMutex;
    use std::task::{Context, Poll};

    use tokio::io::{duplex, AsyncWriteExt, ReadBuf};

    use crate::carrier::Incoming;
    use crate::config::Config;

    #[derive(Default)]
    struct RecordingCarrier {
        sent: Arc<StdMutex<Vec<Vec<u8>>>>,
    }

    #[async_trait::async_trait]
    impl WsCarrier for RecordingCarrier {
        async fn send_message(&mut self, payload: Vec<u8>) -> io::Result<()> {
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }
        async fn drain(&mut self) -> io::Result<()> {
            Ok(())
        }
        async fn send_close(&mut self, _code: u16) -> io::Result<()> {
            Ok(())
        }
        async fn recv(&mut self) -> io::Result<Incoming> {
            unreachable!("the pump never calls recv on the carrier")
        }
    }

    fn shared() -> (Arc<Mutex<Shared<RecordingCarrier>>>, Arc<StdMutex<Vec<Vec<u8>>>>) {
        let carrier = RecordingCarrier::default();
        let sent = carrier.sent.clone();
        let cfg = Config::new(Some([9u8; 16]), false, false).unwrap();
        let cryptor = Cryptor::from_config(&cfg, [0u8; 16]);
        (Arc::new(Mutex::new(Shared { carrier, cryptor })), sent)
    }

    /// an `AsyncRead` that always returns an I/O error, modelling the local
    /// target connection breaking mid-read.
    struct BrokenReader;

    impl tokio::io::AsyncRead for BrokenReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "target broke")))
        }
    }

    #[tokio::test]
    async fn eof_reports_event_and_sends_no_frame() {
        let (shared, sent) = shared();
        let (writer, reader) = duplex(64);
        drop(writer); // immediate EOF on the read side

        let mut handle = spawn(reader, shared, 4096);
        match handle.events.recv().await {
            Some(PumpEvent::Eof) => {}
            other => panic!("expected Eof, got {other:?}"),
        }
        handle.task.await.unwrap();
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_error_reports_broken() {
        let (shared, sent) = shared();
        let mut handle = spawn(BrokenReader, shared, 4096);
        match handle.events.recv().await {
            Some(PumpEvent::Broken) => {}
            other => panic!("expected Broken, got {other:?}"),
        }
        handle.task.await.unwrap();
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dat_frame_is_sent_for_each_chunk_while_open() {
        let (shared, sent) = shared();
        let (mut writer, reader) = duplex(64);
        let handle = spawn(reader, shared, 4096);

        writer.write_all(b"chunk one").await.unwrap();
        // poll briefly for the pump's background task to read, encode and
        // send rather than assuming a fixed scheduling delay.
        for _ in 0..200 {
            if !sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert_eq!(sent.lock().unwrap().len(), 1);

        drop(writer);
        handle.task.await.unwrap();
    }

    #[tokio::test]
    async fn closing_flag_suppresses_frame_once_set_before_read_completes() {
        let (shared, sent) = shared();
        let (mut writer, reader) = duplex(64);
        let handle = spawn(reader, shared, 4096);

        // flip the cancellation flag before any bytes arrive: the pump's
        // pending read only resolves once we write, so this exercises the
        // "closing observed right after a completed read" fast path.
        handle.closing.store(true, Ordering::Release);
        writer.write_all(b"too late").await.unwrap();
        drop(writer);

        // the task exits without ever locking `shared` to send a frame.
        handle.task.await.unwrap();
        assert!(sent.lock().unwrap().is_empty());
    }
}
