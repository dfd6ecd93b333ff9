//! # Client-Facing Transport
//!
//! Accept loop, per-connection reader/writer tasks, and the engine task
//! that owns all protocol state.
//!
//! The engine is deliberately not shared: reader tasks forward raw bytes
//! over a channel, and one task drives [`Engine`] from a fixed scheduling
//! tick. Writers receive flushed output per session over their own channel,
//! so a slow client never blocks dispatch.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};
use tracing::{debug, error, info, instrument, warn};

use crate::broadcast::WorldIndex;
use crate::config::NetworkConfig;
use crate::dispatch::engine::Engine;
use crate::dispatch::session::SessionId;
use crate::error::Result;
use crate::transport::backend::run_backend_link;

/// Events flowing from socket tasks into the engine task.
pub(crate) enum Event {
    Accepted(TcpStream, SocketAddr),
    ClientBytes(SessionId, Bytes),
    ClientClosed(SessionId),
    /// A fresh backend socket; carries the channel its writer drains.
    BackendConnected(mpsc::UnboundedSender<Bytes>),
    BackendBytes(Bytes),
    BackendClosed,
}

/// Start the server and run until CTRL+C.
#[instrument(skip(cfg, world), fields(address = %cfg.server.address))]
pub async fn start_server(cfg: NetworkConfig, world: Arc<dyn WorldIndex>) -> Result<()> {
    // Create internal shutdown channel
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

    // Set up ctrl-c handler that sends to our internal shutdown channel
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received CTRL+C signal, shutting down");
            let _ = shutdown_tx.send(()).await;
        }
    });

    start_server_with_shutdown(cfg, world, shutdown_rx).await
}

/// Start the server with an external shutdown channel.
#[instrument(skip_all, fields(address = %cfg.server.address))]
pub async fn start_server_with_shutdown(
    cfg: NetworkConfig,
    world: Arc<dyn WorldIndex>,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> Result<()> {
    for problem in cfg.validate() {
        warn!(problem, "configuration");
    }

    let listener = TcpListener::bind(&cfg.server.address).await?;
    info!(address = %cfg.server.address, "Listening for clients");

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

    // Accept loop
    let accept_tx = event_tx.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if accept_tx.send(Event::Accepted(stream, addr)).is_err() {
                        return;
                    }
                }
                Err(e) => error!(error = %e, "Error accepting connection"),
            }
        }
    });

    // Backend link with fixed-interval reconnect
    tokio::spawn(run_backend_link(cfg.backend.clone(), event_tx.clone()));

    let mut engine = Engine::new(cfg.clone(), world);
    let metrics = engine.metrics();
    let mut backend_tx: Option<mpsc::UnboundedSender<Bytes>> = None;

    let mut tick = tokio::time::interval(cfg.server.tick_interval);
    let mut sweep = tokio::time::interval(cfg.handoff.sweep_interval);
    let mut metrics_timer = tokio::time::interval(Duration::from_secs(60));

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!(sessions = engine.session_count(), "Shutting down server");
                metrics.log_metrics();
                return Ok(());
            }

            Some(event) = event_rx.recv() => {
                handle_event(&mut engine, &mut backend_tx, &event_tx, event);
                pump_backend(&mut engine, &backend_tx);
            }

            _ = tick.tick() => {
                let closed = engine.tick(Instant::now());
                for sid in closed {
                    debug!(session = %sid, "session reaped");
                }
                pump_backend(&mut engine, &backend_tx);
            }

            _ = sweep.tick() => {
                engine.sweep(Instant::now());
                pump_backend(&mut engine, &backend_tx);
            }

            _ = metrics_timer.tick() => {
                metrics.log_metrics();
            }
        }
    }
}

fn handle_event(
    engine: &mut Engine,
    backend_tx: &mut Option<mpsc::UnboundedSender<Bytes>>,
    event_tx: &mpsc::UnboundedSender<Event>,
    event: Event,
) {
    match event {
        Event::Accepted(stream, addr) => {
            let client_ip = match addr.ip() {
                IpAddr::V4(v4) => u32::from(v4),
                IpAddr::V6(_) => 0,
            };
            let sid = engine.session_opened(client_ip);
            info!(session = %sid, peer = %addr, "New connection established");

            let (rd, wr) = stream.into_split();
            let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
            engine.attach_writer(sid, tx);
            tokio::spawn(client_writer(rx, wr));
            tokio::spawn(client_reader(sid, rd, event_tx.clone()));
        }
        Event::ClientBytes(sid, bytes) => engine.feed(sid, &bytes),
        Event::ClientClosed(sid) => engine.session_closed(sid),
        Event::BackendConnected(tx) => {
            *backend_tx = Some(tx);
            engine.backend_socket_opened();
        }
        Event::BackendBytes(bytes) => {
            if let Err(e) = engine.on_backend_bytes(&bytes) {
                // A protocol violation from the backend is fatal to the
                // link; dropping the writer closes the socket and the
                // reconnect loop takes it from there.
                error!(error = %e, "backend link protocol violation");
                engine.backend_socket_closed();
                *backend_tx = None;
            }
        }
        Event::BackendClosed => {
            engine.backend_socket_closed();
            *backend_tx = None;
        }
    }
}

/// Forward whatever the engine owes the backend to its writer task.
fn pump_backend(engine: &mut Engine, backend_tx: &Option<mpsc::UnboundedSender<Bytes>>) {
    let out = engine.backend_outgoing();
    if out.is_empty() {
        return;
    }
    if let Some(tx) = backend_tx {
        let _ = tx.send(out);
    }
}

async fn client_reader(
    sid: SessionId,
    rd: OwnedReadHalf,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut chunks = FramedRead::new(rd, BytesCodec::new());
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(bytes) => {
                if events.send(Event::ClientBytes(sid, bytes.freeze())).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(session = %sid, error = %e, "client read error");
                break;
            }
        }
    }
    let _ = events.send(Event::ClientClosed(sid));
}

/// Drains a session's flushed output. Ends when the engine drops the
/// session (sender closed) or the peer stops reading.
async fn client_writer(mut rx: mpsc::UnboundedReceiver<Bytes>, wr: OwnedWriteHalf) {
    let mut sink = FramedWrite::new(wr, BytesCodec::new());
    while let Some(bytes) = rx.recv().await {
        if sink.send(bytes).await.is_err() {
            break;
        }
    }
    // BytesCodec encodes both Bytes and BytesMut, so the item type must be
    // named for close() to resolve.
    let _ = SinkExt::<Bytes>::close(&mut sink).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn writer_drains_queued_output_then_closes_the_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let (_rd, wr) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
        let writer = tokio::spawn(client_writer(rx, wr));

        tx.send(Bytes::from_static(b"hello")).unwrap();
        tx.send(Bytes::from_static(b" there")).unwrap();
        drop(tx);

        // read_to_end returns only once the writer closed its half
        let (mut peer_rd, _peer_wr) = client.into_split();
        let mut buf = Vec::new();
        peer_rd.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello there");
        writer.await.unwrap();
    }
}
