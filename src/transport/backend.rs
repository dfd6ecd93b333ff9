//! # Backend Socket Task
//!
//! Owns the one TCP connection to the backend process and reconnects on a
//! fixed interval. All protocol state lives in the engine's
//! [`BackendLink`](crate::backend::link::BackendLink); this task only moves
//! bytes and reports socket lifecycle events.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};
use tracing::{debug, info, instrument, warn};

use crate::config::BackendConfig;
use crate::transport::server::Event;

/// Connect, pump bytes until the socket dies, sleep, repeat. Exits only
/// when the engine side of the event channel is gone.
#[instrument(skip_all, fields(address = %cfg.address))]
pub(crate) async fn run_backend_link(cfg: BackendConfig, events: mpsc::UnboundedSender<Event>) {
    loop {
        match TcpStream::connect(&cfg.address).await {
            Ok(stream) => {
                info!("backend socket connected");
                let (rd, wr) = stream.into_split();
                let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
                if events.send(Event::BackendConnected(tx)).is_err() {
                    return;
                }

                let writer = tokio::spawn(async move {
                    let mut sink = FramedWrite::new(wr, BytesCodec::new());
                    while let Some(bytes) = rx.recv().await {
                        if sink.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    // BytesCodec encodes both Bytes and BytesMut, so the
                    // item type must be named for close() to resolve.
                    let _ = SinkExt::<Bytes>::close(&mut sink).await;
                });

                let mut chunks = FramedRead::new(rd, BytesCodec::new());
                while let Some(chunk) = chunks.next().await {
                    match chunk {
                        Ok(bytes) => {
                            if events.send(Event::BackendBytes(bytes.freeze())).is_err() {
                                writer.abort();
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "backend read error");
                            break;
                        }
                    }
                }
                writer.abort();
                if events.send(Event::BackendClosed).is_err() {
                    return;
                }
            }
            Err(e) => debug!(error = %e, "backend connect failed"),
        }
        tokio::time::sleep(cfg.retry_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reconnect_loop_reports_socket_lifecycle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cfg = BackendConfig {
            address: listener.local_addr().unwrap().to_string(),
            retry_interval: Duration::from_secs(60),
            ..BackendConfig::default()
        };
        let (events, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(run_backend_link(cfg, events));

        let (mut socket, _) = listener.accept().await.unwrap();
        let to_backend = match rx.recv().await {
            Some(Event::BackendConnected(tx)) => tx,
            _ => panic!("expected the connect event first"),
        };

        // engine-to-backend bytes flow through the writer task
        to_backend.send(Bytes::from_static(&[0x30, 0x75])).unwrap();
        let mut buf = [0u8; 2];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x30, 0x75]);

        socket.write_all(&[1, 2, 3]).await.unwrap();
        match rx.recv().await {
            Some(Event::BackendBytes(b)) => assert_eq!(&b[..], &[1, 2, 3]),
            _ => panic!("expected backend bytes"),
        }

        drop(socket);
        loop {
            match rx.recv().await {
                Some(Event::BackendClosed) => break,
                Some(Event::BackendBytes(_)) => continue,
                _ => panic!("expected the close event"),
            }
        }
    }
}
