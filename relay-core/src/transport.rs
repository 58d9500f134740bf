//! Transport adapter (C1): wraps `quinn` and bridges its asynchronous,
//! tokio-driven I/O onto the synchronous `ConnectionIo` handle that a
//! connection [`crate::pool::Job`] reads and writes from inside `perform`.
//!
//! One unidirectional QUIC stream carries exactly one application frame in
//! either direction, matching the original vendor MsQuic binding's model
//! (`original_source/src/NetMessage/MsQuic.cpp`).

use crate::frame::FRAME_SIZE;
use quinn::crypto::rustls::QuicServerConfig;
use quinn::{Connection as QuinnConnection, Endpoint, IdleTimeout, ServerConfig, TransportConfig, VarInt};
use relay_proto::error::TransportError;
use relay_proto::logging::Logger;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::convert::TryFrom;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc as tokio_mpsc, Notify};

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path).map_err(|_| TransportError::StreamOpenFailed)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| TransportError::StreamOpenFailed)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path).map_err(|_| TransportError::StreamOpenFailed)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|_| TransportError::StreamOpenFailed)?
        .ok_or(TransportError::StreamOpenFailed)
}

/// Synchronous handle a connection task drives from inside `Job::perform`.
/// Inbound frames arrive over a plain `std::sync::mpsc` channel fed by the
/// per-connection bridge task; outbound frames are handed to the bridge
/// task over an unbounded tokio channel (whose `send` is itself
/// synchronous, so it is safe to call from worker threads).
pub struct ConnectionIo {
    inbound: std_mpsc::Receiver<Vec<u8>>,
    outbound: tokio_mpsc::UnboundedSender<Vec<u8>>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    pub peer: SocketAddr,
}

impl ConnectionIo {
    fn new(
        inbound: std_mpsc::Receiver<Vec<u8>>,
        outbound: tokio_mpsc::UnboundedSender<Vec<u8>>,
        connected: Arc<AtomicBool>,
        shutdown: Arc<Notify>,
        peer: SocketAddr,
    ) -> Self {
        ConnectionIo {
            inbound,
            outbound,
            connected,
            shutdown,
            peer,
        }
    }

    /// Non-blocking: returns the next complete frame if one has arrived.
    pub fn try_recv_frame(&self) -> Option<[u8; FRAME_SIZE]> {
        let bytes = self.inbound.try_recv().ok()?;
        let mut frame = [0u8; FRAME_SIZE];
        let n = bytes.len().min(FRAME_SIZE);
        frame[..n].copy_from_slice(&bytes[..n]);
        Some(frame)
    }

    /// Hands the frame to the bridge task for an async stream-per-frame send.
    pub fn send_frame(&self, bytes: [u8; FRAME_SIZE]) -> Result<(), TransportError> {
        self.outbound
            .send(bytes.to_vec())
            .map_err(|_| TransportError::SendFailed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Idempotent local close request; the bridge task tears itself down on
    /// its next scheduling point.
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn test_pair() -> (ConnectionIo, std_mpsc::Sender<Vec<u8>>, tokio_mpsc::UnboundedReceiver<Vec<u8>>) {
        let (inbound_tx, inbound_rx) = std_mpsc::channel();
        let (outbound_tx, outbound_rx) = tokio_mpsc::unbounded_channel();
        let io = ConnectionIo::new(
            inbound_rx,
            outbound_tx,
            Arc::new(AtomicBool::new(true)),
            Arc::new(Notify::new()),
            "127.0.0.1:0".parse().unwrap(),
        );
        (io, inbound_tx, outbound_rx)
    }
}

/// Accepts QUIC connections and admits them against `max_connections`,
/// mirroring the **Admitted -> Alive -> Draining -> Closed** handle state
/// machine: `Endpoint::accept` / handshake is Admitted -> Alive, the bridge
/// task's loop exit is Draining, and dropping `ConnectionIo` is Closed.
pub struct Transport {
    endpoint: Endpoint,
    active_connections: Arc<AtomicU32>,
    max_connections: u32,
}

impl Transport {
    pub fn bind(
        port: u16,
        cert_path: &str,
        key_path: &str,
        idle_timeout_s: u64,
        max_connections: u32,
    ) -> Result<Transport, TransportError> {
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;

        let mut server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|_| TransportError::StreamOpenFailed)?;
        server_crypto.alpn_protocols = vec![b"relay/1".to_vec()];

        let quic_crypto =
            QuicServerConfig::try_from(server_crypto).map_err(|_| TransportError::StreamOpenFailed)?;
        let mut server_config = ServerConfig::with_crypto(Arc::new(quic_crypto));

        let mut transport_config = TransportConfig::default();
        transport_config.max_idle_timeout(Some(
            IdleTimeout::try_from(Duration::from_secs(idle_timeout_s))
                .map_err(|_| TransportError::StreamOpenFailed)?,
        ));
        server_config.transport_config(Arc::new(transport_config));

        let addr: SocketAddr = format!("0.0.0.0:{}", port)
            .parse()
            .map_err(|_| TransportError::StreamOpenFailed)?;
        let endpoint = Endpoint::server(server_config, addr).map_err(|_| TransportError::StreamOpenFailed)?;

        Ok(Transport {
            endpoint,
            active_connections: Arc::new(AtomicU32::new(0)),
            max_connections,
        })
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
    }

    /// Runs the accept loop until the endpoint closes. `on_admit` is called
    /// once per admitted connection with its synchronous I/O handle; a
    /// connection over `max_connections` is refused immediately.
    pub async fn run<F>(&self, log: Logger, on_admit: F)
    where
        F: Fn(ConnectionIo) + Send + Sync + 'static,
    {
        let on_admit = Arc::new(on_admit);
        while let Some(incoming) = self.endpoint.accept().await {
            let active = Arc::clone(&self.active_connections);
            let max = self.max_connections;
            let on_admit = Arc::clone(&on_admit);
            let log = log.clone();

            tokio::spawn(async move {
                let conn = match incoming.await {
                    Ok(conn) => conn,
                    Err(e) => {
                        slog::debug!(log, "handshake failed"; "error" => %e);
                        return;
                    }
                };

                let admitted = active
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        if n < max {
                            Some(n + 1)
                        } else {
                            None
                        }
                    })
                    .is_ok();

                if !admitted {
                    conn.close(VarInt::from_u32(0), b"max connections reached");
                    slog::warn!(log, "connection refused"; "peer" => %conn.remote_address());
                    return;
                }

                let peer = conn.remote_address();
                slog::info!(log, "connection admitted"; "peer" => %peer);
                let io = spawn_bridge(conn, Arc::clone(&active), log.clone());
                on_admit(io);
            });
        }
    }
}

/// Spawns the per-connection async task that owns the `quinn::Connection`
/// and forwards frames across the sync/async boundary, and returns the
/// handle the connection task will drive from the worker pool.
fn spawn_bridge(conn: QuinnConnection, active: Arc<AtomicU32>, log: Logger) -> ConnectionIo {
    let (inbound_tx, inbound_rx) = std_mpsc::channel::<Vec<u8>>();
    let (outbound_tx, mut outbound_rx) = tokio_mpsc::unbounded_channel::<Vec<u8>>();
    let connected = Arc::new(AtomicBool::new(true));
    let shutdown = Arc::new(Notify::new());
    let peer = conn.remote_address();

    let connected_task = Arc::clone(&connected);
    let shutdown_task = Arc::clone(&shutdown);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_task.notified() => break,
                uni = conn.accept_uni() => {
                    let mut recv = match uni {
                        Ok(r) => r,
                        Err(e) => {
                            slog::debug!(log, "connection ended"; "peer" => %peer, "error" => %e);
                            break;
                        }
                    };
                    match recv.read_to_end(FRAME_SIZE).await {
                        Ok(bytes) => {
                            if inbound_tx.send(bytes).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            slog::warn!(log, "oversized or malformed frame stream"; "peer" => %peer, "error" => %e);
                            break;
                        }
                    }
                }
                outgoing = outbound_rx.recv() => {
                    let bytes = match outgoing {
                        Some(bytes) => bytes,
                        None => break,
                    };
                    let mut send = match conn.open_uni().await {
                        Ok(s) => s,
                        Err(e) => {
                            slog::warn!(log, "failed to open send stream"; "peer" => %peer, "error" => %e);
                            break;
                        }
                    };
                    use tokio::io::AsyncWriteExt;
                    if send.write_all(&bytes).await.is_err() || send.finish().is_err() {
                        break;
                    }
                }
            }
        }

        connected_task.store(false, Ordering::SeqCst);
        active.fetch_sub(1, Ordering::SeqCst);
        slog::info!(log, "connection closed"; "peer" => %peer);
    });

    ConnectionIo::new(inbound_rx, outbound_tx, connected, shutdown, peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, FrameId};

    #[test]
    fn io_round_trips_a_frame_through_the_sync_boundary() {
        let (io, inbound_tx, mut outbound_rx) = ConnectionIo::test_pair();

        let frame = Frame::opaque(FrameId::Text, b"hi".to_vec());
        inbound_tx.send(frame.encode().to_vec()).unwrap();
        let received = io.try_recv_frame().unwrap();
        assert_eq!(Frame::decode(&received).unwrap(), frame);

        io.send_frame(frame.encode()).unwrap();
        let forwarded = outbound_rx.try_recv().unwrap();
        assert_eq!(forwarded, frame.encode().to_vec());
    }

    #[test]
    fn close_flips_connected_flag() {
        let (io, _tx, _rx) = ConnectionIo::test_pair();
        assert!(io.is_connected());
        io.close();
        assert!(!io.is_connected());
    }
}
