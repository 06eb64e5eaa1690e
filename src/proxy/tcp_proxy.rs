//! Redirectable TCP relay.
//!
//! Copies bytes between a client connection and its current backend. The
//! backend side can be swapped while the client connection stays open.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

const BUFFER_SIZE: usize = 16 * 1024;

/// TCP proxy error.
#[derive(Debug, thiserror::Error)]
pub enum TcpProxyError {
    #[error("failed to connect to backend {0}: {1}")]
    BackendConnectError(SocketAddr, io::Error),

    #[error("connection timeout to backend {0}")]
    BackendTimeout(SocketAddr),

    #[error("relay has ended")]
    RelayEnded,
}

/// Connect to a backend server with timeout.
#[instrument(skip_all, fields(backend = %addr))]
pub async fn connect_to_backend(
    addr: SocketAddr,
    connect_timeout: Duration,
) -> Result<TcpStream, TcpProxyError> {
    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                warn!(error = %e, "failed to set TCP_NODELAY on backend connection");
            }
            debug!("connected to backend");
            Ok(stream)
        }
        Ok(Err(e)) => Err(TcpProxyError::BackendConnectError(addr, e)),
        Err(_) => Err(TcpProxyError::BackendTimeout(addr)),
    }
}

/// Request to move the relay's backend side to `target`.
#[derive(Debug)]
pub struct Redirect {
    pub target: SocketAddr,
    pub done: oneshot::Sender<Result<(), TcpProxyError>>,
}

/// Why a relay finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The client closed its connection.
    ClientClosed,
    /// The backend closed and no redirect arrived in time.
    BackendClosed,
    /// Stopped from outside.
    Stopped,
}

/// Totals for one relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes sent from client to backends.
    pub upstream: u64,
    /// Bytes sent from backends to client.
    pub downstream: u64,
    /// Successful redirects.
    pub redirects: u32,
    pub end: RelayEnd,
}

enum Step {
    End(RelayEnd),
    BackendClosed,
    Redirect(Redirect),
}

/// Relay between `client` and `backend` until the client closes or `stop`
/// fires.
///
/// Each [`Redirect`] received on `redirects` connects to its target and
/// replaces the backend side; the outcome is reported on `done`. A failed
/// redirect keeps the previous backend. When the backend closes, the relay
/// waits up to `connect_timeout` for a redirect before ending.
pub async fn relay(
    client: TcpStream,
    backend: TcpStream,
    mut redirects: mpsc::UnboundedReceiver<Redirect>,
    mut stop: broadcast::Receiver<()>,
    connect_timeout: Duration,
) -> RelayStats {
    let (mut client_rd, mut client_wr) = client.into_split();
    let mut backend = Some(backend);
    let mut stats = RelayStats {
        upstream: 0,
        downstream: 0,
        redirects: 0,
        end: RelayEnd::Stopped,
    };
    let mut client_buf = vec![0u8; BUFFER_SIZE];
    let mut backend_buf = vec![0u8; BUFFER_SIZE];

    loop {
        let step = match backend.as_mut() {
            Some(stream) => {
                pump(
                    &mut client_rd,
                    &mut client_wr,
                    stream,
                    &mut redirects,
                    &mut stop,
                    &mut client_buf,
                    &mut backend_buf,
                    &mut stats,
                )
                .await
            }
            None => await_redirect(&mut redirects, &mut stop, connect_timeout).await,
        };

        match step {
            Step::End(end) => {
                stats.end = end;
                break;
            }
            Step::BackendClosed => {
                debug!("backend closed, waiting for redirect");
                backend = None;
            }
            Step::Redirect(Redirect { target, done }) => {
                match connect_to_backend(target, connect_timeout).await {
                    Ok(stream) => {
                        info!(backend = %target, "relay redirected");
                        backend = Some(stream);
                        stats.redirects += 1;
                        let _ = done.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = done.send(Err(e));
                    }
                }
            }
        }
    }

    let _ = client_wr.shutdown().await;
    stats
}

#[allow(clippy::too_many_arguments)]
async fn pump(
    client_rd: &mut OwnedReadHalf,
    client_wr: &mut OwnedWriteHalf,
    backend: &mut TcpStream,
    redirects: &mut mpsc::UnboundedReceiver<Redirect>,
    stop: &mut broadcast::Receiver<()>,
    client_buf: &mut [u8],
    backend_buf: &mut [u8],
    stats: &mut RelayStats,
) -> Step {
    let (mut backend_rd, mut backend_wr) = backend.split();
    loop {
        tokio::select! {
            biased;

            _ = stop.recv() => return Step::End(RelayEnd::Stopped),

            redirect = redirects.recv() => {
                return match redirect {
                    Some(r) => Step::Redirect(r),
                    None => Step::End(RelayEnd::Stopped),
                };
            }

            read = client_rd.read(client_buf) => match read {
                Ok(0) | Err(_) => return Step::End(RelayEnd::ClientClosed),
                Ok(n) => {
                    if backend_wr.write_all(&client_buf[..n]).await.is_err() {
                        return Step::BackendClosed;
                    }
                    stats.upstream += n as u64;
                }
            },

            read = backend_rd.read(backend_buf) => match read {
                Ok(0) | Err(_) => return Step::BackendClosed,
                Ok(n) => {
                    if client_wr.write_all(&backend_buf[..n]).await.is_err() {
                        return Step::End(RelayEnd::ClientClosed);
                    }
                    stats.downstream += n as u64;
                }
            },
        }
    }
}

async fn await_redirect(
    redirects: &mut mpsc::UnboundedReceiver<Redirect>,
    stop: &mut broadcast::Receiver<()>,
    grace: Duration,
) -> Step {
    tokio::select! {
        biased;

        _ = stop.recv() => Step::End(RelayEnd::Stopped),

        redirect = redirects.recv() => match redirect {
            Some(r) => Step::Redirect(r),
            None => Step::End(RelayEnd::Stopped),
        },

        _ = tokio::time::sleep(grace) => Step::End(RelayEnd::BackendClosed),
    }
}
