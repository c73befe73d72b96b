//! Server listener
//!
//! Handles the TCP accept loop for one bound address and spawns connection
//! handlers on the server's task tracker.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::server::connection::{Connection, ConnectionContext};

/// Accept loop for one bound socket
pub(crate) struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    ctx: Arc<ConnectionContext>,
}

impl Listener {
    pub fn new(
        listener: TcpListener,
        local_addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        ctx: Arc<ConnectionContext>,
    ) -> Self {
        Self {
            listener,
            local_addr,
            tls,
            ctx,
        }
    }

    /// Run until the shutdown token fires or accept fails hard
    ///
    /// The socket is closed when this returns.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            addr = %self.local_addr,
            tls = self.tls.is_some(),
            "MJPEG server listening"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::debug!(addr = %self.local_addr, "Listener closed");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                    Err(e) if is_transient(&e) => {
                        tracing::debug!(error = %e, "Accept aborted by peer");
                    }
                    Err(e) => {
                        tracing::error!(addr = %self.local_addr, error = %e, "Failed to accept connection");
                        return Err(e.into());
                    }
                },
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        tracing::debug!(peer = %peer_addr, "New connection");

        if let Err(e) = self.configure_socket(&socket) {
            tracing::debug!(peer = %peer_addr, error = %e, "Failed to configure socket");
            return;
        }

        let ctx = Arc::clone(&self.ctx);
        let tls = self.tls.clone();

        self.ctx.tracker.spawn(async move {
            let result = match tls {
                Some(acceptor) => {
                    let handshake =
                        tokio::time::timeout(ctx.config.request_timeout, acceptor.accept(socket));
                    let handshake = tokio::select! {
                        biased;
                        _ = ctx.shutdown.cancelled() => return,
                        handshake = handshake => handshake,
                    };
                    match handshake {
                        Ok(Ok(stream)) => Connection::new(peer_addr, ctx).run(stream).await,
                        Ok(Err(e)) => Err(Error::Tls(format!("handshake failed: {}", e))),
                        Err(_) => Err(Error::Timeout),
                    }
                }
                None => Connection::new(peer_addr, ctx).run(socket).await,
            };

            if let Err(e) = result {
                tracing::debug!(peer = %peer_addr, error = %e, "Connection error");
            }

            tracing::debug!(peer = %peer_addr, "Connection closed");
        });
    }

    fn configure_socket(&self, socket: &TcpStream) -> io::Result<()> {
        if self.ctx.config.tcp_nodelay {
            socket.set_nodelay(true)?;
        }
        Ok(())
    }
}

/// Accept errors caused by a single peer rather than the listening socket
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::Other)));
    }
}
