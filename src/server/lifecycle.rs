//! Server lifecycle
//!
//! ```text
//!  Stopped ──start()──► Starting ──bound──► Running ──stop()/fault──► Stopping ──► Stopped
//!                          │
//!                          └──bind error / stop()──► Stopped
//! ```
//!
//! Only one server instance exists at a time. `stop` is idempotent and
//! returns once every listener is closed and every client is gone or
//! abandoned.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::config::ServerConfig;
use super::connection::ConnectionContext;
use super::listener::Listener;
use super::tls;
use crate::broadcast::{Boundary, StreamBroadcaster};
use crate::encoder::{jpeg, FrameEncoder, FrameReceiver};
use crate::error::{Error, Result};
use crate::event::{EventBus, EventStream};
use crate::registry::{ClientRecord, ClientRegistry};

/// Observable server state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

enum Slot {
    Idle,
    Starting(CancellationToken),
    Running(ServerInstance),
    Stopping,
}

struct Inner {
    frames: FrameReceiver,
    events: EventBus,
    quality: watch::Sender<u8>,
    state: watch::Sender<LifecycleState>,
    slot: Mutex<Slot>,
}

/// MJPEG streaming server
///
/// Cheap to clone; clones control the same server.
#[derive(Clone)]
pub struct MjpegServer {
    inner: Arc<Inner>,
}

impl MjpegServer {
    /// Create a stopped server streaming frames from `frames`
    pub fn new(frames: FrameReceiver) -> Self {
        Self::with_events(frames, EventBus::new())
    }

    /// Create a stopped server reporting to an existing event bus
    pub fn with_events(frames: FrameReceiver, events: EventBus) -> Self {
        let defaults = ServerConfig::default();
        Self {
            inner: Arc::new(Inner {
                frames,
                events,
                quality: watch::Sender::new(jpeg::clamp_quality(defaults.jpeg_quality)),
                state: watch::Sender::new(LifecycleState::Stopped),
                slot: Mutex::new(Slot::Idle),
            }),
        }
    }

    /// Subscribe to server events
    pub fn events(&self) -> EventStream {
        self.inner.events.subscribe()
    }

    /// The event bus this server reports to
    pub fn event_bus(&self) -> &EventBus {
        &self.inner.events
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle state transitions
    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    /// Change JPEG quality; applies from the next encoded frame
    pub fn set_jpeg_quality(&self, quality: u8) {
        let quality = jpeg::clamp_quality(quality);
        self.inner.quality.send_replace(quality);
        tracing::debug!(quality = quality, "JPEG quality changed");
    }

    /// Current JPEG quality
    pub fn jpeg_quality(&self) -> u8 {
        *self.inner.quality.borrow()
    }

    /// Bound listener addresses while running
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        match &*self.lock_slot() {
            Slot::Running(instance) => instance.local_addrs.clone(),
            _ => Vec::new(),
        }
    }

    /// Snapshot of client records while running
    pub async fn clients(&self) -> Vec<ClientRecord> {
        let registry = match &*self.lock_slot() {
            Slot::Running(instance) => Arc::clone(&instance.registry),
            _ => return Vec::new(),
        };
        registry.snapshot().await
    }

    /// Bind every configured address and start serving
    ///
    /// Only valid while stopped. On a bind or TLS failure nothing is left
    /// listening, the error is reported on the event bus, and the server is
    /// back in `Stopped`.
    pub async fn start(&self, config: ServerConfig) -> Result<()> {
        let token = {
            let mut slot = self.lock_slot();
            if !matches!(*slot, Slot::Idle) {
                let state = self.state();
                tracing::warn!(state = ?state, "Start ignored: server not stopped");
                return Err(Error::InvalidState(state));
            }
            let token = CancellationToken::new();
            *slot = Slot::Starting(token.clone());
            self.set_state(LifecycleState::Starting);
            token
        };

        tracing::info!(addresses = ?config.addresses, port = config.port, "Starting MJPEG server");

        let prepared = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            prepared = Prepared::bind(&config) => Some(prepared),
        };

        let mut slot = self.lock_slot();
        let prepared = match prepared {
            Some(prepared) if !token.is_cancelled() => prepared,
            _ => {
                // Stopped while binding; any bound listener is dropped here
                *slot = Slot::Idle;
                self.set_state(LifecycleState::Stopped);
                tracing::info!("Start cancelled");
                return Ok(());
            }
        };

        match prepared {
            Ok(prepared) => {
                self.inner
                    .quality
                    .send_replace(jpeg::clamp_quality(config.jpeg_quality));
                let instance = ServerInstance::launch(self, config, prepared);
                tracing::info!(addrs = ?instance.local_addrs, "MJPEG server running");
                *slot = Slot::Running(instance);
                self.set_state(LifecycleState::Running);
                Ok(())
            }
            Err(e) => {
                *slot = Slot::Idle;
                self.set_state(LifecycleState::Stopped);
                drop(slot);
                tracing::error!(error = %e, "MJPEG server failed to start");
                self.inner.events.error(e.to_app_error());
                Err(e)
            }
        }
    }

    /// Stop serving
    ///
    /// Idempotent; concurrent callers all return once the server is stopped.
    pub async fn stop(&self) {
        let instance = {
            let mut slot = self.lock_slot();
            match std::mem::replace(&mut *slot, Slot::Stopping) {
                Slot::Idle => {
                    *slot = Slot::Idle;
                    return;
                }
                Slot::Starting(token) => {
                    token.cancel();
                    *slot = Slot::Starting(token);
                    None
                }
                Slot::Stopping => None,
                Slot::Running(instance) => {
                    self.set_state(LifecycleState::Stopping);
                    Some(instance)
                }
            }
        };

        let Some(instance) = instance else {
            self.wait_stopped().await;
            return;
        };

        tracing::info!("Stopping MJPEG server");
        instance.shutdown().await;

        *self.lock_slot() = Slot::Idle;
        self.set_state(LifecycleState::Stopped);
        tracing::info!("MJPEG server stopped");
    }

    /// Start, serve until `shutdown` resolves or the server stops itself,
    /// then stop
    pub async fn run_until<F>(&self, config: ServerConfig, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start(config).await?;

        let mut state = self.watch_state();
        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
            }
            _ = async {
                let _ = state.wait_for(|s| *s == LifecycleState::Stopped).await;
            } => {}
        }

        self.stop().await;
        Ok(())
    }

    /// A listener failed after start: report and stop from a separate task
    fn fail(&self, error: Error) {
        tracing::error!(error = %error, "MJPEG server fault");
        self.inner.events.error(error.to_app_error());

        let server = self.clone();
        tokio::spawn(async move { server.stop().await });
    }

    async fn wait_stopped(&self) {
        let mut state = self.watch_state();
        let _ = state.wait_for(|s| *s == LifecycleState::Stopped).await;
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "Lifecycle transition");
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        // Never held across an await, so a poisoned lock still holds a
        // consistent slot
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for MjpegServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MjpegServer")
            .field("state", &self.state())
            .field("jpeg_quality", &self.jpeg_quality())
            .finish()
    }
}

/// Everything acquired before the server can run
struct Prepared {
    listeners: Vec<(TcpListener, SocketAddr)>,
    tls: Option<TlsAcceptor>,
    blocked_image: Bytes,
}

impl Prepared {
    async fn bind(config: &ServerConfig) -> Result<Self> {
        let tls = config.tls.as_ref().map(tls::build_acceptor).transpose()?;

        let blocked_image = match &config.blocked_image {
            Some(image) => image.clone(),
            None => tokio::task::spawn_blocking(jpeg::default_blocked_image)
                .await
                .map_err(|e| Error::Io(io::Error::other(e)))?
                .map_err(|e| Error::Io(io::Error::other(e)))?,
        };

        let addrs = config.socket_addrs();
        if addrs.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no listen address configured",
            )));
        }

        // Dropping `listeners` on an early return closes what was bound
        let mut listeners = Vec::with_capacity(addrs.len());
        let mut port = config.port;
        for addr in addrs {
            // With port 0 every listener shares the port the OS gave the first
            let addr = SocketAddr::new(addr.ip(), port);
            let listener = TcpListener::bind(addr).await.map_err(|e| {
                tracing::warn!(addr = %addr, error = %e, "Failed to bind");
                e
            })?;
            let local_addr = listener.local_addr()?;
            port = local_addr.port();
            listeners.push((listener, local_addr));
        }

        Ok(Self {
            listeners,
            tls,
            blocked_image,
        })
    }
}

/// Tasks and shared state of one running server
struct ServerInstance {
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
    abandon: CancellationToken,
    tracker: TaskTracker,
    registry: Arc<ClientRegistry>,
    encoder: JoinHandle<()>,
    statistics: JoinHandle<()>,
    acceptors: Vec<JoinHandle<()>>,
    local_addrs: Vec<SocketAddr>,
}

impl ServerInstance {
    fn launch(server: &MjpegServer, config: ServerConfig, prepared: Prepared) -> Self {
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();
        let abandon = CancellationToken::new();
        let tracker = TaskTracker::new();
        let events = server.inner.events.clone();

        let registry = Arc::new(ClientRegistry::with_config(config.registry_config()));
        let broadcaster = Arc::new(StreamBroadcaster::with_capacity(
            config.client_queue_capacity,
            Boundary::random(),
        ));

        let encoder = FrameEncoder::new(
            server.inner.frames.clone(),
            server.inner.quality.subscribe(),
            config.keep_alive_interval,
            Arc::clone(&broadcaster),
            events.clone(),
        )
        .spawn(shutdown.clone());
        let statistics = registry.spawn_statistics_task(events.clone());

        let ctx = Arc::new(ConnectionContext {
            config: Arc::clone(&config),
            registry: Arc::clone(&registry),
            broadcaster,
            events,
            blocked_image: prepared.blocked_image,
            shutdown: shutdown.clone(),
            abandon: abandon.clone(),
            tracker: tracker.clone(),
        });

        let mut local_addrs = Vec::with_capacity(prepared.listeners.len());
        let mut acceptors = Vec::with_capacity(prepared.listeners.len());
        for (listener, local_addr) in prepared.listeners {
            local_addrs.push(local_addr);

            let listener = Listener::new(
                listener,
                local_addr,
                prepared.tls.clone(),
                Arc::clone(&ctx),
            );
            let token = shutdown.clone();
            let server = server.clone();
            acceptors.push(tokio::spawn(async move {
                if let Err(e) = listener.run(token).await {
                    server.fail(e);
                }
            }));
        }

        Self {
            config,
            shutdown,
            abandon,
            tracker,
            registry,
            encoder,
            statistics,
            acceptors,
            local_addrs,
        }
    }

    async fn shutdown(self) {
        self.shutdown.cancel();
        self.registry.destroy().await;

        // Listeners are closed once their accept loops return
        for acceptor in self.acceptors {
            let _ = acceptor.await;
        }

        self.tracker.close();
        if tokio::time::timeout(self.config.stop_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                connections = self.tracker.len(),
                "Abandoning in-flight writes"
            );
            self.abandon.cancel();
            if tokio::time::timeout(self.config.stop_timeout, self.tracker.wait())
                .await
                .is_err()
            {
                // Left to finish on their own; none of them writes any more
                tracing::warn!(
                    connections = self.tracker.len(),
                    "Connection tasks still running after abandon"
                );
            }
        }

        let _ = self.encoder.await;
        let _ = self.statistics.await;
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::encoder::frame_channel;
    use crate::error::AppError;
    use crate::event::ServerEvent;

    fn local_config() -> ServerConfig {
        ServerConfig::with_addresses([IpAddr::V4(Ipv4Addr::LOCALHOST)]).port(0)
    }

    #[tokio::test]
    async fn test_start_stop() {
        let (_tx, rx) = frame_channel();
        let server = MjpegServer::new(rx);
        assert_eq!(server.state(), LifecycleState::Stopped);

        server.start(local_config()).await.unwrap();
        assert_eq!(server.state(), LifecycleState::Running);
        assert_eq!(server.local_addrs().len(), 1);
        assert_ne!(server.local_addrs()[0].port(), 0);

        server.stop().await;
        assert_eq!(server.state(), LifecycleState::Stopped);
        assert!(server.local_addrs().is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (_tx, rx) = frame_channel();
        let server = MjpegServer::new(rx);

        // Stopping a stopped server is a no-op
        server.stop().await;
        assert_eq!(server.state(), LifecycleState::Stopped);

        server.start(local_config()).await.unwrap();
        tokio::join!(server.stop(), server.stop());
        server.stop().await;
        assert_eq!(server.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_start_while_running_is_rejected() {
        let (_tx, rx) = frame_channel();
        let server = MjpegServer::new(rx);
        let mut events = server.events();

        server.start(local_config()).await.unwrap();
        let result = server.start(local_config()).await;
        assert!(matches!(
            result,
            Err(Error::InvalidState(LifecycleState::Running))
        ));
        assert_eq!(server.state(), LifecycleState::Running);
        // Misuse is not a server error
        assert!(events.try_recv().is_none());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (_tx, rx) = frame_channel();
        let server = MjpegServer::new(rx);

        server.start(local_config()).await.unwrap();
        server.stop().await;
        server.start(local_config()).await.unwrap();
        assert_eq!(server.state(), LifecycleState::Running);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_no_address_is_server_fault() {
        let (_tx, rx) = frame_channel();
        let server = MjpegServer::new(rx);
        let mut events = server.events();

        let result = server.start(ServerConfig::with_addresses(Vec::<IpAddr>::new())).await;
        assert!(result.is_err());
        assert_eq!(server.state(), LifecycleState::Stopped);
        assert!(matches!(
            events.try_recv(),
            Some(ServerEvent::Error(AppError::HttpServerFault))
        ));
    }

    #[tokio::test]
    async fn test_port_zero_is_shared_by_all_listeners() {
        let (_tx, rx) = frame_channel();
        let server = MjpegServer::new(rx);

        let config = ServerConfig::with_addresses([
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)),
        ])
        .port(0);
        server.start(config).await.unwrap();

        let addrs = server.local_addrs();
        assert_eq!(addrs.len(), 2);
        assert_ne!(addrs[0].port(), 0);
        assert_eq!(addrs[0].port(), addrs[1].port());
        assert_ne!(addrs[0].ip(), addrs[1].ip());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_quality_is_clamped() {
        let (_tx, rx) = frame_channel();
        let server = MjpegServer::new(rx);

        server.set_jpeg_quality(0);
        assert_eq!(server.jpeg_quality(), 1);
        server.set_jpeg_quality(250);
        assert_eq!(server.jpeg_quality(), 100);
    }
}
