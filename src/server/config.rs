//! Server configuration

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;

use crate::broadcast::{WritePolicy, DEFAULT_QUEUE_CAPACITY};
use crate::encoder::DEFAULT_KEEP_ALIVE;
use crate::registry::RegistryConfig;

/// TLS protocol versions offered to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersions {
    /// TLS 1.2 only
    #[default]
    Tls12Only,
    /// TLS 1.3 only
    Tls13Only,
    /// TLS 1.2 and 1.3
    Negotiable,
}

/// Certificate chain and private key supplied by the host
#[derive(Clone)]
pub struct TlsCredentials {
    /// PEM-encoded certificate chain, leaf first
    pub certificate_chain_pem: Bytes,
    /// PEM-encoded private key (PKCS#8, PKCS#1 or SEC1)
    pub private_key_pem: Bytes,
    /// Accepted protocol versions
    pub versions: TlsVersions,
}

impl TlsCredentials {
    /// Create credentials with the default version restriction
    pub fn new(certificate_chain_pem: impl Into<Bytes>, private_key_pem: impl Into<Bytes>) -> Self {
        Self {
            certificate_chain_pem: certificate_chain_pem.into(),
            private_key_pem: private_key_pem.into(),
            versions: TlsVersions::default(),
        }
    }

    /// Set the accepted protocol versions
    pub fn versions(mut self, versions: TlsVersions) -> Self {
        self.versions = versions;
        self
    }
}

impl std::fmt::Debug for TlsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsCredentials")
            .field("certificate_chain_pem", &self.certificate_chain_pem.len())
            .field("private_key_pem", &"<redacted>")
            .field("versions", &self.versions)
            .finish()
    }
}

/// Server configuration options
///
/// Fixed for the lifetime of one running server; restarting with a new
/// port or address set means stopping and starting with a new config.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interfaces to listen on, one listener each
    pub addresses: Vec<IpAddr>,

    /// Port shared by every listener
    ///
    /// With 0 the OS picks a port for the first address and the remaining
    /// listeners bind that same port.
    pub port: u16,

    /// Upgrade every listener to TLS
    pub tls: Option<TlsCredentials>,

    /// Initial JPEG quality (1-100)
    pub jpeg_quality: u8,

    /// Republish the last frame when no new frame arrives this long
    /// (at least 10 ms)
    pub keep_alive_interval: Duration,

    /// Maximum concurrent streaming clients (0 = unlimited)
    pub max_clients: usize,

    /// Maximum concurrent streaming clients per IP (0 = unlimited)
    pub max_clients_per_address: usize,

    /// Per-client queue depth
    pub client_queue_capacity: usize,

    /// A write taking longer marks the client slow
    pub write_timeout: Duration,

    /// Extra time a slow write gets before the client is evicted
    pub slow_client_grace: Duration,

    /// Statistics interval (at least 10 ms)
    pub stats_interval: Duration,

    /// Number of samples in the traffic window
    pub traffic_window: usize,

    /// How long disconnected clients stay in statistics
    pub disconnected_retention: Duration,

    /// How long stop waits for in-flight writes
    pub stop_timeout: Duration,

    /// Request head (and TLS handshake) must arrive within this time
    pub request_timeout: Duration,

    /// Path serving the MJPEG stream
    pub stream_path: String,

    /// Path serving the viewer page
    pub index_path: String,

    /// Viewer page; no page is served when absent
    pub index_html: Option<Bytes>,

    /// Path emitting a start/stop action request when requested
    pub start_stop_path: Option<String>,

    /// Peers that get the blocked image instead of the stream
    pub blocked_addresses: HashSet<IpAddr>,

    /// JPEG sent to blocked peers; generated at start when absent
    pub blocked_image: Option<Bytes>,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addresses: vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
            port: 8080,
            tls: None,
            jpeg_quality: 80,
            keep_alive_interval: DEFAULT_KEEP_ALIVE,
            max_clients: 0, // Unlimited
            max_clients_per_address: 0,
            client_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            write_timeout: Duration::from_secs(2),
            slow_client_grace: Duration::from_secs(3),
            stats_interval: Duration::from_secs(1),
            traffic_window: 30,
            disconnected_retention: Duration::from_secs(2),
            stop_timeout: Duration::from_millis(250),
            request_timeout: Duration::from_secs(5),
            stream_path: "/stream.mjpeg".into(),
            index_path: "/".into(),
            index_html: None,
            start_stop_path: None,
            blocked_addresses: HashSet::new(),
            blocked_image: None,
            tcp_nodelay: true, // Frames should leave as soon as they are written
        }
    }
}

impl ServerConfig {
    /// Create a config listening on the given interfaces
    pub fn with_addresses(addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            addresses: addresses.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Socket addresses to bind, one per interface
    ///
    /// With port 0 the listeners after the first reuse the port the OS gave it.
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        self.addresses
            .iter()
            .map(|ip| SocketAddr::new(*ip, self.port))
            .collect()
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Serve over TLS
    pub fn tls(mut self, credentials: TlsCredentials) -> Self {
        self.tls = Some(credentials);
        self
    }

    /// Set the initial JPEG quality
    pub fn jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality;
        self
    }

    /// Set the keep-alive interval
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set maximum clients
    pub fn max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    /// Set maximum clients per IP address
    pub fn max_clients_per_address(mut self, max: usize) -> Self {
        self.max_clients_per_address = max;
        self
    }

    /// Set the write timeout and slow-client grace period
    pub fn slow_client(mut self, write_timeout: Duration, grace: Duration) -> Self {
        self.write_timeout = write_timeout;
        self.slow_client_grace = grace;
        self
    }

    /// Set the statistics interval
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Set the stop timeout
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Serve a viewer page at the index path
    pub fn index_html(mut self, html: impl Into<Bytes>) -> Self {
        self.index_html = Some(html.into());
        self
    }

    /// Enable the start/stop action path
    pub fn start_stop_path(mut self, path: impl Into<String>) -> Self {
        self.start_stop_path = Some(path.into());
        self
    }

    /// Block a peer address
    pub fn block(mut self, addr: IpAddr) -> Self {
        self.blocked_addresses.insert(addr);
        self
    }

    /// Registry configuration derived from this config
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig::default()
            .max_clients(self.max_clients)
            .max_clients_per_address(self.max_clients_per_address)
            .stats_interval(self.stats_interval)
            .traffic_window(self.traffic_window)
            .disconnected_retention(self.disconnected_retention)
    }

    /// Write policy derived from this config
    pub fn write_policy(&self) -> WritePolicy {
        WritePolicy {
            write_timeout: self.write_timeout,
            slow_grace: self.slow_client_grace,
        }
    }
}
