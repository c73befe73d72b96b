//! Client identity and per-client record

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Unique identifier for a streaming client (peer address + session number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId {
    /// Session number, unique per registry
    pub session: u64,
    /// Remote peer address
    pub peer_addr: SocketAddr,
}

impl ClientId {
    /// Create a new client id
    pub fn new(session: u64, peer_addr: SocketAddr) -> Self {
        Self { session, peer_addr }
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.peer_addr, self.session)
    }
}

/// Connection status of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// Admitted, response head not yet written
    Connecting,
    /// Receiving frames normally
    Streaming,
    /// A write ran past the write timeout; cleared by the next completed write
    Slow,
    /// Connection closed, kept briefly for the final statistics
    Disconnected,
}

/// Snapshot-able state of one client
#[derive(Debug, Clone)]
pub struct ClientRecord {
    /// Client identity
    pub id: ClientId,
    /// Current status
    pub status: ClientStatus,
    /// When the client was admitted
    pub connected_at: Instant,
    /// Last successful write (or admission)
    pub last_activity: Instant,
    /// When the client went away
    pub disconnected_at: Option<Instant>,
    /// Total bytes written to the client
    pub bytes_sent: u64,
    /// Frames written to the client
    pub frames_sent: u64,
    /// Frames skipped because the client fell behind
    pub frames_dropped: u64,
}

impl ClientRecord {
    /// Create a record for a newly admitted client
    pub fn new(id: ClientId) -> Self {
        let now = Instant::now();
        Self {
            id,
            status: ClientStatus::Connecting,
            connected_at: now,
            last_activity: now,
            disconnected_at: None,
            bytes_sent: 0,
            frames_sent: 0,
            frames_dropped: 0,
        }
    }

    /// Peer address of the client
    pub fn peer_addr(&self) -> SocketAddr {
        self.id.peer_addr
    }

    /// Whether the connection is still live
    pub fn is_connected(&self) -> bool {
        self.status != ClientStatus::Disconnected
    }

    /// Time since admission (frozen at disconnect)
    pub fn duration(&self) -> Duration {
        let end = self.disconnected_at.unwrap_or_else(Instant::now);
        end.duration_since(self.connected_at)
    }

    /// Time since the last successful write
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub(super) fn on_sent(&mut self, bytes: u64) {
        self.bytes_sent += bytes;
        self.frames_sent += 1;
        self.last_activity = Instant::now();
    }

    pub(super) fn on_disconnect(&mut self) {
        if self.status != ClientStatus::Disconnected {
            self.status = ClientStatus::Disconnected;
            self.disconnected_at = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ClientId {
        ClientId::new(7, "192.168.1.20:50123".parse().unwrap())
    }

    #[test]
    fn test_client_id_display() {
        assert_eq!(id().to_string(), "192.168.1.20:50123#7");
    }

    #[test]
    fn test_record_lifecycle() {
        let mut record = ClientRecord::new(id());
        assert_eq!(record.status, ClientStatus::Connecting);
        assert!(record.is_connected());

        record.on_sent(1000);
        record.on_sent(500);
        assert_eq!(record.bytes_sent, 1500);
        assert_eq!(record.frames_sent, 2);

        record.on_disconnect();
        assert!(!record.is_connected());
        let at = record.disconnected_at.unwrap();

        // Second disconnect keeps the first timestamp
        record.on_disconnect();
        assert_eq!(record.disconnected_at, Some(at));
    }
}
