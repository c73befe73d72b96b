//! Client registry implementation
//!
//! The registry owns every `ClientRecord`. Connection tasks mutate their own
//! record through a `ClientHandle`; everything else reads snapshot copies.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::client::{ClientId, ClientRecord, ClientStatus};
use super::config::{RegistryConfig, MIN_STATS_INTERVAL};
use super::error::RegistryError;
use super::traffic::{TrafficPoint, TrafficWindow};
use crate::event::{EventBus, ServerEvent};

struct ClientEntry {
    record: ClientRecord,
    /// Cancelled when the client is unregistered
    cancel: CancellationToken,
}

/// Registry of connected streaming clients
///
/// Thread-safe via `RwLock`; statistics reads take the read lock and copy.
pub struct ClientRegistry {
    /// Map of client id to entry
    clients: RwLock<HashMap<ClientId, ClientEntry>>,

    /// Rolling traffic samples
    traffic: RwLock<TrafficWindow>,

    /// Configuration
    config: RegistryConfig,

    next_session_id: AtomicU64,

    /// Bytes sent to all clients since creation
    bytes_sent: AtomicU64,

    /// Parent of every client token; cancelled by `destroy`
    shutdown: CancellationToken,
}

impl ClientRegistry {
    /// Create a new registry with default configuration
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration
    pub fn with_config(mut config: RegistryConfig) -> Self {
        config.stats_interval = config.stats_interval.max(MIN_STATS_INTERVAL);
        Self {
            clients: RwLock::new(HashMap::new()),
            traffic: RwLock::new(TrafficWindow::new(config.traffic_window)),
            config,
            next_session_id: AtomicU64::new(1),
            bytes_sent: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Admit a new client
    ///
    /// Fails when a client limit is reached or the registry was destroyed.
    pub async fn admit(
        self: &Arc<Self>,
        peer_addr: SocketAddr,
    ) -> Result<ClientHandle, RegistryError> {
        let mut clients = self.clients.write().await;

        if self.shutdown.is_cancelled() {
            return Err(RegistryError::Destroyed);
        }

        let live = clients.values().filter(|e| e.record.is_connected()).count();
        if self.config.max_clients > 0 && live >= self.config.max_clients {
            tracing::warn!(peer = %peer_addr, limit = self.config.max_clients, "Client rejected: limit reached");
            return Err(RegistryError::LimitReached(self.config.max_clients));
        }

        let limit = self.config.max_clients_per_address;
        if limit > 0 {
            let from_addr = clients
                .values()
                .filter(|e| e.record.is_connected() && e.record.id.peer_addr.ip() == peer_addr.ip())
                .count();
            if from_addr >= limit {
                tracing::warn!(peer = %peer_addr, limit = limit, "Client rejected: address limit reached");
                return Err(RegistryError::AddressLimitReached {
                    addr: peer_addr.ip(),
                    limit,
                });
            }
        }

        let id = ClientId::new(
            self.next_session_id.fetch_add(1, Ordering::Relaxed),
            peer_addr,
        );
        let cancel = self.shutdown.child_token();
        clients.insert(
            id,
            ClientEntry {
                record: ClientRecord::new(id),
                cancel: cancel.clone(),
            },
        );

        tracing::info!(client = %id, clients = live + 1, "Client admitted");

        Ok(ClientHandle {
            id,
            cancel,
            registry: Arc::clone(self),
            closed: false,
        })
    }

    /// Update a live client's status
    ///
    /// Returns the previous status. Disconnected records are never revived.
    pub async fn set_status(&self, id: ClientId, status: ClientStatus) -> Option<ClientStatus> {
        let mut clients = self.clients.write().await;
        let entry = clients.get_mut(&id)?;
        let previous = entry.record.status;

        if previous == ClientStatus::Disconnected {
            return Some(previous);
        }
        if status == ClientStatus::Disconnected {
            entry.record.on_disconnect();
            entry.cancel.cancel();
        } else {
            entry.record.status = status;
        }

        Some(previous)
    }

    /// Account a successful write to a client
    pub async fn record_sent(&self, id: ClientId, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);

        let mut clients = self.clients.write().await;
        if let Some(entry) = clients.get_mut(&id) {
            entry.record.on_sent(bytes as u64);
        }
    }

    /// Account frames a client skipped because it fell behind
    pub async fn record_dropped(&self, id: ClientId, frames: u64) {
        let mut clients = self.clients.write().await;
        if let Some(entry) = clients.get_mut(&id) {
            entry.record.frames_dropped += frames;
        }
    }

    /// Mark a client disconnected and stop its writes
    ///
    /// The record stays visible until the retention period elapses.
    pub async fn disconnect(&self, id: ClientId) {
        if let Some(previous) = self.set_status(id, ClientStatus::Disconnected).await {
            if previous != ClientStatus::Disconnected {
                tracing::info!(client = %id, "Client disconnected");
            }
        }
    }

    /// Get a copy of one record
    pub async fn get(&self, id: ClientId) -> Option<ClientRecord> {
        self.clients.read().await.get(&id).map(|e| e.record.clone())
    }

    /// Copy of every record, in admission order
    pub async fn snapshot(&self) -> Vec<ClientRecord> {
        let clients = self.clients.read().await;
        let mut records: Vec<ClientRecord> = clients.values().map(|e| e.record.clone()).collect();
        records.sort_by_key(|r| r.id.session);
        records
    }

    /// Copy of the traffic window
    pub async fn traffic(&self) -> Vec<TrafficPoint> {
        self.traffic.read().await.points()
    }

    /// Number of clients not yet disconnected
    pub async fn active_count(&self) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|e| e.record.is_connected())
            .count()
    }

    /// Number of records, including recently disconnected ones
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Whether the registry holds no records
    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Bytes sent to all clients since creation
    pub fn total_bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Remove records disconnected longer than the retention period
    pub async fn cleanup(&self) {
        let mut clients = self.clients.write().await;
        let now = Instant::now();
        let retention = self.config.disconnected_retention;

        clients.retain(|id, entry| {
            let expired = entry
                .record
                .disconnected_at
                .is_some_and(|at| now.duration_since(at) >= retention);
            if expired {
                tracing::debug!(client = %id, "Client record removed");
            }
            !expired
        });
    }

    /// Append a traffic sample covering one statistics interval
    pub async fn sample_traffic(&self) -> TrafficPoint {
        let total = self.total_bytes_sent();
        self.traffic
            .write()
            .await
            .sample(total, self.config.stats_interval)
    }

    /// Run one statistics tick: cleanup, sample, emit both snapshots
    pub async fn publish_statistics(&self, events: &EventBus) {
        self.cleanup().await;
        self.sample_traffic().await;

        events.send(ServerEvent::ClientsStatistic(self.snapshot().await));
        events.send(ServerEvent::TrafficStatistic(self.traffic().await));
    }

    /// Spawn the periodic statistics task
    ///
    /// The task ends when the registry is destroyed.
    pub fn spawn_statistics_task(self: &Arc<Self>, events: EventBus) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = registry.config.stats_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = registry.shutdown.cancelled() => break,
                    _ = ticker.tick() => registry.publish_statistics(&events).await,
                }
            }
        })
    }

    /// Forcibly disconnect every client and stop statistics
    ///
    /// Idempotent. No client is admitted afterwards.
    pub async fn destroy(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let mut clients = self.clients.write().await;
        for entry in clients.values_mut() {
            entry.record.on_disconnect();
        }

        tracing::debug!(clients = clients.len(), "Client registry destroyed");
    }

    /// Whether `destroy` has been called
    pub fn is_destroyed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Write access to a single client's record
///
/// Held by the task serving the client. Dropping the handle without calling
/// `disconnect` still marks the client disconnected.
pub struct ClientHandle {
    id: ClientId,
    cancel: CancellationToken,
    registry: Arc<ClientRegistry>,
    closed: bool,
}

impl ClientHandle {
    /// Client identity
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Token cancelled when the client is unregistered
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the client has been unregistered
    pub fn is_unregistered(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The client is receiving frames normally
    pub async fn mark_streaming(&self) {
        let previous = self
            .registry
            .set_status(self.id, ClientStatus::Streaming)
            .await;
        if previous == Some(ClientStatus::Slow) {
            tracing::debug!(client = %self.id, "Client caught up");
        }
    }

    /// The client is stalling or dropping frames
    pub async fn mark_slow(&self) {
        let previous = self.registry.set_status(self.id, ClientStatus::Slow).await;
        if previous == Some(ClientStatus::Streaming) {
            tracing::warn!(client = %self.id, "Client is slow");
        }
    }

    /// Account a successful write
    pub async fn record_sent(&self, bytes: usize) {
        self.registry.record_sent(self.id, bytes).await;
    }

    /// Account frames skipped for this client
    pub async fn record_dropped(&self, frames: u64) {
        self.registry.record_dropped(self.id, frames).await;
    }

    /// Mark the client disconnected
    pub async fn disconnect(mut self) {
        self.closed = true;
        self.registry.disconnect(self.id).await;
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.cancel.cancel();
        let registry = Arc::clone(&self.registry);
        let id = self.id;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { registry.disconnect(id).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, last], port))
    }

    #[tokio::test]
    async fn test_admit_and_disconnect() {
        let registry = Arc::new(ClientRegistry::new());

        let client = registry.admit(addr(2, 5000)).await.unwrap();
        let id = client.id();
        assert_eq!(registry.active_count().await, 1);
        assert_eq!(registry.get(id).await.unwrap().status, ClientStatus::Connecting);

        client.mark_streaming().await;
        client.record_sent(1200).await;
        let record = registry.get(id).await.unwrap();
        assert_eq!(record.status, ClientStatus::Streaming);
        assert_eq!(record.bytes_sent, 1200);
        assert_eq!(registry.total_bytes_sent(), 1200);

        client.disconnect().await;
        assert_eq!(registry.active_count().await, 0);
        // Still listed until retention elapses
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get(id).await.unwrap().status, ClientStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_client_limit() {
        let registry = Arc::new(ClientRegistry::with_config(
            RegistryConfig::default().max_clients(2),
        ));

        let first = registry.admit(addr(2, 1)).await.unwrap();
        let _second = registry.admit(addr(3, 1)).await.unwrap();
        let result = registry.admit(addr(4, 1)).await;
        assert!(matches!(result, Err(RegistryError::LimitReached(2))));

        // A disconnected record no longer counts against the limit
        first.disconnect().await;
        assert!(registry.admit(addr(4, 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_address_limit() {
        let registry = Arc::new(ClientRegistry::with_config(
            RegistryConfig::default().max_clients_per_address(1),
        ));

        let _first = registry.admit(addr(2, 1)).await.unwrap();
        let result = registry.admit(addr(2, 2)).await;
        assert!(matches!(
            result,
            Err(RegistryError::AddressLimitReached { limit: 1, .. })
        ));
        assert!(registry.admit(addr(3, 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_slow_status_transitions() {
        let registry = Arc::new(ClientRegistry::new());
        let client = registry.admit(addr(2, 1)).await.unwrap();

        client.mark_streaming().await;
        client.mark_slow().await;
        assert_eq!(registry.get(client.id()).await.unwrap().status, ClientStatus::Slow);

        client.mark_streaming().await;
        assert_eq!(
            registry.get(client.id()).await.unwrap().status,
            ClientStatus::Streaming
        );

        client.record_dropped(3).await;
        let record = registry.get(client.id()).await.unwrap();
        assert_eq!(record.frames_dropped, 3);
        // Dropping frames alone never marks a client slow
        assert_eq!(record.status, ClientStatus::Streaming);
    }

    #[tokio::test]
    async fn test_disconnected_is_not_revived() {
        let registry = Arc::new(ClientRegistry::new());
        let client = registry.admit(addr(2, 1)).await.unwrap();
        let id = client.id();

        registry.disconnect(id).await;
        assert!(client.is_unregistered());

        client.mark_streaming().await;
        assert_eq!(registry.get(id).await.unwrap().status, ClientStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_cleanup_after_retention() {
        let config = RegistryConfig::default().disconnected_retention(Duration::from_millis(50));
        let registry = Arc::new(ClientRegistry::with_config(config));

        let client = registry.admit(addr(2, 1)).await.unwrap();
        client.disconnect().await;

        registry.cleanup().await;
        assert_eq!(registry.len().await, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        registry.cleanup().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_dropped_handle_disconnects() {
        let registry = Arc::new(ClientRegistry::new());
        let client = registry.admit(addr(2, 1)).await.unwrap();
        let id = client.id();

        drop(client);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.get(id).await.unwrap().status, ClientStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let registry = Arc::new(ClientRegistry::new());
        let client = registry.admit(addr(2, 1)).await.unwrap();

        registry.destroy().await;
        registry.destroy().await;

        assert!(registry.is_destroyed());
        assert!(client.is_unregistered());
        assert_eq!(registry.active_count().await, 0);
        assert!(matches!(
            registry.admit(addr(3, 1)).await,
            Err(RegistryError::Destroyed)
        ));
    }

    #[tokio::test]
    async fn test_statistics_events() {
        let config = RegistryConfig::default().stats_interval(Duration::from_millis(30));
        let registry = Arc::new(ClientRegistry::with_config(config));
        let bus = EventBus::new();
        let mut events = bus.subscribe();

        let client = registry.admit(addr(2, 1)).await.unwrap();
        client.record_sent(4096).await;

        let task = registry.spawn_statistics_task(bus.clone());

        match events.recv().await {
            Some(ServerEvent::ClientsStatistic(clients)) => {
                assert_eq!(clients.len(), 1);
                assert_eq!(clients[0].bytes_sent, 4096);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match events.recv().await {
            Some(ServerEvent::TrafficStatistic(points)) => {
                assert_eq!(points.len(), 1);
                assert_eq!(points[0].bytes, 4096);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        registry.destroy().await;
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_stats_interval_still_ticks() {
        let config = RegistryConfig::default().stats_interval(Duration::ZERO);
        let registry = Arc::new(ClientRegistry::with_config(config));
        assert_eq!(registry.config().stats_interval, MIN_STATS_INTERVAL);

        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let task = registry.spawn_statistics_task(bus.clone());

        for _ in 0..4 {
            let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .unwrap();
            assert!(matches!(
                event,
                Some(ServerEvent::ClientsStatistic(_)) | Some(ServerEvent::TrafficStatistic(_))
            ));
        }

        registry.destroy().await;
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
