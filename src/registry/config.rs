//! Registry configuration

use std::time::Duration;

/// Shortest statistics interval; smaller values are raised to this
pub const MIN_STATS_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for the client registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum concurrent clients (0 = unlimited)
    pub max_clients: usize,

    /// Maximum concurrent clients from one IP address (0 = unlimited)
    pub max_clients_per_address: usize,

    /// How often statistics snapshots are emitted
    pub stats_interval: Duration,

    /// Number of samples kept in the traffic window
    pub traffic_window: usize,

    /// How long a disconnected record stays visible in snapshots
    pub disconnected_retention: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_clients: 0,
            max_clients_per_address: 0,
            stats_interval: Duration::from_secs(1),
            traffic_window: 30,
            disconnected_retention: Duration::from_secs(2),
        }
    }
}

impl RegistryConfig {
    /// Set the global client limit
    pub fn max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    /// Set the per-address client limit
    pub fn max_clients_per_address(mut self, max: usize) -> Self {
        self.max_clients_per_address = max;
        self
    }

    /// Set the statistics interval
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Set the traffic window size
    pub fn traffic_window(mut self, points: usize) -> Self {
        self.traffic_window = points;
        self
    }

    /// Set how long disconnected records are retained
    pub fn disconnected_retention(mut self, retention: Duration) -> Self {
        self.disconnected_retention = retention;
        self
    }
}
