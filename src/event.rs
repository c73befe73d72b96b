//! Event bus
//!
//! A single ordered stream of errors, statistics and action requests for the
//! owning application. Delivery is best effort: a consumer that falls behind
//! by more than the bus capacity loses the oldest undelivered events instead
//! of blocking the server.

use tokio::sync::broadcast;

use crate::error::AppError;
use crate::registry::{ClientRecord, TrafficPoint};

/// Default number of undelivered events kept per consumer
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Requests the server cannot act on itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionRequest {
    /// A viewer asked for streaming to be started or stopped
    StartStop,
}

/// Event emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// An error condition, already mapped to the public taxonomy
    Error(AppError),
    /// Snapshot of every known client
    ClientsStatistic(Vec<ClientRecord>),
    /// Snapshot of the traffic window
    TrafficStatistic(Vec<TrafficPoint>),
    /// Action requested through the HTTP interface
    Action(ActionRequest),
}

/// Cloneable sending side of the event stream
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    /// Create a bus with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a bus keeping at most `capacity` undelivered events
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn send(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }

    /// Publish an error event
    pub fn error(&self, error: AppError) {
        self.send(ServerEvent::Error(error));
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of the event stream
#[derive(Debug)]
pub struct EventStream {
    rx: broadcast::Receiver<ServerEvent>,
}

impl EventStream {
    /// Wait for the next event
    ///
    /// Skips over events lost to lag. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(missed = n, "Event consumer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is already queued
    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
