//! Client registry
//!
//! Tracks every streaming client from admission to removal, enforces client
//! limits, and periodically reports statistics through the event bus.
//!
//! # Record lifecycle
//!
//! ```text
//!  admit() ──► Connecting ──► Streaming ◄──► Slow
//!                  │              │            │
//!                  └──────────────┴────────────┴──► Disconnected ──► removed
//!                                                  (peer close,      (after
//!                                                   eviction,         retention)
//!                                                   destroy)
//! ```
//!
//! Records are mutated only through the registry: the serving task holds a
//! `ClientHandle` for its own record, statistics read snapshot copies.

pub mod client;
pub mod config;
pub mod error;
pub mod store;
pub mod traffic;

pub use client::{ClientId, ClientRecord, ClientStatus};
pub use config::{RegistryConfig, MIN_STATS_INTERVAL};
pub use error::RegistryError;
pub use store::{ClientHandle, ClientRegistry};
pub use traffic::{TrafficPoint, TrafficWindow};
