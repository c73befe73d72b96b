//! Registry error types
//!
//! Reasons a client can be refused admission.

use std::net::IpAddr;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The global client limit is reached
    #[error("Client limit reached ({0})")]
    LimitReached(usize),
    /// The per-address client limit is reached
    #[error("Client limit for {addr} reached ({limit})")]
    AddressLimitReached { addr: IpAddr, limit: usize },
    /// The registry was destroyed and accepts no more clients
    #[error("Registry destroyed")]
    Destroyed,
}
