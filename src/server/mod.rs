//! HTTP(S) server
//!
//! `MjpegServer` owns the lifecycle. While running it holds one accept loop
//! per configured address; each accepted socket is served by its own task
//! on a shared task tracker so that `stop` can wait for, and if needed
//! abandon, every connection.

pub mod config;
mod connection;
pub mod http;
pub mod lifecycle;
mod listener;
pub mod tls;

pub use config::{ServerConfig, TlsCredentials, TlsVersions};
pub use lifecycle::{LifecycleState, MjpegServer};
