//! Frame fan-out
//!
//! One encoded stream feeds any number of clients. Each client reads from
//! its own bounded queue built on `tokio::sync::broadcast`; a client that
//! falls behind loses its oldest queued frames and never holds up the
//! encoder or other clients.
//!
//! # Architecture
//!
//! ```text
//!    FrameEncoder
//!         │ publish(EncodedFrame)
//!         ▼
//!  ┌──────────────────────┐
//!  │ StreamBroadcaster    │
//!  │  current: Option<_>  │──► catchup for new subscribers
//!  │  tx: broadcast::Tx   │
//!  └──────────┬───────────┘
//!             │
//!     ┌───────┼────────┐
//!     ▼       ▼        ▼
//!  [queue]  [queue]  [queue]      capacity 2, drop-oldest
//!     │       │        │
//!  stream_to stream_to stream_to  one task per client
//!     │       │        │
//!    TCP     TCP      TLS
//! ```
//!
//! `EncodedFrame::data` is `Bytes`, so the JPEG is shared, not copied, across
//! every queue.

pub mod broadcaster;
pub mod multipart;

pub use broadcaster::{
    Received, StreamBroadcaster, StreamEnd, Subscription, WritePolicy, DEFAULT_QUEUE_CAPACITY,
};
pub use multipart::Boundary;
