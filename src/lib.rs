//! MJPEG-over-HTTP(S) streaming server
//!
//! Frames handed in by the host application are JPEG-encoded once and
//! fanned out to every connected viewer as a `multipart/x-mixed-replace`
//! stream. Slow viewers lose frames instead of slowing anyone else down.
//!
//! # Example
//!
//! ```no_run
//! use mjpeg_rs::{frame_channel, Frame, MjpegServer, ServerConfig, ServerEvent};
//!
//! # async fn run() -> mjpeg_rs::Result<()> {
//! let (frames, rx) = frame_channel();
//! let server = MjpegServer::new(rx);
//! let mut events = server.events();
//!
//! server.start(ServerConfig::default().port(8080)).await?;
//! frames.send(Frame::solid_rgb(640, 480, [0, 128, 255]));
//!
//! while let Some(event) = events.recv().await {
//!     if let ServerEvent::Error(e) = event {
//!         eprintln!("server error: {}", e);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod encoder;
pub mod error;
pub mod event;
pub mod registry;
pub mod server;

pub use encoder::{frame_channel, Frame, FrameReceiver, FrameSender, PixelFormat};
pub use error::{AppError, Error, Result};
pub use event::{ActionRequest, EventBus, EventStream, ServerEvent};
pub use registry::{ClientId, ClientRecord, ClientStatus, TrafficPoint};
pub use server::{LifecycleState, MjpegServer, ServerConfig, TlsCredentials, TlsVersions};
