//! Frame encoding
//!
//! Raw frames arrive through a latest-wins cell (`frame_channel`), are
//! compressed to JPEG off the async workers, and are published to the
//! broadcaster as `EncodedFrame`s with increasing generation ids.

pub mod frame;
pub mod jpeg;
pub mod pipeline;

pub use frame::{frame_channel, EncodedFrame, Frame, FrameReceiver, FrameSender, PixelFormat};
pub use jpeg::EncodeError;
pub use pipeline::{FrameEncoder, DEFAULT_KEEP_ALIVE, MIN_KEEP_ALIVE};
