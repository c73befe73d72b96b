//! Raw and encoded frame types
//!
//! Raw frames reach the encoder through a single-slot cell: pushing a new
//! frame replaces whatever the encoder has not consumed yet.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;

/// Pixel layout of a raw frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit RGBA, alpha is discarded on encode
    Rgba8,
    /// 8-bit RGB
    Rgb8,
    /// 8-bit grayscale
    Luma8,
}

impl PixelFormat {
    /// Bytes per pixel
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Luma8 => 1,
        }
    }
}

/// A raw bitmap produced by the frame source
#[derive(Debug, Clone)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel layout
    pub format: PixelFormat,
    /// Tightly packed rows, no padding
    pub pixels: Bytes,
}

impl Frame {
    /// Create a frame from packed pixels
    pub fn new(width: u32, height: u32, format: PixelFormat, pixels: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            format,
            pixels: pixels.into(),
        }
    }

    /// Create a single-color RGB frame
    pub fn solid_rgb(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let count = width as usize * height as usize;
        let mut pixels = Vec::with_capacity(count * 3);
        for _ in 0..count {
            pixels.extend_from_slice(&rgb);
        }
        Self::new(width, height, PixelFormat::Rgb8, pixels)
    }

    /// Byte length implied by the dimensions and format
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// An immutable JPEG image with its generation id
///
/// Cheap to clone: the JPEG bytes are reference counted and shared by
/// every client queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Monotonically increasing per encoder; heartbeats reuse the id
    pub generation: u64,
    /// JPEG bytes
    pub data: Bytes,
}

impl EncodedFrame {
    /// Create an encoded frame
    pub fn new(generation: u64, data: Bytes) -> Self {
        Self { generation, data }
    }

    /// Size of the JPEG payload
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Producer side of the latest-frame cell
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: Arc<watch::Sender<Option<Arc<Frame>>>>,
}

impl FrameSender {
    /// Replace the latest frame; never blocks
    pub fn send(&self, frame: Frame) {
        self.tx.send_replace(Some(Arc::new(frame)));
    }

    /// Create another receiver observing the same cell
    pub fn subscribe(&self) -> FrameReceiver {
        FrameReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

/// Consumer side of the latest-frame cell
#[derive(Debug, Clone)]
pub struct FrameReceiver {
    rx: watch::Receiver<Option<Arc<Frame>>>,
}

impl FrameReceiver {
    /// Take the current frame (if any) and mark it seen
    pub fn take_latest(&mut self) -> Option<Arc<Frame>> {
        self.rx.borrow_and_update().clone()
    }

    /// Wait until a newer frame than the last one taken is available
    ///
    /// Returns `false` once every sender is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// Create a latest-wins frame cell
pub fn frame_channel() -> (FrameSender, FrameReceiver) {
    let (tx, rx) = watch::channel(None);
    (FrameSender { tx: Arc::new(tx) }, FrameReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solid_frame_len() {
        let frame = Frame::solid_rgb(4, 2, [1, 2, 3]);
        assert_eq!(frame.pixels.len(), 24);
        assert_eq!(frame.expected_len(), 24);
        assert_eq!(&frame.pixels[..3], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_latest_frame_wins() {
        let (tx, mut rx) = frame_channel();
        assert!(rx.take_latest().is_none());

        tx.send(Frame::solid_rgb(1, 1, [1, 1, 1]));
        tx.send(Frame::solid_rgb(1, 1, [2, 2, 2]));
        tx.send(Frame::solid_rgb(1, 1, [3, 3, 3]));

        assert!(rx.changed().await);
        let frame = rx.take_latest().unwrap();
        assert_eq!(&frame.pixels[..], &[3, 3, 3]);
    }

    #[tokio::test]
    async fn test_changed_reports_closed_source() {
        let (tx, mut rx) = frame_channel();
        drop(tx);
        assert!(!rx.changed().await);
    }
}
