//! Encode loop
//!
//! Waits for either a new raw frame or the keep-alive deadline. A new frame
//! is JPEG-encoded on the blocking pool and published; a missed deadline
//! republishes the last encoded frame unchanged so idle viewers keep
//! receiving data.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::frame::{EncodedFrame, Frame, FrameReceiver};
use super::jpeg;
use crate::broadcast::StreamBroadcaster;
use crate::error::{AppError, Error};
use crate::event::EventBus;

/// Default keep-alive interval
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(1);

/// Shortest keep-alive interval; smaller values are raised to this
pub const MIN_KEEP_ALIVE: Duration = Duration::from_millis(10);

/// Turns raw frames into published JPEG frames
pub struct FrameEncoder {
    frames: FrameReceiver,
    quality: watch::Receiver<u8>,
    keep_alive: Duration,
    broadcaster: Arc<StreamBroadcaster>,
    events: EventBus,
    generation: u64,
    current: Option<EncodedFrame>,
}

impl FrameEncoder {
    /// Create an encoder publishing to `broadcaster`
    ///
    /// `quality` is read before every encode, so changes apply to the next
    /// frame.
    pub fn new(
        frames: FrameReceiver,
        quality: watch::Receiver<u8>,
        keep_alive: Duration,
        broadcaster: Arc<StreamBroadcaster>,
        events: EventBus,
    ) -> Self {
        Self {
            frames,
            quality,
            keep_alive: keep_alive.max(MIN_KEEP_ALIVE),
            broadcaster,
            events,
            generation: 0,
            current: None,
        }
    }

    /// Generation of the last encoded frame (0 before the first)
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Spawn the encode loop
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run the encode loop until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut source_open = true;

        // A frame pushed before start is encoded right away
        if let Some(frame) = self.frames.take_latest() {
            self.encode_and_publish(frame).await;
        }
        let mut deadline = Instant::now() + self.keep_alive;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                changed = self.frames.changed(), if source_open => {
                    if !changed {
                        tracing::debug!("Frame source closed");
                        source_open = false;
                        continue;
                    }
                    if let Some(frame) = self.frames.take_latest() {
                        if self.encode_and_publish(frame).await {
                            deadline = Instant::now() + self.keep_alive;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some(ref frame) = self.current {
                        self.broadcaster.publish(frame.clone());
                    }
                    deadline = Instant::now() + self.keep_alive;
                }
            }
        }

        tracing::debug!(generation = self.generation, "Frame encoder stopped");
    }

    /// Encode one frame and publish it
    ///
    /// On failure the previous frame stays current and a client-class error
    /// is reported.
    async fn encode_and_publish(&mut self, frame: Arc<Frame>) -> bool {
        let quality = *self.quality.borrow();
        let (width, height) = (frame.width, frame.height);

        match tokio::task::spawn_blocking(move || jpeg::encode(&frame, quality)).await {
            Ok(Ok(data)) => {
                self.generation += 1;
                let encoded = EncodedFrame::new(self.generation, data);
                self.current = Some(encoded.clone());
                let receivers = self.broadcaster.publish(encoded);
                tracing::trace!(
                    generation = self.generation,
                    quality = quality,
                    receivers = receivers,
                    "Frame published"
                );
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(width = width, height = height, error = %e, "Frame encoding failed");
                self.events.error(Error::from(e).to_app_error());
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Frame encoding task failed");
                self.events.error(AppError::ClientError(e.to_string()));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::frame::{frame_channel, PixelFormat};
    use crate::event::ServerEvent;

    struct Harness {
        broadcaster: Arc<StreamBroadcaster>,
        events: EventBus,
        quality: watch::Sender<u8>,
        shutdown: CancellationToken,
    }

    fn start(frames: FrameReceiver, keep_alive: Duration) -> Harness {
        let broadcaster = Arc::new(StreamBroadcaster::new());
        let events = EventBus::new();
        let (quality, quality_rx) = watch::channel(80);
        let shutdown = CancellationToken::new();

        FrameEncoder::new(
            frames,
            quality_rx,
            keep_alive,
            Arc::clone(&broadcaster),
            events.clone(),
        )
        .spawn(shutdown.clone());

        Harness {
            broadcaster,
            events,
            quality,
            shutdown,
        }
    }

    #[tokio::test]
    async fn test_encodes_pending_frame_on_start() {
        let (tx, rx) = frame_channel();
        tx.send(Frame::solid_rgb(16, 16, [0, 0, 255]));

        let harness = start(rx, DEFAULT_KEEP_ALIVE);
        let mut sub = harness.broadcaster.subscribe();

        let received = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.frame.generation, 1);
        assert_eq!(&received.frame.data[..2], &[0xFF, 0xD8]);
        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_burst_only_yields_newer_frames() {
        let (tx, rx) = frame_channel();
        let harness = start(rx, DEFAULT_KEEP_ALIVE);
        let mut sub = harness.broadcaster.subscribe();

        for step in 0..50u8 {
            let shade = step * 5;
            tx.send(Frame::solid_rgb(32, 32, [shade, shade, shade]));
        }

        // Drain until the newest push has been encoded
        let mut last = 0;
        loop {
            let received = tokio::time::timeout(Duration::from_secs(2), sub.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(received.frame.generation >= last);
            last = received.frame.generation;

            let decoded = image::load_from_memory(&received.frame.data)
                .unwrap()
                .to_rgb8();
            if (decoded.get_pixel(0, 0)[0] as i16 - 245).abs() <= 2 {
                break;
            }
        }

        // Never more encodes than pushes
        assert!(last <= 50);
        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_keep_alive_republishes_last_frame() {
        let (tx, rx) = frame_channel();
        let keep_alive = Duration::from_millis(50);
        let harness = start(rx, keep_alive);
        let mut sub = harness.broadcaster.subscribe();

        tx.send(Frame::solid_rgb(8, 8, [10, 20, 30]));
        let first = sub.recv().await.unwrap().frame;

        let mut repeats = 0;
        let window = tokio::time::sleep(keep_alive * 7 / 2);
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => break,
                received = sub.recv() => {
                    let frame = received.unwrap().frame;
                    assert_eq!(frame, first);
                    repeats += 1;
                }
            }
        }

        assert!(repeats >= 3, "only {} keep-alive frames", repeats);
        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_zero_keep_alive_is_raised_to_minimum() {
        let (tx, rx) = frame_channel();
        let harness = start(rx, Duration::ZERO);
        let mut sub = harness.broadcaster.subscribe();

        tx.send(Frame::solid_rgb(8, 8, [90, 90, 90]));
        sub.recv().await.unwrap();

        let mut repeats = 0u32;
        let window = tokio::time::sleep(MIN_KEEP_ALIVE * 10);
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => break,
                received = sub.recv() => {
                    received.unwrap();
                    repeats += 1;
                }
            }
        }

        // Roughly one repeat per minimum interval, not a spin
        assert!(repeats >= 2, "only {} keep-alive frames", repeats);
        assert!(repeats <= 12, "{} keep-alive frames", repeats);
        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_encode_error_keeps_previous_frame() {
        let (tx, rx) = frame_channel();
        let harness = start(rx, DEFAULT_KEEP_ALIVE);
        let mut events = harness.events.subscribe();
        let mut sub = harness.broadcaster.subscribe();

        tx.send(Frame::solid_rgb(8, 8, [1, 2, 3]));
        let good = sub.recv().await.unwrap().frame;

        tx.send(Frame::new(0, 0, PixelFormat::Rgb8, Vec::new()));
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(ServerEvent::Error(AppError::ClientError(_)))) => {}
            other => panic!("unexpected event: {:?}", other),
        }

        assert_eq!(harness.broadcaster.current(), Some(good));
        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_quality_change_applies_to_next_frame() {
        let (tx, rx) = frame_channel();
        let harness = start(rx, DEFAULT_KEEP_ALIVE);
        let mut sub = harness.broadcaster.subscribe();

        let pixels: Vec<u8> = (0..64 * 64 * 3).map(|i| (i * 13 % 241) as u8).collect();
        let frame = Frame::new(64, 64, PixelFormat::Rgb8, pixels);

        harness.quality.send_replace(100);
        tx.send(frame.clone());
        let high = sub.recv().await.unwrap().frame;

        harness.quality.send_replace(5);
        tx.send(frame);
        let low = sub.recv().await.unwrap().frame;

        assert!(low.generation > high.generation);
        assert!(low.len() < high.len());
        harness.shutdown.cancel();
    }
}
