//! Fan-out of encoded frames to streaming clients

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_util::sync::CancellationToken;

use super::multipart::{self, Boundary};
use crate::encoder::EncodedFrame;
use crate::error::{Error, Result};
use crate::registry::ClientHandle;

/// Default per-client queue depth
pub const DEFAULT_QUEUE_CAPACITY: usize = 2;

/// Limits applied to every client write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePolicy {
    /// A write taking longer marks the client slow
    pub write_timeout: Duration,
    /// Further time a slow write may take before the client is evicted
    pub slow_grace: Duration,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(2),
            slow_grace: Duration::from_secs(3),
        }
    }
}

/// Why a client stream ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The client was unregistered
    Unregistered,
    /// The broadcaster went away
    SourceClosed,
    /// The server stopped and gave up on the in-flight write
    Abandoned,
}

/// A frame delivered to one subscriber
#[derive(Debug, Clone)]
pub struct Received {
    /// Newest frame available
    pub frame: EncodedFrame,
    /// Older frames skipped to reach it
    pub dropped: u64,
}

/// One client's view of the frame stream
///
/// Backed by a bounded queue; when it overflows the oldest frames are
/// discarded. `recv` always skips ahead to the newest queued frame and never
/// yields a generation older than one already yielded.
pub struct Subscription {
    catchup: Option<EncodedFrame>,
    rx: broadcast::Receiver<EncodedFrame>,
    last_generation: Option<u64>,
}

impl Subscription {
    /// Wait for the next frame
    ///
    /// Returns `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<Received> {
        let mut dropped = 0u64;
        let mut next = self.catchup.take();

        loop {
            if next.is_none() {
                match self.rx.recv().await {
                    Ok(frame) => next = Some(frame),
                    Err(RecvError::Lagged(n)) => {
                        dropped += n;
                        continue;
                    }
                    Err(RecvError::Closed) => return None,
                }
            }

            // Skip to the newest frame already queued
            loop {
                match self.rx.try_recv() {
                    Ok(frame) => {
                        dropped += 1;
                        next = Some(frame);
                    }
                    Err(TryRecvError::Lagged(n)) => dropped += n,
                    Err(_) => break,
                }
            }

            let Some(frame) = next.take() else {
                continue;
            };
            if self.last_generation.is_some_and(|last| frame.generation < last) {
                continue;
            }

            self.last_generation = Some(frame.generation);
            return Some(Received { frame, dropped });
        }
    }

    /// Generation of the last frame yielded
    pub fn last_generation(&self) -> Option<u64> {
        self.last_generation
    }
}

/// Broadcasts the current encoded frame to every registered client
///
/// The producer side never waits on a client: `publish` overwrites the
/// oldest queued frame of any client that fell behind.
pub struct StreamBroadcaster {
    tx: broadcast::Sender<EncodedFrame>,
    current: Mutex<Option<EncodedFrame>>,
    boundary: Boundary,
}

impl StreamBroadcaster {
    /// Create a broadcaster with the default queue depth and a random boundary
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY, Boundary::random())
    }

    /// Create a broadcaster with the given per-client queue depth
    pub fn with_capacity(capacity: usize, boundary: Boundary) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            current: Mutex::new(None),
            boundary,
        }
    }

    /// Multipart boundary used for every client
    pub fn boundary(&self) -> &Boundary {
        &self.boundary
    }

    /// Make `frame` current and queue it for every subscriber
    ///
    /// Returns the number of subscribers it was queued for.
    pub fn publish(&self, frame: EncodedFrame) -> usize {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current = Some(frame.clone());
        self.tx.send(frame).unwrap_or(0)
    }

    /// The most recently published frame
    pub fn current(&self) -> Option<EncodedFrame> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Subscribe to frames, starting with the current one
    pub fn subscribe(&self) -> Subscription {
        // Same lock as publish, so nothing falls between catchup and rx
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        Subscription {
            catchup: current.clone(),
            rx: self.tx.subscribe(),
            last_generation: None,
        }
    }

    /// Stream frames to `writer` until the client is unregistered
    ///
    /// Every write is bounded by `policy`: a write exceeding
    /// `write_timeout` marks the client slow, one still pending after a
    /// further `slow_grace` evicts it with `Error::Evicted`. Cancelling
    /// `abandon` drops an in-flight write immediately.
    pub async fn stream_to<W>(
        &self,
        client: &ClientHandle,
        writer: &mut W,
        policy: WritePolicy,
        abandon: &CancellationToken,
    ) -> Result<StreamEnd>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut subscription = self.subscribe();
        let unregistered = client.cancellation().clone();
        let mut slow = false;

        loop {
            let received = tokio::select! {
                biased;
                _ = unregistered.cancelled() => return Ok(StreamEnd::Unregistered),
                received = subscription.recv() => match received {
                    Some(received) => received,
                    None => return Ok(StreamEnd::SourceClosed),
                },
            };

            if received.dropped > 0 {
                client.record_dropped(received.dropped).await;
            }

            match self
                .write_frame(client, writer, &received.frame, policy, abandon, &mut slow)
                .await?
            {
                Some(written) => client.record_sent(written).await,
                None => return Ok(StreamEnd::Abandoned),
            }
        }
    }

    async fn write_frame<W>(
        &self,
        client: &ClientHandle,
        writer: &mut W,
        frame: &EncodedFrame,
        policy: WritePolicy,
        abandon: &CancellationToken,
        slow: &mut bool,
    ) -> Result<Option<usize>>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let write = multipart::write_part(writer, &self.boundary, &frame.data);
        tokio::pin!(write);

        let on_time = tokio::select! {
            biased;
            _ = abandon.cancelled() => return Ok(None),
            result = tokio::time::timeout(policy.write_timeout, &mut write) => result,
        };

        let written = match on_time {
            Ok(result) => {
                if *slow {
                    *slow = false;
                    client.mark_streaming().await;
                }
                result?
            }
            Err(_) => {
                if !*slow {
                    *slow = true;
                    client.mark_slow().await;
                }
                tokio::select! {
                    biased;
                    _ = abandon.cancelled() => return Ok(None),
                    result = tokio::time::timeout(policy.slow_grace, &mut write) => match result {
                        Ok(result) => result?,
                        Err(_) => {
                            tracing::warn!(
                                client = %client.id(),
                                generation = frame.generation,
                                "Client made no write progress, evicting"
                            );
                            return Err(Error::Evicted);
                        }
                    },
                }
            }
        };

        Ok(Some(written))
    }
}

impl Default for StreamBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
