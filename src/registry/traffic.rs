//! Rolling traffic window

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

/// Bytes sent to all clients during one sampling interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficPoint {
    /// End of the sampling interval
    pub timestamp: SystemTime,
    /// Bytes sent during the interval
    pub bytes: u64,
    /// Length of the interval
    pub interval: Duration,
}

impl TrafficPoint {
    /// Create a traffic sample
    pub fn new(timestamp: SystemTime, bytes: u64, interval: Duration) -> Self {
        Self {
            timestamp,
            bytes,
            interval,
        }
    }

    /// Rate over the sampled interval
    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.interval.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            0.0
        }
    }
}

/// Fixed-capacity window of traffic samples, oldest evicted first
#[derive(Debug)]
pub struct TrafficWindow {
    capacity: usize,
    points: VecDeque<TrafficPoint>,
    last_total: u64,
}

impl TrafficWindow {
    /// Create a window holding at most `capacity` points
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            points: VecDeque::with_capacity(capacity),
            last_total: 0,
        }
    }

    /// Append a sample, evicting the oldest when full
    pub fn push(&mut self, point: TrafficPoint) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    /// Append a sample from a running byte total
    ///
    /// The sample holds the difference to the total seen on the previous call.
    pub fn sample(&mut self, total_bytes: u64, interval: Duration) -> TrafficPoint {
        let bytes = total_bytes.saturating_sub(self.last_total);
        self.last_total = total_bytes;
        let point = TrafficPoint::new(SystemTime::now(), bytes, interval);
        self.push(point);
        point
    }

    /// Copy of the samples, oldest first
    pub fn points(&self) -> Vec<TrafficPoint> {
        self.points.iter().copied().collect()
    }

    /// Most recent sample
    pub fn latest(&self) -> Option<&TrafficPoint> {
        self.points.back()
    }

    /// Average rate across the window
    pub fn average_bytes_per_second(&self) -> f64 {
        let bytes: u64 = self.points.iter().map(|p| p.bytes).sum();
        let secs: f64 = self.points.iter().map(|p| p.interval.as_secs_f64()).sum();
        if secs > 0.0 {
            bytes as f64 / secs
        } else {
            0.0
        }
    }

    /// Number of samples held
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the window is empty
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Maximum number of samples
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn test_evicts_oldest() {
        let mut window = TrafficWindow::new(3);
        for bytes in 1..=5 {
            window.push(TrafficPoint::new(SystemTime::now(), bytes, SEC));
        }

        let bytes: Vec<u64> = window.points().iter().map(|p| p.bytes).collect();
        assert_eq!(bytes, vec![3, 4, 5]);
        assert_eq!(window.len(), window.capacity());
    }

    #[test]
    fn test_sample_uses_delta() {
        let mut window = TrafficWindow::new(10);
        assert_eq!(window.sample(1_000, SEC).bytes, 1_000);
        assert_eq!(window.sample(1_500, SEC).bytes, 500);
        assert_eq!(window.sample(1_500, SEC).bytes, 0);
        assert_eq!(window.latest().unwrap().bytes, 0);
    }

    #[test]
    fn test_rates() {
        let mut window = TrafficWindow::new(10);
        assert_eq!(window.average_bytes_per_second(), 0.0);

        window.push(TrafficPoint::new(SystemTime::now(), 2_000, Duration::from_secs(2)));
        window.push(TrafficPoint::new(SystemTime::now(), 4_000, Duration::from_secs(2)));

        assert_eq!(window.latest().unwrap().bytes_per_second(), 2_000.0);
        assert_eq!(window.average_bytes_per_second(), 1_500.0);
    }

    #[test]
    fn test_zero_capacity_is_bumped() {
        let window = TrafficWindow::new(0);
        assert_eq!(window.capacity(), 1);
        assert!(window.is_empty());
    }
}
