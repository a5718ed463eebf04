use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time multiplexer counters.
#[derive(Debug, Clone)]
pub struct StreamStats {
    pub routed_frames: u64,
    pub dropped_frames: u64,
    pub restarts: u64,
    pub registered_streams: usize,
}

/// Lock-free counters updated on the routing path.
///
/// `dropped_frames` covers frames with no live handle as well as
/// undecodable ones; dropping is silent for callers, but this counter makes
/// it observable.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    routed_frames: AtomicU64,
    dropped_frames: AtomicU64,
    restarts: AtomicU64,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_routed(&self) {
        self.routed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn routed_frames(&self) -> u64 {
        self.routed_frames.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, registered_streams: usize) -> StreamStats {
        StreamStats {
            routed_frames: self.routed_frames(),
            dropped_frames: self.dropped_frames(),
            restarts: self.restarts(),
            registered_streams,
        }
    }
}
