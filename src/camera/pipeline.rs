//! Shared pipeline context and counters.

use super::frame::FrameBuffer;
use super::slot::{FrameSlot, Latch};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Everything the capture task shares with its consumers.
pub struct Pipeline<B> {
    pub slot: Arc<FrameSlot<B>>,
    pub latch: Arc<Latch>,
    pub stats: Arc<PipelineStats>,
}

impl<B> Clone for Pipeline<B> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            latch: self.latch.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<B: FrameBuffer> Default for Pipeline<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: FrameBuffer> Pipeline<B> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(FrameSlot::new()),
            latch: Arc::new(Latch::new()),
            stats: Arc::new(PipelineStats::new()),
        }
    }
}

/// Pipeline counters, updated lock-free from every task.
#[derive(Debug)]
pub struct PipelineStats {
    pub frames_captured: AtomicU64,
    pub capture_failures: AtomicU64,
    pub transcode_failures: AtomicU64,
    pub frames_written: AtomicU64,
    pub write_failures: AtomicU64,
    pub frames_streamed: AtomicU64,
    pub stream_clients: AtomicUsize,
    started: Instant,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            frames_captured: AtomicU64::new(0),
            capture_failures: AtomicU64::new(0),
            transcode_failures: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            frames_streamed: AtomicU64::new(0),
            stream_clients: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    pub fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.uptime_secs(),
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            transcode_failures: self.transcode_failures.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            frames_streamed: self.frames_streamed.load(Ordering::Relaxed),
            stream_clients: self.stream_clients.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`], served on `/stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub frames_captured: u64,
    pub capture_failures: u64,
    pub transcode_failures: u64,
    pub frames_written: u64,
    pub write_failures: u64,
    pub frames_streamed: u64,
    pub stream_clients: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = PipelineStats::new();
        PipelineStats::record(&stats.frames_captured);
        PipelineStats::record(&stats.frames_captured);
        PipelineStats::record(&stats.write_failures);
        stats.stream_clients.fetch_add(1, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_captured, 2);
        assert_eq!(snapshot.write_failures, 1);
        assert_eq!(snapshot.stream_clients, 1);
        assert_eq!(snapshot.frames_written, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(PipelineStats::new().snapshot()).unwrap();
        assert_eq!(json["frames_captured"], 0);
        assert!(json.get("uptime_secs").is_some());
    }
}
