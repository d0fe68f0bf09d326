//! Capture task: the only writer of the frame slot.

use super::frame::{EncodePolicy, FrameSource};
use super::pipeline::{Pipeline, PipelineStats};
use log::{debug, info, warn};
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What one capture cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Published { generation: u64 },
    CaptureFailed,
    TranscodeFailed,
}

/// Captures frames and publishes them into the slot.
pub struct CaptureTask<S: FrameSource> {
    source: S,
    pipeline: Pipeline<S::Frame>,
    policy: EncodePolicy,
    interval: Duration,
}

impl<S: FrameSource> CaptureTask<S> {
    pub fn new(source: S, pipeline: Pipeline<S::Frame>, policy: EncodePolicy) -> Self {
        Self {
            source,
            pipeline,
            policy,
            interval: Duration::ZERO,
        }
    }

    /// Pause between cycles.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// One capture cycle.
    ///
    /// The previous frame is released before a new one is acquired, all
    /// under the slot lock, so the slot never owns two buffers. On failure
    /// the slot stays empty until the next cycle.
    pub fn cycle(&mut self) -> CycleOutcome {
        let stats = &self.pipeline.stats;
        let outcome = {
            let mut slot = self.pipeline.slot.lock();
            if let Some(previous) = slot.take() {
                previous.release_to(&mut self.source);
            }

            match self.source.acquire() {
                None => {
                    PipelineStats::record(&stats.capture_failures);
                    CycleOutcome::CaptureFailed
                }
                Some(frame) => match self.policy.prepare(&mut self.source, frame) {
                    Ok(prepared) => CycleOutcome::Published {
                        generation: slot.install(prepared),
                    },
                    Err(e) => {
                        debug!("Dropping frame: {}", e);
                        PipelineStats::record(&stats.transcode_failures);
                        CycleOutcome::TranscodeFailed
                    }
                },
            }
        };

        if let CycleOutcome::Published { .. } = outcome {
            PipelineStats::record(&stats.frames_captured);
            self.pipeline.latch.signal();
        }
        outcome
    }

    /// Capture until cancelled, then return the last frame to the source.
    pub fn run(mut self, cancel: CancellationToken) -> S {
        info!("Capture task started");
        let mut failures_in_row = 0u32;

        while !cancel.is_cancelled() {
            match self.cycle() {
                CycleOutcome::Published { .. } => failures_in_row = 0,
                outcome => {
                    failures_in_row += 1;
                    if failures_in_row == 1 || failures_in_row % 100 == 0 {
                        warn!("Capture cycle failed ({:?}, {} in a row)", outcome, failures_in_row);
                    }
                }
            }
            if !self.interval.is_zero() {
                thread::sleep(self.interval);
            }
        }

        if let Some(last) = self.pipeline.slot.lock().take() {
            last.release_to(&mut self.source);
        }
        info!("Capture task stopped");
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::frame::Encoding;
    use crate::sim::SyntheticCamera;
    use std::time::Duration;

    #[test]
    fn test_cycle_publishes_and_signals() {
        let pipeline = Pipeline::new();
        let mut task = CaptureTask::new(SyntheticCamera::jpeg(64), pipeline.clone(), EncodePolicy::default());

        assert_eq!(task.cycle(), CycleOutcome::Published { generation: 1 });
        assert!(pipeline.latch.wait_timeout(Duration::from_millis(1)));
        assert_eq!(pipeline.slot.snapshot().unwrap().encoding, Encoding::Jpeg);
    }

    #[test]
    fn test_previous_frame_released_before_acquire() {
        let pipeline = Pipeline::new();
        let mut task = CaptureTask::new(SyntheticCamera::jpeg(64), pipeline, EncodePolicy::default());

        for _ in 0..5 {
            task.cycle();
        }
        assert_eq!(task.source().outstanding(), 1);
        assert_eq!(task.source().max_outstanding_at_acquire(), 0);
    }

    #[test]
    fn test_capture_failure_leaves_slot_empty() {
        let pipeline = Pipeline::new();
        let mut camera = SyntheticCamera::jpeg(64);
        camera.fail_every(2);
        let mut task = CaptureTask::new(camera, pipeline.clone(), EncodePolicy::default());

        assert!(matches!(task.cycle(), CycleOutcome::Published { .. }));
        pipeline.latch.wait_timeout(Duration::from_millis(1));

        assert_eq!(task.cycle(), CycleOutcome::CaptureFailed);
        assert!(pipeline.slot.snapshot().is_none());
        assert!(!pipeline.latch.is_set());
        assert_eq!(task.source().outstanding(), 0);
        assert_eq!(pipeline.stats.snapshot().capture_failures, 1);
    }

    #[test]
    fn test_transcode_failure_is_counted() {
        let pipeline = Pipeline::new();
        let mut camera = SyntheticCamera::raw(640, 480);
        camera.fail_transcode(true);
        let mut task = CaptureTask::new(camera, pipeline.clone(), EncodePolicy::default());

        assert_eq!(task.cycle(), CycleOutcome::TranscodeFailed);
        assert!(pipeline.slot.snapshot().is_none());
        assert_eq!(task.source().outstanding(), 0);
        assert_eq!(pipeline.stats.snapshot().transcode_failures, 1);
    }

    #[test]
    fn test_large_raw_frames_are_transcoded() {
        let pipeline = Pipeline::new();
        let mut task = CaptureTask::new(SyntheticCamera::raw(640, 480), pipeline.clone(), EncodePolicy::default());

        task.cycle();
        assert_eq!(pipeline.slot.snapshot().unwrap().encoding, Encoding::Jpeg);
        assert_eq!(task.source().outstanding(), 0);
    }

    #[test]
    fn test_run_returns_last_frame_on_cancel() {
        let pipeline = Pipeline::new();
        let task = CaptureTask::new(SyntheticCamera::jpeg(64), pipeline.clone(), EncodePolicy::default())
            .with_interval(Duration::from_millis(1));
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            std::thread::spawn(move || task.run(cancel))
        };
        while pipeline.slot.generation() < 3 {
            std::thread::sleep(Duration::from_millis(1));
        }
        cancel.cancel();

        let camera = handle.join().unwrap();
        assert_eq!(camera.outstanding(), 0);
        assert!(pipeline.slot.snapshot().is_none());
    }
}
