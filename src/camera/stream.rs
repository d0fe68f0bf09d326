//! MJPEG stream responder.
//!
//! Each client gets an endless `multipart/x-mixed-replace` body. Every frame
//! goes out as three writes: the part header with the length, the JPEG
//! bytes, then the boundary.
//!
//! Frames come from a [`FrameFeed`]:
//! - [`SlotFeed`] copies the latest published frame out of the slot
//! - [`DirectFeed`] grabs frames from the source itself, bypassing the
//!   capture task

use super::frame::{EncodePolicy, FrameBuffer, FrameSource, PreparedFrame};
use super::pipeline::PipelineStats;
use super::slot::FrameSlot;
use log::{debug, info};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Multipart boundary.
pub const BOUNDARY: &str = "123456789000000000000987654321";

/// Response content type of the stream.
pub const STREAM_CONTENT_TYPE: &str =
    "multipart/x-mixed-replace;boundary=123456789000000000000987654321";

const STREAM_BOUNDARY: &str = "\r\n--123456789000000000000987654321\r\n";

/// How long a slot reader waits for a new frame before rechecking cancel.
const SLOT_WAIT: Duration = Duration::from_millis(500);

/// Pause after the source failed to deliver, to avoid spinning.
const RETRY_PAUSE: Duration = Duration::from_millis(50);

/// Why a feed produced no frame this round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// No new frame in time.
    NoFrame,
    CaptureFailed,
    TranscodeFailed,
    /// The frame is not JPEG and cannot go into an MJPEG stream.
    NotJpeg,
}

/// Result of one feed round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Sent,
    Skipped(Skip),
}

/// A source of frames for one stream client.
pub trait FrameFeed: Send {
    /// Get the next frame and pass its bytes to `emit`.
    ///
    /// The frame only lives for the duration of the call. An error from
    /// `emit` is returned unchanged.
    fn send_next(&mut self, emit: &mut dyn FnMut(&[u8]) -> io::Result<()>) -> io::Result<Next>;
}

/// Reads the shared slot, sending each generation at most once.
pub struct SlotFeed<B> {
    slot: Arc<FrameSlot<B>>,
    last_sent: u64,
    wait: Duration,
}

impl<B> Clone for SlotFeed<B> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            last_sent: self.last_sent,
            wait: self.wait,
        }
    }
}

impl<B: FrameBuffer> SlotFeed<B> {
    pub fn new(slot: Arc<FrameSlot<B>>) -> Self {
        Self {
            slot,
            last_sent: 0,
            wait: SLOT_WAIT,
        }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

impl<B: FrameBuffer> FrameFeed for SlotFeed<B> {
    fn send_next(&mut self, emit: &mut dyn FnMut(&[u8]) -> io::Result<()>) -> io::Result<Next> {
        // Copied under the lock; the write below runs unlocked
        let Some(snapshot) = self.slot.wait_newer(self.last_sent, self.wait) else {
            return Ok(Next::Skipped(Skip::NoFrame));
        };
        self.last_sent = snapshot.generation;
        if !snapshot.encoding.is_jpeg() {
            return Ok(Next::Skipped(Skip::NotJpeg));
        }
        emit(&snapshot.data)?;
        Ok(Next::Sent)
    }
}

/// Grabs frames straight from the source.
pub struct DirectFeed<S> {
    source: Arc<Mutex<S>>,
    policy: EncodePolicy,
}

impl<S> Clone for DirectFeed<S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            policy: self.policy,
        }
    }
}

impl<S: FrameSource> DirectFeed<S> {
    pub fn new(source: Arc<Mutex<S>>, policy: EncodePolicy) -> Self {
        Self { source, policy }
    }
}

/// Returns a frame to its source when dropped, whatever happened to the
/// writes in between.
struct Lease<'a, S: FrameSource> {
    source: &'a mut S,
    frame: Option<PreparedFrame<S::Frame>>,
}

impl<S: FrameSource> Drop for Lease<'_, S> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            frame.release_to(self.source);
        }
    }
}

impl<S: FrameSource> FrameFeed for DirectFeed<S> {
    fn send_next(&mut self, emit: &mut dyn FnMut(&[u8]) -> io::Result<()>) -> io::Result<Next> {
        let mut source = self.source.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(frame) = source.acquire() else {
            return Ok(Next::Skipped(Skip::CaptureFailed));
        };
        let prepared = match self.policy.prepare(&mut *source, frame) {
            Ok(prepared) => prepared,
            Err(e) => {
                debug!("Stream frame dropped: {}", e);
                return Ok(Next::Skipped(Skip::TranscodeFailed));
            }
        };

        if !prepared.encoding().is_jpeg() {
            prepared.release_to(&mut *source);
            return Ok(Next::Skipped(Skip::NotJpeg));
        }

        let lease = Lease {
            source: &mut *source,
            frame: Some(prepared),
        };
        if let Some(frame) = &lease.frame {
            emit(frame.data())?;
        }
        Ok(Next::Sent)
    }
}

/// Slot or direct feed, picked at startup.
pub enum ModeFeed<S: FrameSource> {
    Slot(SlotFeed<S::Frame>),
    Direct(DirectFeed<S>),
}

impl<S: FrameSource> Clone for ModeFeed<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Slot(feed) => Self::Slot(feed.clone()),
            Self::Direct(feed) => Self::Direct(feed.clone()),
        }
    }
}

impl<S: FrameSource> FrameFeed for ModeFeed<S> {
    fn send_next(&mut self, emit: &mut dyn FnMut(&[u8]) -> io::Result<()>) -> io::Result<Next> {
        match self {
            Self::Slot(feed) => feed.send_next(emit),
            Self::Direct(feed) => feed.send_next(emit),
        }
    }
}

/// Writes one frame: part header, bytes, boundary.
fn write_part<W: Write + ?Sized>(out: &mut W, data: &[u8]) -> io::Result<()> {
    let header = format!(
        "Content-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        data.len()
    );
    out.write_all(header.as_bytes())?;
    out.write_all(data)?;
    out.write_all(STREAM_BOUNDARY.as_bytes())?;
    out.flush()
}

/// Serves the multipart body to one client.
#[derive(Clone)]
pub struct StreamResponder {
    stats: Arc<PipelineStats>,
}

impl StreamResponder {
    pub fn new(stats: Arc<PipelineStats>) -> Self {
        Self { stats }
    }

    /// Stream until cancelled or the client goes away.
    ///
    /// Returns the number of frames sent. A write error ends only this
    /// client and is returned to the caller.
    pub fn serve<F, W>(&self, feed: &mut F, out: &mut W, cancel: &CancellationToken) -> io::Result<u64>
    where
        F: FrameFeed + ?Sized,
        W: Write + ?Sized,
    {
        out.write_all(STREAM_BOUNDARY.as_bytes())?;
        let mut sent = 0u64;

        while !cancel.is_cancelled() {
            match feed.send_next(&mut |data| write_part(out, data))? {
                Next::Sent => {
                    sent += 1;
                    PipelineStats::record(&self.stats.frames_streamed);
                }
                Next::Skipped(Skip::NoFrame) => {}
                Next::Skipped(skip) => {
                    debug!("Stream frame skipped: {:?}", skip);
                    thread::sleep(RETRY_PAUSE);
                }
            }
        }

        info!("Stream ended after {} frames", sent);
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::frame::{Encoding, OwnedFrame};
    use crate::sim::SyntheticCamera;

    /// Sink that fails after accepting a number of writes.
    struct FailingSink {
        writes_left: usize,
        written: Vec<u8>,
    }

    impl Write for FailingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.writes_left == 0 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client gone"));
            }
            self.writes_left -= 1;
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_content_type_uses_boundary() {
        assert!(STREAM_CONTENT_TYPE.ends_with(BOUNDARY));
        assert!(STREAM_BOUNDARY.contains(BOUNDARY));
    }

    #[test]
    fn test_part_layout() {
        let mut out = Vec::new();
        write_part(&mut out, b"JPEGDATA").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "Content-Type: image/jpeg\r\nContent-Length: 8\r\n\r\nJPEGDATA\r\n--123456789000000000000987654321\r\n"
        );
    }

    #[test]
    fn test_slot_feed_sends_each_generation_once() {
        let slot = Arc::new(FrameSlot::new());
        slot.lock()
            .install(PreparedFrame::Captured(OwnedFrame::new(vec![1; 4], Encoding::Jpeg)));
        let mut feed = SlotFeed::new(slot).with_wait(Duration::from_millis(5));

        let mut frames = Vec::new();
        assert_eq!(feed.send_next(&mut |d| { frames.push(d.to_vec()); Ok(()) }).unwrap(), Next::Sent);
        assert_eq!(
            feed.send_next(&mut |d| { frames.push(d.to_vec()); Ok(()) }).unwrap(),
            Next::Skipped(Skip::NoFrame)
        );
        assert_eq!(frames, vec![vec![1; 4]]);
    }

    #[test]
    fn test_direct_feed_releases_on_write_error() {
        let camera = Arc::new(Mutex::new(SyntheticCamera::jpeg(32)));
        let mut feed = DirectFeed::new(camera.clone(), EncodePolicy::default());

        let result = feed.send_next(&mut |_| Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")));
        assert!(result.is_err());
        assert_eq!(camera.lock().unwrap().outstanding(), 0);

        assert_eq!(feed.send_next(&mut |_| Ok(())).unwrap(), Next::Sent);
        assert_eq!(camera.lock().unwrap().outstanding(), 0);
    }

    #[test]
    fn test_direct_feed_capture_failure_is_skipped() {
        let mut camera = SyntheticCamera::jpeg(32);
        camera.fail_every(1);
        let mut feed = DirectFeed::new(Arc::new(Mutex::new(camera)), EncodePolicy::default());
        assert_eq!(
            feed.send_next(&mut |_| Ok(())).unwrap(),
            Next::Skipped(Skip::CaptureFailed)
        );
    }

    #[test]
    fn test_direct_feed_skips_small_raw_frames() {
        let camera = Arc::new(Mutex::new(SyntheticCamera::raw(160, 120)));
        let mut feed = DirectFeed::new(camera.clone(), EncodePolicy::default());
        assert_eq!(
            feed.send_next(&mut |_| Ok(())).unwrap(),
            Next::Skipped(Skip::NotJpeg)
        );
        assert_eq!(camera.lock().unwrap().outstanding(), 0);
    }

    #[test]
    fn test_write_error_ends_client() {
        let camera = Arc::new(Mutex::new(SyntheticCamera::jpeg(32)));
        let mut feed = DirectFeed::new(camera.clone(), EncodePolicy::default());
        let responder = StreamResponder::new(Arc::new(PipelineStats::new()));
        // Opening boundary plus two full frames (header, body, boundary each)
        let mut sink = FailingSink {
            writes_left: 7,
            written: Vec::new(),
        };

        let result = responder.serve(&mut feed, &mut sink, &CancellationToken::new());

        assert!(result.is_err());
        assert_eq!(camera.lock().unwrap().outstanding(), 0);
        let text = String::from_utf8_lossy(&sink.written);
        assert_eq!(text.matches("Content-Length: 32").count(), 2);
    }

    #[test]
    fn test_cancel_ends_stream() {
        let slot: Arc<FrameSlot<OwnedFrame>> = Arc::new(FrameSlot::new());
        let mut feed = SlotFeed::new(slot).with_wait(Duration::from_millis(5));
        let responder = StreamResponder::new(Arc::new(PipelineStats::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut out = Vec::new();
        assert_eq!(responder.serve(&mut feed, &mut out, &cancel).unwrap(), 0);
        assert_eq!(out, STREAM_BOUNDARY.as_bytes());
    }
}
