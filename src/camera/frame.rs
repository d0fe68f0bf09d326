//! Frames and the capture capability.

use std::fmt;

/// Pixel layout of an unencoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb565,
    Yuv422,
    Grayscale,
    Rgb888,
}

/// How the bytes of a frame are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Jpeg,
    Raw {
        width: u16,
        height: u16,
        format: PixelFormat,
    },
}

impl Encoding {
    pub fn is_jpeg(&self) -> bool {
        matches!(self, Self::Jpeg)
    }

    /// File extension used when a frame is written to storage.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Raw { .. } => "raw",
        }
    }
}

/// A frame handed out by a [`FrameSource`].
pub trait FrameBuffer: Send {
    fn data(&self) -> &[u8];
    fn encoding(&self) -> Encoding;
}

/// Capture capability.
///
/// Every frame obtained from `acquire` must go back through `release`
/// exactly once.
pub trait FrameSource: Send {
    type Frame: FrameBuffer;

    /// Grab the next frame. `None` when the sensor had nothing to give.
    fn acquire(&mut self) -> Option<Self::Frame>;

    /// Hand a frame back to the driver.
    fn release(&mut self, frame: Self::Frame);

    /// Encode `frame` as JPEG into a new buffer.
    fn transcode(&mut self, frame: &Self::Frame, quality: u8) -> Result<Vec<u8>, CaptureError>;
}

/// A heap-owned frame, used by sources that read frames from elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedFrame {
    data: Vec<u8>,
    encoding: Encoding,
}

impl OwnedFrame {
    pub fn new(data: Vec<u8>, encoding: Encoding) -> Self {
        Self { data, encoding }
    }
}

impl FrameBuffer for OwnedFrame {
    fn data(&self) -> &[u8] {
        &self.data
    }

    fn encoding(&self) -> Encoding {
        self.encoding
    }
}

/// A frame ready to publish: the driver's own buffer, or a transcoded copy.
#[derive(Debug)]
pub enum PreparedFrame<B> {
    Captured(B),
    Transcoded(Vec<u8>),
}

impl<B: FrameBuffer> PreparedFrame<B> {
    pub fn data(&self) -> &[u8] {
        match self {
            Self::Captured(frame) => frame.data(),
            Self::Transcoded(bytes) => bytes,
        }
    }

    pub fn encoding(&self) -> Encoding {
        match self {
            Self::Captured(frame) => frame.encoding(),
            Self::Transcoded(_) => Encoding::Jpeg,
        }
    }

    /// Give a driver buffer back to its source; transcoded copies are freed.
    pub fn release_to<S: FrameSource<Frame = B>>(self, source: &mut S) {
        match self {
            Self::Captured(frame) => source.release(frame),
            Self::Transcoded(bytes) => drop(bytes),
        }
    }
}

/// When to transcode before publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodePolicy {
    /// Unencoded frames wider than this are converted to JPEG.
    pub min_transcode_width: u16,
    pub jpeg_quality: u8,
}

impl Default for EncodePolicy {
    fn default() -> Self {
        Self {
            min_transcode_width: 400,
            jpeg_quality: 80,
        }
    }
}

impl EncodePolicy {
    pub fn needs_transcode(&self, encoding: &Encoding) -> bool {
        match encoding {
            Encoding::Jpeg => false,
            Encoding::Raw { width, .. } => *width > self.min_transcode_width,
        }
    }

    /// Apply the policy to a freshly acquired frame.
    ///
    /// When transcoding, the source frame is released as soon as the copy
    /// exists (or the conversion failed).
    pub fn prepare<S: FrameSource>(
        &self,
        source: &mut S,
        frame: S::Frame,
    ) -> Result<PreparedFrame<S::Frame>, CaptureError> {
        if !self.needs_transcode(&frame.encoding()) {
            return Ok(PreparedFrame::Captured(frame));
        }
        let encoded = source.transcode(&frame, self.jpeg_quality);
        source.release(frame);
        encoded.map(PreparedFrame::Transcoded)
    }
}

/// Capture errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The camera driver could not be initialised.
    Init(String),
    /// JPEG conversion failed.
    Transcode(String),
    /// The source cannot transcode.
    Unsupported,
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init(msg) => write!(f, "camera init failed: {}", msg),
            Self::Transcode(msg) => write!(f, "transcode failed: {}", msg),
            Self::Unsupported => write!(f, "source cannot transcode"),
        }
    }
}

impl std::error::Error for CaptureError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SyntheticCamera;

    fn raw(width: u16) -> Encoding {
        Encoding::Raw {
            width,
            height: 240,
            format: PixelFormat::Rgb565,
        }
    }

    #[test]
    fn test_extension() {
        assert_eq!(Encoding::Jpeg.extension(), "jpg");
        assert_eq!(raw(320).extension(), "raw");
    }

    #[test]
    fn test_policy_threshold() {
        let policy = EncodePolicy::default();
        assert!(!policy.needs_transcode(&Encoding::Jpeg));
        assert!(!policy.needs_transcode(&raw(400)));
        assert!(policy.needs_transcode(&raw(401)));
    }

    #[test]
    fn test_prepare_transcodes_and_releases() {
        let mut camera = SyntheticCamera::raw(640, 480);
        let policy = EncodePolicy::default();

        let frame = camera.acquire().unwrap();
        let prepared = policy.prepare(&mut camera, frame).unwrap();

        assert!(matches!(prepared, PreparedFrame::Transcoded(_)));
        assert_eq!(prepared.encoding(), Encoding::Jpeg);
        assert_eq!(camera.outstanding(), 0);
    }

    #[test]
    fn test_prepare_keeps_small_frames() {
        let mut camera = SyntheticCamera::raw(320, 240);
        let policy = EncodePolicy::default();

        let frame = camera.acquire().unwrap();
        let prepared = policy.prepare(&mut camera, frame).unwrap();
        assert!(matches!(prepared, PreparedFrame::Captured(_)));
        assert_eq!(camera.outstanding(), 1);

        prepared.release_to(&mut camera);
        assert_eq!(camera.outstanding(), 0);
    }

    #[test]
    fn test_failed_transcode_still_releases() {
        let mut camera = SyntheticCamera::raw(640, 480);
        camera.fail_transcode(true);

        let frame = camera.acquire().unwrap();
        let result = EncodePolicy::default().prepare(&mut camera, frame);
        assert!(matches!(result, Err(CaptureError::Transcode(_))));
        assert_eq!(camera.outstanding(), 0);
    }
}
