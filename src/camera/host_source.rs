//! Frame source for host builds: replays JPEG files from a directory.

use super::frame::{CaptureError, Encoding, FrameSource, OwnedFrame};
use log::warn;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Cycles through the `.jpg`/`.jpeg` files of a directory in name order.
#[derive(Debug)]
pub struct DirFrameSource {
    files: Vec<PathBuf>,
    next: usize,
}

impl DirFrameSource {
    pub fn open(dir: &Path) -> io::Result<Self> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no JPEG files in {}", dir.display()),
            ));
        }
        Ok(Self { files, next: 0 })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for DirFrameSource {
    type Frame = OwnedFrame;

    fn acquire(&mut self) -> Option<OwnedFrame> {
        let path = &self.files[self.next % self.files.len()];
        self.next = self.next.wrapping_add(1);
        match fs::read(path) {
            Ok(data) => Some(OwnedFrame::new(data, Encoding::Jpeg)),
            Err(e) => {
                warn!("Could not read {}: {}", path.display(), e);
                None
            }
        }
    }

    fn release(&mut self, frame: OwnedFrame) {
        drop(frame);
    }

    fn transcode(&mut self, _frame: &OwnedFrame, _quality: u8) -> Result<Vec<u8>, CaptureError> {
        // Files are already JPEG
        Err(CaptureError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::frame::FrameBuffer;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEMP_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_dir() -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("camstream_frames_{}_{}", std::process::id(), n));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_cycles_through_files() {
        let dir = temp_dir();
        fs::write(dir.join("b.jpg"), b"second").unwrap();
        fs::write(dir.join("a.JPEG"), b"first").unwrap();
        fs::write(dir.join("notes.txt"), b"ignored").unwrap();

        let mut source = DirFrameSource::open(&dir).unwrap();
        assert_eq!(source.len(), 2);

        let frames: Vec<Vec<u8>> = (0..3)
            .map(|_| source.acquire().unwrap().data().to_vec())
            .collect();
        assert_eq!(frames, vec![b"first".to_vec(), b"second".to_vec(), b"first".to_vec()]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_empty_dir_is_error() {
        let dir = temp_dir();
        assert!(DirFrameSource::open(&dir).is_err());
        let _ = fs::remove_dir_all(&dir);
    }
}
