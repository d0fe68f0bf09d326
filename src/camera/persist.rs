//! Persistence consumer: writes published frames to flash.
//!
//! Files are named `frame-<N>.<ext>` in one flat directory, `N` being the
//! picture counter kept in the key-value store. The counter is saved only
//! after the file is fully written, so it never runs behind the files on
//! disk.

use super::frame::{Encoding, FrameBuffer};
use super::pipeline::{Pipeline, PipelineStats};
use crate::store::{self, SharedStore, StoreError};
use crate::wifi::storage::{load_picture_number, save_picture_number};
use log::{debug, info, warn};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long one latch wait lasts before the cancel token is checked again.
const LATCH_POLL: Duration = Duration::from_millis(200);

/// Flat named-file store.
pub trait FileStore: Send {
    fn write_file(&mut self, name: &str, bytes: &[u8]) -> io::Result<()>;
    fn delete_if_exists(&mut self, name: &str) -> io::Result<()>;
}

/// [`FileStore`] over a directory (the SPIFFS mount point on ESP32).
#[derive(Debug, Clone)]
pub struct DirFileStore {
    root: PathBuf,
}

impl DirFileStore {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileStore for DirFileStore {
    fn write_file(&mut self, name: &str, bytes: &[u8]) -> io::Result<()> {
        fs::write(self.root.join(name), bytes)
    }

    fn delete_if_exists(&mut self, name: &str) -> io::Result<()> {
        match fs::remove_file(self.root.join(name)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// File name for picture `number`.
pub fn frame_file_name(number: u32, encoding: &Encoding) -> String {
    format!("frame-{}.{}", number, encoding.extension())
}

/// A frame that made it to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persisted {
    pub name: String,
    pub generation: u64,
    pub counter: u32,
    pub len: usize,
}

/// Persistence errors. None of them stop the consumer.
#[derive(Debug)]
pub enum PersistError {
    /// The frame file could not be replaced or written.
    Write { name: String, source: io::Error },
    /// The file was written but the counter could not be saved.
    Counter(StoreError),
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write { name, source } => write!(f, "writing {} failed: {}", name, source),
            Self::Counter(e) => write!(f, "saving picture counter failed: {}", e),
        }
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Write { source, .. } => Some(source),
            Self::Counter(e) => Some(e),
        }
    }
}

/// Writes the latest frame each time the capture task signals.
pub struct PersistenceConsumer<B, F> {
    pipeline: Pipeline<B>,
    files: F,
    store: SharedStore,
    counter: u32,
}

impl<B: FrameBuffer, F: FileStore> PersistenceConsumer<B, F> {
    /// Create the consumer, loading the picture counter once.
    pub fn new(pipeline: Pipeline<B>, files: F, store: SharedStore) -> Result<Self, StoreError> {
        let counter = load_picture_number(&*store::lock(&store))?;
        info!("Picture counter at {}", counter);
        Ok(Self {
            pipeline,
            files,
            store,
            counter,
        })
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Wait up to `timeout` for the latch, then persist the current frame.
    ///
    /// `Ok(None)` when nothing was signalled or the slot was empty.
    pub fn run_once(&mut self, timeout: Duration) -> Result<Option<Persisted>, PersistError> {
        if !self.pipeline.latch.wait_timeout(timeout) {
            return Ok(None);
        }
        self.persist_current()
    }

    fn persist_current(&mut self) -> Result<Option<Persisted>, PersistError> {
        let stats = &self.pipeline.stats;
        let next = self.counter.wrapping_add(1);

        // The lock is held until the file is complete
        let (name, generation, len) = {
            let slot = self.pipeline.slot.lock();
            let Some(frame) = slot.frame() else {
                debug!("Slot empty, nothing to persist");
                return Ok(None);
            };
            let name = frame_file_name(next, &frame.encoding());
            let written = self
                .files
                .delete_if_exists(&name)
                .and_then(|()| self.files.write_file(&name, frame.data()));
            if let Err(source) = written {
                PipelineStats::record(&stats.write_failures);
                return Err(PersistError::Write { name, source });
            }
            (name, slot.generation(), frame.data().len())
        };

        PipelineStats::record(&stats.frames_written);
        // The file exists either way; never hand out its number again
        self.counter = next;
        save_picture_number(&mut *store::lock(&self.store), next).map_err(PersistError::Counter)?;

        Ok(Some(Persisted {
            name,
            generation,
            counter: next,
            len,
        }))
    }

    /// Persist frames until cancelled.
    pub fn run(mut self, cancel: CancellationToken) {
        info!("Persistence consumer started");
        while !cancel.is_cancelled() {
            match self.run_once(LATCH_POLL) {
                Ok(Some(persisted)) => debug!(
                    "Saved {} ({} bytes, generation {})",
                    persisted.name, persisted.len, persisted.generation
                ),
                Ok(None) => {}
                Err(e) => warn!("{}", e),
            }
        }
        info!("Persistence consumer stopped");
    }
}

/// Mount the SPIFFS partition at `base_path`.
#[cfg(feature = "esp32")]
pub fn mount_spiffs(base_path: &str) -> io::Result<()> {
    use esp_idf_sys::{self as sys, esp};
    use std::ffi::CString;

    let base_path =
        CString::new(base_path).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let config = sys::esp_vfs_spiffs_conf_t {
        base_path: base_path.as_ptr(),
        partition_label: core::ptr::null(),
        max_files: 5,
        format_if_mount_failed: true,
    };
    esp!(unsafe { sys::esp_vfs_spiffs_register(&config) })
        .map_err(|e| io::Error::other(format!("SPIFFS mount failed: {}", e)))?;
    info!("SPIFFS mounted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::frame::{OwnedFrame, PreparedFrame, PixelFormat};
    use crate::store::{shared, MemoryStore};
    use crate::wifi::storage::PICTURE_NUMBER_KEY;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEMP_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_dir() -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("camstream_persist_{}_{}", std::process::id(), n))
    }

    fn publish(pipeline: &Pipeline<OwnedFrame>, bytes: Vec<u8>, encoding: Encoding) {
        let mut slot = pipeline.slot.lock();
        slot.take();
        slot.install(PreparedFrame::Captured(OwnedFrame::new(bytes, encoding)));
        drop(slot);
        pipeline.latch.signal();
    }

    #[test]
    fn test_frame_file_name() {
        assert_eq!(frame_file_name(7, &Encoding::Jpeg), "frame-7.jpg");
        let raw = Encoding::Raw {
            width: 96,
            height: 96,
            format: PixelFormat::Grayscale,
        };
        assert_eq!(frame_file_name(1, &raw), "frame-1.raw");
    }

    #[test]
    fn test_writes_file_and_advances_counter() {
        let dir = temp_dir();
        let pipeline = Pipeline::new();
        let store = shared(MemoryStore::new());
        let files = DirFileStore::new(&dir).unwrap();
        let mut consumer = PersistenceConsumer::new(pipeline.clone(), files, store.clone()).unwrap();

        publish(&pipeline, vec![0xAB; 100], Encoding::Jpeg);
        let persisted = consumer.run_once(Duration::from_millis(10)).unwrap().unwrap();

        assert_eq!(persisted.name, "frame-1.jpg");
        assert_eq!(persisted.counter, 1);
        assert_eq!(fs::read(dir.join("frame-1.jpg")).unwrap().len(), 100);
        assert_eq!(load_picture_number(&*store::lock(&store)).unwrap(), 1);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_counter_resumes_from_store() {
        let dir = temp_dir();
        let mut seeded = MemoryStore::new();
        save_picture_number(&mut seeded, 41).unwrap();
        let pipeline = Pipeline::new();
        let mut consumer =
            PersistenceConsumer::new(pipeline.clone(), DirFileStore::new(&dir).unwrap(), shared(seeded))
                .unwrap();
        assert_eq!(consumer.counter(), 41);

        publish(&pipeline, vec![1; 10], Encoding::Jpeg);
        let persisted = consumer.run_once(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(persisted.name, "frame-42.jpg");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_existing_file_is_replaced() {
        let dir = temp_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("frame-1.jpg"), vec![0; 500]).unwrap();

        let pipeline = Pipeline::new();
        let mut consumer = PersistenceConsumer::new(
            pipeline.clone(),
            DirFileStore::new(&dir).unwrap(),
            shared(MemoryStore::new()),
        )
        .unwrap();

        publish(&pipeline, vec![9; 20], Encoding::Jpeg);
        consumer.run_once(Duration::from_millis(10)).unwrap();
        assert_eq!(fs::read(dir.join("frame-1.jpg")).unwrap(), vec![9; 20]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_no_signal_no_write() {
        let dir = temp_dir();
        let pipeline: Pipeline<OwnedFrame> = Pipeline::new();
        let mut consumer = PersistenceConsumer::new(
            pipeline,
            DirFileStore::new(&dir).unwrap(),
            shared(MemoryStore::new()),
        )
        .unwrap();

        assert_eq!(consumer.run_once(Duration::from_millis(5)).unwrap(), None);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_empty_slot_after_signal() {
        let dir = temp_dir();
        let pipeline: Pipeline<OwnedFrame> = Pipeline::new();
        let mut consumer = PersistenceConsumer::new(
            pipeline.clone(),
            DirFileStore::new(&dir).unwrap(),
            shared(MemoryStore::new()),
        )
        .unwrap();

        pipeline.latch.signal();
        assert_eq!(consumer.run_once(Duration::from_millis(5)).unwrap(), None);
        assert_eq!(consumer.counter(), 0);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_counter_failure_reported_after_write() {
        let dir = temp_dir();
        let mut failing = MemoryStore::new();
        failing.set_fail_writes(true);
        let store = shared(failing);
        let pipeline = Pipeline::new();
        let mut consumer =
            PersistenceConsumer::new(pipeline.clone(), DirFileStore::new(&dir).unwrap(), store.clone())
                .unwrap();

        publish(&pipeline, vec![3; 30], Encoding::Jpeg);
        let result = consumer.run_once(Duration::from_millis(10));

        assert!(matches!(result, Err(PersistError::Counter(_))));
        assert!(dir.join("frame-1.jpg").exists());
        assert_eq!(store::lock(&store).get(PICTURE_NUMBER_KEY).unwrap(), None);
        // The next frame does not overwrite frame-1
        publish(&pipeline, vec![4; 30], Encoding::Jpeg);
        let _ = consumer.run_once(Duration::from_millis(10));
        assert!(dir.join("frame-2.jpg").exists());

        let _ = fs::remove_dir_all(&dir);
    }
}
