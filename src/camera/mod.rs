//! Camera frame pipeline.
//!
//! ```text
//!   FrameSource ──▶ CaptureTask ──install──▶ FrameSlot ──copy──▶ StreamResponder (per client)
//!                        │                       │
//!                        └──signal──▶ Latch ──▶ PersistenceConsumer ──▶ FileStore
//! ```
//!
//! The capture task is the only writer of the slot. Readers hold the slot
//! lock only to copy a frame out, except the persistence consumer, which
//! keeps it for the whole file write.

mod capture;
#[cfg(feature = "esp32")]
mod esp_camera;
mod frame;
mod host_source;
mod persist;
mod pipeline;
mod slot;
mod stream;

pub use capture::{CaptureTask, CycleOutcome};
#[cfg(feature = "esp32")]
pub use esp_camera::{CameraSettings, EspCamera, EspFrame};
pub use frame::{
    CaptureError, EncodePolicy, Encoding, FrameBuffer, FrameSource, OwnedFrame, PixelFormat,
    PreparedFrame,
};
pub use host_source::DirFrameSource;
#[cfg(feature = "esp32")]
pub use persist::mount_spiffs;
pub use persist::{
    frame_file_name, DirFileStore, FileStore, PersistError, Persisted, PersistenceConsumer,
};
pub use pipeline::{Pipeline, PipelineStats, StatsSnapshot};
pub use slot::{FrameSlot, FrameSnapshot, Latch, SlotGuard};
pub use stream::{
    DirectFeed, FrameFeed, ModeFeed, Next, Skip, SlotFeed, StreamResponder, BOUNDARY,
    STREAM_CONTENT_TYPE,
};
