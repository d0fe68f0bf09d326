//! esp32-camera driver bindings.
//!
//! Pin map of the AI-Thinker ESP32-CAM board. Frame buffers belong to the
//! driver; an [`EspFrame`] gives its buffer back when dropped.

use super::frame::{CaptureError, Encoding, FrameBuffer, FrameSource, PixelFormat};
use core::ptr::NonNull;
use esp_idf_sys::{self as sys, camera, esp};
use log::info;

/// Driver settings chosen at init.
#[derive(Debug, Clone, Copy)]
pub struct CameraSettings {
    /// Sensor output as JPEG (true) or RGB565.
    pub jpeg: bool,
    pub jpeg_quality: u8,
    pub frame_buffers: usize,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            jpeg: true,
            jpeg_quality: 12,
            frame_buffers: 2,
        }
    }
}

/// The camera driver. Only one may exist.
pub struct EspCamera {
    _private: (),
}

impl EspCamera {
    pub fn init(settings: CameraSettings) -> Result<Self, CaptureError> {
        let pixel_format = if settings.jpeg {
            camera::pixformat_t_PIXFORMAT_JPEG
        } else {
            camera::pixformat_t_PIXFORMAT_RGB565
        };

        let config = camera::camera_config_t {
            pin_pwdn: 32,
            pin_reset: -1,
            pin_xclk: 0,
            __bindgen_anon_1: camera::camera_config_t__bindgen_ty_1 { pin_sccb_sda: 26 },
            __bindgen_anon_2: camera::camera_config_t__bindgen_ty_2 { pin_sccb_scl: 27 },
            pin_d7: 35,
            pin_d6: 34,
            pin_d5: 39,
            pin_d4: 36,
            pin_d3: 21,
            pin_d2: 19,
            pin_d1: 18,
            pin_d0: 5,
            pin_vsync: 25,
            pin_href: 23,
            pin_pclk: 22,
            xclk_freq_hz: 20_000_000,
            ledc_timer: camera::ledc_timer_t_LEDC_TIMER_0,
            ledc_channel: camera::ledc_channel_t_LEDC_CHANNEL_0,
            pixel_format,
            frame_size: camera::framesize_t_FRAMESIZE_VGA,
            jpeg_quality: i32::from(settings.jpeg_quality),
            fb_count: settings.frame_buffers,
            fb_location: camera::camera_fb_location_t_CAMERA_FB_IN_PSRAM,
            grab_mode: camera::camera_grab_mode_t_CAMERA_GRAB_LATEST,
            ..Default::default()
        };

        esp!(unsafe { camera::esp_camera_init(&config) })
            .map_err(|e| CaptureError::Init(format!("{}", e)))?;
        info!("Camera initialised");
        Ok(Self { _private: () })
    }
}

impl Drop for EspCamera {
    fn drop(&mut self) {
        unsafe {
            camera::esp_camera_deinit();
        }
    }
}

/// A driver frame buffer.
pub struct EspFrame(NonNull<camera::camera_fb_t>);

// The buffer is owned by whoever holds the EspFrame; the driver does not
// touch it until esp_camera_fb_return.
unsafe impl Send for EspFrame {}

impl EspFrame {
    fn fb(&self) -> &camera::camera_fb_t {
        unsafe { self.0.as_ref() }
    }
}

impl Drop for EspFrame {
    fn drop(&mut self) {
        unsafe { camera::esp_camera_fb_return(self.0.as_ptr()) }
    }
}

impl FrameBuffer for EspFrame {
    fn data(&self) -> &[u8] {
        let fb = self.fb();
        if fb.buf.is_null() {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(fb.buf, fb.len) }
    }

    fn encoding(&self) -> Encoding {
        let fb = self.fb();
        let width = u16::try_from(fb.width).unwrap_or(u16::MAX);
        let height = u16::try_from(fb.height).unwrap_or(u16::MAX);
        let format = match fb.format {
            camera::pixformat_t_PIXFORMAT_JPEG => return Encoding::Jpeg,
            camera::pixformat_t_PIXFORMAT_YUV422 => PixelFormat::Yuv422,
            camera::pixformat_t_PIXFORMAT_GRAYSCALE => PixelFormat::Grayscale,
            camera::pixformat_t_PIXFORMAT_RGB888 => PixelFormat::Rgb888,
            _ => PixelFormat::Rgb565,
        };
        Encoding::Raw {
            width,
            height,
            format,
        }
    }
}

impl FrameSource for EspCamera {
    type Frame = EspFrame;

    fn acquire(&mut self) -> Option<EspFrame> {
        NonNull::new(unsafe { camera::esp_camera_fb_get() }).map(EspFrame)
    }

    fn release(&mut self, frame: EspFrame) {
        drop(frame);
    }

    fn transcode(&mut self, frame: &EspFrame, quality: u8) -> Result<Vec<u8>, CaptureError> {
        let mut out: *mut u8 = core::ptr::null_mut();
        let mut out_len: usize = 0;
        let converted = unsafe {
            camera::frame2jpg(
                frame.0.as_ptr(),
                quality,
                &mut out,
                &mut out_len,
            )
        };
        if !converted || out.is_null() {
            return Err(CaptureError::Transcode("frame2jpg failed".to_string()));
        }

        let jpeg = unsafe { core::slice::from_raw_parts(out, out_len) }.to_vec();
        unsafe { sys::free(out.cast()) };
        Ok(jpeg)
    }
}
