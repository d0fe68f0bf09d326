//! In-process stand-ins for the radio and the camera sensor.
//!
//! Both are used by the unit and integration tests and by host runs that
//! have no real hardware behind them. [`ScriptedLink`] answers link
//! requests with [`LinkEvent`]s according to a small script held in a
//! shared [`LinkLog`]; [`SyntheticCamera`] hands out frames whose bytes all
//! carry the same value, so a reader can tell a torn frame apart.

use crate::camera::{CaptureError, Encoding, FrameBuffer, FrameSource, PixelFormat};
use crate::config::WifiCredential;
use crate::network::{LinkDriver, LinkEvent, NetworkError};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::UnboundedSender;

/// Address handed out on a successful association.
pub const SIM_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

/// A request made to a [`ScriptedLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    Start,
    Disconnect,
    Configure(Vec<u8>),
    Connect,
}

#[derive(Debug)]
struct LinkScript {
    events: UnboundedSender<LinkEvent>,
    calls: Vec<LinkCall>,
    accepted: HashSet<Vec<u8>>,
    configured: Option<Vec<u8>>,
    associated: bool,
    silent: bool,
    fail_start: bool,
}

impl LinkScript {
    fn emit(&self, event: LinkEvent) {
        // Receiver gone means the machine was dropped; nothing to tell
        let _ = self.events.send(event);
    }
}

/// Test-side view of a [`ScriptedLink`]: records its calls and steers its
/// answers.
#[derive(Debug, Clone)]
pub struct LinkLog {
    inner: Arc<Mutex<LinkScript>>,
}

impl LinkLog {
    fn lock(&self) -> MutexGuard<'_, LinkScript> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> Vec<LinkCall> {
        self.lock().calls.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| **call == LinkCall::Connect)
            .count()
    }

    /// Let connects to `ssid` succeed.
    pub fn accept(&self, ssid: &str) {
        self.lock().accepted.insert(ssid.as_bytes().to_vec());
    }

    /// When silent, connects produce no event at all.
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    pub fn fail_start(&self) {
        self.lock().fail_start = true;
    }

    /// Simulate the access point going away.
    pub fn drop_link(&self) {
        let mut script = self.lock();
        if script.associated {
            script.associated = false;
            script.emit(LinkEvent::Disconnected);
        }
    }

    pub fn last_configured(&self) -> Option<Vec<u8>> {
        self.lock().configured.clone()
    }
}

/// A station interface that answers from a script.
#[derive(Debug)]
pub struct ScriptedLink {
    log: LinkLog,
}

impl ScriptedLink {
    pub fn new(events: UnboundedSender<LinkEvent>) -> (Self, LinkLog) {
        let log = LinkLog {
            inner: Arc::new(Mutex::new(LinkScript {
                events,
                calls: Vec::new(),
                accepted: HashSet::new(),
                configured: None,
                associated: false,
                silent: false,
                fail_start: false,
            })),
        };
        (Self { log: log.clone() }, log)
    }
}

impl LinkDriver for ScriptedLink {
    fn start(&mut self) -> Result<(), NetworkError> {
        let mut script = self.log.lock();
        script.calls.push(LinkCall::Start);
        if script.fail_start {
            return Err(NetworkError::Driver("radio did not start".to_string()));
        }
        script.emit(LinkEvent::StationStarted);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<bool, NetworkError> {
        let mut script = self.log.lock();
        script.calls.push(LinkCall::Disconnect);
        if !script.associated {
            return Ok(false);
        }
        script.associated = false;
        script.emit(LinkEvent::Disconnected);
        Ok(true)
    }

    fn configure(&mut self, credential: &WifiCredential) -> Result<(), NetworkError> {
        let mut script = self.log.lock();
        let ssid = credential.ssid().to_vec();
        script.calls.push(LinkCall::Configure(ssid.clone()));
        script.configured = Some(ssid);
        Ok(())
    }

    fn connect(&mut self) -> Result<(), NetworkError> {
        let mut script = self.log.lock();
        script.calls.push(LinkCall::Connect);
        if script.silent {
            return Ok(());
        }
        let accepted = script
            .configured
            .as_ref()
            .is_some_and(|ssid| script.accepted.contains(ssid));
        if accepted {
            script.associated = true;
            script.emit(LinkEvent::GotIp(SIM_ADDRESS));
        } else {
            script.emit(LinkEvent::Disconnected);
        }
        Ok(())
    }
}

/// A frame from a [`SyntheticCamera`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticFrame {
    data: Vec<u8>,
    encoding: Encoding,
}

impl FrameBuffer for SyntheticFrame {
    fn data(&self) -> &[u8] {
        &self.data
    }

    fn encoding(&self) -> Encoding {
        self.encoding
    }
}

/// A sensor that counts its outstanding buffers.
#[derive(Debug)]
pub struct SyntheticCamera {
    encoding: Encoding,
    size: usize,
    acquired: u64,
    fail_every: Option<u64>,
    fail_transcode: bool,
    outstanding: usize,
    max_outstanding_at_acquire: usize,
}

impl SyntheticCamera {
    /// JPEG frames of `size` bytes.
    pub fn jpeg(size: usize) -> Self {
        Self::with_encoding(Encoding::Jpeg, size)
    }

    /// RGB565 frames.
    pub fn raw(width: u16, height: u16) -> Self {
        let size = usize::from(width) * usize::from(height) * 2;
        Self::with_encoding(
            Encoding::Raw {
                width,
                height,
                format: PixelFormat::Rgb565,
            },
            size,
        )
    }

    fn with_encoding(encoding: Encoding, size: usize) -> Self {
        Self {
            encoding,
            size,
            acquired: 0,
            fail_every: None,
            fail_transcode: false,
            outstanding: 0,
            max_outstanding_at_acquire: 0,
        }
    }

    /// Make every `n`th acquire (counting from 1) come back empty.
    pub fn fail_every(&mut self, n: u64) {
        self.fail_every = (n > 0).then_some(n);
    }

    pub fn fail_transcode(&mut self, fail: bool) {
        self.fail_transcode = fail;
    }

    /// Frames acquired and not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Highest number of frames still held by the caller at the moment it
    /// asked for another one.
    pub fn max_outstanding_at_acquire(&self) -> usize {
        self.max_outstanding_at_acquire
    }
}

impl FrameSource for SyntheticCamera {
    type Frame = SyntheticFrame;

    fn acquire(&mut self) -> Option<SyntheticFrame> {
        self.max_outstanding_at_acquire = self.max_outstanding_at_acquire.max(self.outstanding);
        self.acquired += 1;
        if self.fail_every.is_some_and(|n| self.acquired % n == 0) {
            return None;
        }
        self.outstanding += 1;
        let fill = (self.acquired % 251) as u8;
        Some(SyntheticFrame {
            data: vec![fill; self.size],
            encoding: self.encoding,
        })
    }

    fn release(&mut self, frame: SyntheticFrame) {
        drop(frame);
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    fn transcode(&mut self, frame: &SyntheticFrame, _quality: u8) -> Result<Vec<u8>, CaptureError> {
        if self.fail_transcode {
            return Err(CaptureError::Transcode("synthetic encoder failure".to_string()));
        }
        // SOI, a short body taken from the frame, EOI
        let body = &frame.data[..frame.data.len().min(64)];
        let mut jpeg = Vec::with_capacity(body.len() + 4);
        jpeg.extend_from_slice(&[0xFF, 0xD8]);
        jpeg.extend_from_slice(body);
        jpeg.extend_from_slice(&[0xFF, 0xD9]);
        Ok(jpeg)
    }
}
