//! The shared frame slot and the capture latch.
//!
//! The slot holds at most one published frame. Only the capture task
//! installs into it; readers either take a [`FrameSnapshot`] (a copy made
//! while the lock is held) or work on the frame inside the lock, as the
//! persistence consumer does. Nothing hands out a reference that outlives
//! the lock.

use super::frame::{Encoding, FrameBuffer, PreparedFrame};
use log::warn;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct SlotState<B> {
    frame: Option<PreparedFrame<B>>,
    /// Incremented on every install.
    generation: u64,
}

/// Single-frame buffer shared between the capture task and its readers.
pub struct FrameSlot<B> {
    state: Mutex<SlotState<B>>,
    published: Condvar,
}

impl<B: FrameBuffer> Default for FrameSlot<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: FrameBuffer> FrameSlot<B> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                frame: None,
                generation: 0,
            }),
            published: Condvar::new(),
        }
    }

    /// Take the slot lock.
    pub fn lock(&self) -> SlotGuard<'_, B> {
        SlotGuard {
            slot: self,
            state: self.state.lock().unwrap_or_else(PoisonError::into_inner),
            installed: false,
        }
    }

    /// Generation of the last install.
    pub fn generation(&self) -> u64 {
        self.lock().generation()
    }

    /// Copy the current frame, if any.
    pub fn snapshot(&self) -> Option<FrameSnapshot> {
        self.lock().snapshot()
    }

    /// Wait up to `timeout` for a frame newer than generation `after`.
    pub fn wait_newer(&self, after: u64, timeout: Duration) -> Option<FrameSnapshot> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if state.generation > after {
                if let Some(frame) = &state.frame {
                    return Some(FrameSnapshot::copy(frame, state.generation));
                }
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (next, result) = self
                .published
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
            if result.timed_out() && state.generation <= after {
                return None;
            }
        }
    }
}

/// Exclusive access to the slot.
///
/// Waiters in [`FrameSlot::wait_newer`] are woken when a guard that
/// installed a frame is dropped.
pub struct SlotGuard<'a, B: FrameBuffer> {
    slot: &'a FrameSlot<B>,
    state: MutexGuard<'a, SlotState<B>>,
    installed: bool,
}

impl<B: FrameBuffer> SlotGuard<'_, B> {
    /// Remove the current frame. The caller owns it and must release it.
    pub fn take(&mut self) -> Option<PreparedFrame<B>> {
        self.state.frame.take()
    }

    /// Publish a frame and return its generation.
    ///
    /// The slot must have been emptied with [`Self::take`] first.
    pub fn install(&mut self, frame: PreparedFrame<B>) -> u64 {
        if self.state.frame.replace(frame).is_some() {
            warn!("Frame slot was not emptied before install");
        }
        self.state.generation += 1;
        self.installed = true;
        self.state.generation
    }

    pub fn frame(&self) -> Option<&PreparedFrame<B>> {
        self.state.frame.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    pub fn snapshot(&self) -> Option<FrameSnapshot> {
        self.state
            .frame
            .as_ref()
            .map(|frame| FrameSnapshot::copy(frame, self.state.generation))
    }
}

impl<B: FrameBuffer> Drop for SlotGuard<'_, B> {
    fn drop(&mut self) {
        if self.installed {
            self.slot.published.notify_all();
        }
    }
}

/// Private copy of a published frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSnapshot {
    pub data: Vec<u8>,
    pub encoding: Encoding,
    pub generation: u64,
}

impl FrameSnapshot {
    fn copy<B: FrameBuffer>(frame: &PreparedFrame<B>, generation: u64) -> Self {
        Self {
            data: frame.data().to_vec(),
            encoding: frame.encoding(),
            generation,
        }
    }
}

/// Binary wakeup from the capture task to the persistence consumer.
///
/// A signal stays set until a waiter consumes it; signals while set
/// coalesce into one.
#[derive(Debug, Default)]
pub struct Latch {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the latch and wake one waiter.
    pub fn signal(&self) {
        let mut set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        *set = true;
        self.cond.notify_one();
    }

    /// Wait up to `timeout` and consume the signal. `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut set, _) = self
            .cond
            .wait_timeout_while(set, timeout, |set| !*set)
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *set, false)
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
