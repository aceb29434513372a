//! The shared framebuffer and the dirty signal between the protocol and
//! compositor threads.
//!
//! Pixels are stored in the wire's native byte layout (one `u32` per pixel,
//! little-endian B,G,R,A) so GetImage read-back needs no conversion. The
//! compositor snapshots the buffer under a short-held lock and clears the
//! dirty flag before any GPU work begins, so writes landing during rendering
//! are not lost.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::wire::BACKGROUND_PIXEL;

pub struct Framebuffer {
    pub pixels: Vec<u32>,
    /// Logical plugin size, fixed by the first CreateWindow. Zero until then.
    pub width: u32,
    pub height: u32,
    /// Size from the first CreateWindow, before any client resize. Geometry
    /// queries for the root window answer with this, scaled.
    pub original_width: u32,
    pub original_height: u32,
}

impl Framebuffer {
    pub fn new() -> Self {
        Self {
            pixels: Vec::new(),
            width: 0,
            height: 0,
            original_width: 0,
            original_height: 0,
        }
    }

    pub fn has_content(&self) -> bool {
        self.width > 0 && self.height > 0 && !self.pixels.is_empty()
    }

    /// Fix the logical size from the first top-level window and fill with the
    /// background color.
    pub fn init_plugin_size(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.original_width = width;
        self.original_height = height;
        self.pixels = vec![BACKGROUND_PIXEL; (width as usize) * (height as usize)];
    }

    /// Resize, preserving the overlapping region of existing content. Newly
    /// exposed pixels get the background color.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == self.width && height == self.height {
            return;
        }
        let mut next = vec![BACKGROUND_PIXEL; (width as usize) * (height as usize)];
        let copy_w = width.min(self.width) as usize;
        let copy_h = height.min(self.height) as usize;
        for row in 0..copy_h {
            let src = row * self.width as usize;
            let dst = row * width as usize;
            next[dst..dst + copy_w].copy_from_slice(&self.pixels[src..src + copy_w]);
        }
        self.pixels = next;
        self.width = width;
        self.height = height;
    }

    /// Copy the current contents into a staging buffer (compositor-owned).
    pub fn snapshot_into(&self, staging: &mut Vec<u32>) {
        staging.clear();
        staging.extend_from_slice(&self.pixels);
    }
}

impl Default for Framebuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Dirty flag plus condition variable: the only paint synchronization between
/// the protocol and compositor threads.
pub struct FrameSignal {
    dirty: Mutex<bool>,
    cv: Condvar,
}

impl FrameSignal {
    pub fn new() -> Self {
        Self {
            dirty: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn mark(&self) {
        *self.dirty.lock().unwrap() = true;
        self.cv.notify_one();
    }

    pub fn clear(&self) {
        *self.dirty.lock().unwrap() = false;
    }

    pub fn is_dirty(&self) -> bool {
        *self.dirty.lock().unwrap()
    }

    /// Block until the flag is set or the timeout elapses; returns the flag.
    /// Wakes spuriously on shutdown via [`FrameSignal::wake_all`].
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.dirty.lock().unwrap();
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |dirty| !*dirty)
            .unwrap();
        *guard
    }

    /// Wake every waiter regardless of the flag (used on shutdown).
    pub fn wake_all(&self) {
        self.cv.notify_all();
    }
}

impl Default for FrameSignal {
    fn default() -> Self {
        Self::new()
    }
}
