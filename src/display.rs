// Copyright 2025 the ltsm-remote authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Collaborator interfaces to the on-host display and the viewer surface.
//!
//! The channel core never talks to a windowing system directly; the
//! server side drives a [`DisplayAdapter`] and the viewer side paints
//! through a [`ClientSurface`]. [`HeadlessDisplay`] is an in-memory
//! adapter used by the server binary's demo mode and by the tests.

use crate::error::Result;
use crate::framebuffer::{ColorCursor, Framebuffer, Region};
use crate::protocol::PixelFormat;

/// Server-side view of the host display: geometry, damage, input
/// injection, clipboard and bell.
pub trait DisplayAdapter: Send {
    /// Current framebuffer geometry.
    fn size(&self) -> (u16, u16);

    /// Pixel layout of the host framebuffer.
    fn pixel_format(&self) -> PixelFormat;

    /// Full-screen region at the current geometry.
    fn region(&self) -> Region {
        let (w, h) = self.size();
        Region::with_size(w, h)
    }

    /// Damage accumulated since the last poll, if any.
    fn poll_damage(&mut self) -> Option<Region>;

    /// A host-side resolution change since the last poll, if any.
    fn poll_resize(&mut self) -> Option<(u16, u16)>;

    /// Copies `region` into `out` as tightly packed rows in the host
    /// pixel format.
    fn copy_region(&self, region: Region, out: &mut Vec<u8>) -> Result<()>;

    /// Applies a desktop resize requested by the client. Returns false
    /// when the display cannot switch to that geometry.
    fn apply_resize(&mut self, width: u16, height: u16) -> bool;

    fn inject_key(&mut self, keycode: u32, pressed: bool);
    fn inject_button(&mut self, button: u8, x: u16, y: u16, pressed: bool);
    fn inject_motion(&mut self, x: u16, y: u16);

    fn set_clipboard(&mut self, bytes: &[u8]);
    fn get_clipboard(&mut self) -> Option<Vec<u8>>;

    /// True when the host rang the bell since the last poll.
    fn ring(&mut self) -> bool;
}

/// Viewer-side painting surface.
pub trait ClientSurface: Send {
    fn create_window(&mut self, width: u16, height: u16, fullscreen: bool) -> Result<()>;
    fn resize(&mut self, width: u16, height: u16);

    /// Blits decoded pixels (already in the negotiated client format).
    fn upload_region(&mut self, region: Region, pixels: &[u8], format: &PixelFormat);

    /// Flips the frame after all rectangles of an update landed.
    fn present(&mut self);

    fn set_cursor(&mut self, cursor: ColorCursor);
    fn bell(&mut self);

    fn set_clipboard(&mut self, bytes: &[u8]);
    fn get_clipboard(&mut self) -> Option<Vec<u8>>;
}

/// In-memory display adapter: an owned framebuffer plus recorded input,
/// damage and clipboard state.
pub struct HeadlessDisplay {
    fb: Framebuffer,
    damage: Option<Region>,
    resize: Option<(u16, u16)>,
    clipboard: Option<Vec<u8>>,
    bell: bool,
    /// Injected input events, newest last: (keycode/button, pressed).
    pub key_log: Vec<(u32, bool)>,
    pub button_log: Vec<(u8, u16, u16, bool)>,
    pub motion_log: Vec<(u16, u16)>,
}

impl HeadlessDisplay {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            fb: Framebuffer::new(width, height, PixelFormat::rgb888()),
            damage: Some(Region::with_size(width, height)),
            resize: None,
            clipboard: None,
            bell: false,
            key_log: Vec::new(),
            button_log: Vec::new(),
            motion_log: Vec::new(),
        }
    }

    /// Writes pixels and accumulates damage, like a real display would.
    pub fn paint(&mut self, region: Region, pixels: &[u8]) {
        self.fb.put_region(region, pixels);
        self.damage = Some(match self.damage {
            Some(old) => old.join(&region),
            None => region,
        });
    }

    pub fn ring_bell(&mut self) {
        self.bell = true;
    }

    pub fn push_resize(&mut self, width: u16, height: u16) {
        self.resize = Some((width, height));
    }
}

impl DisplayAdapter for HeadlessDisplay {
    fn size(&self) -> (u16, u16) {
        (self.fb.width(), self.fb.height())
    }

    fn pixel_format(&self) -> PixelFormat {
        self.fb.format().clone()
    }

    fn poll_damage(&mut self) -> Option<Region> {
        self.damage.take()
    }

    fn poll_resize(&mut self) -> Option<(u16, u16)> {
        self.resize.take()
    }

    fn copy_region(&self, region: Region, out: &mut Vec<u8>) -> Result<()> {
        out.clear();
        if let Some(pixels) = self.fb.get_region(region) {
            out.extend_from_slice(&pixels);
        }
        Ok(())
    }

    fn apply_resize(&mut self, width: u16, height: u16) -> bool {
        if width == 0 || height == 0 {
            return false;
        }
        self.fb.resize(width, height);
        self.damage = Some(Region::with_size(width, height));
        true
    }

    fn inject_key(&mut self, keycode: u32, pressed: bool) {
        self.key_log.push((keycode, pressed));
    }

    fn inject_button(&mut self, button: u8, x: u16, y: u16, pressed: bool) {
        self.button_log.push((button, x, y, pressed));
    }

    fn inject_motion(&mut self, x: u16, y: u16) {
        self.motion_log.push((x, y));
    }

    fn set_clipboard(&mut self, bytes: &[u8]) {
        self.clipboard = Some(bytes.to_vec());
    }

    fn get_clipboard(&mut self) -> Option<Vec<u8>> {
        self.clipboard.take()
    }

    fn ring(&mut self) -> bool {
        std::mem::take(&mut self.bell)
    }
}

/// Surface that records everything; viewer tests assert against it.
#[derive(Default)]
pub struct NullSurface {
    pub fb: Option<Framebuffer>,
    pub presents: usize,
    pub bells: usize,
    pub clipboard: Option<Vec<u8>>,
}

impl ClientSurface for NullSurface {
    fn create_window(&mut self, width: u16, height: u16, _fullscreen: bool) -> Result<()> {
        self.fb = Some(Framebuffer::new(width, height, PixelFormat::rgb888()));
        Ok(())
    }

    fn resize(&mut self, width: u16, height: u16) {
        if let Some(fb) = &mut self.fb {
            fb.resize(width, height);
        }
    }

    fn upload_region(&mut self, region: Region, pixels: &[u8], format: &PixelFormat) {
        if let Some(fb) = &mut self.fb {
            if fb.format() == format {
                fb.put_region(region, pixels);
            }
        }
    }

    fn present(&mut self) {
        self.presents += 1;
    }

    fn set_cursor(&mut self, _cursor: ColorCursor) {}

    fn bell(&mut self) {
        self.bells += 1;
    }

    fn set_clipboard(&mut self, bytes: &[u8]) {
        self.clipboard = Some(bytes.to_vec());
    }

    fn get_clipboard(&mut self) -> Option<Vec<u8>> {
        self.clipboard.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headless_damage_accumulates_and_clears() {
        let mut display = HeadlessDisplay::new(64, 64);
        assert_eq!(display.poll_damage(), Some(Region::with_size(64, 64)));
        assert_eq!(display.poll_damage(), None);

        display.paint(Region::new(0, 0, 8, 8), &[0u8; 8 * 8 * 4]);
        display.paint(Region::new(32, 32, 8, 8), &[0u8; 8 * 8 * 4]);
        assert_eq!(display.poll_damage(), Some(Region::new(0, 0, 40, 40)));
    }

    #[test]
    fn headless_rejects_zero_resize() {
        let mut display = HeadlessDisplay::new(64, 64);
        assert!(!display.apply_resize(0, 64));
        assert!(display.apply_resize(128, 96));
        assert_eq!(display.size(), (128, 96));
    }
}
