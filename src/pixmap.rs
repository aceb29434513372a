//! Offscreen pixmaps: independent pixel buffers, never composited directly.

use std::collections::HashMap;

use crate::wire::BACKGROUND_PIXEL;

pub struct Pixmap {
    pub width: u32,
    pub height: u32,
    /// Wire-layout pixels, one u32 per pixel, same format as the framebuffer.
    pub pixels: Vec<u32>,
}

pub struct PixmapStore {
    pixmaps: HashMap<u32, Pixmap>,
}

impl PixmapStore {
    pub fn new() -> Self {
        Self {
            pixmaps: HashMap::new(),
        }
    }

    pub fn create(&mut self, pid: u32, width: u32, height: u32) {
        let pixels = vec![BACKGROUND_PIXEL; (width as usize) * (height as usize)];
        self.pixmaps.insert(
            pid,
            Pixmap {
                width,
                height,
                pixels,
            },
        );
    }

    pub fn free(&mut self, pid: u32) -> bool {
        self.pixmaps.remove(&pid).is_some()
    }

    pub fn get(&self, pid: u32) -> Option<&Pixmap> {
        self.pixmaps.get(&pid)
    }

    pub fn get_mut(&mut self, pid: u32) -> Option<&mut Pixmap> {
        self.pixmaps.get_mut(&pid)
    }

    pub fn clear(&mut self) {
        self.pixmaps.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pixmaps.is_empty()
    }
}

impl Default for PixmapStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_pixmap_is_background_filled() {
        let mut store = PixmapStore::new();
        store.create(0x20_0001, 4, 3);
        let pm = store.get(0x20_0001).unwrap();
        assert_eq!(pm.pixels.len(), 12);
        assert!(pm.pixels.iter().all(|&p| p == BACKGROUND_PIXEL));
    }

    #[test]
    fn free_removes_entry() {
        let mut store = PixmapStore::new();
        store.create(7, 2, 2);
        assert!(store.free(7));
        assert!(!store.free(7));
        assert!(store.get(7).is_none());
    }
}
