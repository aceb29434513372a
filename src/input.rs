//! Touch queue and pointer state.
//!
//! Touch events arrive from arbitrary caller threads; only the protocol
//! thread drains the queue and writes pointer events to the client socket.
//! Consecutive moves coalesce into the latest position so a fast drag cannot
//! flood the queue; presses and releases are never merged.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchAction {
    Down,
    Up,
    Move,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Touch {
    pub action: TouchAction,
    pub x: i32,
    pub y: i32,
}

pub struct TouchQueue {
    queue: Mutex<Vec<Touch>>,
}

impl TouchQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, touch: Touch) {
        let mut queue = self.queue.lock().unwrap();
        if touch.action == TouchAction::Move {
            if let Some(last) = queue.last_mut() {
                if last.action == TouchAction::Move {
                    last.x = touch.x;
                    last.y = touch.y;
                    return;
                }
            }
        }
        queue.push(touch);
    }

    /// Take everything queued so far. Non-blocking, called only by the
    /// protocol thread.
    pub fn drain(&self) -> Vec<Touch> {
        std::mem::take(&mut *self.queue.lock().unwrap())
    }
}

impl Default for TouchQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Last pointer position and button state as recorded by the input bridge.
/// QueryPointer answers from here, not from any live query.
pub struct PointerState {
    x: AtomicI32,
    y: AtomicI32,
    button1_down: AtomicBool,
}

impl PointerState {
    pub fn new() -> Self {
        Self {
            x: AtomicI32::new(0),
            y: AtomicI32::new(0),
            button1_down: AtomicBool::new(false),
        }
    }

    pub fn record_position(&self, x: i32, y: i32) {
        self.x.store(x, Ordering::Relaxed);
        self.y.store(y, Ordering::Relaxed);
    }

    pub fn set_button1(&self, down: bool) {
        self.button1_down.store(down, Ordering::Relaxed);
    }

    pub fn position(&self) -> (i32, i32) {
        (self.x.load(Ordering::Relaxed), self.y.load(Ordering::Relaxed))
    }

    pub fn button1_down(&self) -> bool {
        self.button1_down.load(Ordering::Relaxed)
    }
}

impl Default for PointerState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mv(x: i32, y: i32) -> Touch {
        Touch {
            action: TouchAction::Move,
            x,
            y,
        }
    }

    #[test]
    fn consecutive_moves_coalesce() {
        let q = TouchQueue::new();
        q.push(mv(1, 1));
        q.push(mv(2, 2));
        q.push(mv(3, 3));
        let drained = q.drain();
        assert_eq!(drained, vec![mv(3, 3)]);
    }

    #[test]
    fn down_and_up_are_never_merged() {
        let q = TouchQueue::new();
        q.push(Touch {
            action: TouchAction::Down,
            x: 5,
            y: 5,
        });
        q.push(Touch {
            action: TouchAction::Down,
            x: 6,
            y: 6,
        });
        q.push(Touch {
            action: TouchAction::Up,
            x: 6,
            y: 6,
        });
        assert_eq!(q.drain().len(), 3);
    }

    #[test]
    fn move_does_not_merge_across_press() {
        let q = TouchQueue::new();
        q.push(mv(1, 1));
        q.push(Touch {
            action: TouchAction::Down,
            x: 2,
            y: 2,
        });
        q.push(mv(3, 3));
        q.push(mv(4, 4));
        let drained = q.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[2], mv(4, 4));
    }

    #[test]
    fn drain_empties_the_queue() {
        let q = TouchQueue::new();
        q.push(mv(1, 1));
        assert_eq!(q.drain().len(), 1);
        assert!(q.drain().is_empty());
    }
}
