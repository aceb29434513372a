//! Per-display lifecycle phases, shared between the display registry and its
//! owning module.
//!
//! A detach requested while a plugin UI is being instantiated must not run
//! concurrently with the instantiation; it is recorded as deferred and
//! honored once the create path returns.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Detached,
    Attached,
    Creating,
    Ready,
    Destroying,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    phase: Phase,
    plugin_slot: Option<usize>,
    detach_deferred: bool,
}

impl Default for Record {
    fn default() -> Self {
        Self {
            phase: Phase::Detached,
            plugin_slot: None,
            detach_deferred: false,
        }
    }
}

/// Outcome of a detach request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachDecision {
    /// Teardown may proceed now.
    Proceed,
    /// Plugin instantiation is in flight; teardown was recorded for later.
    Deferred,
}

pub struct StateMap {
    inner: Mutex<HashMap<u32, Record>>,
}

impl StateMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn phase(&self, display: u32) -> Phase {
        self.inner
            .lock()
            .unwrap()
            .get(&display)
            .map(|r| r.phase)
            .unwrap_or(Phase::Detached)
    }

    pub fn plugin_slot(&self, display: u32) -> Option<usize> {
        self.inner
            .lock()
            .unwrap()
            .get(&display)
            .and_then(|r| r.plugin_slot)
    }

    pub fn set_attached(&self, display: u32) {
        let mut inner = self.inner.lock().unwrap();
        let rec = inner.entry(display).or_default();
        rec.phase = Phase::Attached;
        rec.detach_deferred = false;
    }

    /// Enter `Creating` for the given plugin slot. Refused while a teardown
    /// is running.
    pub fn begin_create(&self, display: u32, plugin_slot: usize) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let rec = inner.entry(display).or_default();
        match rec.phase {
            Phase::Destroying | Phase::Detached => false,
            _ => {
                rec.phase = Phase::Creating;
                rec.plugin_slot = Some(plugin_slot);
                true
            }
        }
    }

    /// Leave `Creating`. Returns true if a detach arrived meanwhile and is
    /// now due; the deferred flag is consumed.
    #[must_use]
    pub fn finish_create(&self, display: u32, success: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let rec = inner.entry(display).or_default();
        if rec.phase == Phase::Creating {
            rec.phase = if success { Phase::Ready } else { Phase::Attached };
        }
        if !success {
            rec.plugin_slot = None;
        }
        std::mem::take(&mut rec.detach_deferred)
    }

    pub fn request_detach(&self, display: u32) -> DetachDecision {
        let mut inner = self.inner.lock().unwrap();
        let rec = inner.entry(display).or_default();
        match rec.phase {
            Phase::Creating => {
                rec.detach_deferred = true;
                DetachDecision::Deferred
            }
            Phase::Destroying => DetachDecision::Proceed,
            _ => {
                rec.phase = Phase::Destroying;
                DetachDecision::Proceed
            }
        }
    }

    pub fn finish_detach(&self, display: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(rec) = inner.get_mut(&display) {
            rec.phase = Phase::Detached;
            rec.plugin_slot = None;
            rec.detach_deferred = false;
        }
    }

    pub fn is_creating(&self, display: u32) -> bool {
        self.phase(display) == Phase::Creating
    }

    pub fn remove(&self, display: u32) {
        self.inner.lock().unwrap().remove(&display);
    }
}

impl Default for StateMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detach_during_create_is_deferred() {
        let states = StateMap::new();
        states.set_attached(7);
        assert!(states.begin_create(7, 0));
        assert_eq!(states.request_detach(7), DetachDecision::Deferred);
        // still creating: the teardown did not interleave
        assert_eq!(states.phase(7), Phase::Creating);
        assert!(states.finish_create(7, true));
    }

    #[test]
    fn detach_outside_create_proceeds() {
        let states = StateMap::new();
        states.set_attached(7);
        assert_eq!(states.request_detach(7), DetachDecision::Proceed);
        assert_eq!(states.phase(7), Phase::Destroying);
        states.finish_detach(7);
        assert_eq!(states.phase(7), Phase::Detached);
    }

    #[test]
    fn create_refused_while_destroying() {
        let states = StateMap::new();
        states.set_attached(7);
        let _ = states.request_detach(7);
        assert!(!states.begin_create(7, 0));
    }

    #[test]
    fn failed_create_returns_to_attached() {
        let states = StateMap::new();
        states.set_attached(7);
        assert!(states.begin_create(7, 3));
        assert_eq!(states.plugin_slot(7), Some(3));
        assert!(!states.finish_create(7, false));
        assert_eq!(states.phase(7), Phase::Attached);
        assert_eq!(states.plugin_slot(7), None);
    }

    #[test]
    fn deferred_flag_is_consumed_once() {
        let states = StateMap::new();
        states.set_attached(7);
        assert!(states.begin_create(7, 0));
        let _ = states.request_detach(7);
        assert!(states.finish_create(7, true));
        assert!(states.begin_create(7, 1));
        assert!(!states.finish_create(7, true));
    }
}
