//! Per-display-number instance: owns the worker threads, the shared state
//! between them, and the host-facing lifecycle/input surface.
//!
//! Thread model per instance: the protocol thread is the sole owner of the
//! sockets, the compositor thread the sole owner of the presentation
//! surface, and the ui worker the sole owner of calls into the hosted client
//! library. Caller threads only enqueue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::framebuffer::{FrameSignal, Framebuffer};
use crate::input::{PointerState, Touch, TouchAction, TouchQueue};
use crate::renderer::{self, PresentTarget};
use crate::server;
use crate::state::{DetachDecision, StateMap};
use crate::window::WindowMap;
use crate::wire::ROOT_WINDOW_ID;
use crate::worker::{IdleCallback, UiWorker};

/// Best-effort wait for the listener to come up.
const LISTEN_WAIT: Duration = Duration::from_millis(10);
const LISTEN_WAIT_TRIES: u32 = 100;
/// Bounded wait for the compositor thread to confirm exit.
const COMPOSITOR_EXIT_WAIT: Duration = Duration::from_millis(500);

/// Exit confirmation from the compositor thread.
pub(crate) struct ExitGate {
    state: Mutex<bool>,
    cv: Condvar,
}

impl ExitGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn set(&self) {
        *self.state.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn reset(&self) {
        *self.state.lock().unwrap() = false;
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.state.lock().unwrap();
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |exited| !*exited)
            .unwrap();
        *guard
    }
}

/// State shared between the three owned threads and caller threads.
pub(crate) struct Shared {
    pub number: u32,
    pub fb: Mutex<Framebuffer>,
    pub windows: Mutex<WindowMap>,
    pub frame: FrameSignal,
    pub touch: TouchQueue,
    pub pointer: PointerState,
    /// Protocol thread keep-alive.
    pub running: AtomicBool,
    /// Graceful teardown: the protocol thread sends DestroyNotify and waits
    /// for the client to go away before the socket is force-closed.
    pub closing_gracefully: AtomicBool,
    /// Ask the protocol thread to Expose every window (compositor resume).
    pub resume_expose: AtomicBool,
    pub listening: AtomicBool,
    pub client_connected: AtomicBool,
    pub compositor_running: AtomicBool,
    pub compositor_exited: ExitGate,
    pub present: Mutex<Option<PresentTarget>>,
    surface_width: AtomicU32,
    surface_height: AtomicU32,
    ui_scale_bits: AtomicU32,
}

impl Shared {
    fn new(number: u32) -> Self {
        Self {
            number,
            fb: Mutex::new(Framebuffer::new()),
            windows: Mutex::new(WindowMap::new()),
            frame: FrameSignal::new(),
            touch: TouchQueue::new(),
            pointer: PointerState::new(),
            running: AtomicBool::new(false),
            closing_gracefully: AtomicBool::new(false),
            resume_expose: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            client_connected: AtomicBool::new(false),
            compositor_running: AtomicBool::new(false),
            compositor_exited: ExitGate::new(),
            present: Mutex::new(None),
            surface_width: AtomicU32::new(0),
            surface_height: AtomicU32::new(0),
            ui_scale_bits: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    pub fn surface_size(&self) -> (u32, u32) {
        (
            self.surface_width.load(Ordering::Relaxed),
            self.surface_height.load(Ordering::Relaxed),
        )
    }

    fn set_surface_dims(&self, width: u32, height: u32) {
        self.surface_width.store(width, Ordering::Relaxed);
        self.surface_height.store(height, Ordering::Relaxed);
    }

    pub fn ui_scale(&self) -> f32 {
        f32::from_bits(self.ui_scale_bits.load(Ordering::Relaxed))
    }

    fn set_ui_scale(&self, scale: f32) {
        self.ui_scale_bits.store(scale.to_bits(), Ordering::Relaxed);
    }
}

struct Threads {
    protocol: Option<thread::JoinHandle<()>>,
    compositor: Option<thread::JoinHandle<()>>,
}

/// One embedded X11 display. Listens on 127.0.0.1 at the base port plus the
/// display number once attached.
pub struct VirtualDisplay {
    number: u32,
    shared: Arc<Shared>,
    states: Arc<StateMap>,
    worker: Mutex<Option<Arc<UiWorker>>>,
    threads: Mutex<Threads>,
}

impl VirtualDisplay {
    pub(crate) fn new(number: u32, states: Arc<StateMap>) -> Self {
        Self {
            number,
            shared: Arc::new(Shared::new(number)),
            states,
            worker: Mutex::new(None),
            threads: Mutex::new(Threads {
                protocol: None,
                compositor: None,
            }),
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    /// Root window id handed to clients for top-level window creation.
    pub fn root_window_id(&self) -> u32 {
        ROOT_WINDOW_ID
    }

    /// Attach a presentation surface and start the display. `window` is any
    /// wgpu-compatible surface target (e.g. an `Arc<winit::window::Window>`).
    pub fn attach(
        &self,
        window: impl Into<wgpu::SurfaceTarget<'static>>,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let surface = instance
            .create_surface(window)
            .context("create presentation surface")?;
        *self.shared.present.lock().unwrap() = Some(PresentTarget {
            instance,
            surface,
            width: width.max(1),
            height: height.max(1),
        });
        self.start(width, height)
    }

    /// Start the display without a presentation surface. The protocol server
    /// runs normally; frames are composited once a surface is attached.
    pub fn attach_headless(&self, width: u32, height: u32) -> Result<()> {
        self.start(width, height)
    }

    fn start(&self, width: u32, height: u32) -> Result<()> {
        let mut threads = self.threads.lock().unwrap();
        if threads.protocol.is_some() {
            bail!("display {} already attached", self.number);
        }
        self.shared.set_surface_dims(width.max(1), height.max(1));
        self.shared.running.store(true, Ordering::Release);
        self.shared
            .closing_gracefully
            .store(false, Ordering::Release);
        self.shared.resume_expose.store(false, Ordering::Release);
        self.shared.listening.store(false, Ordering::Release);

        let proto_shared = Arc::clone(&self.shared);
        threads.protocol = Some(
            thread::Builder::new()
                .name(format!("x11host-proto-{}", self.number))
                .spawn(move || server::protocol_thread(proto_shared))
                .context("spawn protocol thread")?,
        );

        self.shared
            .compositor_running
            .store(true, Ordering::Release);
        self.shared.compositor_exited.reset();
        let comp_shared = Arc::clone(&self.shared);
        threads.compositor = Some(
            thread::Builder::new()
                .name(format!("x11host-comp-{}", self.number))
                .spawn(move || renderer::compositor_thread(comp_shared))
                .context("spawn compositor thread")?,
        );
        drop(threads);

        *self.worker.lock().unwrap() = Some(Arc::new(UiWorker::start(self.number)));

        // Best effort: the instance continues even if the listener is slow.
        for _ in 0..LISTEN_WAIT_TRIES {
            if self.shared.listening.load(Ordering::Acquire) {
                break;
            }
            thread::sleep(LISTEN_WAIT);
        }
        if !self.shared.listening.load(Ordering::Acquire) {
            log::warn!(
                "display {}: server not listening after {:?} (continuing)",
                self.number,
                LISTEN_WAIT * LISTEN_WAIT_TRIES
            );
        }
        self.states.set_attached(self.number);
        log::info!("display {} attached {width}x{height}", self.number);
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.threads.lock().unwrap().protocol.is_some()
    }

    /// Signal teardown without joining. Returns [`DetachDecision::Deferred`]
    /// when plugin instantiation is in flight for this display.
    pub fn signal_detach(&self) -> DetachDecision {
        match self.states.request_detach(self.number) {
            DetachDecision::Deferred => {
                log::info!(
                    "display {}: detach deferred (plugin instantiation in flight)",
                    self.number
                );
                DetachDecision::Deferred
            }
            DetachDecision::Proceed => {
                if !self.shared.closing_gracefully.swap(true, Ordering::AcqRel) {
                    log::info!("display {}: graceful teardown initiated", self.number);
                }
                DetachDecision::Proceed
            }
        }
    }

    /// Full staged teardown. Returns [`DetachDecision::Deferred`] without
    /// touching anything if plugin instantiation is in flight.
    pub fn detach(&self) -> DetachDecision {
        if !self.is_attached() {
            return DetachDecision::Proceed;
        }
        // A deferred detach must not start any teardown stage.
        if self.states.is_creating(self.number) {
            return self.signal_detach();
        }
        // 1. Stop the compositor and wait for confirmation before the
        //    presentation surface may be released.
        self.stop_compositor();
        // 2. Mark the protocol thread as closing gracefully.
        if self.signal_detach() == DetachDecision::Deferred {
            return DetachDecision::Deferred;
        }
        // 3. Join the ui worker; its queue drains first.
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.stop();
        }
        // 4. Join the protocol thread; it emits DestroyNotify and waits for
        //    the client to disconnect before force-closing. The sockets are
        //    owned by that thread and close with it.
        let mut threads = self.threads.lock().unwrap();
        if let Some(handle) = threads.protocol.take() {
            if handle.join().is_err() {
                log::error!("display {}: protocol thread panicked", self.number);
            }
        }
        if let Some(handle) = threads.compositor.take() {
            if self.shared.compositor_exited.is_set() && handle.join().is_err() {
                log::error!("display {}: compositor thread panicked", self.number);
            }
        }
        drop(threads);
        self.shared.running.store(false, Ordering::Release);
        // 5. Release the presentation surface and graphics context last.
        *self.shared.present.lock().unwrap() = None;
        self.states.finish_detach(self.number);
        log::info!("display {} detached", self.number);
        DetachDecision::Proceed
    }

    /// Pause presentation without tearing down the display. Waits (bounded)
    /// until the compositor thread confirms it has exited.
    pub fn stop_compositor(&self) {
        self.shared
            .compositor_running
            .store(false, Ordering::Release);
        self.shared.frame.wake_all();
        if !self.shared.compositor_exited.wait(COMPOSITOR_EXIT_WAIT) {
            log::warn!(
                "display {}: timeout waiting for compositor exit",
                self.number
            );
        }
    }

    /// Resume (or restart after a presentation failure) the compositor.
    pub fn start_compositor(&self) {
        let mut threads = self.threads.lock().unwrap();
        if let Some(handle) = threads.compositor.take() {
            if self.shared.compositor_exited.is_set() {
                if handle.join().is_err() {
                    log::error!("display {}: compositor thread panicked", self.number);
                }
            } else {
                // Still alive: re-arm the flags and kick a frame.
                threads.compositor = Some(handle);
                self.shared
                    .compositor_running
                    .store(true, Ordering::Release);
                self.shared.frame.mark();
                return;
            }
        }
        self.shared.compositor_exited.reset();
        self.shared
            .compositor_running
            .store(true, Ordering::Release);
        let comp_shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name(format!("x11host-comp-{}", self.number))
            .spawn(move || renderer::compositor_thread(comp_shared))
        {
            Ok(handle) => threads.compositor = Some(handle),
            Err(e) => {
                log::error!("display {}: compositor respawn failed: {e}", self.number);
                return;
            }
        }
        drop(threads);
        // The plugin only repaints what receives events; ask the protocol
        // thread to Expose everything so the whole UI comes back.
        self.shared.resume_expose.store(true, Ordering::Release);
        self.shared.frame.mark();
        log::info!("display {}: compositor restarted", self.number);
    }

    /// Update presentation dimensions (e.g. on a host resize).
    pub fn set_surface_size(&self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.shared.set_surface_dims(width, height);
        if let Some(target) = self.shared.present.lock().unwrap().as_mut() {
            target.width = width;
            target.height = height;
        }
        self.shared.frame.mark();
    }

    /// Request a present. Restarts the compositor if it died with the
    /// surface (e.g. screen off).
    pub fn request_frame(&self) {
        if self.shared.compositor_exited.is_set() {
            log::info!("display {}: compositor dead, restarting", self.number);
            self.start_compositor();
            return;
        }
        self.shared.frame.mark();
    }

    /// Inject a pointer action in presentation-surface coordinates. Safe
    /// from any thread; the protocol thread delivers the events.
    pub fn inject_touch(&self, action: TouchAction, x: i32, y: i32) {
        if !self.shared.client_connected.load(Ordering::Acquire) {
            return;
        }
        let (fx, fy) = self.map_to_frame(x, y);
        self.shared.touch.push(Touch {
            action,
            x: fx,
            y: fy,
        });
    }

    /// Does this point land on a live widget rather than plugin background?
    /// Single-window plugins treat the whole window as interactive;
    /// multi-window plugins only their sub-windows.
    pub fn is_widget_at(&self, x: i32, y: i32) -> bool {
        let (fx, fy) = self.map_to_frame(x, y);
        let windows = self.shared.windows.lock().unwrap();
        let hit = windows.hit_test(fx, fy);
        let top = windows.top_level();
        if windows.len() <= 1 {
            hit.wid != ROOT_WINDOW_ID
        } else {
            hit.wid != ROOT_WINDOW_ID && Some(hit.wid) != top
        }
    }

    fn map_to_frame(&self, x: i32, y: i32) -> (i32, i32) {
        let (fw, fh) = {
            let fb = self.shared.fb.lock().unwrap();
            (fb.width, fb.height)
        };
        let (sw, sh) = self.shared.surface_size();
        renderer::surface_to_frame(x, y, fw, fh, sw, sh)
    }

    /// The plugin's natural window size, once known from the first
    /// CreateWindow.
    pub fn plugin_size(&self) -> Option<(u32, u32)> {
        let fb = self.shared.fb.lock().unwrap();
        (fb.width > 0 && fb.height > 0).then_some((fb.width, fb.height))
    }

    /// Scale factor applied to root geometry answers. Must be set before the
    /// plugin connects to take effect.
    pub fn set_ui_scale(&self, scale: f32) {
        if scale > 0.0 {
            self.shared.set_ui_scale(scale);
        }
    }

    pub fn ui_scale(&self) -> f32 {
        self.shared.ui_scale()
    }

    fn worker(&self) -> Option<Arc<UiWorker>> {
        self.worker.lock().unwrap().clone()
    }

    /// Idle callback pumped on the ui worker thread (~16 ms cadence).
    pub fn set_idle_callback(&self, callback: Option<IdleCallback>) {
        if let Some(worker) = self.worker() {
            worker.set_idle_callback(callback);
        }
    }

    /// Run a closure on the ui worker thread, fire-and-forget.
    pub fn post_task<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.worker() {
            Some(worker) => worker.post(task),
            None => false,
        }
    }

    /// Run a closure on the ui worker thread and wait for completion.
    pub fn post_task_blocking<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.worker() {
            Some(worker) => worker.post_blocking(task),
            None => false,
        }
    }
}

impl Drop for VirtualDisplay {
    fn drop(&mut self) {
        let _ = self.detach();
    }
}

/// All displays in the process, keyed by display number, plus the lifecycle
/// state map shared with the owning module.
pub struct DisplayRegistry {
    displays: Mutex<HashMap<u32, Arc<VirtualDisplay>>>,
    states: Arc<StateMap>,
}

impl DisplayRegistry {
    pub fn new() -> Self {
        Self {
            displays: Mutex::new(HashMap::new()),
            states: Arc::new(StateMap::new()),
        }
    }

    /// Lifecycle phases, shared with the module that instantiates plugin UIs.
    pub fn states(&self) -> &StateMap {
        &self.states
    }

    pub fn get_or_create(&self, number: u32) -> Arc<VirtualDisplay> {
        let mut displays = self.displays.lock().unwrap();
        Arc::clone(
            displays
                .entry(number)
                .or_insert_with(|| Arc::new(VirtualDisplay::new(number, Arc::clone(&self.states)))),
        )
    }

    pub fn get(&self, number: u32) -> Option<Arc<VirtualDisplay>> {
        self.displays.lock().unwrap().get(&number).cloned()
    }

    /// Detach and drop a display. A deferred detach leaves the display
    /// registered; call again once instantiation has finished.
    pub fn destroy(&self, number: u32) -> DetachDecision {
        let display = self.get(number);
        let Some(display) = display else {
            return DetachDecision::Proceed;
        };
        if display.detach() == DetachDecision::Deferred {
            return DetachDecision::Deferred;
        }
        self.displays.lock().unwrap().remove(&number);
        self.states.remove(number);
        DetachDecision::Proceed
    }
}

impl Default for DisplayRegistry {
    fn default() -> Self {
        Self::new()
    }
}
