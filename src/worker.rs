//! Dedicated thread for all calls into the hosted client library.
//!
//! Plugin idle/instantiate/cleanup routines share one Xlib connection and
//! must never run concurrently with each other; everything is funneled
//! through this single worker thread. Work is submitted as queued closures,
//! fire-and-forget or blocking. On shutdown the queue is drained before the
//! thread exits so blocking submitters are never left waiting.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

pub type Task = Box<dyn FnOnce() + Send + 'static>;
pub type IdleCallback = Box<dyn FnMut() + Send + 'static>;

/// Idle cadence between queue drains.
const IDLE_INTERVAL: Duration = Duration::from_millis(16);

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    cv: Condvar,
    running: AtomicBool,
    idle: Mutex<Option<IdleCallback>>,
}

pub struct UiWorker {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl UiWorker {
    pub fn start(display: u32) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            running: AtomicBool::new(true),
            idle: Mutex::new(None),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("x11host-ui-{display}"))
            .spawn(move || run(thread_shared))
            .expect("spawn ui worker thread");
        Self {
            shared,
            thread: Mutex::new(Some(handle)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Replace the idle callback invoked once per tick.
    pub fn set_idle_callback(&self, callback: Option<IdleCallback>) {
        *self.shared.idle.lock().unwrap() = callback;
    }

    /// Queue a closure for the worker thread. Returns false if the worker is
    /// stopped (the task is discarded).
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_running() {
            log::info!("ui worker not running, discarding task");
            return false;
        }
        self.shared.queue.lock().unwrap().push_back(Box::new(task));
        self.shared.cv.notify_one();
        true
    }

    /// Queue a closure and block until the worker has run it. Returns false
    /// without running anything if the worker is stopped.
    pub fn post_blocking<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let posted = self.post(move || {
            task();
            let _ = tx.send(());
        });
        if !posted {
            return false;
        }
        // Queued tasks always run: either in the loop or in the shutdown drain.
        rx.recv().is_ok()
    }

    /// Stop the worker and join its thread. Remaining queued tasks run before
    /// the thread exits.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.cv.notify_all();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            if let Err(e) = handle.join() {
                log::error!("ui worker thread panicked: {e:?}");
            }
        }
    }
}

impl Drop for UiWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<Shared>) {
    log::debug!("ui worker thread started");
    while shared.running.load(Ordering::Acquire) {
        drain_queue(&shared);

        {
            let mut idle = shared.idle.lock().unwrap();
            if let Some(callback) = idle.as_mut() {
                callback();
            }
        }

        let guard = shared.queue.lock().unwrap();
        let _ = shared
            .cv
            .wait_timeout_while(guard, IDLE_INTERVAL, |queue| {
                queue.is_empty() && shared.running.load(Ordering::Acquire)
            })
            .unwrap();
    }
    // Final drain: tasks posted just before stop() still run, so blocking
    // submitters get their completion signal.
    drain_queue(&shared);
    log::debug!("ui worker thread exiting");
}

fn drain_queue(shared: &Arc<Shared>) {
    loop {
        let task = shared.queue.lock().unwrap().pop_front();
        match task {
            Some(task) => task(),
            None => break,
        }
    }
}
