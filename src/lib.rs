//! x11host - embedded X11 protocol server for hosting plugin GUIs
//!
//! Terminates TCP connections from an unmodified X11 client library, answers
//! the subset of the core protocol (plus a stub GLX extension) that plugin
//! UI toolkits exercise, and composites the client's drawing into a single
//! framebuffer presented through wgpu.
//!
//! One [`VirtualDisplay`] per display number; the client connects to
//! `127.0.0.1:(6000 + number)`. Four threads cooperate per display: the
//! protocol thread (sole socket owner), the compositor thread (sole surface
//! owner), the ui worker (sole owner of calls into the hosted client
//! library), and whatever caller thread drives the public API.

mod atom;
mod display;
mod framebuffer;
mod glx;
mod input;
mod pixmap;
mod renderer;
mod server;
mod state;
mod window;
mod wire;
mod worker;

pub use display::{DisplayRegistry, VirtualDisplay};
pub use input::TouchAction;
pub use state::{DetachDecision, Phase, StateMap};
pub use worker::IdleCallback;

/// TCP port for display `n` is `X11_BASE_PORT + n`; the listener binds to
/// loopback only.
pub const X11_BASE_PORT: u16 = 6000;
