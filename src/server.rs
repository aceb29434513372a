//! The X11 protocol engine: listener, connection setup, request dispatch and
//! event synthesis.
//!
//! One dedicated thread per display instance owns the listening socket and
//! the single active client socket. Nothing here ever blocks indefinitely:
//! accepts and reads use short bounded polls so touch draining and teardown
//! checks interleave with request handling.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};

use crate::atom::AtomTable;
use crate::display::Shared;
use crate::framebuffer::Framebuffer;
use crate::glx;
use crate::input::TouchAction;
use crate::pixmap::PixmapStore;
use crate::window::{ClipRect, WindowRec};
use crate::wire::{
    event, opcode, opcode_name, pad4, ByteOrder, BLACK_PIXEL, DEFAULT_COLORMAP_ID,
    DEFAULT_VISUAL_ID, ROOT_WINDOW_ID, WHITE_PIXEL,
};

use crate::X11_BASE_PORT;

/// Idle sleep between accept attempts.
const ACCEPT_POLL: Duration = Duration::from_millis(10);
/// Client socket read timeout; the request loop spins at this cadence.
const SOCKET_POLL: Duration = Duration::from_millis(2);
/// A read that makes no progress for this long counts as a transport failure.
const RECV_STALL: Duration = Duration::from_secs(5);
/// How long graceful teardown waits for the client to disconnect by itself.
const GRACEFUL_WAIT: Duration = Duration::from_secs(2);
/// Drag MotionNotify throttle.
const MOTION_INTERVAL: Duration = Duration::from_millis(33);
/// Bodies beyond this are read and discarded to keep stream framing intact.
const MAX_REQUEST_BODY: usize = 64 * 1024;
/// Sanity cap on image dimensions.
const MAX_IMAGE_DIM: u32 = 4096;

/// Protocol thread entry point. Returns when the display shuts down.
pub(crate) fn protocol_thread(shared: Arc<Shared>) {
    let port = X11_BASE_PORT + shared.number as u16;
    let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("display {}: bind 127.0.0.1:{port} failed: {e}", shared.number);
            return;
        }
    };
    if let Err(e) = listener.set_nonblocking(true) {
        log::error!("display {}: set_nonblocking failed: {e}", shared.number);
        return;
    }
    shared.listening.store(true, Ordering::Release);
    log::info!("display {}: listening on 127.0.0.1:{port}", shared.number);

    // Atoms are global to the display instance: ids survive reconnects and
    // are never reused.
    let mut atoms = AtomTable::new();

    while shared.running.load(Ordering::Acquire) {
        if shared.closing_gracefully.load(Ordering::Acquire) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                log::info!("display {}: client connected", shared.number);
                match serve_client(&shared, stream, &mut atoms) {
                    Ok(()) => log::info!("display {}: client disconnected", shared.number),
                    Err(e) => log::warn!("display {}: client session ended: {e:#}", shared.number),
                }
                // Per-connection resource state must not leak into the next
                // client.
                shared.client_connected.store(false, Ordering::Release);
                shared.windows.lock().unwrap().clear();
                *shared.fb.lock().unwrap() = Framebuffer::new();
                shared.touch.drain();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                log::error!("display {}: accept failed: {e}", shared.number);
                break;
            }
        }
    }
    log::info!("display {}: protocol thread exiting", shared.number);
}

fn timed_out(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Read exactly `buf.len()` bytes, tolerating short-timeout wakeups. Fails if
/// no progress is made for [`RECV_STALL`] or the display is shutting down.
fn recv_exact(stream: &mut TcpStream, buf: &mut [u8], running: &AtomicBool) -> io::Result<()> {
    let mut filled = 0;
    let mut deadline = Instant::now() + RECV_STALL;
    while filled < buf.len() {
        if !running.load(Ordering::Acquire) {
            return Err(io::ErrorKind::Interrupted.into());
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                filled += n;
                deadline = Instant::now() + RECV_STALL;
            }
            Err(e) if timed_out(&e) => {
                if Instant::now() > deadline {
                    return Err(io::ErrorKind::TimedOut.into());
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Read and throw away `len` bytes (oversized or unsupported payloads).
fn discard(stream: &mut TcpStream, mut len: usize, running: &AtomicBool) -> io::Result<()> {
    let mut chunk = [0u8; 4096];
    while len > 0 {
        let take = len.min(chunk.len());
        recv_exact(stream, &mut chunk[..take], running)?;
        len -= take;
    }
    Ok(())
}

/// Handshake + request loop for one accepted client.
fn serve_client(shared: &Arc<Shared>, mut stream: TcpStream, atoms: &mut AtomTable) -> Result<()> {
    stream.set_nodelay(true).ok();
    stream.set_read_timeout(Some(RECV_STALL))?;

    // Fresh per-connection resource state.
    shared.windows.lock().unwrap().clear();
    *shared.fb.lock().unwrap() = Framebuffer::new();

    let mut setup = [0u8; 12];
    stream
        .read_exact(&mut setup)
        .context("read 12-byte connection request")?;
    let order = ByteOrder::from_setup_byte(setup[0])
        .ok_or_else(|| anyhow!("unsupported byte-order byte 0x{:02x}", setup[0]))?;
    let major = order.get16(&setup, 2);
    let minor = order.get16(&setup, 4);
    let auth_name_len = order.get16(&setup, 6) as usize;
    let auth_data_len = order.get16(&setup, 8) as usize;
    // Authorization name/data are skipped regardless of content; each field
    // is padded to a 4-byte boundary.
    discard(
        &mut stream,
        pad4(auth_name_len) + pad4(auth_data_len),
        &shared.running,
    )
    .context("skip authorization fields")?;

    let (sw, sh) = shared.surface_size();
    let accept = connection_reply(order, sw as u16, sh as u16);
    stream.write_all(&accept).context("send connection reply")?;
    log::info!(
        "display {}: handshake done (protocol {major}.{minor}, {:?})",
        shared.number,
        order
    );

    // Short-timeout mode from here on: the request loop interleaves polls
    // with touch draining and teardown checks.
    stream.set_read_timeout(Some(SOCKET_POLL))?;
    shared.client_connected.store(true, Ordering::Release);

    let mut client = Client {
        stream,
        order,
        shared: Arc::clone(shared),
        atoms,
        pixmaps: PixmapStore::new(),
        seq: 0,
        last_reply_seq: 0,
        grab_window: 0,
        pending_drag: None,
        last_motion_flush: Instant::now(),
        destroy_notify_sent: false,
        close_started: None,
        epoch: Instant::now(),
        seen_opcodes: [false; 256],
        scratch: Vec::new(),
    };
    client.run()
}

/// X11 connection-accepted message: exactly 120 bytes, in the client's byte
/// order. One screen, one 24-bit-depth pixmap format, one TrueColor visual.
fn connection_reply(order: ByteOrder, width: u16, height: u16) -> [u8; 120] {
    let mut b = [0u8; 120];
    // reply header
    b[0] = 1; // accepted
    order.put16(&mut b, 2, 11); // protocol major
    order.put16(&mut b, 4, 0); // protocol minor
    order.put16(&mut b, 6, 28); // remaining length in 4-byte units
    // fixed setup prefix
    order.put32(&mut b, 8, 0); // release number
    order.put32(&mut b, 12, 0x0020_0000); // resource-id-base
    order.put32(&mut b, 16, 0x001f_ffff); // resource-id-mask, disjoint from base
    order.put32(&mut b, 20, 256); // motion buffer size
    order.put16(&mut b, 24, 0); // vendor length
    order.put16(&mut b, 26, 32767); // max request length
    b[28] = 1; // one screen
    b[29] = 1; // one pixmap format
    let order_byte = match order {
        ByteOrder::LsbFirst => 0,
        ByteOrder::MsbFirst => 1,
    };
    b[30] = order_byte; // image byte order
    b[31] = order_byte; // bitmap bit order
    b[32] = 8; // bitmap scanline unit
    b[33] = 8; // bitmap scanline pad
    b[34] = 8; // min keycode (X11 requires >= 8)
    b[35] = 255; // max keycode
    // bytes 36..40 pad
    // pixmap format
    b[40] = 24; // depth
    b[41] = 32; // bits per pixel
    order.put16(&mut b, 42, 32); // scanline pad
    // bytes 44..48 pad
    // screen
    order.put32(&mut b, 48, ROOT_WINDOW_ID);
    order.put32(&mut b, 52, DEFAULT_COLORMAP_ID);
    order.put32(&mut b, 56, WHITE_PIXEL);
    order.put32(&mut b, 60, BLACK_PIXEL);
    order.put32(&mut b, 64, 0); // current input masks
    order.put16(&mut b, 68, width);
    order.put16(&mut b, 70, height);
    order.put16(&mut b, 72, ((width as u32) * 254 / 100) as u16); // mm
    order.put16(&mut b, 74, ((height as u32) * 254 / 100) as u16);
    order.put16(&mut b, 76, 0); // min installed maps
    order.put16(&mut b, 78, 0); // max installed maps
    order.put32(&mut b, 80, DEFAULT_VISUAL_ID); // root visual
    b[84] = 0; // backing stores: never
    b[85] = 0; // save unders
    b[86] = 24; // root depth
    b[87] = 1; // one allowed depth
    // depth
    b[88] = 24;
    order.put16(&mut b, 90, 1); // one visual
    // bytes 92..96 pad
    // visual type
    order.put32(&mut b, 96, DEFAULT_VISUAL_ID);
    b[100] = 4; // class: TrueColor
    b[101] = 8; // bits per rgb value
    order.put16(&mut b, 102, 256); // colormap entries
    order.put32(&mut b, 104, 0xff_0000); // red mask
    order.put32(&mut b, 108, 0x00_ff00); // green mask
    order.put32(&mut b, 112, 0x00_00ff); // blue mask
    // bytes 116..120 pad
    b
}

/// Outcome of one header poll.
enum HeaderPoll {
    Data([u8; 4]),
    /// Short timeout elapsed with no pending request.
    Idle,
    Closed,
}

/// Drawable resolution outcome for pixel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    /// The shared framebuffer (root or any known window).
    Frame,
    Pixmap,
    Unknown,
}

struct Client<'a> {
    stream: TcpStream,
    order: ByteOrder,
    shared: Arc<Shared>,
    atoms: &'a mut AtomTable,
    pixmaps: PixmapStore,
    /// Request ordinal; replies must carry it.
    seq: u16,
    /// Sequence of the last reply sent; synthesized events are stamped with
    /// it so they look plausible relative to the request stream.
    last_reply_seq: u16,
    /// Window that captured the pointer on ButtonPress (0 = none).
    grab_window: u32,
    pending_drag: Option<(i32, i32)>,
    last_motion_flush: Instant,
    destroy_notify_sent: bool,
    close_started: Option<Instant>,
    epoch: Instant,
    seen_opcodes: [bool; 256],
    /// Reusable PutImage pixel buffer.
    scratch: Vec<u8>,
}

impl Client<'_> {
    fn run(&mut self) -> Result<()> {
        loop {
            if !self.shared.running.load(Ordering::Acquire) {
                return Ok(());
            }
            if self.shared.closing_gracefully.load(Ordering::Acquire) {
                if self.graceful_teardown_step()? {
                    return Ok(());
                }
                continue;
            }
            if self.shared.resume_expose.swap(false, Ordering::AcqRel) {
                self.send_expose_all()?;
            }
            self.drain_touch()?;

            match self.poll_header()? {
                HeaderPoll::Data(header) => self.dispatch(header)?,
                HeaderPoll::Idle => continue,
                HeaderPoll::Closed => return Ok(()),
            }
            self.drain_touch()?;
        }
    }

    /// One step of graceful teardown. Returns true when the connection should
    /// be closed.
    fn graceful_teardown_step(&mut self) -> Result<bool> {
        if !self.destroy_notify_sent {
            let wids: Vec<u32> = self.shared.windows.lock().unwrap().ids().collect();
            log::info!(
                "display {}: teardown, sending DestroyNotify for {} windows",
                self.shared.number,
                wids.len()
            );
            for wid in wids {
                self.send_destroy_notify(wid)?;
            }
            self.destroy_notify_sent = true;
            self.close_started = Some(Instant::now());
        }
        if self
            .close_started
            .map(|t| t.elapsed() > GRACEFUL_WAIT)
            .unwrap_or(false)
        {
            log::info!(
                "display {}: teardown timeout, forcing disconnect",
                self.shared.number
            );
            return Ok(true);
        }
        // Wait for the client to disconnect on its own; late requests are
        // drained and ignored.
        let mut probe = [0u8; 256];
        match self.stream.read(&mut probe) {
            Ok(0) => return Ok(true),
            Ok(_) => {}
            Err(e) if timed_out(&e) => {}
            Err(_) => return Ok(true),
        }
        thread::sleep(Duration::from_millis(10));
        Ok(false)
    }

    /// Poll for a 4-byte request header with the short socket timeout.
    fn poll_header(&mut self) -> Result<HeaderPoll> {
        let mut header = [0u8; 4];
        let mut filled = 0;
        let mut deadline = Instant::now() + RECV_STALL;
        loop {
            match self.stream.read(&mut header[filled..]) {
                Ok(0) => return Ok(HeaderPoll::Closed),
                Ok(n) => {
                    filled += n;
                    if filled == header.len() {
                        return Ok(HeaderPoll::Data(header));
                    }
                    deadline = Instant::now() + RECV_STALL;
                }
                Err(e) if timed_out(&e) => {
                    if filled == 0 {
                        return Ok(HeaderPoll::Idle);
                    }
                    // Partial header: keep the stream in sync, but stay
                    // responsive to touch input while waiting.
                    self.drain_touch()?;
                    if Instant::now() > deadline {
                        bail!("stalled mid-header");
                    }
                    if !self.shared.running.load(Ordering::Acquire) {
                        bail!("shutdown mid-header");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e).context("read request header"),
            }
        }
    }

    fn dispatch(&mut self, header: [u8; 4]) -> Result<()> {
        let op = header[0];
        let length = self.order.get16(&header, 2);

        // BigRequests framing: length 0 means a 32-bit length follows. The
        // extension is never advertised, so drain and discard defensively
        // instead of honoring it.
        if length == 0 {
            let mut ext = [0u8; 4];
            recv_exact(&mut self.stream, &mut ext, &self.shared.running)?;
            let big = self.order.get32(&ext, 0);
            log::warn!(
                "display {}: BigRequests framing for {} (len {big}), discarding",
                self.shared.number,
                opcode_name(op)
            );
            if big > 2 {
                discard(
                    &mut self.stream,
                    (big as usize - 2) * 4,
                    &self.shared.running,
                )?;
            }
            self.seq = self.seq.wrapping_add(1);
            return Ok(());
        }

        self.seq = self.seq.wrapping_add(1);
        if !self.seen_opcodes[op as usize] {
            self.seen_opcodes[op as usize] = true;
            log::debug!(
                "display {}: first {} (opcode {op}, length {length}, seq {})",
                self.shared.number,
                opcode_name(op),
                self.seq
            );
        }

        // PutImage streams its own pixel payload.
        if op == opcode::PUT_IMAGE {
            return self.put_image(header, length);
        }

        let body_len = (length as usize - 1) * 4;
        let keep = body_len.min(MAX_REQUEST_BODY);
        let mut req = vec![0u8; 4 + keep];
        req[..4].copy_from_slice(&header);
        recv_exact(&mut self.stream, &mut req[4..], &self.shared.running)
            .with_context(|| format!("read {} body", opcode_name(op)))?;
        if body_len > keep {
            log::warn!(
                "display {}: oversized {} body ({body_len} bytes), truncating",
                self.shared.number,
                opcode_name(op)
            );
            discard(&mut self.stream, body_len - keep, &self.shared.running)?;
        }

        match op {
            opcode::CREATE_WINDOW => self.create_window(&req)?,
            opcode::CHANGE_WINDOW_ATTRIBUTES => self.change_window_attributes(&req),
            opcode::GET_WINDOW_ATTRIBUTES => self.get_window_attributes(&req)?,
            opcode::DESTROY_WINDOW => self.destroy_window(&req),
            opcode::MAP_WINDOW => self.map_window(&req)?,
            opcode::UNMAP_WINDOW => self.unmap_window(&req)?,
            opcode::CONFIGURE_WINDOW => self.configure_window(&req)?,
            opcode::GET_GEOMETRY => self.get_geometry(&req)?,
            opcode::INTERN_ATOM => self.intern_atom(&req)?,
            opcode::GET_ATOM_NAME => self.get_atom_name(&req)?,
            opcode::SEND_EVENT => self.send_event(&req)?,
            opcode::QUERY_POINTER => self.query_pointer()?,
            opcode::TRANSLATE_COORDINATES => self.translate_coordinates(&req)?,
            opcode::CREATE_PIXMAP => self.create_pixmap(&req),
            opcode::FREE_PIXMAP => self.free_pixmap(&req),
            opcode::COPY_AREA => self.copy_area(&req)?,
            opcode::GET_IMAGE => self.get_image(&req)?,
            opcode::QUERY_EXTENSION => self.query_extension(&req)?,
            opcode::LIST_EXTENSIONS => self.list_extensions()?,
            opcode::GLX => {
                let minor = header[1];
                if let Some(reply) = glx::reply_for(minor, self.order, self.seq) {
                    self.send_reply(&reply)?;
                }
            }
            // Reply-bearing requests answered with an empty default: the
            // client needs a reply to keep its sequence matching, but the
            // contents do not matter for the hosted toolkits.
            opcode::GET_PROPERTY
            | opcode::QUERY_TREE
            | 21 // ListProperties
            | opcode::GET_SELECTION_OWNER
            | 26 // GrabPointer
            | 31 // GrabKeyboard
            | 39 // GetMotionEvents
            | 43 // GetInputFocus
            | 44 // QueryKeymap
            | 47 // QueryFont
            | 49 // ListFonts
            | 52 // GetFontPath
            | 83 // ListInstalledColormaps
            | 84 // AllocColor
            | 91 // QueryColors
            | 97 // QueryBestSize
            | 102 // GetKeyboardMapping
            | 103 // GetKeyboardControl
            | 106 // GetPointerMapping
            => {
                let mut reply = vec![0u8; 32];
                reply[0] = 1;
                self.order.put16(&mut reply, 2, self.seq);
                self.send_reply(&reply)?;
            }
            // PolyFillRectangle is typically a clear before a PutImage
            // repaint; we do not know the GC foreground, and drawing a wrong
            // color produces visible artifacts, so skip it.
            opcode::POLY_FILL_RECTANGLE => {}
            // Void requests accepted with no visible effect.
            opcode::CHANGE_PROPERTY | opcode::DELETE_PROPERTY | 5 | 9 | 22 | 24 | 42 | 45
            | 46 | 51 | 55 | 56 | 57 | 58 | 59 | 60 | 61 | 63 | 64 | 65 | 66 | 67 | 68 | 69
            | 71 | 78 | 79 | 101 => {}
            _ => {
                // Never answer an unknown request: an unexpected reply
                // desynchronizes the client's request/reply matching.
                log::warn!(
                    "display {}: unhandled opcode {op} {} (ignored)",
                    self.shared.number,
                    opcode_name(op)
                );
            }
        }
        Ok(())
    }

    // --- reply/event plumbing -------------------------------------------

    fn send_reply(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).context("send reply")?;
        self.last_reply_seq = self.seq;
        Ok(())
    }

    fn event_buf(&self, code: u8) -> [u8; 32] {
        let mut buf = [0u8; 32];
        buf[0] = code;
        self.order.put16(&mut buf, 2, self.last_reply_seq);
        buf
    }

    fn timestamp(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    fn send_expose(&mut self, wid: u32, w: u32, h: u32) -> Result<()> {
        let mut buf = self.event_buf(event::EXPOSE);
        self.order.put32(&mut buf, 4, wid);
        self.order.put16(&mut buf, 8, 0); // x
        self.order.put16(&mut buf, 10, 0); // y
        self.order.put16(&mut buf, 12, w as u16);
        self.order.put16(&mut buf, 14, h as u16);
        self.order.put16(&mut buf, 16, 0); // count: no more Expose follow
        self.stream.write_all(&buf).context("send Expose")
    }

    fn send_configure_notify(&mut self, wid: u32, w: u32, h: u32) -> Result<()> {
        let mut buf = self.event_buf(event::CONFIGURE_NOTIFY);
        self.order.put32(&mut buf, 4, wid); // event window
        self.order.put32(&mut buf, 8, wid); // window
        self.order.put32(&mut buf, 12, 0); // above-sibling: None
        self.order.put16(&mut buf, 16, 0); // x
        self.order.put16(&mut buf, 18, 0); // y
        self.order.put16(&mut buf, 20, w as u16);
        self.order.put16(&mut buf, 22, h as u16);
        self.order.put16(&mut buf, 24, 0); // border width
        self.stream.write_all(&buf).context("send ConfigureNotify")
    }

    fn send_destroy_notify(&mut self, wid: u32) -> Result<()> {
        let mut buf = self.event_buf(event::DESTROY_NOTIFY);
        self.order.put32(&mut buf, 4, wid);
        self.order.put32(&mut buf, 8, wid);
        self.stream.write_all(&buf).context("send DestroyNotify")
    }

    fn send_pointer_event(
        &mut self,
        code: u8,
        wid: u32,
        x: i32,
        y: i32,
        button: u8,
        state: u16,
    ) -> Result<()> {
        let mut buf = self.event_buf(code);
        buf[1] = button;
        let ts = self.timestamp();
        self.order.put32(&mut buf, 4, ts);
        self.order.put32(&mut buf, 8, ROOT_WINDOW_ID);
        self.order.put32(&mut buf, 12, wid); // event window
        self.order.put32(&mut buf, 16, 0); // child: None
        self.order.put16(&mut buf, 20, x as i16 as u16); // root-x
        self.order.put16(&mut buf, 22, y as i16 as u16); // root-y
        self.order.put16(&mut buf, 24, x as i16 as u16); // event-x
        self.order.put16(&mut buf, 26, y as i16 as u16); // event-y
        self.order.put16(&mut buf, 28, state);
        buf[30] = 1; // same screen
        self.stream.write_all(&buf).context("send pointer event")
    }

    /// Expose root + every live window (compositor resume path).
    fn send_expose_all(&mut self) -> Result<()> {
        let (sw, sh) = self.shared.surface_size();
        let targets: Vec<(u32, u32, u32)> = {
            let windows = self.shared.windows.lock().unwrap();
            let mut t = vec![(ROOT_WINDOW_ID, sw, sh)];
            for wid in windows.ids() {
                if let Some(rec) = windows.get(wid) {
                    t.push((wid, rec.width, rec.height));
                }
            }
            t
        };
        log::info!(
            "display {}: resume, sending Expose to {} windows",
            self.shared.number,
            targets.len()
        );
        for (wid, w, h) in targets {
            self.send_expose(wid, w, h)?;
        }
        Ok(())
    }

    // --- input bridge ----------------------------------------------------

    /// Deliver queued touch input. Press/release go out immediately; drag
    /// motion is buffered and flushed at the throttle interval.
    fn drain_touch(&mut self) -> Result<()> {
        const BUTTON1_MASK: u16 = 1 << 8;
        for t in self.shared.touch.drain() {
            self.shared.pointer.record_position(t.x, t.y);
            match t.action {
                TouchAction::Down => {
                    self.flush_pending_drag()?;
                    let hit = self.shared.windows.lock().unwrap().hit_test(t.x, t.y);
                    self.grab_window = hit.wid;
                    self.shared.pointer.set_button1(true);
                    self.send_pointer_event(
                        event::BUTTON_PRESS,
                        hit.wid,
                        hit.local_x,
                        hit.local_y,
                        1,
                        0,
                    )?;
                }
                TouchAction::Up => {
                    self.flush_pending_drag()?;
                    self.shared.pointer.set_button1(false);
                    let (wid, lx, ly) = self.pointer_target(t.x, t.y);
                    self.send_pointer_event(
                        event::BUTTON_RELEASE,
                        wid,
                        lx,
                        ly,
                        1,
                        BUTTON1_MASK,
                    )?;
                    self.grab_window = 0;
                }
                TouchAction::Move => self.pending_drag = Some((t.x, t.y)),
            }
        }
        if self.pending_drag.is_some() && self.last_motion_flush.elapsed() >= MOTION_INTERVAL {
            self.flush_pending_drag()?;
            self.last_motion_flush = Instant::now();
        }
        Ok(())
    }

    fn flush_pending_drag(&mut self) -> Result<()> {
        const BUTTON1_MASK: u16 = 1 << 8;
        if let Some((x, y)) = self.pending_drag.take() {
            let (wid, lx, ly) = self.pointer_target(x, y);
            self.send_pointer_event(event::MOTION_NOTIFY, wid, lx, ly, 0, BUTTON1_MASK)?;
        }
        Ok(())
    }

    /// While a grab is active all pointer events target the grabbed window,
    /// even outside its bounds; otherwise hit-test.
    fn pointer_target(&self, x: i32, y: i32) -> (u32, i32, i32) {
        let windows = self.shared.windows.lock().unwrap();
        if self.grab_window != 0 {
            let (wx, wy) = windows.absolute_pos(self.grab_window);
            (self.grab_window, x - wx, y - wy)
        } else {
            let hit = windows.hit_test(x, y);
            (hit.wid, hit.local_x, hit.local_y)
        }
    }

    // --- window requests -------------------------------------------------

    fn create_window(&mut self, req: &[u8]) -> Result<()> {
        if req.len() < 20 {
            log::warn!("display {}: short CreateWindow request", self.shared.number);
            return Ok(());
        }
        let o = self.order;
        let wid = o.get32(req, 4);
        let parent = o.get32(req, 8);
        let x = o.get16i(req, 12) as i32;
        let y = o.get16i(req, 14) as i32;
        let w = o.get16(req, 16) as u32;
        let h = o.get16(req, 18) as u32;

        let first = {
            let mut windows = self.shared.windows.lock().unwrap();
            let first = windows.is_empty();
            windows.insert(
                wid,
                WindowRec {
                    x,
                    y,
                    parent,
                    width: w,
                    height: h,
                    mapped: false, // windows start invisible until MapWindow
                    event_mask: 0,
                },
            );
            first
        };
        log::debug!(
            "display {}: CreateWindow 0x{wid:x} parent=0x{parent:x} ({x},{y}) {w}x{h}",
            self.shared.number
        );

        // The first window anchors framebuffer sizing.
        if first && w > 0 && h > 0 {
            let mut fb = self.shared.fb.lock().unwrap();
            if fb.width == 0 {
                fb.init_plugin_size(w, h);
                log::info!("display {}: plugin size {w}x{h}", self.shared.number);
            }
        }
        // Eager Expose: some clients paint from this without ever mapping.
        self.send_expose(wid, w, h)
    }

    fn change_window_attributes(&mut self, req: &[u8]) {
        if req.len() < 12 {
            return;
        }
        let o = self.order;
        let wid = o.get32(req, 4);
        let mask = o.get32(req, 8);
        // Values follow in bit order; only CWEventMask (bit 11) matters here.
        let mut off = 12;
        for bit in 0..32 {
            if mask & (1u32 << bit) == 0 {
                continue;
            }
            if off + 4 > req.len() {
                break;
            }
            if bit == 11 {
                let event_mask = o.get32(req, off);
                if let Some(rec) = self.shared.windows.lock().unwrap().get_mut(wid) {
                    rec.event_mask = event_mask;
                }
            }
            off += 4;
        }
    }

    fn destroy_window(&mut self, req: &[u8]) {
        if req.len() < 8 {
            return;
        }
        let wid = self.order.get32(req, 4);
        self.shared.windows.lock().unwrap().remove(wid);
        log::debug!("display {}: DestroyWindow 0x{wid:x}", self.shared.number);
    }

    fn map_window(&mut self, req: &[u8]) -> Result<()> {
        if req.len() < 8 {
            return Ok(());
        }
        let wid = self.order.get32(req, 4);
        let dims = {
            let mut windows = self.shared.windows.lock().unwrap();
            windows.set_mapped(wid, true);
            let top = windows.top_level();
            let is_popup = Some(wid) != top
                && windows.get(wid).map(|r| r.parent) == Some(ROOT_WINDOW_ID);
            if is_popup {
                // Popups are hit-tested before base widgets.
                windows.raise_subtree(wid);
            }
            windows.get(wid).map(|r| (r.width, r.height))
        };
        let (sw, sh) = self.shared.surface_size();
        let (w, h) = dims.unwrap_or((sw, sh));
        log::debug!("display {}: MapWindow 0x{wid:x} {w}x{h}", self.shared.number);
        self.send_expose(wid, w, h)
    }

    fn unmap_window(&mut self, req: &[u8]) -> Result<()> {
        if req.len() < 8 {
            return Ok(());
        }
        let wid = self.order.get32(req, 4);
        let expose_main = {
            let mut windows = self.shared.windows.lock().unwrap();
            windows.set_mapped(wid, false);
            let top = windows.top_level();
            // A hidden top-level popup leaves stale pixels behind; the main
            // window must repaint them. Its children are not exposed, which
            // would storm the client during a recursive hide.
            let is_popup = Some(wid) != top
                && windows.get(wid).map(|r| r.parent) == Some(ROOT_WINDOW_ID);
            if is_popup {
                top.and_then(|t| windows.get(t).map(|r| (t, r.width, r.height)))
            } else {
                None
            }
        };
        if let Some((top, w, h)) = expose_main {
            log::debug!(
                "display {}: UnmapWindow 0x{wid:x}, exposing main 0x{top:x}",
                self.shared.number
            );
            self.send_expose(top, w, h)?;
        }
        Ok(())
    }

    fn configure_window(&mut self, req: &[u8]) -> Result<()> {
        if req.len() < 12 {
            return Ok(());
        }
        let o = self.order;
        let wid = o.get32(req, 4);
        let vmask = o.get16(req, 8);
        let mut off = 12;
        let mut next = |req: &[u8]| -> Option<u32> {
            if off + 4 <= req.len() {
                let v = o.get32(req, off);
                off += 4;
                Some(v)
            } else {
                None
            }
        };
        let new_x = (vmask & 0x1 != 0).then(|| next(req)).flatten();
        let new_y = (vmask & 0x2 != 0).then(|| next(req)).flatten();
        let new_w = (vmask & 0x4 != 0).then(|| next(req)).flatten();
        let new_h = (vmask & 0x8 != 0).then(|| next(req)).flatten();

        let mut pos_changed = false;
        let mut size_event = None;
        let mut resize_fb = None;
        let mut expose_top = None;
        {
            let mut windows = self.shared.windows.lock().unwrap();
            let top = windows.top_level();
            if let Some(rec) = windows.get_mut(wid) {
                if let Some(x) = new_x {
                    let x = x as i32;
                    if rec.x != x {
                        rec.x = x;
                        pos_changed = true;
                    }
                }
                if let Some(y) = new_y {
                    let y = y as i32;
                    if rec.y != y {
                        rec.y = y;
                        pos_changed = true;
                    }
                }
                if new_w.is_some() || new_h.is_some() {
                    let fw = new_w.unwrap_or(rec.width).max(1);
                    let fh = new_h.unwrap_or(rec.height).max(1);
                    // Same-size configure is suppressed entirely: answering
                    // it would feed the client's resize handler its own echo.
                    if fw != rec.width || fh != rec.height {
                        rec.width = fw;
                        rec.height = fh;
                        size_event = Some((fw, fh));
                        if Some(wid) == top {
                            resize_fb = Some((fw, fh));
                        }
                    }
                }
            }
            if pos_changed {
                // No layered compositing: after any window moves the client
                // must fully repaint the top-level window.
                expose_top =
                    top.and_then(|t| windows.get(t).map(|r| (t, r.width, r.height)));
            }
        }
        if let Some((w, h)) = resize_fb {
            self.shared.fb.lock().unwrap().resize(w, h);
        }
        if let Some((w, h)) = size_event {
            log::debug!(
                "display {}: ConfigureWindow 0x{wid:x} -> {w}x{h}",
                self.shared.number
            );
            self.send_configure_notify(wid, w, h)?;
            self.send_expose(wid, w, h)?;
        }
        if let Some((top, w, h)) = expose_top {
            self.send_expose(top, w, h)?;
        }
        Ok(())
    }

    fn get_window_attributes(&mut self, req: &[u8]) -> Result<()> {
        if req.len() < 8 {
            return Ok(());
        }
        let o = self.order;
        let wid = o.get32(req, 4);
        let mapped = self
            .shared
            .windows
            .lock()
            .unwrap()
            .get(wid)
            .map(|r| r.mapped)
            .unwrap_or(true);
        let mut reply = vec![0u8; 44];
        reply[0] = 1;
        reply[1] = 0; // backing store: NotUseful
        o.put16(&mut reply, 2, self.seq);
        o.put32(&mut reply, 4, 3); // 12 extra bytes
        o.put32(&mut reply, 8, DEFAULT_VISUAL_ID);
        o.put16(&mut reply, 12, 1); // class InputOutput
        o.put32(&mut reply, 20, BLACK_PIXEL); // backing pixel
        reply[25] = 1; // map installed
        reply[26] = if mapped { 2 } else { 0 }; // IsViewable / IsUnmapped
        o.put32(&mut reply, 28, DEFAULT_COLORMAP_ID);
        o.put32(&mut reply, 32, 0x00ff_ffff); // all event masks
        o.put32(&mut reply, 36, 0x00ff_ffff); // your event mask
        self.send_reply(&reply)
    }

    fn get_geometry(&mut self, req: &[u8]) -> Result<()> {
        if req.len() < 8 {
            return Ok(());
        }
        let o = self.order;
        let drawable = o.get32(req, 4);
        let (sw, sh) = self.shared.surface_size();
        let (mut x, mut y, mut w, mut h) = (0i32, 0i32, sw, sh);
        {
            let windows = self.shared.windows.lock().unwrap();
            if let Some(rec) = windows.get(drawable) {
                x = rec.x;
                y = rec.y;
                w = rec.width;
                h = rec.height;
            } else if drawable == ROOT_WINDOW_ID {
                let fb = self.shared.fb.lock().unwrap();
                if fb.original_width > 0 {
                    // Root queries answer with the scaled *original* size:
                    // clients resize themselves from this, and echoing the
                    // current size shrinks the window on every query.
                    let scale = self.shared.ui_scale();
                    w = ((fb.original_width as f32 * scale) as u32).max(1);
                    h = ((fb.original_height as f32 * scale) as u32).max(1);
                }
            }
        }
        let mut reply = vec![0u8; 32];
        reply[0] = 1;
        reply[1] = 24; // depth
        o.put16(&mut reply, 2, self.seq);
        o.put32(&mut reply, 8, ROOT_WINDOW_ID);
        o.put16(&mut reply, 12, x as i16 as u16);
        o.put16(&mut reply, 14, y as i16 as u16);
        o.put16(&mut reply, 16, w as u16);
        o.put16(&mut reply, 18, h as u16);
        self.send_reply(&reply)
    }

    fn translate_coordinates(&mut self, req: &[u8]) -> Result<()> {
        if req.len() < 16 {
            return Ok(());
        }
        let o = self.order;
        let src = o.get32(req, 4);
        let dst = o.get32(req, 8);
        let sx = o.get16i(req, 12) as i32;
        let sy = o.get16i(req, 14) as i32;
        let (src_abs, dst_abs) = {
            let windows = self.shared.windows.lock().unwrap();
            let src_abs = if src == ROOT_WINDOW_ID {
                (0, 0)
            } else {
                windows.absolute_pos(src)
            };
            let dst_abs = if dst == ROOT_WINDOW_ID {
                (0, 0)
            } else {
                windows.absolute_pos(dst)
            };
            (src_abs, dst_abs)
        };
        let dx = sx + src_abs.0 - dst_abs.0;
        let dy = sy + src_abs.1 - dst_abs.1;
        let mut reply = vec![0u8; 32];
        reply[0] = 1;
        reply[1] = 1; // same screen
        o.put16(&mut reply, 2, self.seq);
        o.put32(&mut reply, 8, 0); // child: None
        o.put16(&mut reply, 12, dx as i16 as u16);
        o.put16(&mut reply, 14, dy as i16 as u16);
        self.send_reply(&reply)
    }

    fn query_pointer(&mut self) -> Result<()> {
        let o = self.order;
        let (px, py) = self.shared.pointer.position();
        let mut reply = vec![0u8; 32];
        reply[0] = 1;
        reply[1] = 1; // same screen
        o.put16(&mut reply, 2, self.seq);
        o.put32(&mut reply, 8, ROOT_WINDOW_ID);
        o.put16(&mut reply, 16, px as i16 as u16); // root-x
        o.put16(&mut reply, 18, py as i16 as u16);
        o.put16(&mut reply, 20, px as i16 as u16); // win-x
        o.put16(&mut reply, 22, py as i16 as u16);
        let mask = if self.shared.pointer.button1_down() {
            1u16 << 8
        } else {
            0
        };
        o.put16(&mut reply, 24, mask);
        self.send_reply(&reply)
    }

    // --- atoms -----------------------------------------------------------

    fn intern_atom(&mut self, req: &[u8]) -> Result<()> {
        if req.len() < 8 {
            return Ok(());
        }
        let o = self.order;
        let only_if_exists = req[1] != 0;
        let name_len = o.get16(req, 4) as usize;
        let name = if name_len > 0 && name_len <= 256 && 8 + name_len <= req.len() {
            String::from_utf8_lossy(&req[8..8 + name_len]).into_owned()
        } else {
            String::new()
        };
        let atom = self.atoms.intern(&name, only_if_exists).unwrap_or(0);
        log::debug!(
            "display {}: InternAtom '{name}' only_if_exists={only_if_exists} -> {atom}",
            self.shared.number
        );
        let mut reply = vec![0u8; 32];
        reply[0] = 1;
        o.put16(&mut reply, 2, self.seq);
        o.put32(&mut reply, 8, atom);
        self.send_reply(&reply)
    }

    fn get_atom_name(&mut self, req: &[u8]) -> Result<()> {
        if req.len() < 8 {
            return Ok(());
        }
        let o = self.order;
        let atom = o.get32(req, 4);
        let name = self.atoms.name(atom).unwrap_or("").to_string();
        let padded = pad4(name.len());
        let mut reply = vec![0u8; 32 + padded];
        reply[0] = 1;
        o.put16(&mut reply, 2, self.seq);
        o.put32(&mut reply, 4, (padded / 4) as u32);
        o.put16(&mut reply, 8, name.len() as u16);
        reply[32..32 + name.len()].copy_from_slice(name.as_bytes());
        self.send_reply(&reply)
    }

    // --- extensions ------------------------------------------------------

    fn query_extension(&mut self, req: &[u8]) -> Result<()> {
        if req.len() < 8 {
            return Ok(());
        }
        let o = self.order;
        let name_len = o.get16(req, 4) as usize;
        let name = if name_len > 0 && 8 + name_len <= req.len() {
            &req[8..8 + name_len]
        } else {
            &[][..]
        };
        let is_glx = name == b"GLX";
        log::debug!(
            "display {}: QueryExtension '{}' -> {}",
            self.shared.number,
            String::from_utf8_lossy(name),
            if is_glx { "present" } else { "not present" }
        );
        let mut reply = vec![0u8; 32];
        reply[0] = 1;
        o.put16(&mut reply, 2, self.seq);
        if is_glx {
            reply[8] = 1; // present
            reply[9] = opcode::GLX;
        }
        self.send_reply(&reply)
    }

    fn list_extensions(&mut self) -> Result<()> {
        let names: [&[u8]; 1] = [b"GLX"];
        let body: usize = names.iter().map(|n| 1 + n.len()).sum();
        let padded = pad4(body);
        let mut reply = vec![0u8; 32 + padded];
        reply[0] = 1;
        reply[1] = names.len() as u8;
        self.order.put16(&mut reply, 2, self.seq);
        self.order.put32(&mut reply, 4, (padded / 4) as u32);
        let mut off = 32;
        for name in names {
            reply[off] = name.len() as u8;
            reply[off + 1..off + 1 + name.len()].copy_from_slice(name);
            off += 1 + name.len();
        }
        self.send_reply(&reply)
    }

    fn send_event(&mut self, req: &[u8]) -> Result<()> {
        if req.len() < 44 {
            return Ok(());
        }
        // Reflect the embedded event back, marked synthetic, with the
        // sequence rewritten to match what the client library expects.
        let mut ev = [0u8; 32];
        ev.copy_from_slice(&req[12..44]);
        ev[0] |= 0x80;
        self.order.put16(&mut ev, 2, self.last_reply_seq);
        self.stream.write_all(&ev).context("reflect SendEvent")
    }

    // --- pixmaps and pixel transfer --------------------------------------

    fn create_pixmap(&mut self, req: &[u8]) {
        if req.len() < 16 {
            return;
        }
        let o = self.order;
        let pid = o.get32(req, 4);
        let w = o.get16(req, 12) as u32;
        let h = o.get16(req, 14) as u32;
        if w == 0 || h == 0 || w > MAX_IMAGE_DIM || h > MAX_IMAGE_DIM {
            log::warn!(
                "display {}: CreatePixmap 0x{pid:x} rejected ({w}x{h})",
                self.shared.number
            );
            return;
        }
        log::debug!("display {}: CreatePixmap 0x{pid:x} {w}x{h}", self.shared.number);
        self.pixmaps.create(pid, w, h);
    }

    fn free_pixmap(&mut self, req: &[u8]) {
        if req.len() < 8 {
            return;
        }
        let pid = self.order.get32(req, 4);
        self.pixmaps.free(pid);
    }

    /// Classify a drawable id and return its framebuffer offset.
    fn resolve_target(&self, drawable: u32) -> (Target, (i32, i32), bool) {
        let windows = self.shared.windows.lock().unwrap();
        let top = windows.top_level();
        let known = windows.contains(drawable);
        if known || drawable == ROOT_WINDOW_ID {
            let is_top = drawable == ROOT_WINDOW_ID || Some(drawable) == top;
            let offset = if is_top {
                (0, 0)
            } else {
                windows.absolute_pos(drawable)
            };
            let unmapped = !is_top
                && windows.get(drawable).map(|r| !r.mapped).unwrap_or(false);
            (Target::Frame, offset, unmapped)
        } else if self.pixmaps.get(drawable).is_some() {
            (Target::Pixmap, (0, 0), false)
        } else {
            (Target::Unknown, (0, 0), false)
        }
    }

    fn put_image(&mut self, header: [u8; 4], length: u16) -> Result<()> {
        let o = self.order;
        let mut head = [0u8; 24];
        head[..4].copy_from_slice(&header);
        recv_exact(&mut self.stream, &mut head[4..], &self.shared.running)
            .context("read PutImage header")?;
        let drawable = o.get32(&head, 4);
        let w = o.get16(&head, 12) as u32;
        let h = o.get16(&head, 14) as u32;
        let dst_x = o.get16i(&head, 16) as i32;
        let dst_y = o.get16i(&head, 18) as i32;
        let data_len = if length >= 6 {
            length as usize * 4 - 24
        } else {
            0
        };

        if w == 0 || h == 0 || w > MAX_IMAGE_DIM || h > MAX_IMAGE_DIM || data_len == 0 {
            // Keep the stream framing intact: the payload is consumed even
            // when the request is rejected.
            return discard(&mut self.stream, data_len, &self.shared.running)
                .context("discard oversized PutImage");
        }

        let mut pixels = std::mem::take(&mut self.scratch);
        pixels.resize(data_len, 0);
        recv_exact(&mut self.stream, &mut pixels, &self.shared.running)
            .context("read PutImage pixels")?;

        let (target, offset, unmapped) = self.resolve_target(drawable);
        let clips = if target == Target::Frame && !unmapped {
            self.shared.windows.lock().unwrap().child_clip_rects(drawable)
        } else {
            Vec::new()
        };
        let x = dst_x + offset.0;
        let y = dst_y + offset.1;

        match target {
            Target::Frame if !unmapped => {
                let mut fb = self.shared.fb.lock().unwrap();
                if fb.has_content() {
                    let (dw, dh) = (fb.width, fb.height);
                    blit_image(&mut fb.pixels, dw, dh, x, y, w, h, &pixels, o, &clips);
                    drop(fb);
                    self.shared.frame.mark();
                }
            }
            Target::Pixmap => {
                if let Some(pm) = self.pixmaps.get_mut(drawable) {
                    let (dw, dh) = (pm.width, pm.height);
                    blit_image(&mut pm.pixels, dw, dh, x, y, w, h, &pixels, o, &clips);
                }
            }
            // Unmapped window or unknown drawable: silently discarded.
            _ => {}
        }

        self.scratch = pixels;
        self.drain_touch()
    }

    fn get_image(&mut self, req: &[u8]) -> Result<()> {
        if req.len() < 16 {
            return Ok(());
        }
        let o = self.order;
        let drawable = o.get32(req, 4);
        let gx = o.get16i(req, 8) as i32;
        let gy = o.get16i(req, 10) as i32;
        let gw = o.get16(req, 12) as u32;
        let gh = o.get16(req, 14) as u32;
        if gw == 0 || gh == 0 || gw > MAX_IMAGE_DIM || gh > MAX_IMAGE_DIM {
            let mut reply = vec![0u8; 32];
            reply[0] = 1;
            reply[1] = 24;
            o.put16(&mut reply, 2, self.seq);
            return self.send_reply(&reply);
        }

        let img_bytes = (gw as usize) * (gh as usize) * 4;
        let mut reply = vec![0u8; 32 + img_bytes];
        reply[0] = 1;
        reply[1] = 24; // depth
        o.put16(&mut reply, 2, self.seq);
        o.put32(&mut reply, 4, (img_bytes / 4) as u32);

        let (target, offset, _) = self.resolve_target(drawable);
        // Lock held only for the copy; a slow socket write must not block
        // painting.
        {
            let fb;
            let (src, sw, sh): (&[u32], u32, u32) = match target {
                Target::Frame => {
                    fb = self.shared.fb.lock().unwrap();
                    (&fb.pixels, fb.width, fb.height)
                }
                Target::Pixmap => match self.pixmaps.get(drawable) {
                    Some(pm) => (&pm.pixels, pm.width, pm.height),
                    None => (&[], 0, 0),
                },
                Target::Unknown => (&[], 0, 0),
            };
            copy_out_rows(
                &mut reply[32..],
                src,
                sw,
                sh,
                gx + offset.0,
                gy + offset.1,
                gw,
                gh,
                o,
            );
        }
        self.drain_touch()?;
        self.send_reply(&reply)
    }

    fn copy_area(&mut self, req: &[u8]) -> Result<()> {
        if req.len() < 28 {
            return Ok(());
        }
        let o = self.order;
        let src_id = o.get32(req, 4);
        let dst_id = o.get32(req, 8);
        let mut src_x = o.get16i(req, 16) as i32;
        let mut src_y = o.get16i(req, 18) as i32;
        let mut dst_x = o.get16i(req, 20) as i32;
        let mut dst_y = o.get16i(req, 22) as i32;
        let w = o.get16(req, 24) as u32;
        let h = o.get16(req, 26) as u32;
        if w == 0 || h == 0 {
            return Ok(());
        }
        log::debug!(
            "display {}: CopyArea 0x{src_id:x}->0x{dst_id:x} {w}x{h} ({src_x},{src_y})->({dst_x},{dst_y})",
            self.shared.number
        );

        let (src_target, src_off, _) = self.resolve_target(src_id);
        let (dst_target, dst_off, _) = self.resolve_target(dst_id);
        src_x += src_off.0;
        src_y += src_off.1;
        dst_x += dst_off.0;
        dst_y += dst_off.1;

        // Snapshot the source block first; source and destination may alias
        // (framebuffer to framebuffer).
        let block = {
            let fb;
            let (src, sw, sh): (&[u32], u32, u32) = match src_target {
                Target::Frame => {
                    fb = self.shared.fb.lock().unwrap();
                    (&fb.pixels, fb.width, fb.height)
                }
                Target::Pixmap => match self.pixmaps.get(src_id) {
                    Some(pm) => (&pm.pixels, pm.width, pm.height),
                    None => return Ok(()),
                },
                Target::Unknown => return Ok(()),
            };
            snapshot_block(src, sw, sh, src_x, src_y, w, h)
        };

        let mut wrote = false;
        match dst_target {
            Target::Frame => {
                let mut fb = self.shared.fb.lock().unwrap();
                if fb.has_content() {
                    let (dw, dh) = (fb.width, fb.height);
                    write_block(&mut fb.pixels, dw, dh, dst_x, dst_y, w, h, &block);
                    wrote = true;
                }
            }
            Target::Pixmap => {
                if let Some(pm) = self.pixmaps.get_mut(dst_id) {
                    let (dw, dh) = (pm.width, pm.height);
                    write_block(&mut pm.pixels, dw, dh, dst_x, dst_y, w, h, &block);
                }
            }
            Target::Unknown => {}
        }
        if wrote {
            self.shared.frame.mark();
        }
        Ok(())
    }
}

/// Write an incoming image into a destination buffer. Alpha is forced fully
/// opaque; pixels falling inside a clip rectangle (a mapped child of the
/// target) are skipped. The fast path requires full coverage, LSB-first
/// data and no clips; everything else takes the per-pixel path.
#[allow(clippy::too_many_arguments)]
fn blit_image(
    dst: &mut [u32],
    dw: u32,
    dh: u32,
    x: i32,
    y: i32,
    w: u32,
    h: u32,
    data: &[u8],
    order: ByteOrder,
    clips: &[ClipRect],
) {
    let (dw, dh) = (dw as i32, dh as i32);
    let (w, h) = (w as i32, h as i32);
    let fully_covered =
        x >= 0 && y >= 0 && x + w <= dw && y + h <= dh && data.len() >= (w * h * 4) as usize;

    if fully_covered && order == ByteOrder::LsbFirst && clips.is_empty() {
        for row in 0..h {
            let dst_base = ((y + row) * dw + x) as usize;
            let src_base = (row * w * 4) as usize;
            for col in 0..w as usize {
                let s = src_base + col * 4;
                let px = u32::from_le_bytes([data[s], data[s + 1], data[s + 2], data[s + 3]]);
                dst[dst_base + col] = px | 0xff00_0000;
            }
        }
        return;
    }

    for row in 0..h {
        let dy = y + row;
        if dy < 0 || dy >= dh {
            continue;
        }
        for col in 0..w {
            let dx = x + col;
            if dx < 0 || dx >= dw {
                continue;
            }
            if clips.iter().any(|c| c.contains(dx, dy)) {
                continue;
            }
            let s = ((row * w + col) * 4) as usize;
            if s + 4 > data.len() {
                continue;
            }
            let px = match order {
                ByteOrder::LsbFirst => {
                    u32::from_le_bytes([data[s], data[s + 1], data[s + 2], data[s + 3]])
                }
                // MSB wire order carries [A, R, G, B] per pixel.
                ByteOrder::MsbFirst => {
                    ((data[s] as u32) << 24)
                        | ((data[s + 1] as u32) << 16)
                        | ((data[s + 2] as u32) << 8)
                        | (data[s + 3] as u32)
                }
            };
            dst[(dy * dw + dx) as usize] = px | 0xff00_0000;
        }
    }
}

/// Serialize a rectangular region into reply bytes, zero-filling anything
/// outside the source bounds.
#[allow(clippy::too_many_arguments)]
fn copy_out_rows(
    out: &mut [u8],
    src: &[u32],
    sw: u32,
    sh: u32,
    gx: i32,
    gy: i32,
    gw: u32,
    gh: u32,
    order: ByteOrder,
) {
    let (sw, sh) = (sw as i32, sh as i32);
    for row in 0..gh as i32 {
        let sy = gy + row;
        for col in 0..gw as i32 {
            let sx = gx + col;
            let off = ((row * gw as i32 + col) * 4) as usize;
            let px = if sx >= 0 && sx < sw && sy >= 0 && sy < sh {
                src.get((sy * sw + sx) as usize).copied().unwrap_or(0)
            } else {
                0
            };
            let bytes = match order {
                ByteOrder::LsbFirst => px.to_le_bytes(),
                ByteOrder::MsbFirst => [
                    (px >> 24) as u8,
                    (px >> 16) as u8,
                    (px >> 8) as u8,
                    px as u8,
                ],
            };
            out[off..off + 4].copy_from_slice(&bytes);
        }
    }
}

/// Copy a source region into a dense block; out-of-bounds pixels read as 0.
fn snapshot_block(src: &[u32], sw: u32, sh: u32, x: i32, y: i32, w: u32, h: u32) -> Vec<u32> {
    let (sw, sh) = (sw as i32, sh as i32);
    let mut block = vec![0u32; (w as usize) * (h as usize)];
    for row in 0..h as i32 {
        let sy = y + row;
        if sy < 0 || sy >= sh {
            continue;
        }
        for col in 0..w as i32 {
            let sx = x + col;
            if sx < 0 || sx >= sw {
                continue;
            }
            block[(row * w as i32 + col) as usize] = src[(sy * sw + sx) as usize];
        }
    }
    block
}

/// Inverse of [`snapshot_block`]: write a dense block with bounds clipping.
#[allow(clippy::too_many_arguments)]
fn write_block(dst: &mut [u32], dw: u32, dh: u32, x: i32, y: i32, w: u32, h: u32, block: &[u32]) {
    let (dw, dh) = (dw as i32, dh as i32);
    for row in 0..h as i32 {
        let dy = y + row;
        if dy < 0 || dy >= dh {
            continue;
        }
        for col in 0..w as i32 {
            let dx = x + col;
            if dx < 0 || dx >= dw {
                continue;
            }
            dst[(dy * dw + dx) as usize] = block[(row * w as i32 + col) as usize];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_reply_is_exactly_120_bytes() {
        for order in [ByteOrder::LsbFirst, ByteOrder::MsbFirst] {
            let reply = connection_reply(order, 1280, 720);
            assert_eq!(reply.len(), 120);
            assert_eq!(reply[0], 1); // accepted
            assert_eq!(order.get16(&reply, 2), 11);
            // 8 header bytes + length words == 120
            assert_eq!(8 + order.get16(&reply, 6) as usize * 4, 120);
            assert_eq!(order.get32(&reply, 48), ROOT_WINDOW_ID);
            assert_eq!(order.get16(&reply, 68), 1280);
            assert_eq!(order.get16(&reply, 70), 720);
            assert_eq!(order.get32(&reply, 96), DEFAULT_VISUAL_ID);
        }
    }

    #[test]
    fn resource_id_space_is_disjoint_from_mask() {
        let reply = connection_reply(ByteOrder::LsbFirst, 100, 100);
        let base = ByteOrder::LsbFirst.get32(&reply, 12);
        let mask = ByteOrder::LsbFirst.get32(&reply, 16);
        assert_eq!(base & mask, 0);
        assert_ne!(mask, 0);
    }

    #[test]
    fn blit_forces_opaque_alpha() {
        let mut dst = vec![0u32; 4];
        let data = 0x0011_2233u32.to_le_bytes();
        blit_image(&mut dst, 2, 2, 0, 0, 1, 1, &data, ByteOrder::LsbFirst, &[]);
        assert_eq!(dst[0], 0xff11_2233);
    }

    #[test]
    fn blit_clips_against_child_rects() {
        let mut dst = vec![0u32; 16];
        let data: Vec<u8> = std::iter::repeat(0xabu8).take(4 * 4 * 4).collect();
        let clip = ClipRect {
            x1: 1,
            y1: 1,
            x2: 3,
            y2: 3,
        };
        blit_image(&mut dst, 4, 4, 0, 0, 4, 4, &data, ByteOrder::LsbFirst, &[clip]);
        assert_ne!(dst[0], 0); // outside clip: written
        assert_eq!(dst[1 * 4 + 1], 0); // inside clip: preserved
        assert_eq!(dst[2 * 4 + 2], 0);
        assert_ne!(dst[3 * 4 + 3], 0);
    }

    #[test]
    fn blit_discards_out_of_bounds_pixels() {
        let mut dst = vec![0u32; 4];
        let data: Vec<u8> = std::iter::repeat(0xcdu8).take(3 * 3 * 4).collect();
        blit_image(&mut dst, 2, 2, 1, 1, 3, 3, &data, ByteOrder::LsbFirst, &[]);
        assert_eq!(dst[0], 0); // untouched
        assert_ne!(dst[3], 0); // (1,1) written
    }

    #[test]
    fn msb_blit_then_copy_out_round_trips() {
        // MSB wire pixel [A,R,G,B]
        let wire_in = [0x00u8, 0x11, 0x22, 0x33];
        let mut dst = vec![0u32; 1];
        blit_image(&mut dst, 1, 1, 0, 0, 1, 1, &wire_in, ByteOrder::MsbFirst, &[]);
        let mut out = [0u8; 4];
        copy_out_rows(&mut out, &dst, 1, 1, 0, 0, 1, 1, ByteOrder::MsbFirst);
        // alpha came back forced opaque, the rest is intact
        assert_eq!(out, [0xff, 0x11, 0x22, 0x33]);
    }

    #[test]
    fn copy_out_zero_fills_outside_source() {
        let src = vec![0xff11_1111u32; 4]; // 2x2
        let mut out = vec![0xaau8; 3 * 3 * 4];
        copy_out_rows(&mut out, &src, 2, 2, 1, 1, 3, 3, ByteOrder::LsbFirst);
        // (0,0) of the request maps to src (1,1): valid
        assert_eq!(&out[0..4], &0xff11_1111u32.to_le_bytes());
        // (2,2) maps to src (3,3): out of bounds, zeroed
        assert_eq!(&out[(2 * 3 + 2) * 4..(2 * 3 + 2) * 4 + 4], &[0, 0, 0, 0]);
    }

    #[test]
    fn snapshot_and_write_block_round_trip_with_overlap() {
        // 4x1 buffer, copy [0..2) onto [1..3): aliasing regions
        let mut buf = vec![1u32, 2, 3, 4];
        let block = snapshot_block(&buf, 4, 1, 0, 0, 2, 1);
        write_block(&mut buf, 4, 1, 1, 0, 2, 1, &block);
        assert_eq!(buf, vec![1, 1, 2, 4]);
    }
}
