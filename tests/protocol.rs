//! Wire-level tests: drive a display instance over real TCP with a
//! hand-rolled X11 client.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use x11host::{DetachDecision, DisplayRegistry, TouchAction, X11_BASE_PORT};

// Each test gets its own display number; one listener per port.
const WID: u32 = 0x0020_0001;

fn le16(v: u16) -> [u8; 2] {
    v.to_le_bytes()
}

fn le32(v: u32) -> [u8; 4] {
    v.to_le_bytes()
}

struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    /// Connect and complete the 12-byte handshake (little-endian).
    fn connect(display: u32) -> TestClient {
        let port = X11_BASE_PORT + display as u16;
        let mut stream = None;
        for _ in 0..100 {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(_) => thread::sleep(Duration::from_millis(20)),
            }
        }
        let mut stream = stream.expect("server did not start listening");
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let mut setup = [0u8; 12];
        setup[0] = 0x6c; // LSB first
        setup[2..4].copy_from_slice(&le16(11));
        stream.write_all(&setup).unwrap();

        let mut head = [0u8; 8];
        stream.read_exact(&mut head).unwrap();
        assert_eq!(head[0], 1, "connection refused");
        let words = u16::from_le_bytes([head[6], head[7]]) as usize;
        let mut rest = vec![0u8; words * 4];
        stream.read_exact(&mut rest).unwrap();
        assert_eq!(8 + rest.len(), 120, "accept reply must be 120 bytes");
        TestClient { stream }
    }

    /// Send one request; the body is padded to a 4-byte boundary.
    fn request(&mut self, op: u8, detail: u8, body: &[u8]) {
        assert_eq!(body.len() % 4, 0, "test bodies must be pre-padded");
        let words = (4 + body.len()) / 4;
        let mut buf = Vec::with_capacity(4 + body.len());
        buf.push(op);
        buf.push(detail);
        buf.extend_from_slice(&le16(words as u16));
        buf.extend_from_slice(body);
        self.stream.write_all(&buf).unwrap();
    }

    /// Read one 32-byte message (reply header or event).
    fn read_msg(&mut self) -> [u8; 32] {
        let mut buf = [0u8; 32];
        self.stream.read_exact(&mut buf).unwrap();
        buf
    }

    /// Read the variable part of a reply whose header was already consumed.
    fn read_extra(&mut self, words: u32) -> Vec<u8> {
        let mut buf = vec![0u8; words as usize * 4];
        self.stream.read_exact(&mut buf).unwrap();
        buf
    }

    fn expect_silence(&mut self) {
        self.stream
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        let mut buf = [0u8; 1];
        match self.stream.read(&mut buf) {
            Ok(0) => {} // closed is also silence
            Ok(_) => panic!("unexpected data from server"),
            Err(e) => assert!(
                matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
                "unexpected error: {e}"
            ),
        }
        self.stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
    }

    fn create_window(&mut self, wid: u32, parent: u32, w: u16, h: u16) {
        let mut body = Vec::new();
        body.extend_from_slice(&le32(wid));
        body.extend_from_slice(&le32(parent));
        body.extend_from_slice(&le16(0)); // x
        body.extend_from_slice(&le16(0)); // y
        body.extend_from_slice(&le16(w));
        body.extend_from_slice(&le16(h));
        body.extend_from_slice(&le16(0)); // border
        body.extend_from_slice(&le16(1)); // InputOutput
        body.extend_from_slice(&le32(0x21)); // visual
        body.extend_from_slice(&le32(0)); // value mask
        self.request(1, 24, &body);
    }

    fn map_window(&mut self, wid: u32) {
        self.request(8, 0, &le32(wid));
    }

    /// PutImage of `rows` rows of solid `pixel` (wire BGRA), ZPixmap.
    fn put_image_strip(&mut self, drawable: u32, w: u16, rows: u16, dst_y: i16, pixel: [u8; 4]) {
        let mut body = Vec::new();
        body.extend_from_slice(&le32(drawable));
        body.extend_from_slice(&le32(0)); // gc
        body.extend_from_slice(&le16(w));
        body.extend_from_slice(&le16(rows));
        body.extend_from_slice(&le16(0)); // dst x
        body.extend_from_slice(&le16(dst_y as u16));
        body.push(0); // left pad
        body.push(24); // depth
        body.extend_from_slice(&le16(0));
        for _ in 0..(w as usize * rows as usize) {
            body.extend_from_slice(&pixel);
        }
        self.request(72, 2, &body);
    }

    fn get_image(&mut self, drawable: u32, x: i16, y: i16, w: u16, h: u16) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&le32(drawable));
        body.extend_from_slice(&le16(x as u16));
        body.extend_from_slice(&le16(y as u16));
        body.extend_from_slice(&le16(w));
        body.extend_from_slice(&le16(h));
        body.extend_from_slice(&le32(0xffff_ffff)); // plane mask
        self.request(73, 2, &body);
        let head = self.read_msg();
        assert_eq!(head[0], 1, "GetImage must reply");
        let words = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
        self.read_extra(words)
    }

    fn intern_atom(&mut self, name: &str, only_if_exists: bool) -> u32 {
        let mut body = Vec::new();
        body.extend_from_slice(&le16(name.len() as u16));
        body.extend_from_slice(&le16(0));
        body.extend_from_slice(name.as_bytes());
        while body.len() % 4 != 0 {
            body.push(0);
        }
        self.request(16, only_if_exists as u8, &body);
        let reply = self.read_msg();
        assert_eq!(reply[0], 1);
        u32::from_le_bytes([reply[8], reply[9], reply[10], reply[11]])
    }
}

#[test]
fn handshake_both_byte_orders() {
    let registry = DisplayRegistry::new();
    let display = registry.get_or_create(71);
    display.attach_headless(640, 480).unwrap();

    // little-endian covered by TestClient::connect
    let client = TestClient::connect(71);
    drop(client);

    // big-endian: lengths in the reply must be big-endian too
    let mut stream = TcpStream::connect(("127.0.0.1", X11_BASE_PORT + 71)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut setup = [0u8; 12];
    setup[0] = 0x42;
    setup[2..4].copy_from_slice(&11u16.to_be_bytes());
    stream.write_all(&setup).unwrap();
    let mut head = [0u8; 8];
    stream.read_exact(&mut head).unwrap();
    assert_eq!(head[0], 1);
    assert_eq!(u16::from_be_bytes([head[2], head[3]]), 11);
    let words = u16::from_be_bytes([head[6], head[7]]) as usize;
    let mut rest = vec![0u8; words * 4];
    stream.read_exact(&mut rest).unwrap();
    assert_eq!(8 + rest.len(), 120);
    drop(stream);

    registry.destroy(71);
}

#[test]
fn solid_fill_round_trip_and_cleanup() {
    let registry = DisplayRegistry::new();
    let display = registry.get_or_create(72);
    display.attach_headless(400, 300).unwrap();

    let mut client = TestClient::connect(72);
    client.create_window(WID, 1, 400, 300);
    assert_eq!(client.read_msg()[0], 12, "eager Expose on CreateWindow");
    client.map_window(WID);
    assert_eq!(client.read_msg()[0], 12, "Expose on MapWindow");

    assert_eq!(display.plugin_size(), Some((400, 300)));

    // Fill in strips; one request cannot carry 400x300 pixels within a
    // 16-bit length field.
    let pixel = [0x20u8, 0x40, 0x60, 0x00]; // B G R A, alpha deliberately 0
    for strip in 0i16..3 {
        client.put_image_strip(WID, 400, 100, strip * 100, pixel);
    }

    let data = client.get_image(WID, 0, 0, 400, 300);
    assert_eq!(data.len(), 400 * 300 * 4);
    for px in data.chunks_exact(4) {
        // read-back is byte-identical except alpha is forced opaque
        assert_eq!(px, [0x20, 0x40, 0x60, 0xff]);
    }

    // Window covers the whole single-window plugin: everything interactive.
    assert!(display.is_widget_at(10, 10));

    drop(client);
    thread::sleep(Duration::from_millis(200));
    // Resource tables are cleared once the client socket closes.
    assert!(!display.is_widget_at(10, 10));
    assert_eq!(display.plugin_size(), None);

    registry.destroy(72);
}

#[test]
fn atom_table_round_trip() {
    let registry = DisplayRegistry::new();
    let display = registry.get_or_create(73);
    display.attach_headless(320, 240).unwrap();

    let mut client = TestClient::connect(73);
    let a = client.intern_atom("FOO", false);
    let b = client.intern_atom("FOO", false);
    assert_ne!(a, 0);
    assert_eq!(a, b);
    assert_eq!(client.intern_atom("MISSING", true), 0);

    client.request(17, 0, &le32(a)); // GetAtomName
    let reply = client.read_msg();
    assert_eq!(reply[0], 1);
    let name_len = u16::from_le_bytes([reply[8], reply[9]]) as usize;
    let words = u32::from_le_bytes([reply[4], reply[5], reply[6], reply[7]]);
    let extra = client.read_extra(words);
    assert_eq!(&extra[..name_len], b"FOO");

    drop(client);
    registry.destroy(73);
}

#[test]
fn same_size_configure_is_suppressed() {
    let registry = DisplayRegistry::new();
    let display = registry.get_or_create(74);
    display.attach_headless(400, 300).unwrap();

    let mut client = TestClient::connect(74);
    client.create_window(WID, 1, 400, 300);
    client.read_msg();
    client.map_window(WID);
    client.read_msg();

    let mut body = Vec::new();
    body.extend_from_slice(&le32(WID));
    body.extend_from_slice(&le16(0x4 | 0x8)); // width | height
    body.extend_from_slice(&le16(0));
    body.extend_from_slice(&le32(400));
    body.extend_from_slice(&le32(300));
    client.request(12, 0, &body); // ConfigureWindow, same size
    client.expect_silence();

    let mut body = Vec::new();
    body.extend_from_slice(&le32(WID));
    body.extend_from_slice(&le16(0x4 | 0x8));
    body.extend_from_slice(&le16(0));
    body.extend_from_slice(&le32(500));
    body.extend_from_slice(&le32(350));
    client.request(12, 0, &body); // actual resize
    assert_eq!(client.read_msg()[0], 22, "ConfigureNotify on real resize");
    assert_eq!(client.read_msg()[0], 12, "Expose on real resize");
    assert_eq!(display.plugin_size(), Some((500, 350)));

    drop(client);
    registry.destroy(74);
}

#[test]
fn resize_preserves_framebuffer_content() {
    let registry = DisplayRegistry::new();
    let display = registry.get_or_create(75);
    display.attach_headless(200, 100).unwrap();

    let mut client = TestClient::connect(75);
    client.create_window(WID, 1, 200, 100);
    client.read_msg();
    client.map_window(WID);
    client.read_msg();
    client.put_image_strip(WID, 200, 100, 0, [1, 2, 3, 0xff]);

    let mut body = Vec::new();
    body.extend_from_slice(&le32(WID));
    body.extend_from_slice(&le16(0x4 | 0x8));
    body.extend_from_slice(&le16(0));
    body.extend_from_slice(&le32(300));
    body.extend_from_slice(&le32(100));
    client.request(12, 0, &body);
    client.read_msg(); // ConfigureNotify
    client.read_msg(); // Expose

    // Old content survives the grow; never wiped to black.
    let data = client.get_image(WID, 0, 0, 200, 100);
    for px in data.chunks_exact(4) {
        assert_eq!(px, [1, 2, 3, 0xff]);
    }

    drop(client);
    registry.destroy(75);
}

#[test]
fn touch_down_up_sends_one_press_one_release() {
    let registry = DisplayRegistry::new();
    let display = registry.get_or_create(76);
    display.attach_headless(400, 300).unwrap();

    let mut client = TestClient::connect(76);
    client.create_window(WID, 1, 400, 300);
    client.read_msg();
    client.map_window(WID);
    client.read_msg();

    display.inject_touch(TouchAction::Down, 50, 50);
    display.inject_touch(TouchAction::Up, 50, 50);

    let press = client.read_msg();
    assert_eq!(press[0], 4, "ButtonPress");
    assert_eq!(press[1], 1, "button 1");
    assert_eq!(u32::from_le_bytes([press[12], press[13], press[14], press[15]]), WID);
    assert_eq!(u16::from_le_bytes([press[24], press[25]]), 50); // event-x
    assert_eq!(u16::from_le_bytes([press[26], press[27]]), 50); // event-y

    let release = client.read_msg();
    assert_eq!(release[0], 5, "ButtonRelease");
    assert_eq!(
        u32::from_le_bytes([release[12], release[13], release[14], release[15]]),
        WID
    );

    // exactly one of each: nothing else follows
    client.expect_silence();

    drop(client);
    registry.destroy(76);
}

#[test]
fn glx_stub_and_extension_listing() {
    let registry = DisplayRegistry::new();
    let display = registry.get_or_create(77);
    display.attach_headless(320, 240).unwrap();

    let mut client = TestClient::connect(77);

    // QueryExtension "GLX" -> present with the reserved major opcode
    let mut body = Vec::new();
    body.extend_from_slice(&le16(3));
    body.extend_from_slice(&le16(0));
    body.extend_from_slice(b"GLX\0");
    client.request(98, 0, &body);
    let reply = client.read_msg();
    assert_eq!(reply[0], 1);
    assert_eq!(reply[8], 1, "GLX present");
    assert_eq!(reply[9], 128, "GLX major opcode");

    // glXQueryVersion
    client.request(128, 7, &[0u8; 8]);
    let reply = client.read_msg();
    assert_eq!(reply[0], 1);
    assert_eq!(u32::from_le_bytes([reply[8], reply[9], reply[10], reply[11]]), 1);
    assert_eq!(u32::from_le_bytes([reply[12], reply[13], reply[14], reply[15]]), 4);

    // glXRender is void: no reply may be sent
    client.request(128, 1, &[0u8; 4]);
    client.expect_silence();

    // ListExtensions names exactly GLX
    client.request(100, 0, &[]);
    let reply = client.read_msg();
    assert_eq!(reply[0], 1);
    assert_eq!(reply[1], 1, "one extension");
    let words = u32::from_le_bytes([reply[4], reply[5], reply[6], reply[7]]);
    let extra = client.read_extra(words);
    assert_eq!(extra[0] as usize, 3);
    assert_eq!(&extra[1..4], b"GLX");

    drop(client);
    registry.destroy(77);
}

#[test]
fn unknown_opcode_keeps_sequence_in_sync() {
    let registry = DisplayRegistry::new();
    let display = registry.get_or_create(78);
    display.attach_headless(320, 240).unwrap();

    let mut client = TestClient::connect(78);
    client.request(200, 0, &[0u8; 4]); // unknown, must be ignored silently
    let atom = client.intern_atom("BAR", false);
    assert_ne!(atom, 0);

    // the unknown request still consumed sequence slot 1
    let mut body = Vec::new();
    body.extend_from_slice(&le16(3));
    body.extend_from_slice(&le16(0));
    body.extend_from_slice(b"BAR\0");
    client.request(16, 0, &body);
    let reply = client.read_msg();
    assert_eq!(reply[0], 1);
    assert_eq!(u16::from_le_bytes([reply[2], reply[3]]), 3);

    drop(client);
    registry.destroy(78);
}

#[test]
fn send_event_reflects_with_synthetic_bit() {
    let registry = DisplayRegistry::new();
    let display = registry.get_or_create(79);
    display.attach_headless(320, 240).unwrap();

    let mut client = TestClient::connect(79);
    let mut body = Vec::new();
    body.extend_from_slice(&le32(WID)); // destination
    body.extend_from_slice(&le32(0)); // event mask
    let mut event = [0u8; 32];
    event[0] = 33; // ClientMessage
    event[31] = 0x5a;
    body.extend_from_slice(&event);
    client.request(25, 0, &body);

    let reflected = client.read_msg();
    assert_eq!(reflected[0], 33 | 0x80, "synthetic bit set");
    assert_eq!(reflected[31], 0x5a, "payload intact");

    drop(client);
    registry.destroy(79);
}

#[test]
fn graceful_detach_sends_destroy_notify() {
    let registry = DisplayRegistry::new();
    let display = registry.get_or_create(80);
    display.attach_headless(400, 300).unwrap();

    let mut client = TestClient::connect(80);
    client.create_window(WID, 1, 400, 300);
    client.read_msg(); // Expose

    assert_eq!(display.signal_detach(), DetachDecision::Proceed);
    let msg = client.read_msg();
    assert_eq!(msg[0], 17, "DestroyNotify during teardown");
    assert_eq!(u32::from_le_bytes([msg[4], msg[5], msg[6], msg[7]]), WID);
    drop(client); // client complies by disconnecting

    assert_eq!(registry.destroy(80), DetachDecision::Proceed);
}

#[test]
fn detach_during_plugin_create_is_deferred() {
    let registry = DisplayRegistry::new();
    let display = registry.get_or_create(81);
    display.attach_headless(320, 240).unwrap();

    assert!(registry.states().begin_create(81, 0));
    assert_eq!(display.detach(), DetachDecision::Deferred);
    assert!(display.is_attached(), "teardown must not interleave with create");

    let deferred = registry.states().finish_create(81, true);
    assert!(deferred, "deferred detach surfaces after create returns");
    assert_eq!(registry.destroy(81), DetachDecision::Proceed);
}
