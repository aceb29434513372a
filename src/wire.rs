//! Byte-order codec and protocol constants.
//!
//! Every other module reads and writes logical integers through [`ByteOrder`];
//! nothing outside this file touches raw endianness.

/// Negotiated client byte order, taken from the first byte of the connection
/// request (0x42 = MSB first, 0x6c = LSB first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LsbFirst,
    MsbFirst,
}

impl ByteOrder {
    pub fn from_setup_byte(b: u8) -> Option<Self> {
        match b {
            0x6c => Some(ByteOrder::LsbFirst),
            0x42 => Some(ByteOrder::MsbFirst),
            _ => None,
        }
    }

    pub fn get16(self, buf: &[u8], off: usize) -> u16 {
        let b = [buf[off], buf[off + 1]];
        match self {
            ByteOrder::LsbFirst => u16::from_le_bytes(b),
            ByteOrder::MsbFirst => u16::from_be_bytes(b),
        }
    }

    pub fn get32(self, buf: &[u8], off: usize) -> u32 {
        let b = [buf[off], buf[off + 1], buf[off + 2], buf[off + 3]];
        match self {
            ByteOrder::LsbFirst => u32::from_le_bytes(b),
            ByteOrder::MsbFirst => u32::from_be_bytes(b),
        }
    }

    pub fn put16(self, buf: &mut [u8], off: usize, val: u16) {
        let b = match self {
            ByteOrder::LsbFirst => val.to_le_bytes(),
            ByteOrder::MsbFirst => val.to_be_bytes(),
        };
        buf[off..off + 2].copy_from_slice(&b);
    }

    pub fn put32(self, buf: &mut [u8], off: usize, val: u32) {
        let b = match self {
            ByteOrder::LsbFirst => val.to_le_bytes(),
            ByteOrder::MsbFirst => val.to_be_bytes(),
        };
        buf[off..off + 4].copy_from_slice(&b);
    }

    /// Signed 16-bit read (window coordinates).
    pub fn get16i(self, buf: &[u8], off: usize) -> i16 {
        self.get16(buf, off) as i16
    }
}

/// Round up to the X11 4-byte padding boundary.
pub fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

/// Fixed root window id for the minimal server.
pub const ROOT_WINDOW_ID: u32 = 1;
pub const DEFAULT_COLORMAP_ID: u32 = 1;
pub const WHITE_PIXEL: u32 = 0xff_ffff;
pub const BLACK_PIXEL: u32 = 0x00_0000;
/// Non-zero visual id for our single TrueColor visual (Xlib rejects 0).
pub const DEFAULT_VISUAL_ID: u32 = 0x21;
/// Framebuffer/pixmap background in wire layout (B=0x20 G=0x20 R=0x30 A=0xff).
pub const BACKGROUND_PIXEL: u32 = 0xff30_2020;

/// Core request opcodes (subset exercised by plugin UI toolkits).
pub mod opcode {
    pub const CREATE_WINDOW: u8 = 1;
    pub const CHANGE_WINDOW_ATTRIBUTES: u8 = 2;
    pub const GET_WINDOW_ATTRIBUTES: u8 = 3;
    pub const DESTROY_WINDOW: u8 = 4;
    pub const MAP_WINDOW: u8 = 8;
    pub const UNMAP_WINDOW: u8 = 10;
    pub const CONFIGURE_WINDOW: u8 = 12;
    pub const GET_GEOMETRY: u8 = 14;
    pub const QUERY_TREE: u8 = 15;
    pub const INTERN_ATOM: u8 = 16;
    pub const GET_ATOM_NAME: u8 = 17;
    pub const CHANGE_PROPERTY: u8 = 18;
    pub const DELETE_PROPERTY: u8 = 19;
    pub const GET_PROPERTY: u8 = 20;
    pub const GET_SELECTION_OWNER: u8 = 23;
    pub const SEND_EVENT: u8 = 25;
    pub const QUERY_POINTER: u8 = 38;
    pub const TRANSLATE_COORDINATES: u8 = 40;
    pub const CREATE_PIXMAP: u8 = 53;
    pub const FREE_PIXMAP: u8 = 54;
    pub const COPY_AREA: u8 = 62;
    pub const POLY_FILL_RECTANGLE: u8 = 70;
    pub const PUT_IMAGE: u8 = 72;
    pub const GET_IMAGE: u8 = 73;
    pub const QUERY_EXTENSION: u8 = 98;
    pub const LIST_EXTENSIONS: u8 = 100;
    /// Major opcode we reserve for the GLX extension stub.
    pub const GLX: u8 = 128;
}

/// Event codes the server synthesizes.
pub mod event {
    pub const BUTTON_PRESS: u8 = 4;
    pub const BUTTON_RELEASE: u8 = 5;
    pub const MOTION_NOTIFY: u8 = 6;
    pub const EXPOSE: u8 = 12;
    pub const DESTROY_NOTIFY: u8 = 17;
    pub const CONFIGURE_NOTIFY: u8 = 22;
}

/// Stable request names for diagnostics.
pub fn opcode_name(op: u8) -> &'static str {
    match op {
        1 => "CreateWindow",
        2 => "ChangeWindowAttributes",
        3 => "GetWindowAttributes",
        4 => "DestroyWindow",
        5 => "DestroySubwindows",
        7 => "ReparentWindow",
        8 => "MapWindow",
        9 => "MapSubwindows",
        10 => "UnmapWindow",
        12 => "ConfigureWindow",
        14 => "GetGeometry",
        15 => "QueryTree",
        16 => "InternAtom",
        17 => "GetAtomName",
        18 => "ChangeProperty",
        19 => "DeleteProperty",
        20 => "GetProperty",
        21 => "ListProperties",
        22 => "SetSelectionOwner",
        23 => "GetSelectionOwner",
        24 => "ConvertSelection",
        25 => "SendEvent",
        26 => "GrabPointer",
        31 => "GrabKeyboard",
        38 => "QueryPointer",
        39 => "GetMotionEvents",
        40 => "TranslateCoordinates",
        42 => "SetInputFocus",
        43 => "GetInputFocus",
        44 => "QueryKeymap",
        45 => "OpenFont",
        47 => "QueryFont",
        49 => "ListFonts",
        52 => "GetFontPath",
        53 => "CreatePixmap",
        54 => "FreePixmap",
        55 => "CreateGC",
        56 => "ChangeGC",
        57 => "CopyGC",
        58 => "SetDashes",
        59 => "SetClipRectangles",
        60 => "FreeGC",
        61 => "ClearArea",
        62 => "CopyArea",
        63 => "CopyPlane",
        64 => "PolyPoint",
        65 => "PolyLine",
        66 => "PolySegment",
        67 => "PolyRectangle",
        68 => "PolyArc",
        69 => "FillPoly",
        70 => "PolyFillRectangle",
        71 => "PolyFillArc",
        72 => "PutImage",
        73 => "GetImage",
        78 => "CreateColormap",
        79 => "FreeColormap",
        83 => "ListInstalledColormaps",
        84 => "AllocColor",
        91 => "QueryColors",
        97 => "QueryBestSize",
        98 => "QueryExtension",
        100 => "ListExtensions",
        101 => "ChangeKeyboardMapping",
        102 => "GetKeyboardMapping",
        103 => "GetKeyboardControl",
        104 => "Bell",
        106 => "GetPointerMapping",
        opcode::GLX => "GLX",
        _ => "?",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_order_round_trip() {
        let mut buf = [0u8; 8];
        for order in [ByteOrder::LsbFirst, ByteOrder::MsbFirst] {
            order.put16(&mut buf, 0, 0xbeef);
            order.put32(&mut buf, 4, 0xdead_beef);
            assert_eq!(order.get16(&buf, 0), 0xbeef);
            assert_eq!(order.get32(&buf, 4), 0xdead_beef);
        }
    }

    #[test]
    fn lsb_layout_matches_wire() {
        let mut buf = [0u8; 4];
        ByteOrder::LsbFirst.put32(&mut buf, 0, 0x0403_0201);
        assert_eq!(buf, [1, 2, 3, 4]);
        ByteOrder::MsbFirst.put32(&mut buf, 0, 0x0403_0201);
        assert_eq!(buf, [4, 3, 2, 1]);
    }

    #[test]
    fn setup_byte_detection() {
        assert_eq!(ByteOrder::from_setup_byte(0x6c), Some(ByteOrder::LsbFirst));
        assert_eq!(ByteOrder::from_setup_byte(0x42), Some(ByteOrder::MsbFirst));
        assert_eq!(ByteOrder::from_setup_byte(0x00), None);
    }

    #[test]
    fn padding() {
        assert_eq!(pad4(0), 0);
        assert_eq!(pad4(1), 4);
        assert_eq!(pad4(4), 4);
        assert_eq!(pad4(5), 8);
    }

    #[test]
    fn signed_coordinate_read() {
        let mut buf = [0u8; 2];
        ByteOrder::LsbFirst.put16(&mut buf, 0, -20i16 as u16);
        assert_eq!(ByteOrder::LsbFirst.get16i(&buf, 0), -20);
    }
}
