//! GLX extension stub.
//!
//! Mesa's xlib GLX with software rendering does nearly everything
//! client-side; the server only has to answer a handful of capability
//! queries with static data. No GL command forwarding ever happens. Minors
//! that expect a reply must never be left unanswered; a conforming client
//! blocks forever on a missing GLX reply.

use crate::wire::{ByteOrder, DEFAULT_VISUAL_ID};

// GLX minor opcodes.
pub const RENDER: u8 = 1;
pub const RENDER_LARGE: u8 = 2;
pub const CREATE_CONTEXT: u8 = 3;
pub const DESTROY_CONTEXT: u8 = 4;
pub const MAKE_CURRENT: u8 = 5;
pub const IS_DIRECT: u8 = 6;
pub const QUERY_VERSION: u8 = 7;
pub const WAIT_GL: u8 = 8;
pub const WAIT_X: u8 = 9;
pub const COPY_CONTEXT: u8 = 10;
pub const SWAP_BUFFERS: u8 = 11;
pub const GET_VISUAL_CONFIGS: u8 = 14;
pub const QUERY_SERVER_STRING: u8 = 17;
pub const CLIENT_INFO: u8 = 18;
pub const GET_FB_CONFIGS: u8 = 19;
pub const CREATE_GLX_PIXMAP: u8 = 20;
pub const DESTROY_GLX_PIXMAP: u8 = 21;
pub const CREATE_NEW_CONTEXT: u8 = 22;
pub const MAKE_CONTEXT_CURRENT: u8 = 24;
pub const QUERY_CONTEXT: u8 = 26;

fn empty_reply(order: ByteOrder, seq: u16) -> Vec<u8> {
    let mut reply = vec![0u8; 32];
    reply[0] = 1;
    order.put16(&mut reply, 2, seq);
    reply
}

/// Build the reply for a GLX request, or `None` for void minors.
pub fn reply_for(minor: u8, order: ByteOrder, seq: u16) -> Option<Vec<u8>> {
    match minor {
        QUERY_VERSION => {
            let mut reply = empty_reply(order, seq);
            order.put32(&mut reply, 8, 1); // major
            order.put32(&mut reply, 12, 4); // minor: GLX 1.4
            Some(reply)
        }
        MAKE_CURRENT | MAKE_CONTEXT_CURRENT => {
            let mut reply = empty_reply(order, seq);
            order.put32(&mut reply, 8, 1); // context tag, non-zero = success
            Some(reply)
        }
        IS_DIRECT => {
            // is_direct = false: indirect rendering only
            Some(empty_reply(order, seq))
        }
        GET_VISUAL_CONFIGS => Some(visual_configs_reply(order, seq)),
        GET_FB_CONFIGS => Some(fb_configs_reply(order, seq)),
        QUERY_SERVER_STRING => {
            // 32-byte header + 4 bytes: a zero-length string
            let mut reply = vec![0u8; 36];
            reply[0] = 1;
            order.put16(&mut reply, 2, seq);
            order.put32(&mut reply, 4, 1); // reply length in words
            order.put32(&mut reply, 8, 0); // string length
            Some(reply)
        }
        QUERY_CONTEXT => Some(empty_reply(order, seq)),
        RENDER | RENDER_LARGE | CREATE_CONTEXT | DESTROY_CONTEXT | WAIT_GL | WAIT_X
        | COPY_CONTEXT | SWAP_BUFFERS | CLIENT_INFO | CREATE_GLX_PIXMAP | DESTROY_GLX_PIXMAP
        | CREATE_NEW_CONTEXT => None,
        _ => {
            log::debug!("glx: unhandled minor {minor}, sending generic reply");
            Some(empty_reply(order, seq))
        }
    }
}

/// One visual config matching the TrueColor visual from connection setup.
fn visual_configs_reply(order: ByteOrder, seq: u16) -> Vec<u8> {
    const NUM_PROPS: usize = 28;
    let mut reply = vec![0u8; 32 + NUM_PROPS * 4];
    reply[0] = 1;
    order.put16(&mut reply, 2, seq);
    order.put32(&mut reply, 4, NUM_PROPS as u32);
    order.put32(&mut reply, 8, 1); // num configs
    order.put32(&mut reply, 12, NUM_PROPS as u32);
    let props: [u32; 18] = [
        DEFAULT_VISUAL_ID,
        4,  // class: TrueColor
        1,  // rgba
        8,  // red bits
        8,  // green bits
        8,  // blue bits
        8,  // alpha bits
        0,  // accum red
        0,  // accum green
        0,  // accum blue
        0,  // accum alpha
        1,  // double buffer
        0,  // stereo
        32, // buffer size
        24, // depth size
        8,  // stencil size
        0,  // aux buffers
        0,  // level
    ];
    for (i, val) in props.iter().enumerate() {
        order.put32(&mut reply, 32 + i * 4, *val);
    }
    reply
}

/// One fbconfig as GLX attribute key/value pairs.
fn fb_configs_reply(order: ByteOrder, seq: u16) -> Vec<u8> {
    const NUM_ATTRIBS: usize = 28;
    let data_words = NUM_ATTRIBS * 2;
    let mut reply = vec![0u8; 32 + data_words * 4];
    reply[0] = 1;
    order.put16(&mut reply, 2, seq);
    order.put32(&mut reply, 4, data_words as u32);
    order.put32(&mut reply, 8, 1); // num configs
    order.put32(&mut reply, 12, NUM_ATTRIBS as u32);
    let attribs: [(u32, u32); 16] = [
        (0x8013, 1),      // GLX_FBCONFIG_ID
        (0x8010, 32),     // GLX_BUFFER_SIZE
        (0x8011, 0),      // GLX_LEVEL
        (0x8012, 1),      // GLX_DOUBLEBUFFER
        (0x8014, 4),      // GLX_VISUAL_TYPE = TrueColor
        (0x8015, 8),      // GLX_RED_SIZE
        (0x8016, 8),      // GLX_GREEN_SIZE
        (0x8017, 8),      // GLX_BLUE_SIZE
        (0x8018, 8),      // GLX_ALPHA_SIZE
        (0x8019, 24),     // GLX_DEPTH_SIZE
        (0x801a, 8),      // GLX_STENCIL_SIZE
        (0x8020, 0x8002), // GLX_RENDER_TYPE = RGBA_BIT
        (0x8021, 0x8001), // GLX_DRAWABLE_TYPE = WINDOW_BIT
        (0x8022, 0),      // GLX_X_RENDERABLE
        (0x8023, 0),      // GLX_X_VISUAL_TYPE
        (0x20, 0),        // GLX_NONE terminator, remaining pairs stay zero
    ];
    for (i, (key, val)) in attribs.iter().enumerate() {
        order.put32(&mut reply, 32 + i * 8, *key);
        order.put32(&mut reply, 32 + i * 8 + 4, *val);
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_version_reports_1_4() {
        let reply = reply_for(QUERY_VERSION, ByteOrder::LsbFirst, 9).unwrap();
        assert_eq!(reply.len(), 32);
        assert_eq!(reply[0], 1);
        assert_eq!(ByteOrder::LsbFirst.get16(&reply, 2), 9);
        assert_eq!(ByteOrder::LsbFirst.get32(&reply, 8), 1);
        assert_eq!(ByteOrder::LsbFirst.get32(&reply, 12), 4);
    }

    #[test]
    fn void_minors_produce_no_reply() {
        for minor in [RENDER, SWAP_BUFFERS, CLIENT_INFO, CREATE_CONTEXT] {
            assert!(reply_for(minor, ByteOrder::LsbFirst, 1).is_none());
        }
    }

    #[test]
    fn unknown_reply_minor_gets_generic_reply() {
        let reply = reply_for(200, ByteOrder::LsbFirst, 3).unwrap();
        assert_eq!(reply.len(), 32);
        assert_eq!(reply[0], 1);
    }

    #[test]
    fn is_direct_is_false() {
        let reply = reply_for(IS_DIRECT, ByteOrder::LsbFirst, 1).unwrap();
        assert_eq!(reply[8], 0);
    }

    #[test]
    fn reply_lengths_are_word_aligned() {
        for minor in [QUERY_VERSION, GET_VISUAL_CONFIGS, GET_FB_CONFIGS, QUERY_SERVER_STRING] {
            let reply = reply_for(minor, ByteOrder::LsbFirst, 1).unwrap();
            assert_eq!(reply.len() % 4, 0);
            let words = ByteOrder::LsbFirst.get32(&reply, 4) as usize;
            assert_eq!(reply.len(), 32 + words * 4);
        }
    }
}
