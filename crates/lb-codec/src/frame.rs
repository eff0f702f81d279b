//! Length-prefixed framing for the stream transport.
//!
//! Layout: 4-byte big-endian length covering `1 byte msg_type + payload`,
//! then the type byte, then the payload bytes.

pub const MSG_DATA: u8 = 0x01;
pub const MSG_ACK: u8 = 0x02;

/// Frames beyond this are treated as stream desync, not real traffic.
const MAX_FRAME_LEN: u32 = 8 * 1024 * 1024;

/// Encode one frame.
pub fn encode_frame(msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let len = 1 + payload.len() as u32;
    let mut out = Vec::with_capacity(5 + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.push(msg_type);
    out.extend_from_slice(payload);
    out
}

/// Take one complete frame off the front of `buf`, if one is buffered.
///
/// Returns `None` while the buffer holds only a partial frame. A length of
/// zero or beyond [`MAX_FRAME_LEN`] clears the buffer entirely: the stream is
/// desynced and nothing after that point can be trusted.
pub fn try_decode_frame(buf: &mut Vec<u8>) -> Option<(u8, Vec<u8>)> {
    if buf.len() < 5 {
        return None;
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len == 0 || len > MAX_FRAME_LEN {
        buf.clear();
        return None;
    }
    let total = 4 + len as usize;
    if buf.len() < total {
        return None;
    }
    let msg_type = buf[4];
    let payload = buf[5..total].to_vec();
    buf.drain(..total);
    Some((msg_type, payload))
}
