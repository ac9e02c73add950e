//! MLLP frame encoder and incremental decoder.

use bytes::{BufMut, Bytes, BytesMut};

/// Start block (vertical tab).
pub const START_BLOCK: u8 = 0x0B;

/// End block (file separator).
pub const END_BLOCK: u8 = 0x1C;

/// Frame terminator (carriage return).
pub const CARRIAGE_RETURN: u8 = 0x0D;

/// Bytes added around a payload by `encode`.
pub const FRAME_OVERHEAD: usize = 3;

/// Result of looking for a frame in buffered bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// A full frame is present: payload and bytes consumed from the buffer.
    Complete(Bytes, usize),
    /// Framing so far is valid but more bytes are needed.
    Incomplete,
    /// The buffer cannot be the start of a frame.
    Malformed,
}

/// Wrap a payload in an MLLP frame.
pub fn encode(payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(payload.len() + FRAME_OVERHEAD);
    encode_into(payload, &mut frame);
    frame.freeze()
}

/// Append an MLLP frame for `payload` to `dst`.
pub fn encode_into(payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(payload.len() + FRAME_OVERHEAD);
    dst.put_u8(START_BLOCK);
    dst.extend_from_slice(payload);
    dst.put_u8(END_BLOCK);
    dst.put_u8(CARRIAGE_RETURN);
}

/// Try to extract one frame from bytes read off a stream that is still open.
///
/// An end block that is the last buffered byte yields `Incomplete`, since the
/// terminator may still be in flight. Use `try_extract_final` once the peer
/// has closed the stream.
pub fn try_extract(buffer: &[u8]) -> ParseResult {
    extract(buffer, false)
}

/// Try to extract one frame after the stream has reached end of input.
///
/// Same as `try_extract`, except that a frame ending in a bare end block is
/// accepted.
pub fn try_extract_final(buffer: &[u8]) -> ParseResult {
    extract(buffer, true)
}

fn extract(buffer: &[u8], at_eof: bool) -> ParseResult {
    match buffer.first() {
        None => return ParseResult::Incomplete,
        Some(&START_BLOCK) => {}
        Some(_) => return ParseResult::Malformed,
    }

    let end = match find_end_block(&buffer[1..]) {
        Some(pos) => pos + 1,
        None => return ParseResult::Incomplete,
    };

    let consumed = match buffer.get(end + 1) {
        Some(&CARRIAGE_RETURN) => end + 2,
        // The end block alone delimits the payload; the stray byte belongs
        // to whatever follows.
        Some(_) => end + 1,
        None if at_eof => end + 1,
        None => return ParseResult::Incomplete,
    };

    let payload = Bytes::copy_from_slice(&buffer[1..end]);
    ParseResult::Complete(payload, consumed)
}

/// Find the end block in buffer, returning its position.
fn find_end_block(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == END_BLOCK)
}
