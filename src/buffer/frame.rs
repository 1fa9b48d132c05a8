//! Frame header layout and accessors
//!
//! Every frame in a term is a 32-byte header followed by the payload, padded
//! out to the frame alignment. The length word sits at offset 0 and is the
//! commit point: it is written last with release ordering, so a reader that
//! observes a positive length with acquire ordering sees the whole frame.
//!
//! ```text
//! 0        4        8        12       16       20       24         32
//! | length | v/f/ty | termoff | session | stream | term id | reserved |
//! ```

use super::atomic::AtomicBuffer;

/// Frame header length in bytes
pub const HEADER_LENGTH: usize = 32;

/// Frames start on this boundary; claimed ranges are padded up to it
pub const FRAME_ALIGNMENT: usize = 32;

/// Protocol version written into every header
pub const FRAME_VERSION: u8 = 1;

/// Padding frame filling the remainder of a term after rotation
pub const FRAME_TYPE_PAD: u16 = 0x00;
/// Data frame carrying a payload fragment
pub const FRAME_TYPE_DATA: u16 = 0x01;

/// First fragment of a message
pub const BEGIN_FLAG: u8 = 0x80;
/// Last fragment of a message
pub const END_FLAG: u8 = 0x40;
/// A message that fits in one fragment carries both flags
pub const UNFRAGMENTED: u8 = BEGIN_FLAG | END_FLAG;

const LENGTH_OFFSET: usize = 0;
const BITS_OFFSET: usize = 4;
const TERM_OFFSET_OFFSET: usize = 8;
const SESSION_ID_OFFSET: usize = 12;
const STREAM_ID_OFFSET: usize = 16;
const TERM_ID_OFFSET: usize = 20;
const RESERVED_OFFSET: usize = 24;

/// Round a frame length up to the alignment boundary
#[inline]
pub const fn align_frame_length(length: usize) -> usize {
    (length + FRAME_ALIGNMENT - 1) & !(FRAME_ALIGNMENT - 1)
}

/// Write every header field except the length word.
///
/// The length word is the commit point and must be written separately via
/// [`commit_frame`] once the payload is in place.
#[allow(clippy::too_many_arguments)]
pub fn write_header(
    term: &AtomicBuffer,
    offset: usize,
    frame_type: u16,
    flags: u8,
    term_offset: i32,
    session_id: i32,
    stream_id: i32,
    term_id: i32,
) {
    let bits = (u32::from(FRAME_VERSION)) | (u32::from(flags) << 8) | (u32::from(frame_type) << 16);
    term.put_i32(offset + BITS_OFFSET, bits as i32);
    term.put_i32(offset + TERM_OFFSET_OFFSET, term_offset);
    term.put_i32(offset + SESSION_ID_OFFSET, session_id);
    term.put_i32(offset + STREAM_ID_OFFSET, stream_id);
    term.put_i32(offset + TERM_ID_OFFSET, term_id);
    term.put_i64(offset + RESERVED_OFFSET, 0);
}

/// Commit a frame by publishing its length with release ordering
#[inline]
pub fn commit_frame(term: &AtomicBuffer, offset: usize, frame_length: i32) {
    term.put_i32_ordered(offset + LENGTH_OFFSET, frame_length);
}

/// Read a frame length with acquire ordering; zero means not yet committed
#[inline]
pub fn frame_length_volatile(term: &AtomicBuffer, offset: usize) -> i32 {
    term.get_i32_volatile(offset + LENGTH_OFFSET)
}

/// Raw length word on an already-committed frame
#[inline]
pub fn frame_length(term: &AtomicBuffer, offset: usize) -> i32 {
    term.get_i32(offset + LENGTH_OFFSET)
}

#[inline]
pub fn frame_type(term: &AtomicBuffer, offset: usize) -> u16 {
    ((term.get_i32(offset + BITS_OFFSET) as u32) >> 16) as u16
}

#[inline]
pub fn frame_flags(term: &AtomicBuffer, offset: usize) -> u8 {
    ((term.get_i32(offset + BITS_OFFSET) as u32) >> 8) as u8
}

#[inline]
pub fn frame_term_offset(term: &AtomicBuffer, offset: usize) -> i32 {
    term.get_i32(offset + TERM_OFFSET_OFFSET)
}

#[inline]
pub fn frame_session_id(term: &AtomicBuffer, offset: usize) -> i32 {
    term.get_i32(offset + SESSION_ID_OFFSET)
}

#[inline]
pub fn frame_stream_id(term: &AtomicBuffer, offset: usize) -> i32 {
    term.get_i32(offset + STREAM_ID_OFFSET)
}

#[inline]
pub fn frame_term_id(term: &AtomicBuffer, offset: usize) -> i32 {
    term.get_i32(offset + TERM_ID_OFFSET)
}

#[inline]
pub fn is_padding(term: &AtomicBuffer, offset: usize) -> bool {
    frame_type(term, offset) == FRAME_TYPE_PAD
}

/// Header metadata handed to fragment handlers alongside the payload
#[derive(Debug, Clone, Copy)]
pub struct Header {
    /// Committed frame length including the header
    pub frame_length: i32,
    /// Fragmentation flags ([`BEGIN_FLAG`], [`END_FLAG`])
    pub flags: u8,
    /// Session the frame originated from
    pub session_id: i32,
    /// Stream the frame belongs to
    pub stream_id: i32,
    /// Term holding the frame
    pub term_id: i32,
    /// Offset of the frame within its term
    pub term_offset: i32,
    /// Initial term id of the stream, for position arithmetic
    pub initial_term_id: i32,
    /// log2 of the term length
    pub position_bits_to_shift: u32,
}

impl Header {
    /// Stream position immediately after this frame
    pub fn position(&self) -> i64 {
        let term_count = i64::from(self.term_id - self.initial_term_id);
        let aligned = align_frame_length(self.frame_length as usize) as i64;
        (term_count << self.position_bits_to_shift) + i64::from(self.term_offset) + aligned
    }

    /// Whether this frame is the first fragment of a message
    pub fn is_begin_fragment(&self) -> bool {
        self.flags & BEGIN_FLAG != 0
    }

    /// Whether this frame is the last fragment of a message
    pub fn is_end_fragment(&self) -> bool {
        self.flags & END_FLAG != 0
    }
}
