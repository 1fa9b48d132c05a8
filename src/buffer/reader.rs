//! Term reader: scan committed frames from an offset
//!
//! Reading is a pure scan over one term partition. The scan stops at the
//! first uncommitted length word, at a frame whose term id disagrees with
//! the term the reader expects (a recycled partition not yet rewritten), at
//! the end of the term, or once the fragment limit is reached. The returned
//! offset restarts the scan exactly where it left off.

use super::atomic::AtomicBuffer;
use super::frame::{
    align_frame_length, frame_flags, frame_length_volatile, frame_session_id, frame_stream_id,
    frame_term_id, frame_term_offset, is_padding, Header, HEADER_LENGTH,
};

/// Handler verdict for a controlled scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlledAction {
    /// Stop scanning and leave the current fragment unconsumed
    Abort,
    /// Consume the current fragment, then stop scanning
    Break,
    /// Consume the current fragment and keep scanning
    Continue,
}

/// Result of one scan call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Complete DATA fragments delivered to the handler
    pub fragments_read: usize,
    /// Term offset to restart the next scan from
    pub offset: usize,
}

/// Committed frame length at `offset`, or `None` if the slot is empty, still
/// being written, or holds a stale frame from a recycled term
pub fn committed_frame_at(term: &AtomicBuffer, offset: usize, expected_term_id: i32) -> Option<i32> {
    if offset >= term.capacity() {
        return None;
    }
    let length = frame_length_volatile(term, offset);
    if length <= 0 {
        return None;
    }
    if frame_term_id(term, offset) != expected_term_id {
        return None;
    }
    Some(length)
}

/// Scan up to `fragment_limit` DATA fragments starting at `offset`.
///
/// Padding frames are crossed silently. The handler's verdict controls
/// consumption; `scratch` is reused for payload unpacking across calls.
pub fn read<H>(
    term: &AtomicBuffer,
    mut offset: usize,
    expected_term_id: i32,
    initial_term_id: i32,
    position_bits_to_shift: u32,
    fragment_limit: usize,
    scratch: &mut Vec<u8>,
    handler: &mut H,
) -> ReadOutcome
where
    H: FnMut(&[u8], &Header) -> ControlledAction,
{
    let mut fragments_read = 0;

    while fragments_read < fragment_limit {
        let length = match committed_frame_at(term, offset, expected_term_id) {
            Some(length) => length as usize,
            None => break,
        };
        let aligned = align_frame_length(length);

        if is_padding(term, offset) {
            offset += aligned;
            continue;
        }

        let payload_length = length - HEADER_LENGTH;
        scratch.resize(payload_length, 0);
        term.get_bytes(offset + HEADER_LENGTH, scratch);

        let header = Header {
            frame_length: length as i32,
            flags: frame_flags(term, offset),
            session_id: frame_session_id(term, offset),
            stream_id: frame_stream_id(term, offset),
            term_id: frame_term_id(term, offset),
            term_offset: frame_term_offset(term, offset),
            initial_term_id,
            position_bits_to_shift,
        };

        match handler(&scratch[..payload_length], &header) {
            ControlledAction::Abort => break,
            ControlledAction::Break => {
                fragments_read += 1;
                offset += aligned;
                break;
            }
            ControlledAction::Continue => {
                fragments_read += 1;
                offset += aligned;
            }
        }
    }

    ReadOutcome {
        fragments_read,
        offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::appender::{append_unfragmented, with_active_term};
    use crate::buffer::frame::{commit_frame, write_header, FRAME_TYPE_PAD, UNFRAGMENTED};
    use crate::buffer::log::LogBuffer;

    fn log_with_frames(payloads: &[&[u8]]) -> LogBuffer {
        let log = LogBuffer::new(64 * 1024, 0, 3, 1001, 1408);
        for payload in payloads {
            with_active_term(&log, |term, tail, _| {
                append_unfragmented(&log, term, tail, payload)
            })
            .unwrap();
        }
        log
    }

    #[test]
    fn test_read_delivers_committed_frames() {
        let log = log_with_frames(&[b"first", b"second"]);
        let mut seen = Vec::new();
        let mut scratch = Vec::new();

        let outcome = read(
            log.term(0),
            0,
            0,
            0,
            log.position_bits(),
            10,
            &mut scratch,
            &mut |payload, header| {
                seen.push((payload.to_vec(), header.session_id));
                ControlledAction::Continue
            },
        );

        assert_eq!(outcome.fragments_read, 2);
        assert_eq!(outcome.offset, 128);
        assert_eq!(seen[0], (b"first".to_vec(), 3));
        assert_eq!(seen[1], (b"second".to_vec(), 3));
    }

    #[test]
    fn test_read_respects_fragment_limit() {
        let log = log_with_frames(&[b"a", b"b", b"c"]);
        let mut scratch = Vec::new();
        let mut count = 0;

        let outcome = read(
            log.term(0),
            0,
            0,
            0,
            log.position_bits(),
            2,
            &mut scratch,
            &mut |_, _| {
                count += 1;
                ControlledAction::Continue
            },
        );

        assert_eq!(outcome.fragments_read, 2);
        assert_eq!(count, 2);

        // restartable from the returned offset
        let outcome = read(
            log.term(0),
            outcome.offset,
            0,
            0,
            log.position_bits(),
            2,
            &mut scratch,
            &mut |_, _| ControlledAction::Continue,
        );
        assert_eq!(outcome.fragments_read, 1);
    }

    #[test]
    fn test_read_stops_at_uncommitted_frame() {
        let log = log_with_frames(&[b"ok"]);
        // a header without a committed length must stop the scan
        write_header(log.term(0), 64, 1, UNFRAGMENTED, 64, 3, 1001, 0);

        let mut scratch = Vec::new();
        let outcome = read(
            log.term(0),
            0,
            0,
            0,
            log.position_bits(),
            10,
            &mut scratch,
            &mut |_, _| ControlledAction::Continue,
        );
        assert_eq!(outcome.fragments_read, 1);
        assert_eq!(outcome.offset, 64);
    }

    #[test]
    fn test_read_stops_on_stale_term_id() {
        let log = log_with_frames(&[b"stale"]);
        let mut scratch = Vec::new();

        // reader expecting term 3 sees the frame written for term 0 as stale
        let outcome = read(
            log.term(0),
            0,
            3,
            0,
            log.position_bits(),
            10,
            &mut scratch,
            &mut |_, _| ControlledAction::Continue,
        );
        assert_eq!(outcome.fragments_read, 0);
        assert_eq!(outcome.offset, 0);
    }

    #[test]
    fn test_read_skips_padding() {
        let log = LogBuffer::new(64 * 1024, 0, 3, 1001, 1408);
        let term = log.term(0);
        write_header(term, 0, FRAME_TYPE_PAD, UNFRAGMENTED, 0, 3, 1001, 0);
        commit_frame(term, 0, 64);
        log.raw_tail_counter(0)
            .store(crate::buffer::position::pack_tail(0, 64), std::sync::atomic::Ordering::Release);
        with_active_term(&log, |t, tail, _| append_unfragmented(&log, t, tail, b"after pad")).unwrap();

        let mut scratch = Vec::new();
        let mut seen = Vec::new();
        let outcome = read(
            term,
            0,
            0,
            0,
            log.position_bits(),
            10,
            &mut scratch,
            &mut |payload, _| {
                seen.push(payload.to_vec());
                ControlledAction::Continue
            },
        );
        assert_eq!(outcome.fragments_read, 1);
        assert_eq!(seen[0], b"after pad".to_vec());
    }

    #[test]
    fn test_controlled_abort_leaves_fragment() {
        let log = log_with_frames(&[b"x", b"y"]);
        let mut scratch = Vec::new();

        let outcome = read(
            log.term(0),
            0,
            0,
            0,
            log.position_bits(),
            10,
            &mut scratch,
            &mut |_, _| ControlledAction::Abort,
        );
        assert_eq!(outcome.fragments_read, 0);
        assert_eq!(outcome.offset, 0);
    }
}
