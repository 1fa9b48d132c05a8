//! Term appenders: claim a frame range, write it, commit it
//!
//! The shared appender claims ranges with an atomic fetch-add on the packed
//! tail counter, so concurrent producers never overlap. The exclusive
//! appender serves a single producer that tracks the tail itself and only
//! publishes it with a plain ordered store, skipping the atomic claim.
//!
//! A claim that crosses the end of the term writes a padding frame over the
//! remainder (so readers can cross the boundary) and reports a trip; the
//! caller rotates the log and retries.

use std::sync::atomic::{AtomicI64, Ordering};

use super::atomic::AtomicBuffer;
use super::frame::{
    align_frame_length, commit_frame, write_header, BEGIN_FLAG, END_FLAG, FRAME_TYPE_DATA,
    FRAME_TYPE_PAD, HEADER_LENGTH, UNFRAGMENTED,
};
use super::log::LogBuffer;
use super::position::{index_by_term_count, pack_tail, tail_term_id};

/// Result of one append attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Frame(s) written and committed; the tail now sits at `end_offset`
    Appended {
        /// Term offset immediately after the appended range
        end_offset: i32,
    },
    /// The claim crossed the end of the term; the caller must rotate
    Tripped,
}

/// Total aligned bytes a payload will claim, accounting for fragmentation
pub fn required_length(log: &LogBuffer, payload_length: usize) -> usize {
    let max_payload = log.max_payload_length();
    if payload_length <= max_payload {
        return align_frame_length(HEADER_LENGTH + payload_length);
    }
    let num_fragments = payload_length.div_ceil(max_payload);
    let last_length = payload_length - (num_fragments - 1) * max_payload;
    (num_fragments - 1) * align_frame_length(HEADER_LENGTH + max_payload)
        + align_frame_length(HEADER_LENGTH + last_length)
}

/// Append one unfragmented frame via the shared tail counter.
///
/// `payload` must fit a single fragment; larger messages go through
/// [`append_fragmented`].
pub fn append_unfragmented(
    log: &LogBuffer,
    term: &AtomicBuffer,
    raw_tail: &AtomicI64,
    payload: &[u8],
) -> AppendOutcome {
    let frame_length = HEADER_LENGTH + payload.len();
    let aligned = align_frame_length(frame_length);

    let raw = raw_tail.fetch_add(aligned as i64, Ordering::AcqRel);
    let term_id = tail_term_id(raw);
    let offset = raw & 0xFFFF_FFFF;
    let term_length = log.term_length() as i64;

    if offset + aligned as i64 > term_length {
        pad_to_term_end(log, term, term_id, offset, term_length);
        return AppendOutcome::Tripped;
    }

    let offset = offset as usize;
    write_frame(log, term, offset, term_id, UNFRAGMENTED, payload);
    commit_frame(term, offset, frame_length as i32);

    AppendOutcome::Appended {
        end_offset: (offset + aligned) as i32,
    }
}

/// Append a message larger than one fragment via the shared tail counter.
///
/// The whole run of fragments is claimed with a single fetch-add so the
/// fragments sit contiguously; each fragment is committed in order, letting
/// readers consume the run fragment by fragment.
pub fn append_fragmented(
    log: &LogBuffer,
    term: &AtomicBuffer,
    raw_tail: &AtomicI64,
    payload: &[u8],
) -> AppendOutcome {
    let max_payload = log.max_payload_length();
    let num_fragments = payload.len().div_ceil(max_payload);
    let last_length = payload.len() - (num_fragments - 1) * max_payload;
    let required = (num_fragments - 1) * align_frame_length(HEADER_LENGTH + max_payload)
        + align_frame_length(HEADER_LENGTH + last_length);

    let raw = raw_tail.fetch_add(required as i64, Ordering::AcqRel);
    let term_id = tail_term_id(raw);
    let offset = raw & 0xFFFF_FFFF;
    let term_length = log.term_length() as i64;

    if offset + required as i64 > term_length {
        pad_to_term_end(log, term, term_id, offset, term_length);
        return AppendOutcome::Tripped;
    }

    write_fragment_run(log, term, offset as usize, term_id, payload, max_payload);

    AppendOutcome::Appended {
        end_offset: (offset as usize + required) as i32,
    }
}

/// Append one unfragmented frame as the sole producer.
///
/// `term_offset` is the producer's locally tracked tail; the shared counter
/// is only published afterwards so no atomic read-modify-write is needed.
pub fn append_unfragmented_exclusive(
    log: &LogBuffer,
    term: &AtomicBuffer,
    raw_tail: &AtomicI64,
    term_id: i32,
    term_offset: i32,
    payload: &[u8],
) -> AppendOutcome {
    let frame_length = HEADER_LENGTH + payload.len();
    let aligned = align_frame_length(frame_length);
    let term_length = log.term_length() as i64;
    let offset = i64::from(term_offset);

    if offset + aligned as i64 > term_length {
        pad_to_term_end(log, term, term_id, offset, term_length);
        raw_tail.store(pack_tail(term_id, log.term_length() as i32), Ordering::Release);
        return AppendOutcome::Tripped;
    }

    let offset = offset as usize;
    write_frame(log, term, offset, term_id, UNFRAGMENTED, payload);
    commit_frame(term, offset, frame_length as i32);

    let end_offset = (offset + aligned) as i32;
    raw_tail.store(pack_tail(term_id, end_offset), Ordering::Release);
    AppendOutcome::Appended { end_offset }
}

/// Fragmented variant of [`append_unfragmented_exclusive`]
pub fn append_fragmented_exclusive(
    log: &LogBuffer,
    term: &AtomicBuffer,
    raw_tail: &AtomicI64,
    term_id: i32,
    term_offset: i32,
    payload: &[u8],
) -> AppendOutcome {
    let max_payload = log.max_payload_length();
    let num_fragments = payload.len().div_ceil(max_payload);
    let last_length = payload.len() - (num_fragments - 1) * max_payload;
    let required = (num_fragments - 1) * align_frame_length(HEADER_LENGTH + max_payload)
        + align_frame_length(HEADER_LENGTH + last_length);
    let term_length = log.term_length() as i64;
    let offset = i64::from(term_offset);

    if offset + required as i64 > term_length {
        pad_to_term_end(log, term, term_id, offset, term_length);
        raw_tail.store(pack_tail(term_id, log.term_length() as i32), Ordering::Release);
        return AppendOutcome::Tripped;
    }

    write_fragment_run(log, term, offset as usize, term_id, payload, max_payload);

    let end_offset = (offset as usize + required) as i32;
    raw_tail.store(pack_tail(term_id, end_offset), Ordering::Release);
    AppendOutcome::Appended { end_offset }
}

/// Resolve the active term for an append and run `f` against it.
///
/// Returns `None` when the tail's term id disagrees with the active term
/// count, which means a rotation is mid-flight and the caller should report
/// an admin action.
pub fn with_active_term<F>(log: &LogBuffer, f: F) -> Option<AppendOutcome>
where
    F: FnOnce(&AtomicBuffer, &AtomicI64, i64) -> AppendOutcome,
{
    let term_count = log.active_term_count();
    let index = index_by_term_count(term_count);
    let raw_tail = log.raw_tail_counter(index);
    let term_id = tail_term_id(raw_tail.load(Ordering::Acquire));
    if i64::from(term_id - log.initial_term_id()) != term_count {
        return None;
    }
    Some(f(log.term(index), raw_tail, term_count))
}

fn write_frame(
    log: &LogBuffer,
    term: &AtomicBuffer,
    offset: usize,
    term_id: i32,
    flags: u8,
    payload: &[u8],
) {
    write_header(
        term,
        offset,
        FRAME_TYPE_DATA,
        flags,
        offset as i32,
        log.session_id(),
        log.stream_id(),
        term_id,
    );
    term.put_bytes(offset + HEADER_LENGTH, payload);
}

fn write_fragment_run(
    log: &LogBuffer,
    term: &AtomicBuffer,
    start_offset: usize,
    term_id: i32,
    payload: &[u8],
    max_payload: usize,
) {
    let mut offset = start_offset;
    let mut remaining = payload;
    let mut first = true;

    while !remaining.is_empty() {
        let take = remaining.len().min(max_payload);
        let (chunk, rest) = remaining.split_at(take);
        let mut flags = 0u8;
        if first {
            flags |= BEGIN_FLAG;
        }
        if rest.is_empty() {
            flags |= END_FLAG;
        }

        let frame_length = HEADER_LENGTH + take;
        write_frame(log, term, offset, term_id, flags, chunk);
        commit_frame(term, offset, frame_length as i32);

        offset += align_frame_length(frame_length);
        remaining = rest;
        first = false;
    }
}

fn pad_to_term_end(log: &LogBuffer, term: &AtomicBuffer, term_id: i32, offset: i64, term_length: i64) {
    // Only the claim that straddles the boundary owns the remainder; later
    // claims land entirely past the end and write nothing.
    if offset < term_length {
        let offset = offset as usize;
        let pad_length = term_length as usize - offset;
        write_header(
            term,
            offset,
            FRAME_TYPE_PAD,
            UNFRAGMENTED,
            offset as i32,
            log.session_id(),
            log.stream_id(),
            term_id,
        );
        commit_frame(term, offset, pad_length as i32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::frame::{
        frame_flags, frame_length_volatile, frame_session_id, frame_term_id, is_padding,
    };

    fn test_log() -> LogBuffer {
        LogBuffer::new(64 * 1024, 0, 7, 1001, 1408)
    }

    #[test]
    fn test_append_commits_frame() {
        let log = test_log();
        let payload = vec![0xAB; 100];

        let outcome = with_active_term(&log, |term, tail, _| {
            append_unfragmented(&log, term, tail, &payload)
        })
        .unwrap();

        assert_eq!(outcome, AppendOutcome::Appended { end_offset: 160 });

        let term = log.term(0);
        assert_eq!(frame_length_volatile(term, 0), 132);
        assert_eq!(frame_session_id(term, 0), 7);
        assert_eq!(frame_term_id(term, 0), 0);
        assert_eq!(frame_flags(term, 0), UNFRAGMENTED);

        let mut out = vec![0u8; 100];
        term.get_bytes(HEADER_LENGTH, &mut out);
        assert_eq!(out, payload);
    }

    #[test]
    fn test_sequential_appends_advance_tail() {
        let log = test_log();
        let first = with_active_term(&log, |term, tail, _| {
            append_unfragmented(&log, term, tail, &[1u8; 32])
        })
        .unwrap();
        let second = with_active_term(&log, |term, tail, _| {
            append_unfragmented(&log, term, tail, &[2u8; 32])
        })
        .unwrap();

        assert_eq!(first, AppendOutcome::Appended { end_offset: 64 });
        assert_eq!(second, AppendOutcome::Appended { end_offset: 128 });
        assert_eq!(log.position(), 128);
    }

    #[test]
    fn test_trip_pads_term_end() {
        let log = test_log();
        let term_length = log.term_length();
        // park the tail close to the end of term 0
        log.raw_tail_counter(0)
            .store(pack_tail(0, (term_length - 64) as i32), Ordering::Release);

        let outcome = with_active_term(&log, |term, tail, _| {
            append_unfragmented(&log, term, tail, &vec![0u8; 200])
        })
        .unwrap();
        assert_eq!(outcome, AppendOutcome::Tripped);

        let term = log.term(0);
        let pad_offset = term_length - 64;
        assert!(is_padding(term, pad_offset));
        assert_eq!(frame_length_volatile(term, pad_offset), 64);
    }

    #[test]
    fn test_fragmented_append_flags() {
        let log = test_log();
        let max_payload = log.max_payload_length();
        let payload = vec![0x5A; max_payload * 2 + 10];

        let outcome = with_active_term(&log, |term, tail, _| {
            append_fragmented(&log, term, tail, &payload)
        })
        .unwrap();
        let end = match outcome {
            AppendOutcome::Appended { end_offset } => end_offset as usize,
            AppendOutcome::Tripped => panic!("unexpected trip"),
        };

        let term = log.term(0);
        let frag = align_frame_length(HEADER_LENGTH + max_payload);
        assert_eq!(frame_flags(term, 0), BEGIN_FLAG);
        assert_eq!(frame_flags(term, frag), 0);
        assert_eq!(frame_flags(term, 2 * frag), END_FLAG);
        assert_eq!(end, 2 * frag + align_frame_length(HEADER_LENGTH + 10));
    }

    #[test]
    fn test_exclusive_append_publishes_tail() {
        let log = test_log();
        let outcome = append_unfragmented_exclusive(
            &log,
            log.term(0),
            log.raw_tail_counter(0),
            0,
            0,
            &[9u8; 16],
        );
        assert_eq!(outcome, AppendOutcome::Appended { end_offset: 64 });
        assert_eq!(log.position(), 64);
    }
}
