//! Producer-side handles: concurrent and exclusive publications
//!
//! A publication writes frames into the term buffer set of one
//! (stream id, session id) pair. The concurrent variant supports any number
//! of producer threads via the atomic tail claim; the exclusive variant
//! assumes a single producer and skips the claim. Destination management for
//! multi-destination publications rides the conductor's command protocol.

pub mod concurrent;
pub mod exclusive;

pub use concurrent::Publication;
pub use exclusive::ExclusivePublication;

use std::sync::atomic::{AtomicI64, Ordering};

use crate::buffer::atomic::AtomicBuffer;
use crate::buffer::frame::{commit_frame, write_header, FRAME_TYPE_PAD, HEADER_LENGTH, UNFRAGMENTED};
use crate::buffer::position::pack_tail;

/// A claimed frame range awaiting payload and commit.
///
/// Produced by `try_claim`; the caller writes the payload directly into the
/// term and then commits. Dropping an uncommitted claim aborts it by turning
/// the range into padding, so readers are never stuck behind an abandoned
/// claim.
pub struct BufferClaim<'a> {
    term: &'a AtomicBuffer,
    raw_tail: Option<(&'a AtomicI64, i64)>,
    frame_offset: usize,
    frame_length: usize,
    term_id: i32,
    session_id: i32,
    stream_id: i32,
    position: i64,
    resolved: bool,
}

impl<'a> BufferClaim<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        term: &'a AtomicBuffer,
        raw_tail: Option<(&'a AtomicI64, i64)>,
        frame_offset: usize,
        frame_length: usize,
        term_id: i32,
        session_id: i32,
        stream_id: i32,
        position: i64,
    ) -> Self {
        Self {
            term,
            raw_tail,
            frame_offset,
            frame_length,
            term_id,
            session_id,
            stream_id,
            position,
            resolved: false,
        }
    }

    /// Payload capacity of the claimed frame
    pub fn length(&self) -> usize {
        self.frame_length - HEADER_LENGTH
    }

    /// Write payload bytes at `offset` within the claimed range
    pub fn put_bytes(&mut self, offset: usize, src: &[u8]) {
        assert!(
            offset + src.len() <= self.length(),
            "write exceeds claimed range"
        );
        self.term
            .put_bytes(self.frame_offset + HEADER_LENGTH + offset, src);
    }

    /// Commit the frame, making it visible to readers; returns the stream
    /// position after the frame
    pub fn commit(mut self) -> i64 {
        commit_frame(self.term, self.frame_offset, self.frame_length as i32);
        self.publish_tail();
        self.resolved = true;
        self.position
    }

    /// Abort the claim; the range becomes padding that readers skip
    pub fn abort(mut self) {
        self.abort_in_place();
    }

    fn abort_in_place(&mut self) {
        write_header(
            self.term,
            self.frame_offset,
            FRAME_TYPE_PAD,
            UNFRAGMENTED,
            self.frame_offset as i32,
            self.session_id,
            self.stream_id,
            self.term_id,
        );
        commit_frame(self.term, self.frame_offset, self.frame_length as i32);
        self.publish_tail();
        self.resolved = true;
    }

    fn publish_tail(&self) {
        if let Some((tail, end_offset)) = self.raw_tail {
            tail.store(
                pack_tail(self.term_id, end_offset as i32),
                Ordering::Release,
            );
        }
    }
}

impl Drop for BufferClaim<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.abort_in_place();
        }
    }
}
