//! Image: one live source session within a subscription
//!
//! The driver mirrors the source's committed frames into the image's log;
//! the consumer scans from its subscriber position, which the driver reads
//! back to compute the flow-control window. One consumer thread polls an
//! image at a time; the position is an atomic only so the driver can observe
//! it.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use crate::buffer::position::index_by_term_count;
use crate::buffer::reader::{self, ControlledAction};
use crate::buffer::{Header, LogBuffer};

/// Consumer-side view of one source session
pub struct Image {
    correlation_id: i64,
    session_id: i32,
    source_identity: String,
    log: Arc<LogBuffer>,
    subscriber_position: Arc<AtomicI64>,
    join_position: i64,
    unavailable: AtomicBool,
}

impl Image {
    pub(crate) fn new(
        correlation_id: i64,
        session_id: i32,
        source_identity: String,
        log: Arc<LogBuffer>,
        subscriber_position: Arc<AtomicI64>,
        join_position: i64,
    ) -> Self {
        Self {
            correlation_id,
            session_id,
            source_identity,
            log,
            subscriber_position,
            join_position,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Driver-allocated identity of this image
    pub fn correlation_id(&self) -> i64 {
        self.correlation_id
    }

    /// Session id of the source this image tracks
    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    /// Where the source lives (its channel description)
    pub fn source_identity(&self) -> &str {
        &self.source_identity
    }

    /// Stream position this image joined the source at
    pub fn join_position(&self) -> i64 {
        self.join_position
    }

    /// Current consumption position
    pub fn position(&self) -> i64 {
        self.subscriber_position.load(Ordering::Acquire)
    }

    /// Whether the driver has declared this source gone
    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::Acquire)
    }

    pub(crate) fn set_unavailable(&self) {
        self.unavailable.store(true, Ordering::Release);
    }

    /// Poll up to `fragment_limit` fragments, advancing the subscriber
    /// position past everything consumed. Never blocks; returns the number
    /// of fragments delivered.
    pub fn poll<H>(&self, handler: &mut H, fragment_limit: usize) -> usize
    where
        H: FnMut(&[u8], &Header),
    {
        self.controlled_poll(
            &mut |payload: &[u8], header: &Header| {
                handler(payload, header);
                ControlledAction::Continue
            },
            fragment_limit,
        )
    }

    /// Poll with per-fragment flow control: the handler's verdict can stop
    /// the scan and leave the remaining fragments for a later call
    pub fn controlled_poll<H>(&self, handler: &mut H, fragment_limit: usize) -> usize
    where
        H: FnMut(&[u8], &Header) -> ControlledAction,
    {
        if self.is_unavailable() || fragment_limit == 0 {
            return 0;
        }

        let log = &self.log;
        let position = self.position();
        let bits = log.position_bits();
        let term_count = position >> bits;
        let index = index_by_term_count(term_count);
        let term_offset = (position & ((1i64 << bits) - 1)) as usize;
        let expected_term_id = log.initial_term_id() + term_count as i32;

        let mut scratch = Vec::new();
        let outcome = reader::read(
            log.term(index),
            term_offset,
            expected_term_id,
            log.initial_term_id(),
            bits,
            fragment_limit,
            &mut scratch,
            handler,
        );

        let consumed = (outcome.offset - term_offset) as i64;
        if consumed > 0 {
            self.subscriber_position
                .store(position + consumed, Ordering::Release);
        }
        outcome.fragments_read
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("correlation_id", &self.correlation_id)
            .field("session_id", &self.session_id)
            .field("source", &self.source_identity)
            .field("position", &self.position())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::appender::{append_unfragmented, with_active_term};

    fn image_over(log: Arc<LogBuffer>, join_position: i64) -> Image {
        Image::new(
            100,
            log.session_id(),
            "bus:mem?endpoint=test".to_string(),
            log,
            Arc::new(AtomicI64::new(join_position)),
            join_position,
        )
    }

    fn append(log: &LogBuffer, payload: &[u8]) {
        with_active_term(log, |term, tail, _| append_unfragmented(log, term, tail, payload))
            .unwrap();
    }

    #[test]
    fn test_poll_delivers_and_advances() {
        let log = Arc::new(LogBuffer::new(64 * 1024, 0, 3, 1001, 1408));
        append(&log, b"one");
        append(&log, b"two");

        let image = image_over(Arc::clone(&log), 0);
        let mut seen = Vec::new();
        let count = image.poll(&mut |payload, _h| seen.push(payload.to_vec()), 10);

        assert_eq!(count, 2);
        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(image.position(), 128);

        // nothing further
        assert_eq!(image.poll(&mut |_, _| {}, 10), 0);
    }

    #[test]
    fn test_poll_respects_fragment_limit() {
        let log = Arc::new(LogBuffer::new(64 * 1024, 0, 3, 1001, 1408));
        for _ in 0..3 {
            append(&log, b"m");
        }

        let image = image_over(Arc::clone(&log), 0);
        assert_eq!(image.poll(&mut |_, _| {}, 2), 2);
        assert_eq!(image.poll(&mut |_, _| {}, 2), 1);
    }

    #[test]
    fn test_poll_from_join_position() {
        let log = Arc::new(LogBuffer::new(64 * 1024, 0, 3, 1001, 1408));
        append(&log, b"before join");
        let join = log.position();
        append(&log, b"after join");

        let image = image_over(Arc::clone(&log), join);
        let mut seen = Vec::new();
        image.poll(&mut |payload, _| seen.push(payload.to_vec()), 10);
        assert_eq!(seen, vec![b"after join".to_vec()]);
    }

    #[test]
    fn test_unavailable_image_polls_zero() {
        let log = Arc::new(LogBuffer::new(64 * 1024, 0, 3, 1001, 1408));
        append(&log, b"pending");

        let image = image_over(Arc::clone(&log), 0);
        image.set_unavailable();
        assert_eq!(image.poll(&mut |_, _| {}, 10), 0);
    }

    #[test]
    fn test_controlled_abort_holds_position() {
        let log = Arc::new(LogBuffer::new(64 * 1024, 0, 3, 1001, 1408));
        append(&log, b"held");

        let image = image_over(Arc::clone(&log), 0);
        let count = image.controlled_poll(&mut |_, _| ControlledAction::Abort, 10);
        assert_eq!(count, 0);
        assert_eq!(image.position(), 0);

        // a later poll still sees the fragment
        assert_eq!(image.poll(&mut |_, _| {}, 10), 1);
    }
}
