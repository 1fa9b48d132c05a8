//! Log buffer: three rotating term partitions plus shared stream metadata
//!
//! One `LogBuffer` backs one direction of one stream: producers append frames
//! to the active term, the driver replicates committed ranges to images, and
//! consumers scan by position. Three partitions are recycled round-robin so a
//! reader can finish draining an old term while a new one fills.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use crossbeam_utils::CachePadded;

use super::atomic::AtomicBuffer;
use super::frame::HEADER_LENGTH;
use super::position::{
    compute_position, index_by_term_count, pack_tail, position_bits_to_shift, tail_term_id,
    tail_term_offset, PARTITION_COUNT,
};

/// Shared log for one (session id, stream id) stream direction
pub struct LogBuffer {
    terms: [AtomicBuffer; PARTITION_COUNT],
    raw_tails: [CachePadded<AtomicI64>; PARTITION_COUNT],
    active_term_count: AtomicI64,
    /// Highest position producers may claim up to; maintained by the driver
    /// from the flow-control window
    position_limit: CachePadded<AtomicI64>,
    /// Whether at least one live destination or image is attached
    connected: AtomicBool,
    /// Serializes term rotation; the hot append path never takes it
    rotation_lock: Mutex<()>,
    term_length: usize,
    position_bits: u32,
    initial_term_id: i32,
    session_id: i32,
    stream_id: i32,
    mtu_length: usize,
}

impl LogBuffer {
    /// Allocate a log with three zeroed terms of `term_length` bytes each
    /// (must be a power of two)
    pub fn new(
        term_length: usize,
        initial_term_id: i32,
        session_id: i32,
        stream_id: i32,
        mtu_length: usize,
    ) -> Self {
        assert!(term_length.is_power_of_two(), "term length must be a power of two");
        assert!(mtu_length > HEADER_LENGTH, "mtu must exceed the header length");

        let terms = std::array::from_fn(|_| AtomicBuffer::new(term_length));
        // Partition 0 starts at the initial term; the others carry expired
        // term ids until rotation brings them into use.
        let raw_tails = std::array::from_fn(|i| {
            let term_id = initial_term_id + i as i32 - if i == 0 { 0 } else { PARTITION_COUNT as i32 };
            CachePadded::new(AtomicI64::new(pack_tail(term_id, 0)))
        });

        Self {
            terms,
            raw_tails,
            active_term_count: AtomicI64::new(0),
            position_limit: CachePadded::new(AtomicI64::new(0)),
            connected: AtomicBool::new(false),
            rotation_lock: Mutex::new(()),
            position_bits: position_bits_to_shift(term_length),
            term_length,
            initial_term_id,
            session_id,
            stream_id,
            mtu_length,
        }
    }

    /// Term length in bytes
    pub fn term_length(&self) -> usize {
        self.term_length
    }

    /// log2 of the term length
    pub fn position_bits(&self) -> u32 {
        self.position_bits
    }

    /// Term id the stream began with
    pub fn initial_term_id(&self) -> i32 {
        self.initial_term_id
    }

    /// Session this log belongs to
    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    /// Stream this log belongs to
    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Largest payload accepted by a single `offer`
    pub fn max_message_length(&self) -> usize {
        self.term_length / 8
    }

    /// Largest payload carried by one fragment
    pub fn max_payload_length(&self) -> usize {
        self.mtu_length - HEADER_LENGTH
    }

    /// Number of terms filled so far
    pub fn active_term_count(&self) -> i64 {
        self.active_term_count.load(Ordering::Acquire)
    }

    /// Term arena for a partition index
    pub fn term(&self, index: usize) -> &AtomicBuffer {
        &self.terms[index]
    }

    /// Tail counter for a partition index
    pub fn raw_tail_counter(&self, index: usize) -> &AtomicI64 {
        &self.raw_tails[index]
    }

    /// Current producer position. Retries while a rotation is mid-flight so
    /// the (term count, tail) pair is always read consistently.
    pub fn position(&self) -> i64 {
        loop {
            let term_count = self.active_term_count();
            let raw_tail = self.raw_tails[index_by_term_count(term_count)].load(Ordering::Acquire);
            let term_id = tail_term_id(raw_tail);
            if i64::from(term_id - self.initial_term_id) == term_count {
                let offset = tail_term_offset(raw_tail, self.term_length);
                return compute_position(term_id, offset, self.position_bits, self.initial_term_id);
            }
            std::hint::spin_loop();
        }
    }

    /// Position limit advertised by the driver's flow control
    pub fn position_limit(&self) -> i64 {
        self.position_limit.load(Ordering::Acquire)
    }

    /// Driver-side: publish a new position limit
    pub fn set_position_limit(&self, limit: i64) {
        self.position_limit.store(limit, Ordering::Release);
    }

    /// Whether at least one live destination or image is attached
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Driver-side: update the connection indicator
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Rotate to the next term after the active one filled.
    ///
    /// Idempotent: concurrent producers that tripped on the same term end all
    /// call this, the first recycles the next partition and the rest observe
    /// the already-advanced term count. Appending never touches a partition
    /// until the active term count has moved to it, so zeroing here cannot
    /// race a committed write.
    pub fn rotate(&self, current_term_count: i64) {
        let _guard = self.rotation_lock.lock().unwrap();
        if self.active_term_count.load(Ordering::Acquire) != current_term_count {
            return;
        }

        let next_count = current_term_count + 1;
        let next_index = index_by_term_count(next_count);
        let next_term_id = self.initial_term_id + next_count as i32;

        self.terms[next_index].zero_range(0, self.term_length);
        self.raw_tails[next_index].store(pack_tail(next_term_id, 0), Ordering::Release);
        self.active_term_count.store(next_count, Ordering::Release);

        tracing::debug!(
            session_id = self.session_id,
            stream_id = self.stream_id,
            term_id = next_term_id,
            "Term rotated"
        );
    }
}

impl std::fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBuffer")
            .field("session_id", &self.session_id)
            .field("stream_id", &self.stream_id)
            .field("term_length", &self.term_length)
            .field("position", &self.position())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_log() -> LogBuffer {
        LogBuffer::new(64 * 1024, 5, 1, 1001, 1408)
    }

    #[test]
    fn test_new_log_geometry() {
        let log = test_log();
        assert_eq!(log.term_length(), 64 * 1024);
        assert_eq!(log.position_bits(), 16);
        assert_eq!(log.max_message_length(), 8 * 1024);
        assert_eq!(log.max_payload_length(), 1408 - HEADER_LENGTH);
        assert_eq!(log.position(), 0);
        assert!(!log.is_connected());
    }

    #[test]
    fn test_rotation_advances_term() {
        let log = test_log();
        assert_eq!(log.active_term_count(), 0);

        log.rotate(0);
        assert_eq!(log.active_term_count(), 1);
        let raw = log.raw_tail_counter(index_by_term_count(1)).load(Ordering::Relaxed);
        assert_eq!(tail_term_id(raw), 6);
        assert_eq!(tail_term_offset(raw, log.term_length()), 0);

        // stale rotation request is a no-op
        log.rotate(0);
        assert_eq!(log.active_term_count(), 1);
    }

    #[test]
    fn test_position_tracks_tail() {
        let log = test_log();
        log.raw_tail_counter(0).store(pack_tail(5, 256), Ordering::Release);
        assert_eq!(log.position(), 256);

        log.rotate(0);
        assert_eq!(log.position(), 64 * 1024);
    }

    #[test]
    fn test_limit_and_connected_flags() {
        let log = test_log();
        log.set_position_limit(4096);
        assert_eq!(log.position_limit(), 4096);
        log.set_connected(true);
        assert!(log.is_connected());
    }
}
