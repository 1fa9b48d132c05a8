//! Exclusive publication: single producer, no atomic claim
//!
//! The producer tracks the term tail itself and only publishes it with a
//! plain ordered store after each append, trading multi-producer safety for
//! latency.
//!
//! # Caller contract
//!
//! An `ExclusivePublication` must only ever be offered to from one thread at
//! a time. Calling `offer`/`try_claim` concurrently from multiple threads is
//! not guarded internally and leaves the stream in an undefined state (it is
//! memory-safe, but frames may interleave and positions may repeat). Use
//! [`Publication`](crate::publication::Publication) when multiple producer
//! threads share a handle.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use crate::buffer::appender::{
    append_fragmented_exclusive, append_unfragmented_exclusive, required_length, AppendOutcome,
};
use crate::buffer::frame::{
    align_frame_length, commit_frame, write_header, FRAME_TYPE_DATA, FRAME_TYPE_PAD, HEADER_LENGTH,
    UNFRAGMENTED,
};
use crate::buffer::position::{compute_position, index_by_term_count, max_position, pack_tail};
use crate::buffer::LogBuffer;
use crate::client::command::ControlMode;
use crate::client::conductor::ClientConductor;
use crate::error::{ClientError, OfferError, Result};
use crate::publication::BufferClaim;

/// Single-producer handle for one (stream id, session id) pair
pub struct ExclusivePublication {
    conductor: Arc<ClientConductor>,
    log: Arc<LogBuffer>,
    registration_id: i64,
    stream_id: i32,
    session_id: i32,
    control_mode: ControlMode,
    max_possible_position: i64,
    closed: AtomicBool,
    // Locally tracked tail; plain values updated by the single producer.
    // Stored as atomics only so the handle stays Sync for the conductor's
    // resource map, always accessed relaxed.
    term_count: AtomicI64,
    term_id: AtomicI64,
    term_offset: AtomicI64,
}

impl ExclusivePublication {
    pub(crate) fn new(
        conductor: Arc<ClientConductor>,
        registration_id: i64,
        stream_id: i32,
        session_id: i32,
        control_mode: ControlMode,
        log: Arc<LogBuffer>,
    ) -> Self {
        let term_count = log.active_term_count();
        let initial_term_id = log.initial_term_id();
        Self {
            conductor,
            max_possible_position: max_position(log.term_length()),
            registration_id,
            stream_id,
            session_id,
            control_mode,
            closed: AtomicBool::new(false),
            term_count: AtomicI64::new(term_count),
            term_id: AtomicI64::new(i64::from(initial_term_id) + term_count),
            term_offset: AtomicI64::new(0),
            log,
        }
    }

    /// Registration id assigned when the publication was added
    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    /// Stream this publication writes to
    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Session identifying this producer on the stream
    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    /// Destination handling mode declared by the channel URI
    pub fn control_mode(&self) -> ControlMode {
        self.control_mode
    }

    /// Largest payload a single offer accepts
    pub fn max_message_length(&self) -> usize {
        self.log.max_message_length()
    }

    /// Largest payload that fits one unfragmented frame
    pub fn max_payload_length(&self) -> usize {
        self.log.max_payload_length()
    }

    /// Current producer position
    pub fn position(&self) -> i64 {
        let term_count = self.term_count.load(Ordering::Relaxed);
        let term_offset = self.term_offset.load(Ordering::Relaxed);
        (term_count << self.log.position_bits()) + term_offset
    }

    /// Whether at least one live destination/image is attached
    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.log.is_connected()
    }

    /// Whether this handle has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.conductor.is_closed()
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Offer a message; non-blocking, the caller handles back-pressure.
    ///
    /// # Panics
    ///
    /// Panics if `payload` exceeds [`max_message_length`](Self::max_message_length).
    pub fn offer(&self, payload: &[u8]) -> std::result::Result<i64, OfferError> {
        assert!(
            payload.len() <= self.max_message_length(),
            "payload of {} exceeds max message length {}",
            payload.len(),
            self.max_message_length()
        );
        if self.is_closed() {
            return Err(OfferError::Closed);
        }

        let log = &self.log;
        let position = self.position();
        if !log.is_connected() {
            return Err(OfferError::NotConnected);
        }
        let required = required_length(log, payload.len()) as i64;
        if position + required > self.max_possible_position {
            return Err(OfferError::MaxPositionExceeded);
        }
        if position + required > log.position_limit() {
            return Err(OfferError::BackPressured);
        }

        let term_count = self.term_count.load(Ordering::Relaxed);
        let term_id = self.term_id.load(Ordering::Relaxed) as i32;
        let term_offset = self.term_offset.load(Ordering::Relaxed) as i32;
        let index = index_by_term_count(term_count);
        let term = log.term(index);
        let tail = log.raw_tail_counter(index);

        let outcome = if payload.len() <= log.max_payload_length() {
            append_unfragmented_exclusive(log, term, tail, term_id, term_offset, payload)
        } else {
            append_fragmented_exclusive(log, term, tail, term_id, term_offset, payload)
        };

        match outcome {
            AppendOutcome::Appended { end_offset } => {
                self.term_offset.store(i64::from(end_offset), Ordering::Relaxed);
                Ok((term_count << log.position_bits()) + i64::from(end_offset))
            }
            AppendOutcome::Tripped => {
                self.rotate(term_count);
                Err(OfferError::AdminAction)
            }
        }
    }

    /// Claim a frame range for zero-copy writing.
    ///
    /// # Panics
    ///
    /// Panics if `length` exceeds [`max_payload_length`](Self::max_payload_length).
    pub fn try_claim(&self, length: usize) -> std::result::Result<BufferClaim<'_>, OfferError> {
        assert!(
            length <= self.max_payload_length(),
            "claim of {} exceeds max payload length {}",
            length,
            self.max_payload_length()
        );
        if self.is_closed() {
            return Err(OfferError::Closed);
        }

        let log = &self.log;
        let position = self.position();
        if !log.is_connected() {
            return Err(OfferError::NotConnected);
        }
        let frame_length = HEADER_LENGTH + length;
        let aligned = align_frame_length(frame_length) as i64;
        if position + aligned > self.max_possible_position {
            return Err(OfferError::MaxPositionExceeded);
        }
        if position + aligned > log.position_limit() {
            return Err(OfferError::BackPressured);
        }

        let term_count = self.term_count.load(Ordering::Relaxed);
        let term_id = self.term_id.load(Ordering::Relaxed) as i32;
        let term_offset = self.term_offset.load(Ordering::Relaxed);
        let index = index_by_term_count(term_count);
        let term = log.term(index);
        let tail = log.raw_tail_counter(index);

        if term_offset + aligned > log.term_length() as i64 {
            if (term_offset as usize) < log.term_length() {
                let pad_offset = term_offset as usize;
                let pad_length = log.term_length() - pad_offset;
                write_header(
                    term,
                    pad_offset,
                    FRAME_TYPE_PAD,
                    UNFRAGMENTED,
                    pad_offset as i32,
                    self.session_id,
                    self.stream_id,
                    term_id,
                );
                commit_frame(term, pad_offset, pad_length as i32);
            }
            tail.store(pack_tail(term_id, log.term_length() as i32), Ordering::Release);
            self.rotate(term_count);
            return Err(OfferError::AdminAction);
        }

        let offset = term_offset as usize;
        write_header(
            term,
            offset,
            FRAME_TYPE_DATA,
            UNFRAGMENTED,
            offset as i32,
            self.session_id,
            self.stream_id,
            term_id,
        );
        self.term_offset
            .store(term_offset + aligned, Ordering::Relaxed);

        let claim_position = compute_position(
            term_id,
            offset as i32,
            log.position_bits(),
            log.initial_term_id(),
        ) + aligned;
        Ok(BufferClaim::new(
            term,
            Some((tail, term_offset + aligned)),
            offset,
            frame_length,
            term_id,
            self.session_id,
            self.stream_id,
            claim_position,
        ))
    }

    fn rotate(&self, term_count: i64) {
        self.log.rotate(term_count);
        self.term_count.store(term_count + 1, Ordering::Relaxed);
        self.term_id.fetch_add(1, Ordering::Relaxed);
        self.term_offset.store(0, Ordering::Relaxed);
    }

    /// Add a destination to this manual-mode publication
    pub fn add_destination(&self, channel: &str) -> Result<i64> {
        self.check_manual_mode()?;
        self.conductor.add_destination(self.registration_id, channel)
    }

    /// Remove a destination by the correlation id of its add
    pub fn remove_destination(&self, destination_id: i64) -> Result<i64> {
        self.check_manual_mode()?;
        self.conductor
            .remove_destination(self.registration_id, destination_id)
    }

    /// Poll the outcome of a destination operation; `Ok(None)` while pending
    pub fn find_destination_response(&self, correlation_id: i64) -> Result<Option<()>> {
        self.conductor.find_destination_response(correlation_id)
    }

    fn check_manual_mode(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::ResourceClosed);
        }
        match self.control_mode {
            ControlMode::Manual => Ok(()),
            ControlMode::Dynamic => Err(ClientError::UnsupportedOperation(
                "dynamic-mode publication derives destinations from discovery".to_string(),
            )),
            ControlMode::None => Err(ClientError::UnsupportedOperation(
                "publication is not in multi-destination mode".to_string(),
            )),
        }
    }

    /// Close the publication and release its driver resources
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.conductor.close_publication(self.registration_id);
        }
    }
}

impl std::fmt::Debug for ExclusivePublication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusivePublication")
            .field("registration_id", &self.registration_id)
            .field("stream_id", &self.stream_id)
            .field("session_id", &self.session_id)
            .field("position", &self.position())
            .finish()
    }
}
