//! Fragment assembler: rebuild messages split across frames
//!
//! Wraps a whole-message handler. Unfragmented frames pass straight through
//! with no copy; BEGIN..END runs accumulate per session until the terminating
//! fragment arrives. A partial run is dropped, never delivered, when its
//! image goes unavailable.

use std::collections::HashMap;

use bytes::BytesMut;

use crate::buffer::Header;

/// Reassembles fragmented messages before invoking the wrapped handler
pub struct FragmentAssembler<H> {
    handler: H,
    partials: HashMap<i32, BytesMut>,
}

impl<H> FragmentAssembler<H>
where
    H: FnMut(&[u8], &Header),
{
    /// Wrap a handler that expects whole messages
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            partials: HashMap::new(),
        }
    }

    /// Feed one fragment; invokes the wrapped handler when a message
    /// completes. Use as the handler for `Subscription::poll`.
    pub fn on_fragment(&mut self, payload: &[u8], header: &Header) {
        if header.is_begin_fragment() && header.is_end_fragment() {
            (self.handler)(payload, header);
            return;
        }

        if header.is_begin_fragment() {
            let buffer = self.partials.entry(header.session_id).or_default();
            buffer.clear();
            buffer.extend_from_slice(payload);
            return;
        }

        let Some(buffer) = self.partials.get_mut(&header.session_id) else {
            // middle/end fragment without a begin: the run started before we
            // joined, drop it
            return;
        };
        buffer.extend_from_slice(payload);

        if header.is_end_fragment() {
            let message = self.partials.remove(&header.session_id).unwrap();
            (self.handler)(&message, header);
        }
    }

    /// Borrow a closure suitable for passing to a poll call
    pub fn handler(&mut self) -> impl FnMut(&[u8], &Header) + '_ {
        move |payload, header| self.on_fragment(payload, header)
    }

    /// Discard any partial run for a session whose image went away
    pub fn on_unavailable_image(&mut self, session_id: i32) {
        if self.partials.remove(&session_id).is_some() {
            tracing::debug!(session_id, "Dropped partial message for unavailable image");
        }
    }

    /// Number of sessions with a partially assembled message
    pub fn partial_count(&self) -> usize {
        self.partials.len()
    }
}
