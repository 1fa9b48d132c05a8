//! Consumer-side handles: subscriptions, images, fragment assembly
//!
//! A subscription aggregates every live source (image) for one channel and
//! stream. Polling round-robins across the images so one noisy source cannot
//! starve the others; image arrival and removal are driven entirely by the
//! driver's liveness protocol through the conductor.

pub mod assembler;
pub mod image;

pub use assembler::FragmentAssembler;
pub use image::Image;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::buffer::reader::ControlledAction;
use crate::buffer::Header;
use crate::client::conductor::ClientConductor;

/// Consumer handle for one channel and stream
pub struct Subscription {
    conductor: Arc<ClientConductor>,
    registration_id: i64,
    images: RwLock<Vec<Arc<Image>>>,
    round_robin: AtomicUsize,
    closed: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(conductor: Arc<ClientConductor>, registration_id: i64) -> Self {
        Self {
            conductor,
            registration_id,
            images: RwLock::new(Vec::new()),
            round_robin: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Registration id assigned when the subscription was added
    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    /// Whether at least one live image exists
    pub fn is_connected(&self) -> bool {
        !self.is_closed()
            && self
                .images
                .read()
                .unwrap()
                .iter()
                .any(|image| !image.is_unavailable())
    }

    /// Whether this handle has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.conductor.is_closed()
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Number of images currently attached
    pub fn image_count(&self) -> usize {
        self.images.read().unwrap().len()
    }

    /// Snapshot of the current images
    pub fn images(&self) -> Vec<Arc<Image>> {
        self.images.read().unwrap().clone()
    }

    /// Image for a given source session, if attached
    pub fn image_by_session(&self, session_id: i32) -> Option<Arc<Image>> {
        self.images
            .read()
            .unwrap()
            .iter()
            .find(|image| image.session_id() == session_id)
            .cloned()
    }

    pub(crate) fn add_image(&self, image: Arc<Image>) {
        self.images.write().unwrap().push(image);
    }

    pub(crate) fn remove_image(&self, correlation_id: i64) -> Option<Arc<Image>> {
        let mut images = self.images.write().unwrap();
        let index = images
            .iter()
            .position(|image| image.correlation_id() == correlation_id)?;
        let image = images.remove(index);
        image.set_unavailable();
        Some(image)
    }

    /// Poll up to `fragment_limit` fragments across the live images,
    /// round-robining the starting image between calls. Never blocks.
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

    /// Poll with a handler that can stop consumption mid-stream
    pub fn controlled_poll<H>(&self, handler: &mut H, fragment_limit: usize) -> usize
    where
        H: FnMut(&[u8], &Header) -> ControlledAction,
    {
        if self.is_closed() {
            return 0;
        }

        // snapshot outside the handler so image arrival never contends with
        // handler execution
        let images = self.images.read().unwrap().clone();
        if images.is_empty() {
            return 0;
        }

        let start = self.round_robin.load(Ordering::Relaxed) % images.len();
        let mut total = 0;
        for i in 0..images.len() {
            if total >= fragment_limit {
                break;
            }
            let image = &images[(start + i) % images.len()];
            if image.is_unavailable() {
                continue;
            }
            total += image.controlled_poll(handler, fragment_limit - total);
        }
        self.round_robin.store(start + 1, Ordering::Relaxed);
        total
    }

    /// Close the subscription and release its driver resources
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.conductor.close_subscription(self.registration_id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("registration_id", &self.registration_id)
            .field("images", &self.image_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
