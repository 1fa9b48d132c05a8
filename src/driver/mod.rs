//! Embedded media driver: the transport-side half of the protocol
//!
//! The driver owns every log buffer mapping and all lifecycle state. Clients
//! talk to it exclusively through the asynchronous command/response conduit;
//! frames travel through shared log buffers, never through the conduit. This
//! in-process driver stands in for the wire boundary a networked deployment
//! would have; OS socket I/O is out of scope.

pub mod destination;
pub mod processor;
pub mod uri;

pub use destination::{Destination, DestinationRegistry};
pub use processor::DriverConductor;
pub use uri::ChannelUri;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, UnboundedSender};

use crate::client::command::{Command, DriverHandle};
use crate::config::DriverConfig;

/// In-process driver owning the conductor and, optionally, its duty-cycle
/// task
pub struct MediaDriver {
    conductor: Arc<Mutex<DriverConductor>>,
    command_tx: UnboundedSender<Command>,
    heartbeat: Arc<AtomicI64>,
    next_client_id: AtomicI64,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl MediaDriver {
    /// Build a driver whose duty cycle the caller steps via
    /// [`do_work`](Self::do_work) (single-threaded embedding)
    pub fn new_embedded(config: DriverConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let heartbeat = Arc::new(AtomicI64::new(0));
        let conductor = Arc::new(Mutex::new(DriverConductor::new(
            config,
            command_rx,
            Arc::clone(&heartbeat),
        )));
        Self {
            conductor,
            command_tx,
            heartbeat,
            next_client_id: AtomicI64::new(0),
            task: None,
        }
    }

    /// Launch a driver with a background duty-cycle task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn launch(config: DriverConfig) -> Self {
        let interval = config.duty_cycle_interval;
        let mut driver = Self::new_embedded(config);
        let conductor = Arc::clone(&driver.conductor);
        driver.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                conductor.lock().unwrap().do_work();
            }
        }));
        tracing::info!("Media driver launched");
        driver
    }

    /// Step the driver duty cycle once; returns an indication of work done
    pub fn do_work(&self) -> usize {
        self.conductor.lock().unwrap().do_work()
    }

    /// Attach a client, returning its half of the command/response conduit
    pub fn add_client(&self) -> DriverHandle {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        self.conductor
            .lock()
            .unwrap()
            .add_client(client_id, response_tx);
        DriverHandle {
            client_id,
            to_driver: self.command_tx.clone(),
            from_driver: response_rx,
            heartbeat: Arc::clone(&self.heartbeat),
        }
    }

    /// Stop the background task, if one is running
    pub fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::info!("Media driver shut down");
        }
    }
}

impl Drop for MediaDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for MediaDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaDriver")
            .field("background_task", &self.task.is_some())
            .finish()
    }
}
