//! Command and response messages exchanged with the driver
//!
//! Every lifecycle operation is an asynchronous command tagged with a
//! correlation id; the driver answers with exactly one response carrying the
//! same id (or an image event carrying its own driver-allocated id). The
//! conduit is a pair of unbounded channels drained with `try_recv` from the
//! duty cycles, so neither side ever blocks on the other.

use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::buffer::LogBuffer;
use crate::error::ErrorCode;

/// Destination handling declared by a publication's channel URI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    /// Single implicit destination taken from the `endpoint` parameter
    None,
    /// The application adds and removes every destination explicitly
    Manual,
    /// Destinations are derived from subscription discovery; add/remove is
    /// not available to the application
    Dynamic,
}

impl std::fmt::Display for ControlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControlMode::None => "none",
            ControlMode::Manual => "manual",
            ControlMode::Dynamic => "dynamic",
        };
        f.write_str(s)
    }
}

/// Client-to-driver lifecycle commands
#[derive(Debug)]
pub enum Command {
    /// Create a publication (or exclusive publication) for a channel/stream
    AddPublication {
        correlation_id: i64,
        client_id: i64,
        channel: String,
        stream_id: i32,
        exclusive: bool,
    },
    /// Release a publication and its log
    ClosePublication {
        correlation_id: i64,
        client_id: i64,
        registration_id: i64,
    },
    /// Register interest in a channel/stream
    AddSubscription {
        correlation_id: i64,
        client_id: i64,
        channel: String,
        stream_id: i32,
    },
    /// Drop a subscription and its images
    CloseSubscription {
        correlation_id: i64,
        client_id: i64,
        registration_id: i64,
    },
    /// Attach a destination to a manual-mode publication
    AddDestination {
        correlation_id: i64,
        client_id: i64,
        publication_id: i64,
        channel: String,
    },
    /// Detach a destination previously added, referenced by the correlation
    /// id of the add operation
    RemoveDestination {
        correlation_id: i64,
        client_id: i64,
        publication_id: i64,
        destination_id: i64,
    },
    /// Client liveness signal
    ClientKeepalive { client_id: i64 },
    /// Client is going away; release everything it owns
    ClientClose { client_id: i64 },
}

impl Command {
    /// Correlation id the driver must answer with, if the command expects an
    /// answer
    pub fn correlation_id(&self) -> Option<i64> {
        match self {
            Command::AddPublication { correlation_id, .. }
            | Command::ClosePublication { correlation_id, .. }
            | Command::AddSubscription { correlation_id, .. }
            | Command::CloseSubscription { correlation_id, .. }
            | Command::AddDestination { correlation_id, .. }
            | Command::RemoveDestination { correlation_id, .. } => Some(*correlation_id),
            Command::ClientKeepalive { .. } | Command::ClientClose { .. } => None,
        }
    }
}

/// Driver-to-client responses and events
#[derive(Debug)]
pub enum Response {
    /// Publication created; carries the shared log the producer writes into
    PublicationReady {
        correlation_id: i64,
        registration_id: i64,
        session_id: i32,
        stream_id: i32,
        control_mode: ControlMode,
        log: Arc<LogBuffer>,
    },
    /// Subscription registered
    SubscriptionReady {
        correlation_id: i64,
        registration_id: i64,
    },
    /// Command executed with no payload to return
    OperationSuccess { correlation_id: i64 },
    /// Command failed
    Error {
        correlation_id: i64,
        code: ErrorCode,
        message: String,
    },
    /// A new source session is now visible to a subscription
    AvailableImage {
        /// Driver-allocated image identity
        correlation_id: i64,
        subscription_registration_id: i64,
        session_id: i32,
        source_identity: String,
        /// Mirrored log the driver writes and the image scans
        log: Arc<LogBuffer>,
        /// Consumer position, shared so the driver can compute flow windows
        subscriber_position: Arc<AtomicI64>,
        join_position: i64,
    },
    /// A source session went away
    UnavailableImage {
        correlation_id: i64,
        subscription_registration_id: i64,
    },
}

/// Client-side endpoints of the command/response conduit, issued by the
/// driver when a client attaches
#[derive(Debug)]
pub struct DriverHandle {
    /// Driver-assigned client identity
    pub client_id: i64,
    /// Command queue into the driver
    pub to_driver: UnboundedSender<Command>,
    /// Response queue from the driver
    pub from_driver: UnboundedReceiver<Response>,
    /// Epoch-millisecond timestamp the driver refreshes every duty cycle
    pub heartbeat: Arc<AtomicI64>,
}

/// Milliseconds since the unix epoch; the shared clock for heartbeats and
/// liveness checks
pub fn epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
