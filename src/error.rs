//! Error types for the client and driver protocol
//!
//! Hot-path conditions (back-pressure, not-connected) are sentinel values,
//! never allocated; lifecycle errors carry a category and a message so they
//! can travel across the command/response channel.

/// Convenience result alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Category carried by driver error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Unspecified driver-side failure
    GenericError,
    /// Channel URI was malformed or used an unknown media
    InvalidChannel,
    /// Referenced publication is not registered with the driver
    UnknownPublication,
    /// Referenced subscription is not registered with the driver
    UnknownSubscription,
    /// Referenced destination is not registered on the publication
    UnknownDestination,
    /// Operation is not valid for the target's control mode
    NotSupported,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::GenericError => "generic error",
            ErrorCode::InvalidChannel => "invalid channel",
            ErrorCode::UnknownPublication => "unknown publication",
            ErrorCode::UnknownSubscription => "unknown subscription",
            ErrorCode::UnknownDestination => "unknown destination",
            ErrorCode::NotSupported => "not supported",
        };
        f.write_str(s)
    }
}

/// Error type for client lifecycle operations
#[derive(Debug, Clone)]
pub enum ClientError {
    /// Driver heartbeat was not observed within the configured timeout.
    /// Fatal to the whole client session.
    DriverNotActive,
    /// A command was issued but no response arrived within the command timeout
    CommandTimeout(i64),
    /// The driver rejected a command
    DriverError {
        /// Error category reported by the driver
        code: ErrorCode,
        /// Human-readable detail
        message: String,
    },
    /// Operation is not supported by the target (e.g. adding a destination
    /// to a publication that is not in manual control mode)
    UnsupportedOperation(String),
    /// The handle this operation was issued against has been closed
    ResourceClosed,
    /// Correlation id does not map to any command issued by this client
    UnknownCorrelation(i64),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::DriverNotActive => write!(f, "driver not active"),
            ClientError::CommandTimeout(id) => {
                write!(f, "command timed out: correlation id {}", id)
            }
            ClientError::DriverError { code, message } => {
                write!(f, "driver error ({}): {}", code, message)
            }
            ClientError::UnsupportedOperation(detail) => {
                write!(f, "unsupported operation: {}", detail)
            }
            ClientError::ResourceClosed => write!(f, "resource is closed"),
            ClientError::UnknownCorrelation(id) => {
                write!(f, "unknown correlation id {}", id)
            }
        }
    }
}

impl std::error::Error for ClientError {}

/// Non-fatal result codes for `offer` and `try_claim`
///
/// These are back-pressure style sentinels: the caller decides whether to
/// retry, drop, or interleave other work. None of them poison the publication
/// except `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferError {
    /// The receiver window or the current term is full; retry after consumers
    /// advance
    BackPressured,
    /// No live destination or image is attached yet; retry once connected
    NotConnected,
    /// A term rotation is in progress; retry immediately
    AdminAction,
    /// The publication has been closed; never retry
    Closed,
    /// The stream reached the maximum position for its term length
    MaxPositionExceeded,
}

impl std::fmt::Display for OfferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OfferError::BackPressured => "back pressured",
            OfferError::NotConnected => "not connected",
            OfferError::AdminAction => "admin action in progress",
            OfferError::Closed => "publication closed",
            OfferError::MaxPositionExceeded => "max position exceeded",
        };
        f.write_str(s)
    }
}

impl std::error::Error for OfferError {}
