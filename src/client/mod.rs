//! Client side: session context, conductor, command protocol
//!
//! Everything a producing or consuming application touches lives here. All
//! lifecycle operations are asynchronous: issue a command, get a correlation
//! id back immediately, poll a `find_*` accessor until it resolves. The
//! conductor's duty cycle does the matching, either on a background task or
//! stepped explicitly by the embedding thread.

pub mod command;
pub mod conductor;
pub mod context;

pub use command::{Command, ControlMode, DriverHandle, Response};
pub use conductor::ClientConductor;
pub use context::Client;
