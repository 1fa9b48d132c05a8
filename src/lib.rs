//! logbus: brokerless low-latency pub/sub over shared log buffers
//!
//! Messages travel from producers to consumers through fixed-capacity term
//! buffers without a central broker; an embedded driver ships committed
//! frames to any number of independently managed destinations (MDC) and
//! tracks liveness. Every hot-path call (`offer`, `poll`, `add_destination`,
//! `find_*`) is non-blocking: it returns a result or a "not yet" status and
//! the caller decides how to wait.
//!
//! # Architecture
//!
//! ```text
//!  producer threads                             consumer threads
//!  Publication::offer()                         Subscription::poll()
//!        │  atomic claim + commit                       ▲
//!        ▼                                              │ scan by position
//!  ┌──────────────┐   replicate (driver)       ┌──────────────┐
//!  │  LogBuffer   │ ──────────────────────────►│ image logs   │
//!  │  3 terms     │   per destination          │ (mirrored)   │
//!  └──────────────┘                            └──────────────┘
//!        ▲                                              ▲
//!        │ commands / responses (correlation ids)       │
//!  ┌─────┴──────────┐        conduit         ┌──────────┴─────┐
//!  │ ClientConductor│ ◄────────────────────► │ DriverConductor│
//!  └────────────────┘                        └────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use logbus::{Client, ClientConfig, DriverConfig, MediaDriver};
//!
//! # #[tokio::main] async fn main() {
//! let driver = MediaDriver::launch(DriverConfig::default());
//! let client = Client::connect(ClientConfig::default(), driver.add_client());
//!
//! let sub_id = client.add_subscription("bus:mem?endpoint=alpha", 1001).unwrap();
//! let pub_id = client.add_publication("bus:mem?endpoint=alpha", 1001).unwrap();
//!
//! // poll until the driver resolves both commands
//! let publication = loop {
//!     if let Some(p) = client.find_publication(pub_id).unwrap() {
//!         break p;
//!     }
//! };
//! # let _ = (sub_id, publication);
//! # }
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod flow;
pub mod publication;
pub mod subscription;

pub use buffer::{ControlledAction, Header, LogBuffer};
pub use client::{Client, ClientConductor, ControlMode, DriverHandle};
pub use config::{ClientConfig, DriverConfig};
pub use driver::{ChannelUri, MediaDriver};
pub use error::{ClientError, ErrorCode, OfferError, Result};
pub use flow::{FlowControl, FlowControlStrategy};
pub use publication::{BufferClaim, ExclusivePublication, Publication};
pub use subscription::{FragmentAssembler, Image, Subscription};
