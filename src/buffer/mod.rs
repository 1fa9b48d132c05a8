//! Log/term buffer: the shared ring structure backing one stream direction
//!
//! A log buffer is three fixed-length terms recycled round-robin. Producers
//! claim frame ranges off an atomic tail counter, write header and payload,
//! and commit by publishing the length word last; readers scan committed
//! frames by position and never observe a partially written frame. Positions
//! are monotonic 64-bit byte offsets that decompose into (term id, offset).

pub mod appender;
pub mod atomic;
pub mod frame;
pub mod log;
pub mod position;
pub mod reader;

pub use atomic::AtomicBuffer;
pub use frame::{Header, FRAME_ALIGNMENT, HEADER_LENGTH};
pub use log::LogBuffer;
pub use reader::{ControlledAction, ReadOutcome};
