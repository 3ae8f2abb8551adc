//! Message shapes shared by the `beach-pier` server and its viewers. Both sides
//! depend on this crate so the JSON framing cannot drift between them.

pub mod logging;
pub mod protocol;
pub mod reason;

pub use protocol::{ClientMessage, ExitReport, ProcessStatus, ProtocolError, ServerMessage};
pub use reason::{ResyncReason, ResyncTrigger};

/// Sequence number stamped on every live chunk by the upstream supervisor.
pub type Seq = u64;
