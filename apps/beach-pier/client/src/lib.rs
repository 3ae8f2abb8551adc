//! Viewer side of `beach-pier`: keeps a local terminal in step with the
//! shared process across snapshots, live output and reconnects.

pub mod backoff;
pub mod buffer;
pub mod resync;
pub mod sink;
pub mod viewer;

pub use backoff::{ConnectionMachine, ConnectionState, ReconnectBackoff};
pub use buffer::{ByteWindow, Flush};
pub use resync::{Action, ResyncMachine, SyncState};
pub use sink::{MemorySink, StdoutSink, TerminalSink};
pub use viewer::{Control, Viewer, ViewerConfig, ViewerError};
