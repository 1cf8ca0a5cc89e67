//! Serial crate: sub-modules.

pub mod types;
pub mod error;
pub mod transport;
pub mod port_scanner;
pub mod literal;
pub mod raw_repl;
pub mod file_ops;
pub mod file_manager;
pub mod terminal;
pub mod keys;
pub mod repl_session;
pub mod flow_control;
pub mod simulator;

// Re-export top-level items for convenience.
pub use types::*;
pub use error::{ReplError, ReplErrorKind, ReplResult};
pub use transport::{PortHandle, SerialTransport, SimulatedTransport, SystemTransport};
pub use raw_repl::{RawReplSession, RawReplState};
pub use file_ops::DeviceFileOps;
pub use file_manager::{FileEvent, FileManager, FileRequest};
pub use terminal::TerminalEmulator;
pub use keys::{Key, KeyInput, KeyOutcome, Modifiers, Platform};
pub use repl_session::{start_repl, ReplCommand, ReplEvent, ReplSessionHandle, ReplSessionOptions};
pub use flow_control::FlowControlledTransport;
pub use simulator::SimulatedBoard;
