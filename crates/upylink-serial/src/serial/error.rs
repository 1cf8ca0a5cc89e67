//! Error type for the serial link, raw REPL and file operations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised link error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplError {
    pub kind: ReplErrorKind,
    pub message: String,
    /// Port the failing operation was talking to, if known.
    pub port_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplErrorKind {
    /// Port missing, busy, closed, or failing at the OS level.
    PortUnavailable,
    /// An expected marker did not arrive before the read deadline.
    DeviceNotResponding,
    /// The device never acknowledged the raw-mode probe.
    RawModeEntryFailed,
    /// A command printed to stderr on the device.
    RemoteOperationFailed,
    /// A response did not have the expected shape.
    ProtocolDecodeError,
    /// Reading or writing a file on the host failed.
    LocalIo,
    /// The worker owning the port has gone away.
    WorkerStopped,
}

pub type ReplResult<T> = Result<T, ReplError>;

// ── Construction helpers ─────────────────────────────────────────────

impl ReplError {
    pub fn new(kind: ReplErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            port_name: None,
        }
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port_name = Some(port.into());
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn port_unavailable(msg: impl Into<String>) -> Self {
        Self::new(ReplErrorKind::PortUnavailable, msg)
    }

    pub fn not_responding(msg: impl Into<String>) -> Self {
        Self::new(ReplErrorKind::DeviceNotResponding, msg)
    }

    pub fn raw_mode_entry(msg: impl Into<String>) -> Self {
        Self::new(ReplErrorKind::RawModeEntryFailed, msg)
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self::new(ReplErrorKind::RemoteOperationFailed, msg)
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::new(ReplErrorKind::ProtocolDecodeError, msg)
    }

    pub fn local_io(msg: impl Into<String>) -> Self {
        Self::new(ReplErrorKind::LocalIo, msg)
    }

    pub fn worker_stopped() -> Self {
        Self::new(ReplErrorKind::WorkerStopped, "Worker owning the port has stopped")
    }

    pub fn is(&self, kind: ReplErrorKind) -> bool {
        self.kind == kind
    }
}

impl fmt::Display for ReplError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.port_name {
            Some(port) => write!(f, "[{:?} {}] {}", self.kind, port, self.message),
            None => write!(f, "[{:?}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ReplError {}

impl From<std::io::Error> for ReplError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Self::not_responding(format!("I/O timeout: {}", e))
        } else {
            Self::port_unavailable(e.to_string())
        }
    }
}

impl From<serialport::Error> for ReplError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::Io(std::io::ErrorKind::TimedOut) => {
                Self::not_responding(e.description)
            }
            _ => Self::port_unavailable(e.description),
        }
    }
}

impl From<ReplError> for String {
    fn from(e: ReplError) -> String {
        e.message
    }
}
