//! Error taxonomy for the relay.
//!
//! - [`FrameError`]: transient decode errors, recovered inside the decoder
//! - [`LinkError`]: serial link faults (recoverable) and initial open failures (fatal)
//! - [`ConfigError`]: invalid configuration, fatal at startup
//! - [`RelayError`]: failures starting the relay runtime

use std::io;

use thiserror::Error;

// ── Decode ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("expected end byte 0x03, found 0x{found:02X}")]
    BadEndByte { found: u8 },
    #[error("short frame: {got} of 3 bytes before read timeout")]
    ShortRead { got: usize },
}

// ── Serial link ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LinkError {
    /// The port could not be opened at startup (missing device, permission
    /// denied). Never retried.
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: io::Error,
    },
    /// I/O failure on an open link. The link is now `Faulted` and reopens on
    /// its next operation.
    #[error("serial link {port} faulted: {source}")]
    Fault {
        port: String,
        #[source]
        source: io::Error,
    },
    /// The link was closed deliberately or shutdown was signalled while
    /// waiting to reopen.
    #[error("serial link {port} is shut down")]
    Shutdown { port: String },
}

impl LinkError {
    /// Whether the process cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LinkError::Open { .. })
    }

    pub fn port(&self) -> &str {
        match self {
            LinkError::Open { port, .. }
            | LinkError::Fault { port, .. }
            | LinkError::Shutdown { port } => port,
        }
    }
}

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Runtime ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    /// The outbound link was built with a different [`Shutdown`] than the
    /// inbound one, so stopping the relay could not wake its reopen loop.
    ///
    /// [`Shutdown`]: crate::Shutdown
    #[error("serial link {port} does not share the relay's shutdown signal")]
    ForeignShutdown { port: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_open_failures_are_fatal() {
        let open = LinkError::Open {
            port: "/dev/ttyUSB0".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such device"),
        };
        let fault = LinkError::Fault {
            port: "/dev/ttyUSB0".into(),
            source: io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"),
        };
        let shutdown = LinkError::Shutdown {
            port: "/dev/ttyUSB0".into(),
        };
        assert!(open.is_fatal());
        assert!(!fault.is_fatal());
        assert!(!shutdown.is_fatal());
        assert_eq!(fault.port(), "/dev/ttyUSB0");
    }

    #[test]
    fn frame_error_messages_name_the_byte() {
        let err = FrameError::BadEndByte { found: 0x7f };
        assert_eq!(err.to_string(), "expected end byte 0x03, found 0x7F");
    }
}
