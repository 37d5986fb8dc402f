use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::instance::InstanceRef;

pub type Result<T> = std::result::Result<T, ConsoleError>;

/// Why a console session stopped accepting I/O
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer session for the same instance took over the console
    Displaced,
    /// The remote end closed the stream
    Remote,
    /// Reading from the stream failed
    ReadFailed(String),
    /// The owning caller closed the session
    Local,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Displaced => write!(f, "displaced by new connection"),
            CloseReason::Remote => write!(f, "stream closed by remote end"),
            CloseReason::ReadFailed(msg) => write!(f, "read failed: {}", msg),
            CloseReason::Local => write!(f, "session closed by caller"),
        }
    }
}

/// Errors that can occur while connecting to or driving a console
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// The instance never reached the running phase within the connection timeout
    #[error("Timeout trying to connect to the virtual machine instance")]
    ConnectTimeout,

    /// The instance declares no serial console device
    #[error("No serial consoles are present.")]
    NoConsoleDevice,

    /// The console channel could not be established
    #[error("console device unavailable for {instance}: {reason}")]
    DeviceUnavailable {
        instance: InstanceRef,
        reason: String,
    },

    /// Reading or writing the console stream failed
    #[error("console stream I/O error: {0}")]
    StreamIo(#[from] std::io::Error),

    /// The expected text did not show up in time
    #[error("pattern {pattern:?} not found within {timeout:?}")]
    PatternTimeout { pattern: String, timeout: Duration },

    #[error("console connection closed: {reason}")]
    ConnectionClosed { reason: CloseReason },

    #[error("invalid expect pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("virtual machine instance {0} not found")]
    InstanceNotFound(InstanceRef),

    /// The orchestration API returned something unusable
    #[error("orchestration API error: {0}")]
    Api(String),
}

impl ConsoleError {
    pub(crate) fn closed(reason: CloseReason) -> Self {
        ConsoleError::ConnectionClosed { reason }
    }

    /// True for errors caused by the session going away
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, ConsoleError::ConnectionClosed { .. })
    }
}
