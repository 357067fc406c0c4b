//! The core types shared by every part of a board connection
use crate::protocol::Status;
use kstring::KString;
use std::{
    fmt::Display,
    time::Duration,
};
use thiserror::Error;
use xillybus::Direction;

/// The most stream endpoint pairs any supported board exposes
pub const MAX_EP_CNT: usize = 2;

/// Timeout used for data transfers when the caller has no opinion
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);
/// Timeout for each half of a control request/response exchange
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_millis(100);
/// Longest single wait inside a transfer. This bounds how long an abort takes to be noticed.
pub const DEFAULT_POLL_GRANULARITY: Duration = Duration::from_millis(10);

/// The module name boards found by this crate are registered under
pub const MODULE_NAME: &str = "PCIEXillybus";
/// The media string for PCIe attached boards
pub const MEDIA_NAME: &str = "PCI-E";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to open the {endpoint} endpoint")]
    Open {
        endpoint: EndpointId,
        #[source]
        source: xillybus::Error,
    },
    #[error("The {0} endpoint is not open")]
    ClosedEndpoint(EndpointId),
    #[error("The {0} endpoint is not configured for this board")]
    InvalidEndpoint(EndpointId),
    #[error("Device IO failure on the {endpoint} endpoint")]
    Io {
        endpoint: EndpointId,
        #[source]
        source: xillybus::Error,
    },
    #[error("No supported hardware at board index {0}")]
    UnsupportedHardware(usize),
    #[error("Control exchange moved {got} of {expected} bytes")]
    ShortTransfer { expected: usize, got: usize },
    #[error("The board did not complete the command - {0:?}")]
    CommandFailed(Status),
    #[error("Failed to pack or unpack a control frame")]
    Packing(#[from] packed_struct::PackingError),
    #[error("Sample rates must be finite and positive, got tx={tx} rx={rx}")]
    InvalidRate { tx: f64, rx: f64 },
    #[error("No PLL programmer is installed on this connection")]
    NoPllProgrammer,
    #[error("PLL programming failed - {0:#}")]
    Pll(anyhow::Error),
    #[error("Giving up on the {endpoint} endpoint after {failures} consecutive failures")]
    TooManyFailures { endpoint: EndpointId, failures: usize },
    #[error("No connection module named `{0}` is registered")]
    UnknownModule(KString),
    #[error("No supported board matches the handle {0}")]
    UnresolvedHandle(String),
}

impl Error {
    /// The OS error code behind an open or IO failure
    #[must_use]
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Error::Open { source, .. } | Error::Io { source, .. } => source.os_error(),
            _ => None,
        }
    }
}

pub type ConnectionResult<T> = Result<T, Error>;

/// Names one of the endpoints of a board
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EndpointId {
    ControlRead,
    ControlWrite,
    StreamRead(usize),
    StreamWrite(usize),
}

impl EndpointId {
    #[must_use]
    pub fn direction(self) -> Direction {
        match self {
            EndpointId::ControlRead | EndpointId::StreamRead(_) => Direction::Read,
            EndpointId::ControlWrite | EndpointId::StreamWrite(_) => Direction::Write,
        }
    }
}

impl Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointId::ControlRead => write!(f, "control read"),
            EndpointId::ControlWrite => write!(f, "control write"),
            EndpointId::StreamRead(i) => write!(f, "stream read #{i}"),
            EndpointId::StreamWrite(i) => write!(f, "stream write #{i}"),
        }
    }
}

/// Timing knobs for a connection
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Config {
    /// Default timeout for data transfers
    pub timeout: Duration,
    /// Timeout for each write and each read of a control exchange
    pub control_timeout: Duration,
    /// Longest single wait inside a transfer
    pub poll_granularity: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            poll_granularity: DEFAULT_POLL_GRANULARITY,
        }
    }
}

impl Config {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    /// A zero granularity would turn waits into spins, so it is raised to one millisecond
    #[must_use]
    pub fn with_poll_granularity(mut self, granularity: Duration) -> Self {
        self.poll_granularity = granularity.max(Duration::from_millis(1));
        self
    }
}

/// Describes a board that can be connected to, as found by enumeration. Also used as the filter
/// hint for enumeration, where empty strings and `None` match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    /// The connection module that found this board
    pub module: KString,
    /// What kind of link the board sits on
    pub media: KString,
    /// Board name
    pub name: KString,
    /// Board serial number, if known
    pub serial: KString,
    /// Index of the board in its module's table
    pub index: Option<usize>,
}

impl ConnectionHandle {
    /// A hint that only matches the board at `index`
    #[must_use]
    pub fn with_index(index: usize) -> Self {
        Self {
            index: Some(index),
            ..Default::default()
        }
    }

    /// Checks whether `self` (taken as a hint) accepts `other`
    #[must_use]
    pub fn matches(&self, other: &ConnectionHandle) -> bool {
        let field = |hint: &KString, value: &KString| hint.is_empty() || hint == value;
        field(&self.module, &other.module)
            && field(&self.media, &other.media)
            && field(&self.name, &other.name)
            && field(&self.serial, &other.serial)
            && (self.index.is_none() || self.index == other.index)
    }
}

impl Display for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [media={}, module={}", self.name, self.media, self.module)?;
        if !self.serial.is_empty() {
            write!(f, ", serial={}", self.serial)?;
        }
        if let Some(index) = self.index {
            write!(f, ", index={index}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn found(index: usize) -> ConnectionHandle {
        ConnectionHandle {
            module: MODULE_NAME.into(),
            media: MEDIA_NAME.into(),
            name: "LimeSDR-QPCIe".into(),
            serial: KString::default(),
            index: Some(index),
        }
    }

    #[test]
    fn test_empty_hint_matches_all() {
        assert!(ConnectionHandle::default().matches(&found(0)));
        assert!(ConnectionHandle::default().matches(&found(1)));
    }

    #[test]
    fn test_hint_filters() {
        assert!(ConnectionHandle::with_index(1).matches(&found(1)));
        assert!(!ConnectionHandle::with_index(0).matches(&found(1)));
        let hint = ConnectionHandle {
            module: "FX3".into(),
            ..Default::default()
        };
        assert!(!hint.matches(&found(0)));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            found(1).to_string(),
            "LimeSDR-QPCIe [media=PCI-E, module=PCIEXillybus, index=1]"
        );
    }

    #[test]
    fn test_granularity_floor() {
        let config = Config::default().with_poll_granularity(Duration::ZERO);
        assert_eq!(config.poll_granularity, Duration::from_millis(1));
    }

    #[test]
    fn test_endpoint_direction() {
        assert_eq!(EndpointId::StreamWrite(1).direction(), Direction::Write);
        assert_eq!(EndpointId::ControlRead.direction(), Direction::Read);
        assert_eq!(EndpointId::StreamRead(1).to_string(), "stream read #1");
    }
}
