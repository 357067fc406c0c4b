//! The static table of Xillybus endpoint paths for each supported board revision

use crate::core::{
    ConnectionResult,
    EndpointId,
    Error,
    MAX_EP_CNT,
};

/// The device files a board revision exposes. Empty stream paths mean that stream pair is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig {
    /// The board name reported by enumeration
    pub name: &'static str,
    /// The hardware revision the table entry describes
    pub version: u8,
    pub ctrl_read: &'static str,
    pub ctrl_write: &'static str,
    pub stream_read: [&'static str; MAX_EP_CNT],
    pub stream_write: [&'static str; MAX_EP_CNT],
}

/// Every supported board, indexed by board index
pub const DEVICE_CONFIGS: [EndpointConfig; 2] = [
    EndpointConfig {
        name: "LimeSDR-PCIe",
        version: 0,
        ctrl_read: "/dev/xillybus_read_8",
        ctrl_write: "/dev/xillybus_write_8",
        stream_read: ["/dev/xillybus_read_32", ""],
        stream_write: ["/dev/xillybus_write_32", ""],
    },
    EndpointConfig {
        name: "LimeSDR-QPCIe",
        version: 1,
        ctrl_read: "/dev/xillybus_control0_read_32",
        ctrl_write: "/dev/xillybus_control0_write_32",
        stream_read: [
            "/dev/xillybus_stream0_read_32",
            "/dev/xillybus_stream1_read_32",
        ],
        stream_write: [
            "/dev/xillybus_stream0_write_32",
            "/dev/xillybus_stream1_write_32",
        ],
    },
];

/// Look up the endpoint paths for the board at `index`
/// # Errors
/// Returns [`Error::UnsupportedHardware`] for an index past the end of the table
pub fn lookup(index: usize) -> ConnectionResult<&'static EndpointConfig> {
    DEVICE_CONFIGS
        .get(index)
        .ok_or(Error::UnsupportedHardware(index))
}

impl EndpointConfig {
    /// The number of stream endpoint pairs this revision has. A pair only counts if both
    /// directions are present.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.stream_read
            .iter()
            .zip(self.stream_write.iter())
            .take_while(|(r, w)| !r.is_empty() && !w.is_empty())
            .count()
    }

    /// The path for `endpoint`, or `None` if this revision doesn't have it
    #[must_use]
    pub fn path(&self, endpoint: EndpointId) -> Option<&'static str> {
        let path = match endpoint {
            EndpointId::ControlRead => self.ctrl_read,
            EndpointId::ControlWrite => self.ctrl_write,
            EndpointId::StreamRead(i) if i < self.stream_count() => self.stream_read[i],
            EndpointId::StreamWrite(i) if i < self.stream_count() => self.stream_write[i],
            _ => return None,
        };
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert_eq!(lookup(0).unwrap().name, "LimeSDR-PCIe");
        assert_eq!(lookup(1).unwrap().name, "LimeSDR-QPCIe");
        assert!(matches!(lookup(2), Err(Error::UnsupportedHardware(2))));
    }

    #[test]
    fn test_stream_counts() {
        assert_eq!(DEVICE_CONFIGS[0].stream_count(), 1);
        assert_eq!(DEVICE_CONFIGS[1].stream_count(), 2);
    }

    #[test]
    fn test_missing_stream_path() {
        let cfg = &DEVICE_CONFIGS[0];
        assert_eq!(
            cfg.path(EndpointId::StreamRead(0)),
            Some("/dev/xillybus_read_32")
        );
        assert_eq!(cfg.path(EndpointId::StreamWrite(1)), None);
    }
}
