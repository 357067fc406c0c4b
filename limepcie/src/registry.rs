//! Dispatch from connection module names to the code that finds and builds those connections

use crate::{
    connection::Connection,
    core::{
        Config,
        ConnectionHandle,
        ConnectionResult,
        Error,
        MODULE_NAME,
    },
};
use std::sync::Arc;
use tracing::debug;
use xillybus::Backend;

/// Every kind of connection this crate can build
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Boards on PCIe, through Xillybus device files
    PcieXillybus,
}

pub type EnumerateFn = fn(&dyn Backend, &ConnectionHandle) -> Vec<ConnectionHandle>;
pub type MakeFn = fn(Arc<dyn Backend>, &ConnectionHandle, Config) -> ConnectionResult<Connection>;

/// How to find and build one kind of connection
#[derive(Copy, Clone)]
pub struct RegistryEntry {
    pub kind: ConnectionKind,
    /// The module name handles of this kind carry
    pub module: &'static str,
    pub enumerate: EnumerateFn,
    pub make: MakeFn,
}

impl RegistryEntry {
    fn accepts(&self, module: &str) -> bool {
        module.is_empty() || module == self.module
    }
}

pub const REGISTRY: &[RegistryEntry] = &[RegistryEntry {
    kind: ConnectionKind::PcieXillybus,
    module: MODULE_NAME,
    enumerate: Connection::enumerate,
    make: Connection::make,
}];

/// Find every board `hint` accepts across all registered connection kinds
#[must_use]
pub fn enumerate(backend: &dyn Backend, hint: &ConnectionHandle) -> Vec<ConnectionHandle> {
    REGISTRY
        .iter()
        .filter(|entry| entry.accepts(hint.module.as_str()))
        .flat_map(|entry| (entry.enumerate)(backend, hint))
        .collect()
}

/// Build and open a connection for `handle` with whichever kind its module names. A handle
/// without a module goes to the first registered kind.
/// # Errors
/// Returns [`Error::UnknownModule`] if no kind is registered under the handle's module, otherwise
/// whatever opening the connection returns
pub fn make(
    backend: Arc<dyn Backend>,
    handle: &ConnectionHandle,
    config: Config,
) -> ConnectionResult<Connection> {
    let entry = REGISTRY
        .iter()
        .find(|entry| entry.accepts(handle.module.as_str()))
        .ok_or_else(|| Error::UnknownModule(handle.module.clone()))?;
    debug!(kind = ?entry.kind, %handle, "making connection");
    (entry.make)(backend, handle, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::Mock;

    #[test]
    fn test_enumerate_all() {
        let mock = Mock::with_boards(&[0, 1]);
        let found = enumerate(&mock, &ConnectionHandle::default());
        assert_eq!(found.len(), 2);
        assert_eq!(
            found[1].to_string(),
            "LimeSDR-QPCIe [media=PCI-E, module=PCIEXillybus, index=1]"
        );
    }

    #[test]
    fn test_enumerate_other_module() {
        let mock = Mock::with_boards(&[0, 1]);
        let hint = ConnectionHandle {
            module: "FX3".into(),
            ..Default::default()
        };
        assert!(enumerate(&mock, &hint).is_empty());
    }

    #[test]
    fn test_make_from_enumerated() {
        let mock = Mock::with_boards(&[1]);
        let handle = enumerate(&mock, &ConnectionHandle::default()).remove(0);
        let conn = make(Arc::new(mock.clone()), &handle, Config::default()).unwrap();
        assert_eq!(conn.opened_index(), Some(1));
        drop(conn);
        assert_eq!(mock.open_handles(), 0);
    }

    #[test]
    fn test_make_unknown_module() {
        let handle = ConnectionHandle {
            module: "FX3".into(),
            index: Some(0),
            ..Default::default()
        };
        let err = make(Arc::new(Mock::with_boards(&[0])), &handle, Config::default()).unwrap_err();
        assert!(matches!(err, Error::UnknownModule(m) if m.as_str() == "FX3"));
    }
}
