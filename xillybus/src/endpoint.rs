//! The capability traits every endpoint implementation provides

use crate::Error;
use std::{
    fmt::Debug,
    time::Duration,
};

/// Which way bytes flow through an endpoint, from the host's point of view
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    /// FPGA to host
    Read,
    /// Host to FPGA
    Write,
}

/// One opened endpoint. Dropping the handle closes it.
pub trait EndpointIo: Send + Debug {
    /// The path this endpoint was opened from
    fn path(&self) -> &str;

    /// Wait at most `wait` for the endpoint to have data, then read what is available into `buf`.
    /// Returns `Ok(0)` if nothing arrived in that window.
    /// # Errors
    /// Returns the underlying error on a hard device failure
    fn read(&mut self, buf: &mut [u8], wait: Duration) -> std::io::Result<usize>;

    /// Wait at most `wait` for the endpoint to accept data, then write as much of `buf` as it
    /// takes. Returns `Ok(0)` if the FIFO stayed full for the whole window.
    /// # Errors
    /// Returns the underlying error on a hard device failure
    fn write(&mut self, buf: &[u8], wait: Duration) -> std::io::Result<usize>;
}

/// Something that can find and open endpoints by path
pub trait Backend: Send + Sync + Debug {
    /// Checks whether an endpoint exists without opening it
    fn exists(&self, path: &str) -> bool;

    /// Open the endpoint at `path` for `direction`
    /// # Errors
    /// Returns [`Error::Open`] if the OS refuses
    fn open(&self, path: &str, direction: Direction) -> Result<Box<dyn EndpointIo>, Error>;
}
