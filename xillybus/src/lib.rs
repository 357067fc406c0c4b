//! # Xillybus endpoints
//!
//! Xillybus exposes FIFOs inside the FPGA as plain device files. This crate wraps those files as
//! [`EndpointIo`] handles and implements the timeout-bounded, abortable transfers that the
//! higher level board connection is built on.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod abort;
#[cfg(unix)]
pub mod devfs;
pub mod endpoint;
mod transfer;

pub use abort::AbortToken;
#[cfg(unix)]
pub use devfs::DevFs;
pub use endpoint::{
    Backend,
    Direction,
    EndpointIo,
};
pub use transfer::{
    read_bounded,
    write_bounded,
};

/// Errors that come from the device files themselves
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not open endpoint `{path}`")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Device IO failure on endpoint `{path}`")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// The OS error code behind this failure, if the OS gave us one
    #[must_use]
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Error::Open { source, .. } | Error::Io { source, .. } => source.raw_os_error(),
        }
    }

    /// The device path this error happened on
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Error::Open { path, .. } | Error::Io { path, .. } => path,
        }
    }
}
