//! # LimePCIe
//!
//! A connection to LimeSDR boards attached over PCIe. The FPGA exposes its FIFOs through the
//! Xillybus driver as a pair of control endpoints plus up to two pairs of stream endpoints. This
//! crate opens those endpoints, moves bytes over them with bounded and abortable transfers, runs
//! the continuous receive and transmit loops a streaming engine drives, and speaks the LMS64C
//! control protocol on the control pair.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use limepcie::prelude::*;
//! use std::sync::Arc;
//!
//! let backend = Arc::new(DevFs);
//! let conn = Connection::connect(backend, 0, Config::default())?;
//! let info = conn.device_info()?;
//! println!("firmware {} serial {:x}", info.firmware, info.serial);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod connection;
pub mod core;
pub mod endpoints;
mod handles;
pub mod pll;
pub mod prelude;
pub mod protocol;
pub mod registry;
pub mod streaming;
pub mod transport;

pub use crate::{
    connection::Connection,
    core::{
        Config,
        ConnectionHandle,
        Error,
    },
};
