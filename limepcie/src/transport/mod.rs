//! The backends a connection can open its endpoints through.
//!
//! On unix hosts [`DevFs`] opens the real `/dev/xillybus_*` device files. [`mock::Mock`] keeps
//! everything in memory.

pub mod mock;

#[cfg(unix)]
pub use xillybus::DevFs;
pub use xillybus::{
    Backend,
    Direction,
    EndpointIo,
};
