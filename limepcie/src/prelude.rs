//! Prelude (helpful reexports) for this package

pub use crate::{
    connection::{
        Connection,
        ControlPort,
    },
    core::{
        Config,
        ConnectionHandle,
        ConnectionResult,
        EndpointId,
    },
    pll::{
        PllProgrammer,
        PllRequest,
    },
    protocol::{
        Command,
        ControlPacket,
        Status,
    },
    streaming::{
        LoopExit,
        StreamSession,
        TransferReport,
    },
    transport::Backend,
};
#[cfg(unix)]
pub use crate::transport::DevFs;
