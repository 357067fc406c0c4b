//! Endpoints backed by the Xillybus device files under `/dev`

use crate::{
    endpoint::{
        Backend,
        Direction,
        EndpointIo,
    },
    Error,
};
use nix::{
    errno::Errno,
    libc::{
        O_NOCTTY,
        O_NONBLOCK,
    },
    poll::{
        poll,
        PollFd,
        PollFlags,
        PollTimeout,
    },
};
use std::{
    fs::File,
    io::{
        ErrorKind,
        Read,
        Write,
    },
    os::{
        fd::AsFd,
        unix::fs::OpenOptionsExt,
    },
    path::Path,
    time::Duration,
};
use tracing::debug;

/// The real device-file backend
#[derive(Debug, Default, Copy, Clone)]
pub struct DevFs;

impl Backend for DevFs {
    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn open(&self, path: &str, direction: Direction) -> Result<Box<dyn EndpointIo>, Error> {
        // Nonblocking so that every wait goes through `poll` and stays bounded
        let file = File::options()
            .read(direction == Direction::Read)
            .write(direction == Direction::Write)
            .custom_flags(O_NOCTTY | O_NONBLOCK)
            .open(path)
            .map_err(|source| Error::Open {
                path: path.to_string(),
                source,
            })?;
        debug!(path, ?direction, "opened endpoint");
        Ok(Box::new(DevFile {
            path: path.to_string(),
            file,
        }))
    }
}

/// An opened Xillybus device file
#[derive(Debug)]
pub struct DevFile {
    path: String,
    file: File,
}

impl DevFile {
    /// Block in `poll` until the file is ready for `flags` or `wait` runs out
    fn ready(&self, flags: PollFlags, wait: Duration) -> std::io::Result<bool> {
        // Poll granularity is small, clamping to u16 milliseconds loses nothing in practice
        let millis = u16::try_from(wait.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.file.as_fd(), flags)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) | Err(Errno::EINTR) => Ok(false),
            Ok(_) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}

impl EndpointIo for DevFile {
    fn path(&self) -> &str {
        &self.path
    }

    fn read(&mut self, buf: &mut [u8], wait: Duration) -> std::io::Result<usize> {
        if !self.ready(PollFlags::POLLIN, wait)? {
            return Ok(0);
        }
        match self.file.read(buf) {
            // EOF, the FPGA side closed this stream. Poll will keep saying "ready", so sit out
            // the window instead of spinning on it.
            Ok(0) => {
                std::thread::sleep(wait);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, buf: &[u8], wait: Duration) -> std::io::Result<usize> {
        if !self.ready(PollFlags::POLLOUT, wait)? {
            return Ok(0);
        }
        match self.file.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl Drop for DevFile {
    fn drop(&mut self) {
        debug!(path = %self.path, "closing endpoint");
    }
}
