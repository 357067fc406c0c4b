//! Timeout-bounded transfers on top of [`EndpointIo`]

use crate::{
    AbortToken,
    EndpointIo,
    Error,
};
use std::{
    io::ErrorKind,
    time::{
        Duration,
        Instant,
    },
};
use tracing::{
    debug,
    trace,
};

#[derive(Debug, Copy, Clone)]
enum Op {
    Read,
    Write,
}

/// Drive `step` in slices of at most `granularity` until `len` bytes moved, `timeout` elapsed,
/// or `abort` was raised. At least one attempt is always made so a zero timeout still picks up
/// bytes that are immediately available.
fn bounded<F>(
    path: &str,
    op: Op,
    len: usize,
    timeout: Duration,
    granularity: Duration,
    abort: &AbortToken,
    mut step: F,
) -> Result<usize, Error>
where
    F: FnMut(usize, Duration) -> std::io::Result<usize>,
{
    if len == 0 {
        return Ok(0);
    }
    // No deadline when the timeout reaches past what an Instant can hold
    let deadline = Instant::now().checked_add(timeout);
    let mut total = 0usize;
    loop {
        if abort.is_aborted() {
            debug!(path, ?op, total, "transfer aborted");
            break;
        }
        let wait = deadline.map_or(granularity, |deadline| {
            deadline
                .saturating_duration_since(Instant::now())
                .min(granularity)
        });
        match step(total, wait) {
            Ok(n) => total += n,
            // A signal landed while we were waiting, just go around again
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(source) => {
                return Err(Error::Io {
                    path: path.to_string(),
                    source,
                })
            }
        }
        if total >= len || deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
    }
    trace!(path, ?op, requested = len, total, "transfer finished");
    Ok(total)
}

/// Read up to `buf.len()` bytes from `endpoint`, giving up after `timeout`.
///
/// The returned count is in `0..=buf.len()`. Running out of time is not an error, the caller just
/// gets fewer bytes. Raising `abort` makes a blocked read return within one `granularity`.
/// # Errors
/// Returns [`Error::Io`] on a device failure
pub fn read_bounded(
    endpoint: &mut dyn EndpointIo,
    buf: &mut [u8],
    timeout: Duration,
    granularity: Duration,
    abort: &AbortToken,
) -> Result<usize, Error> {
    let path = endpoint.path().to_string();
    let len = buf.len();
    bounded(&path, Op::Read, len, timeout, granularity, abort, |done, wait| {
        endpoint.read(&mut buf[done..], wait)
    })
}

/// Write all of `buf` to `endpoint`, giving up after `timeout`.
///
/// Same count and abort semantics as [`read_bounded`].
/// # Errors
/// Returns [`Error::Io`] on a device failure
pub fn write_bounded(
    endpoint: &mut dyn EndpointIo,
    buf: &[u8],
    timeout: Duration,
    granularity: Duration,
    abort: &AbortToken,
) -> Result<usize, Error> {
    let path = endpoint.path().to_string();
    bounded(
        &path,
        Op::Write,
        buf.len(),
        timeout,
        granularity,
        abort,
        |done, wait| endpoint.write(&buf[done..], wait),
    )
}
