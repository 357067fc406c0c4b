//! The continuous receive and transmit loops driven by a higher level streaming engine.
//!
//! A loop owns nothing but its position in the iteration. Buffers, timeouts and the failure
//! policy all come from the [`StreamSession`] it is handed, and every transfer result is
//! reported back to it.

use crate::{
    connection::Connection,
    core::{
        ConnectionResult,
        EndpointId,
        Error,
        DEFAULT_TIMEOUT,
    },
};
use std::time::Duration;
use tracing::{
    debug,
    error,
    info,
    warn,
};
use xillybus::Direction;

/// How many consecutive device failures a loop tolerates before giving up
pub const DEFAULT_FAILURE_THRESHOLD: usize = 10;

/// What happened to one buffer segment
#[derive(Debug)]
pub struct TransferReport {
    pub endpoint: EndpointId,
    /// Size of the segment that was handed out
    pub requested: usize,
    /// Bytes moved, or why the transfer failed
    pub outcome: ConnectionResult<usize>,
}

impl TransferReport {
    /// Bytes moved, zero if the transfer failed
    #[must_use]
    pub fn transferred(&self) -> usize {
        *self.outcome.as_ref().unwrap_or(&0)
    }

    /// The transfer finished without error but timed out (or was aborted) before the whole
    /// segment moved
    #[must_use]
    pub fn is_partial(&self) -> bool {
        matches!(self.outcome, Ok(n) if n < self.requested)
    }
}

/// The side of a streaming engine a loop talks to
pub trait StreamSession: Send {
    /// The stream endpoint index this session moves data on
    fn endpoint_index(&self) -> usize;

    /// Timeout for each transfer
    fn timeout(&self) -> Duration {
        DEFAULT_TIMEOUT
    }

    /// Consecutive device failures tolerated before the loop gives up
    fn failure_threshold(&self) -> usize {
        DEFAULT_FAILURE_THRESHOLD
    }

    /// Whether the engine wants the loop to stop
    fn is_terminated(&self) -> bool;

    /// If true an abort on the endpoint is cleared and the loop keeps going instead of exiting
    fn rearm_after_abort(&self) -> bool {
        false
    }

    /// The next buffer segment. For receive loops it is filled, for transmit loops its contents
    /// are sent. `None` means the session is out of work and the loop ends.
    fn acquire(&mut self) -> Option<Vec<u8>>;

    /// Hand a segment back together with how its transfer went
    fn complete(&mut self, segment: Vec<u8>, report: TransferReport);
}

/// How a loop ended
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// The session asked to stop or ran out of segments
    Terminated,
    /// The endpoint was aborted
    Aborted,
}

impl Connection {
    /// Keep reading from the session's stream endpoint until the session ends or the endpoint is
    /// aborted
    /// # Errors
    /// Returns [`Error::TooManyFailures`] after too many consecutive device failures, or the
    /// underlying error if the endpoint isn't usable at all
    pub fn receive_packets_loop(
        &self,
        session: &mut dyn StreamSession,
    ) -> ConnectionResult<LoopExit> {
        let endpoint = EndpointId::StreamRead(session.endpoint_index());
        self.packets_loop(endpoint, session)
    }

    /// Keep writing to the session's stream endpoint until the session ends or the endpoint is
    /// aborted
    /// # Errors
    /// Returns [`Error::TooManyFailures`] after too many consecutive device failures, or the
    /// underlying error if the endpoint isn't usable at all
    pub fn transmit_packets_loop(
        &self,
        session: &mut dyn StreamSession,
    ) -> ConnectionResult<LoopExit> {
        let endpoint = EndpointId::StreamWrite(session.endpoint_index());
        self.packets_loop(endpoint, session)
    }

    fn packets_loop(
        &self,
        endpoint: EndpointId,
        session: &mut dyn StreamSession,
    ) -> ConnectionResult<LoopExit> {
        info!(%endpoint, "streaming loop started");
        let threshold = session.failure_threshold().max(1);
        let mut failures = 0usize;
        let exit = loop {
            if session.is_terminated() {
                break LoopExit::Terminated;
            }
            if self.is_aborted(endpoint) {
                if session.rearm_after_abort() {
                    self.rearm(endpoint)?;
                } else {
                    break LoopExit::Aborted;
                }
            }
            let Some(mut segment) = session.acquire() else {
                break LoopExit::Terminated;
            };
            let timeout = session.timeout();
            let outcome = match endpoint.direction() {
                Direction::Read => self.transfer_in(endpoint, &mut segment, timeout),
                Direction::Write => self.transfer_out(endpoint, &segment, timeout),
            };
            let fatal = match &outcome {
                Ok(n) => {
                    failures = 0;
                    if *n < segment.len() {
                        debug!(%endpoint, bytes = n, requested = segment.len(), "partial transfer");
                    }
                    None
                }
                // Nothing to retry against, the endpoint is gone
                Err(Error::ClosedEndpoint(ep)) => Some(Error::ClosedEndpoint(*ep)),
                Err(Error::InvalidEndpoint(ep)) => Some(Error::InvalidEndpoint(*ep)),
                Err(e) => {
                    failures += 1;
                    warn!(%endpoint, failures, os_error = ?e.os_error(), "stream transfer failed");
                    None
                }
            };
            let report = TransferReport {
                endpoint,
                requested: segment.len(),
                outcome,
            };
            session.complete(segment, report);
            if let Some(err) = fatal {
                error!(%endpoint, %err, "streaming loop cannot continue");
                return Err(err);
            }
            if failures >= threshold {
                error!(%endpoint, failures, "too many consecutive failures, giving up");
                return Err(Error::TooManyFailures { endpoint, failures });
            }
        };
        info!(%endpoint, ?exit, "streaming loop stopped");
        Ok(exit)
    }
}
