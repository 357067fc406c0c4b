//! A mock backend, useful for testing connections without any hardware.
//!
//! Every endpoint path is backed by an in-memory [`Channel`]. Tests feed bytes into channels the
//! host reads from, inspect what the host wrote, inject device failures, and can make a control
//! endpoint pair answer like a board would.

use crate::{
    endpoints::{
        EndpointConfig,
        DEVICE_CONFIGS,
    },
    handles::lock,
    protocol::{
        Status,
        PACKET_LEN,
    },
};
use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    io,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
        Condvar,
        Mutex,
        PoisonError,
    },
    time::Duration,
};
use xillybus::{
    Backend,
    Direction,
    EndpointIo,
    Error,
};

/// ENOENT
const NO_SUCH_FILE: i32 = 2;

/// Something that answers one control frame with another
pub type Responder = Box<dyn FnMut(&[u8; PACKET_LEN]) -> [u8; PACKET_LEN] + Send>;

/// One transfer step, in the order they happened across every endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Read { path: String, len: usize },
    Write { path: String, len: usize },
}

#[derive(Debug, Default)]
struct ChannelState {
    /// Bytes waiting for the host to read
    inbound: VecDeque<u8>,
    /// Bytes the host wrote that nobody consumed
    written: Vec<u8>,
    /// Partial control frame, only used with a responder
    frame: Vec<u8>,
    /// OS errors to fail the next transfers with
    faults: VecDeque<i32>,
    /// How many bytes `written` may hold before writes stall
    capacity: Option<usize>,
}

/// The in-memory FIFO behind one endpoint path
#[derive(Default)]
pub struct Channel {
    state: Mutex<ChannelState>,
    changed: Condvar,
    responder: Mutex<Option<(Responder, Arc<Channel>)>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Channel")
            .field("pending", &state.inbound.len())
            .field("written", &state.written.len())
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Make `bytes` available to the host
    pub fn feed(&self, bytes: &[u8]) {
        lock(&self.state).inbound.extend(bytes);
        self.changed.notify_all();
    }

    /// Everything the host wrote so far, clearing it
    pub fn take_written(&self) -> Vec<u8> {
        let written = std::mem::take(&mut lock(&self.state).written);
        self.changed.notify_all();
        written
    }

    /// Fail the next transfer on this channel with OS error `errno`
    pub fn fail_next(&self, errno: i32) {
        lock(&self.state).faults.push_back(errno);
    }

    /// Stall host writes once `bytes` are buffered and not yet taken
    pub fn limit_writes(&self, bytes: Option<usize>) {
        lock(&self.state).capacity = bytes;
        self.changed.notify_all();
    }

    /// Bytes fed but not read yet
    pub fn pending(&self) -> usize {
        lock(&self.state).inbound.len()
    }

    fn fault(&self) -> io::Result<()> {
        match lock(&self.state).faults.pop_front() {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(()),
        }
    }

    fn read(&self, buf: &mut [u8], wait: Duration) -> io::Result<usize> {
        self.fault()?;
        let (mut state, _) = self
            .changed
            .wait_timeout_while(lock(&self.state), wait, |s| s.inbound.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        let n = buf.len().min(state.inbound.len());
        for (dst, src) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8], wait: Duration) -> io::Result<usize> {
        self.fault()?;
        let mut responder = lock(&self.responder);
        if let Some((answer, reply_to)) = responder.as_mut() {
            let frames = {
                let mut state = lock(&self.state);
                state.frame.extend_from_slice(buf);
                let whole = state.frame.len() / PACKET_LEN * PACKET_LEN;
                state.frame.drain(..whole).collect::<Vec<_>>()
            };
            for chunk in frames.chunks_exact(PACKET_LEN) {
                let mut frame = [0u8; PACKET_LEN];
                frame.copy_from_slice(chunk);
                reply_to.feed(&answer(&frame));
            }
            return Ok(buf.len());
        }
        drop(responder);
        let (mut state, _) = self
            .changed
            .wait_timeout_while(lock(&self.state), wait, |s| {
                s.capacity.is_some_and(|cap| s.written.len() >= cap)
            })
            .unwrap_or_else(PoisonError::into_inner);
        let room = state
            .capacity
            .map_or(buf.len(), |cap| cap.saturating_sub(state.written.len()));
        let n = buf.len().min(room);
        state.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

#[derive(Debug, Default)]
struct Inner {
    channels: Mutex<HashMap<String, Arc<Channel>>>,
    refused: Mutex<HashMap<String, i32>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    events: Mutex<Vec<Event>>,
}

/// A backend whose endpoints live in memory. Clones share the same endpoints.
#[derive(Debug, Default, Clone)]
pub struct Mock {
    inner: Arc<Inner>,
}

impl Mock {
    /// A mock with every endpoint of the boards at `indices` present
    #[must_use]
    pub fn with_boards(indices: &[usize]) -> Self {
        let mock = Self::default();
        for config in indices.iter().filter_map(|&i| DEVICE_CONFIGS.get(i)) {
            mock.add_board(config);
        }
        mock
    }

    /// Make every endpoint `config` describes present
    pub fn add_board(&self, config: &EndpointConfig) {
        let paths = [config.ctrl_read, config.ctrl_write]
            .into_iter()
            .chain(config.stream_read)
            .chain(config.stream_write);
        for path in paths.filter(|p| !p.is_empty()) {
            self.endpoint(path);
        }
    }

    /// The channel behind `path`, creating the endpoint if it wasn't present
    pub fn endpoint(&self, path: &str) -> Arc<Channel> {
        lock(&self.inner.channels)
            .entry(path.to_string())
            .or_default()
            .clone()
    }

    /// Make opening `path` fail with OS error `errno`
    pub fn refuse(&self, path: &str, errno: i32) {
        lock(&self.inner.refused).insert(path.to_string(), errno);
    }

    /// Total number of successful opens
    #[must_use]
    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    /// Total number of handles dropped
    #[must_use]
    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Handles currently open
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.opens() - self.closes()
    }

    /// Every write attempt and every read that returned bytes, oldest first
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        lock(&self.inner.events).clone()
    }

    /// Answer every frame written to `ctrl_write` with `responder`, feeding the answer to
    /// `ctrl_read`
    pub fn respond_with<F>(&self, ctrl_write: &str, ctrl_read: &str, responder: F)
    where
        F: FnMut(&[u8; PACKET_LEN]) -> [u8; PACKET_LEN] + Send + 'static,
    {
        let reply_to = self.endpoint(ctrl_read);
        *lock(&self.endpoint(ctrl_write).responder) = Some((Box::new(responder), reply_to));
    }

    /// Make the control endpoints of `config` echo every frame back as completed
    pub fn loopback_control(&self, config: &EndpointConfig) {
        self.respond_with(config.ctrl_write, config.ctrl_read, |frame| {
            let mut reply = *frame;
            reply[1] = Status::Completed as u8;
            reply
        });
    }

    fn record(&self, event: Event) {
        lock(&self.inner.events).push(event);
    }
}

impl Backend for Mock {
    fn exists(&self, path: &str) -> bool {
        lock(&self.inner.channels).contains_key(path)
    }

    fn open(&self, path: &str, direction: Direction) -> Result<Box<dyn EndpointIo>, Error> {
        let refused = lock(&self.inner.refused).get(path).copied();
        let channel = lock(&self.inner.channels).get(path).cloned();
        let errno = match (refused, channel) {
            (None, Some(channel)) => {
                self.inner.opens.fetch_add(1, Ordering::SeqCst);
                return Ok(Box::new(MockEndpoint {
                    path: path.to_string(),
                    direction,
                    channel,
                    mock: self.clone(),
                }));
            }
            (Some(errno), _) => errno,
            (None, None) => NO_SUCH_FILE,
        };
        Err(Error::Open {
            path: path.to_string(),
            source: io::Error::from_raw_os_error(errno),
        })
    }
}

/// An open handle on a [`Channel`]
#[derive(Debug)]
pub struct MockEndpoint {
    path: String,
    direction: Direction,
    channel: Arc<Channel>,
    mock: Mock,
}

impl EndpointIo for MockEndpoint {
    fn path(&self) -> &str {
        &self.path
    }

    fn read(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<usize> {
        debug_assert_eq!(self.direction, Direction::Read);
        let n = self.channel.read(buf, wait)?;
        if n > 0 {
            self.mock.record(Event::Read {
                path: self.path.clone(),
                len: n,
            });
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8], wait: Duration) -> io::Result<usize> {
        debug_assert_eq!(self.direction, Direction::Write);
        // Logged first so a responder's answer can never be read before its request shows up
        self.mock.record(Event::Write {
            path: self.path.clone(),
            len: buf.len(),
        });
        self.channel.write(buf, wait)
    }
}

impl Drop for MockEndpoint {
    fn drop(&mut self) {
        self.mock.inner.closes.fetch_add(1, Ordering::SeqCst);
    }
}
