//! A connection to one PCIe board through its Xillybus endpoints
use crate::{
    core::{
        Config,
        ConnectionHandle,
        ConnectionResult,
        EndpointId,
        Error,
        MEDIA_NAME,
        MODULE_NAME,
    },
    endpoints::{
        self,
        EndpointConfig,
        DEVICE_CONFIGS,
    },
    handles::{
        lock,
        read_lock,
        write_lock,
        AbortTokens,
        EndpointSet,
    },
    pll::{
        PllProgrammer,
        PllRequest,
    },
    protocol::{
        Command,
        ControlPacket,
        DeviceInfo,
        MAX_READ_REGISTERS,
        PACKET_LEN,
    },
};
use kstring::KString;
use std::{
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        RwLock,
        RwLockReadGuard,
    },
    time::Duration,
};
use tracing::{
    debug,
    info,
};
use xillybus::{
    read_bounded,
    write_bounded,
    AbortToken,
    Backend,
    EndpointIo,
};

/// Everything that only exists while a board is open
#[derive(Debug)]
struct Opened {
    index: usize,
    hardware: &'static EndpointConfig,
    endpoints: EndpointSet,
}

/// Run `f` on the handle behind `endpoint`, holding that handle's lock for the duration
fn on_endpoint<R, F>(
    opened: &Opened,
    aborts: &AbortTokens,
    endpoint: EndpointId,
    f: F,
) -> ConnectionResult<R>
where
    F: FnOnce(&mut dyn EndpointIo, &AbortToken) -> Result<R, xillybus::Error>,
{
    let slot = opened.endpoints.slot(endpoint)?;
    let abort = aborts.token(endpoint)?;
    let mut handle = lock(slot);
    f(&mut **handle, abort).map_err(|source| Error::Io { endpoint, source })
}

/// A connection to a PCIe board.
///
/// All methods take `&self` so one connection can be shared (behind an [`Arc`] or a scoped
/// thread) between a receive loop, a transmit loop and control-plane callers. Each endpoint
/// handle has its own lock, and the two control endpoints share one more lock that keeps
/// request/response pairs together.
pub struct Connection {
    backend: Arc<dyn Backend>,
    config: Config,
    state: RwLock<Option<Opened>>,
    aborts: AbortTokens,
    transfer_lock: Mutex<()>,
    pll: Mutex<Option<Box<dyn PllProgrammer>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = read_lock(&self.state);
        f.debug_struct("Connection")
            .field("backend", &self.backend)
            .field("config", &self.config)
            .field("opened", &*state)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection that isn't attached to any board yet
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, config: Config) -> Self {
        Self {
            backend,
            config,
            state: RwLock::new(None),
            aborts: AbortTokens::default(),
            transfer_lock: Mutex::new(()),
            pll: Mutex::new(None),
        }
    }

    /// Create a connection and open the board at `index`
    /// # Errors
    /// Returns an error if the board isn't supported or any of its endpoints fail to open
    pub fn connect(
        backend: Arc<dyn Backend>,
        index: usize,
        config: Config,
    ) -> ConnectionResult<Self> {
        let conn = Self::new(backend, config);
        conn.open(index)?;
        Ok(conn)
    }

    /// List the boards `backend` can see that `hint` accepts, without opening any of them
    #[must_use]
    pub fn enumerate(backend: &dyn Backend, hint: &ConnectionHandle) -> Vec<ConnectionHandle> {
        DEVICE_CONFIGS
            .iter()
            .enumerate()
            .filter(|(_, hw)| backend.exists(hw.ctrl_read) && backend.exists(hw.ctrl_write))
            .map(|(index, hw)| ConnectionHandle {
                module: KString::from_static(MODULE_NAME),
                media: KString::from_static(MEDIA_NAME),
                name: KString::from_static(hw.name),
                serial: KString::default(),
                index: Some(index),
            })
            .filter(|handle| hint.matches(handle))
            .collect()
    }

    /// Build and open a connection for an enumerated board. A handle without an index is
    /// resolved by board name.
    /// # Errors
    /// Returns an error if the handle doesn't resolve to a board or the board fails to open
    pub fn make(
        backend: Arc<dyn Backend>,
        handle: &ConnectionHandle,
        config: Config,
    ) -> ConnectionResult<Self> {
        let index = match handle.index {
            Some(index) => index,
            None => DEVICE_CONFIGS
                .iter()
                .position(|hw| hw.name == handle.name.as_str())
                .ok_or_else(|| Error::UnresolvedHandle(handle.to_string()))?,
        };
        Self::connect(backend, index, config)
    }

    /// Open all endpoints of the board at `index`. A board that was already open is closed first,
    /// aborting its in-flight transfers. Every abort flag is cleared on success.
    /// # Errors
    /// Returns [`Error::UnsupportedHardware`] for an unknown index and [`Error::Open`] if an
    /// endpoint fails to open. Either way nothing is left open.
    pub fn open(&self, index: usize) -> ConnectionResult<()> {
        self.aborts.abort_all();
        let mut state = write_lock(&self.state);
        if let Some(previous) = state.take() {
            info!(index = previous.index, "closing the previously opened board");
            previous.endpoints.close_all();
        }
        let hardware = endpoints::lookup(index)?;
        let endpoints = EndpointSet::open_all(self.backend.as_ref(), hardware)?;
        self.aborts.rearm_all();
        info!(
            index,
            name = hardware.name,
            version = hardware.version,
            streams = endpoints.stream_count(),
            "board connected"
        );
        *state = Some(Opened {
            index,
            hardware,
            endpoints,
        });
        Ok(())
    }

    /// Close every endpoint. In-flight transfers are aborted and waited for. Closing a connection
    /// that isn't open does nothing.
    pub fn close(&self) {
        // Kick blocked transfers loose so the write lock comes quickly. Reopening rearms.
        self.aborts.abort_all();
        let mut state = write_lock(&self.state);
        if let Some(opened) = state.take() {
            opened.endpoints.close_all();
            info!(
                index = opened.index,
                name = opened.hardware.name,
                "board disconnected"
            );
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        read_lock(&self.state).is_some()
    }

    /// The board index this connection has open
    #[must_use]
    pub fn opened_index(&self) -> Option<usize> {
        read_lock(&self.state).as_ref().map(|o| o.index)
    }

    #[must_use]
    pub fn hardware_name(&self) -> Option<&'static str> {
        read_lock(&self.state).as_ref().map(|o| o.hardware.name)
    }

    #[must_use]
    pub fn hardware_version(&self) -> Option<u8> {
        read_lock(&self.state).as_ref().map(|o| o.hardware.version)
    }

    /// Number of stream endpoint pairs of the open board, zero when closed
    #[must_use]
    pub fn stream_count(&self) -> usize {
        read_lock(&self.state)
            .as_ref()
            .map_or(0, |o| o.endpoints.stream_count())
    }

    /// The device path `endpoint` was opened from
    #[must_use]
    pub fn endpoint_path(&self, endpoint: EndpointId) -> Option<&'static str> {
        read_lock(&self.state)
            .as_ref()
            .and_then(|o| o.hardware.path(endpoint))
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn transfer_in(
        &self,
        endpoint: EndpointId,
        buf: &mut [u8],
        timeout: Duration,
    ) -> ConnectionResult<usize> {
        let state = read_lock(&self.state);
        let opened = state.as_ref().ok_or(Error::ClosedEndpoint(endpoint))?;
        let granularity = self.config.poll_granularity;
        on_endpoint(opened, &self.aborts, endpoint, |io, abort| {
            read_bounded(io, buf, timeout, granularity, abort)
        })
    }

    pub(crate) fn transfer_out(
        &self,
        endpoint: EndpointId,
        buf: &[u8],
        timeout: Duration,
    ) -> ConnectionResult<usize> {
        let state = read_lock(&self.state);
        let opened = state.as_ref().ok_or(Error::ClosedEndpoint(endpoint))?;
        let granularity = self.config.poll_granularity;
        on_endpoint(opened, &self.aborts, endpoint, |io, abort| {
            write_bounded(io, buf, timeout, granularity, abort)
        })
    }

    /// Read raw bytes from the control endpoint. Returns how many bytes arrived before `timeout`.
    /// # Errors
    /// Returns an error if the connection is closed or the device fails
    pub fn read(&self, buf: &mut [u8], timeout: Duration) -> ConnectionResult<usize> {
        self.transfer_in(EndpointId::ControlRead, buf, timeout)
    }

    /// Write raw bytes to the control endpoint. Returns how many bytes went out before `timeout`.
    /// # Errors
    /// Returns an error if the connection is closed or the device fails
    pub fn write(&self, buf: &[u8], timeout: Duration) -> ConnectionResult<usize> {
        self.transfer_out(EndpointId::ControlWrite, buf, timeout)
    }

    /// Read from stream endpoint `ep`. A timeout is not an error, it just means fewer bytes.
    /// # Errors
    /// Returns an error if the endpoint isn't open or the device fails
    pub fn receive_data(
        &self,
        buf: &mut [u8],
        ep: usize,
        timeout: Duration,
    ) -> ConnectionResult<usize> {
        self.transfer_in(EndpointId::StreamRead(ep), buf, timeout)
    }

    /// Write to stream endpoint `ep`. A timeout is not an error, it just means fewer bytes.
    /// # Errors
    /// Returns an error if the endpoint isn't open or the device fails
    pub fn send_data(&self, buf: &[u8], ep: usize, timeout: Duration) -> ConnectionResult<usize> {
        self.transfer_out(EndpointId::StreamWrite(ep), buf, timeout)
    }

    /// Read samples straight off stream endpoint `ep`, outside of any streaming loop
    /// # Errors
    /// Same as [`Connection::receive_data`]
    pub fn read_raw_stream_data(
        &self,
        buf: &mut [u8],
        ep: usize,
        timeout: Duration,
    ) -> ConnectionResult<usize> {
        self.receive_data(buf, ep, timeout)
    }

    /// Abort reads on `endpoint` until it is rearmed or the board reopened.
    /// Never waits on the endpoint itself, so this is safe from any thread.
    /// # Errors
    /// Returns [`Error::InvalidEndpoint`] for a stream index past [`crate::core::MAX_EP_CNT`]
    pub fn abort(&self, endpoint: EndpointId) -> ConnectionResult<()> {
        self.aborts.token(endpoint)?.abort();
        debug!(%endpoint, "abort requested");
        Ok(())
    }

    /// Let transfers on `endpoint` run again after an abort
    /// # Errors
    /// Returns [`Error::InvalidEndpoint`] for a stream index past [`crate::core::MAX_EP_CNT`]
    pub fn rearm(&self, endpoint: EndpointId) -> ConnectionResult<()> {
        self.aborts.token(endpoint)?.rearm();
        debug!(%endpoint, "endpoint rearmed");
        Ok(())
    }

    #[must_use]
    pub fn is_aborted(&self, endpoint: EndpointId) -> bool {
        self.aborts
            .token(endpoint)
            .is_ok_and(AbortToken::is_aborted)
    }

    /// # Errors
    /// Returns [`Error::InvalidEndpoint`] for an out of range index
    pub fn abort_reading(&self, ep: usize) -> ConnectionResult<()> {
        self.abort(EndpointId::StreamRead(ep))
    }

    /// # Errors
    /// Returns [`Error::InvalidEndpoint`] for an out of range index
    pub fn abort_sending(&self, ep: usize) -> ConnectionResult<()> {
        self.abort(EndpointId::StreamWrite(ep))
    }

    /// # Errors
    /// Returns [`Error::InvalidEndpoint`] for an out of range index
    pub fn rearm_reading(&self, ep: usize) -> ConnectionResult<()> {
        self.rearm(EndpointId::StreamRead(ep))
    }

    /// # Errors
    /// Returns [`Error::InvalidEndpoint`] for an out of range index
    pub fn rearm_sending(&self, ep: usize) -> ConnectionResult<()> {
        self.rearm(EndpointId::StreamWrite(ep))
    }

    /// Take exclusive use of the control endpoints until the returned port is dropped
    /// # Errors
    /// Returns [`Error::ClosedEndpoint`] if no board is open
    pub fn control_port(&self) -> ConnectionResult<ControlPort<'_>> {
        let guard = lock(&self.transfer_lock);
        let state = read_lock(&self.state);
        if state.is_none() {
            return Err(Error::ClosedEndpoint(EndpointId::ControlWrite));
        }
        Ok(ControlPort {
            state,
            aborts: &self.aborts,
            config: self.config,
            _guard: guard,
        })
    }

    /// Send one control packet and wait for the board's response, which is written back into
    /// `packet`
    /// # Errors
    /// Returns an error if the board is closed, the device fails, or a frame is cut short
    pub fn transfer_packet(&self, packet: &mut ControlPacket) -> ConnectionResult<()> {
        self.control_port()?.transfer(packet)
    }

    /// Query firmware, hardware and serial information from the board
    /// # Errors
    /// Returns an error if the exchange fails or the board rejects it
    pub fn device_info(&self) -> ConnectionResult<DeviceInfo> {
        self.control_port()?.device_info()
    }

    /// # Errors
    /// Returns an error if the exchange fails or the board rejects it
    pub fn write_registers(&self, pairs: &[(u16, u16)]) -> ConnectionResult<()> {
        self.control_port()?.write_registers(pairs)
    }

    /// # Errors
    /// Returns an error if the exchange fails or the board rejects it
    pub fn read_registers(&self, addrs: &[u16]) -> ConnectionResult<Vec<u16>> {
        self.control_port()?.read_registers(addrs)
    }

    /// Install what rate changes get forwarded to
    pub fn set_pll_programmer(&self, programmer: Box<dyn PllProgrammer>) {
        *lock(&self.pll) = Some(programmer);
    }

    /// Retune the FPGA interface for new sample rates on `channel`
    /// # Errors
    /// Returns an error for invalid rates, with no programmer installed, or if programming fails
    pub fn update_external_data_rate(
        &self,
        channel: usize,
        tx_rate: f64,
        rx_rate: f64,
    ) -> ConnectionResult<()> {
        self.forward_rate_change(PllRequest::new(channel, tx_rate, rx_rate)?)
    }

    /// Same as [`Connection::update_external_data_rate`] with explicit clock phases in degrees
    /// # Errors
    /// Returns an error for invalid rates, with no programmer installed, or if programming fails
    pub fn update_external_data_rate_with_phase(
        &self,
        channel: usize,
        tx_rate: f64,
        rx_rate: f64,
        tx_phase: f64,
        rx_phase: f64,
    ) -> ConnectionResult<()> {
        let request = PllRequest::new(channel, tx_rate, rx_rate)?.with_phase(tx_phase, rx_phase);
        self.forward_rate_change(request)
    }

    fn forward_rate_change(&self, request: PllRequest) -> ConnectionResult<()> {
        let mut slot = lock(&self.pll);
        let programmer = slot.as_mut().ok_or(Error::NoPllProgrammer)?;
        let mut port = self.control_port()?;
        info!(
            channel = request.channel,
            pll = request.pll_index,
            tx_clk = request.tx_interface_clk,
            rx_clk = request.rx_interface_clk,
            "forwarding data rate change"
        );
        programmer.program(&mut port, &request).map_err(Error::Pll)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Exclusive access to the control endpoints of an open board. Holding one keeps every other
/// control-plane caller out, so a whole sequence of exchanges can't be interleaved.
pub struct ControlPort<'a> {
    state: RwLockReadGuard<'a, Option<Opened>>,
    aborts: &'a AbortTokens,
    config: Config,
    _guard: MutexGuard<'a, ()>,
}

impl ControlPort<'_> {
    /// Frame `packet`, then for every frame write it and read back exactly one response frame
    /// # Errors
    /// Returns [`Error::ShortTransfer`] if a frame doesn't fully go out or come back in time
    pub fn transfer(&mut self, packet: &mut ControlPacket) -> ConnectionResult<()> {
        let frames = packet.frames()?;
        let opened = self
            .state
            .as_ref()
            .ok_or(Error::ClosedEndpoint(EndpointId::ControlWrite))?;
        let timeout = self.config.control_timeout;
        let granularity = self.config.poll_granularity;
        let mut response = Vec::with_capacity(frames.len() * PACKET_LEN);
        for frame in &frames {
            let sent = on_endpoint(opened, self.aborts, EndpointId::ControlWrite, |io, abort| {
                write_bounded(io, frame, timeout, granularity, abort)
            })?;
            if sent != PACKET_LEN {
                return Err(Error::ShortTransfer {
                    expected: PACKET_LEN,
                    got: sent,
                });
            }
            let mut reply = [0u8; PACKET_LEN];
            let got = on_endpoint(opened, self.aborts, EndpointId::ControlRead, |io, abort| {
                read_bounded(io, &mut reply, timeout, granularity, abort)
            })?;
            if got != PACKET_LEN {
                return Err(Error::ShortTransfer {
                    expected: PACKET_LEN,
                    got,
                });
            }
            response.extend_from_slice(&reply);
        }
        debug!(cmd = ?packet.cmd, frames = frames.len(), "control exchange done");
        packet.parse_response(&response)
    }

    /// # Errors
    /// Returns an error if the exchange fails or the board rejects it
    pub fn device_info(&mut self) -> ConnectionResult<DeviceInfo> {
        let mut packet = ControlPacket::new(Command::GetInfo);
        self.transfer(&mut packet)?;
        packet.ensure_completed()?;
        DeviceInfo::from_response(&packet)
    }

    /// # Errors
    /// Returns an error if the exchange fails or the board rejects it
    pub fn write_registers(&mut self, pairs: &[(u16, u16)]) -> ConnectionResult<()> {
        let mut packet = ControlPacket::write_registers(pairs);
        self.transfer(&mut packet)?;
        packet.ensure_completed()
    }

    /// Reads are split into as many exchanges as it takes
    /// # Errors
    /// Returns an error if any exchange fails or the board rejects it
    pub fn read_registers(&mut self, addrs: &[u16]) -> ConnectionResult<Vec<u16>> {
        let mut values = Vec::with_capacity(addrs.len());
        for chunk in addrs.chunks(MAX_READ_REGISTERS) {
            let mut packet = ControlPacket::read_registers(chunk);
            self.transfer(&mut packet)?;
            packet.ensure_completed()?;
            values.extend(packet.register_values(chunk.len())?);
        }
        Ok(values)
    }
}
