//! The LMS64C control protocol spoken over the control endpoints.
//!
//! Every request is cut into fixed 64 byte frames: an 8 byte header followed by 56 bytes of
//! payload. The board answers each frame with exactly one frame of the same shape.

use crate::core::{
    ConnectionResult,
    Error,
};
use limepcie_derive::PacketSerde;
use num_derive::{
    FromPrimitive,
    ToPrimitive,
};
use num_traits::FromPrimitive;
use packed_struct::prelude::*;

/// Size of every control frame in bytes
pub const PACKET_LEN: usize = 64;
/// Size of the frame header
pub const HEADER_LEN: usize = 8;
/// Payload bytes per frame
pub const MAX_DATA_LEN: usize = PACKET_LEN - HEADER_LEN;
/// Register reads answer with 4 bytes (address and value) per requested register
pub const MAX_READ_REGISTERS: usize = MAX_DATA_LEN / 4;

/// Types that implement this trait can be packed into a control frame
pub trait Encode {
    type Frame;
    /// # Errors
    /// Returns an error if a field doesn't fit its bit range
    fn encode(&self) -> Result<Self::Frame, PackingError>;
}

/// Types that implement this trait can be unpacked out of a control frame
pub trait Decode: Sized {
    type Frame;
    /// # Errors
    /// Returns an error if the bytes don't describe a valid value
    fn decode(frame: &Self::Frame) -> Result<Self, PackingError>;
}

/// LMS64C command codes
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum Command {
    GetInfo = 0x00,
    Lms7002Rst = 0x20,
    Lms7002Wr = 0x21,
    Lms7002Rd = 0x22,
    GpioWr = 0x51,
    GpioRd = 0x52,
    BrdSpiWr = 0x55,
    BrdSpiRd = 0x56,
    AnalogValWr = 0x61,
    AnalogValRd = 0x62,
    MemoryWr = 0x8C,
    MemoryRd = 0x8D,
}

impl Command {
    /// How many payload bytes make up one block of this command
    #[must_use]
    pub fn block_size(self) -> usize {
        match self {
            // 16-bit address + 16-bit value
            Command::Lms7002Wr | Command::BrdSpiWr => 4,
            // 16-bit address
            Command::Lms7002Rd | Command::BrdSpiRd => 2,
            _ => 1,
        }
    }
}

/// LMS64C status codes, as reported by the board in each response frame
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum Status {
    #[default]
    Undefined = 0,
    Completed = 1,
    Unknown = 2,
    Busy = 3,
    TooManyBlocks = 4,
    Error = 5,
    WrongOrder = 6,
    ResourceDenied = 7,
}

/// The 8 byte header at the start of every frame
#[derive(Debug, PackedStruct, Default, Copy, Clone, PartialEq, Eq, PacketSerde)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "8")]
pub struct Header {
    #[packed_field(bytes = "0")]
    pub cmd: u8,
    #[packed_field(bytes = "1")]
    pub status: u8,
    #[packed_field(bytes = "2")]
    pub block_count: u8,
    #[packed_field(bytes = "3")]
    pub periph_id: u8,
    #[packed_field(bytes = "4..=7")]
    pub reserved: [u8; 4],
}

/// The board description returned by [`Command::GetInfo`]
#[derive(Debug, PackedStruct, Default, Copy, Clone, PartialEq, Eq, PacketSerde)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "18")]
pub struct DeviceInfo {
    #[packed_field(bytes = "0")]
    pub firmware: u8,
    #[packed_field(bytes = "1")]
    pub device: u8,
    #[packed_field(bytes = "2")]
    pub protocol: u8,
    #[packed_field(bytes = "3")]
    pub hardware: u8,
    #[packed_field(bytes = "4")]
    pub expansion: u8,
    #[packed_field(bytes = "5..=9")]
    pub reserved: [u8; 5],
    #[packed_field(bytes = "10..=17", endian = "msb")]
    pub serial: u64,
}

impl DeviceInfo {
    /// Size of the info block at the start of the response payload
    pub const LEN: usize = 18;

    /// Pull the info block out of a completed [`Command::GetInfo`] exchange
    /// # Errors
    /// Returns an error if the response payload is too short
    pub fn from_response(packet: &ControlPacket) -> ConnectionResult<Self> {
        if packet.in_buffer.len() < Self::LEN {
            return Err(Error::ShortTransfer {
                expected: Self::LEN,
                got: packet.in_buffer.len(),
            });
        }
        let mut raw = [0u8; Self::LEN];
        raw.copy_from_slice(&packet.in_buffer[..Self::LEN]);
        Ok(Self::decode(&raw)?)
    }
}

/// A single control request and, after it went through the board, its response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub cmd: Command,
    pub status: Status,
    pub periph_id: u8,
    /// Request payload
    pub out_buffer: Vec<u8>,
    /// Response payload, 56 bytes per exchanged frame
    pub in_buffer: Vec<u8>,
}

impl ControlPacket {
    #[must_use]
    pub fn new(cmd: Command) -> Self {
        Self::with_data(cmd, vec![])
    }

    #[must_use]
    pub fn with_data(cmd: Command, out_buffer: Vec<u8>) -> Self {
        Self {
            cmd,
            status: Status::Undefined,
            periph_id: 0,
            out_buffer,
            in_buffer: vec![],
        }
    }

    /// Write `(address, value)` pairs to FPGA registers
    #[must_use]
    pub fn write_registers(pairs: &[(u16, u16)]) -> Self {
        let mut data = Vec::with_capacity(pairs.len() * 4);
        for (addr, value) in pairs {
            data.extend_from_slice(&addr.to_be_bytes());
            data.extend_from_slice(&value.to_be_bytes());
        }
        Self::with_data(Command::BrdSpiWr, data)
    }

    /// Read FPGA registers. Only [`MAX_READ_REGISTERS`] fit in one exchange.
    #[must_use]
    pub fn read_registers(addrs: &[u16]) -> Self {
        let data = addrs.iter().flat_map(|addr| addr.to_be_bytes()).collect();
        Self::with_data(Command::BrdSpiRd, data)
    }

    /// The register values out of a completed register read of `count` registers
    /// # Errors
    /// Returns an error if the response is shorter than `count` address/value blocks
    pub fn register_values(&self, count: usize) -> ConnectionResult<Vec<u16>> {
        if self.in_buffer.len() < count * 4 {
            return Err(Error::ShortTransfer {
                expected: count * 4,
                got: self.in_buffer.len(),
            });
        }
        Ok(self
            .in_buffer
            .chunks_exact(4)
            .take(count)
            .map(|block| u16::from_be_bytes([block[2], block[3]]))
            .collect())
    }

    /// Cut the request into wire frames. An empty request still occupies one frame.
    /// # Errors
    /// Returns an error if the header fails to pack
    #[allow(clippy::cast_possible_truncation)]
    pub fn frames(&self) -> ConnectionResult<Vec<[u8; PACKET_LEN]>> {
        let block_size = self.cmd.block_size();
        // Frames only ever carry whole blocks
        let per_frame = (MAX_DATA_LEN / block_size) * block_size;
        let chunks: Vec<&[u8]> = if self.out_buffer.is_empty() {
            vec![&[]]
        } else {
            self.out_buffer.chunks(per_frame).collect()
        };
        chunks
            .into_iter()
            .map(|chunk| -> ConnectionResult<[u8; PACKET_LEN]> {
                let header = Header {
                    cmd: self.cmd as u8,
                    status: self.status as u8,
                    // At most 56 blocks, always fits
                    block_count: (chunk.len() / block_size) as u8,
                    periph_id: self.periph_id,
                    reserved: [0; 4],
                };
                let mut frame = [0u8; PACKET_LEN];
                frame[..HEADER_LEN].copy_from_slice(&header.encode()?);
                frame[HEADER_LEN..HEADER_LEN + chunk.len()].copy_from_slice(chunk);
                Ok(frame)
            })
            .collect()
    }

    /// Fill in the status and response payload from the frames the board sent back.
    /// The packet takes the status of the first frame that was not completed, if any.
    /// # Errors
    /// Returns an error if the response is not a whole number of frames
    pub fn parse_response(&mut self, bytes: &[u8]) -> ConnectionResult<()> {
        if bytes.is_empty() || bytes.len() % PACKET_LEN != 0 {
            return Err(Error::ShortTransfer {
                expected: bytes.len().div_ceil(PACKET_LEN).max(1) * PACKET_LEN,
                got: bytes.len(),
            });
        }
        self.in_buffer.clear();
        self.status = Status::Completed;
        for frame in bytes.chunks_exact(PACKET_LEN) {
            let mut raw = [0u8; HEADER_LEN];
            raw.copy_from_slice(&frame[..HEADER_LEN]);
            let header = Header::decode(&raw)?;
            let status = Status::from_u8(header.status).unwrap_or_default();
            if self.status == Status::Completed {
                self.status = status;
            }
            self.in_buffer.extend_from_slice(&frame[HEADER_LEN..]);
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`Error::CommandFailed`] unless the board reported [`Status::Completed`]
    pub fn ensure_completed(&self) -> ConnectionResult<()> {
        match self.status {
            Status::Completed => Ok(()),
            other => Err(Error::CommandFailed(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paste::paste;

    /// Build a response frame the way the board would for `request`
    fn reply(request: &[u8; PACKET_LEN], status: Status, payload: &[u8]) -> [u8; PACKET_LEN] {
        let mut frame = [0u8; PACKET_LEN];
        frame[..HEADER_LEN].copy_from_slice(&request[..HEADER_LEN]);
        frame[1] = status as u8;
        frame[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
        frame
    }

    macro_rules! test_block_size {
        ($cmd:ident, $size:literal) => {
            paste! {
                #[test]
                fn [<test_block_size_ $cmd:snake>]() {
                    assert_eq!(Command::$cmd.block_size(), $size);
                }
            }
        };
    }

    test_block_size!(Lms7002Wr, 4);
    test_block_size!(BrdSpiWr, 4);
    test_block_size!(Lms7002Rd, 2);
    test_block_size!(BrdSpiRd, 2);
    test_block_size!(GetInfo, 1);
    test_block_size!(GpioWr, 1);

    #[test]
    fn test_header_layout() {
        let header = Header {
            cmd: 0x55,
            status: 1,
            block_count: 14,
            periph_id: 3,
            reserved: [0; 4],
        };
        assert_eq!(header.encode().unwrap(), [0x55, 1, 14, 3, 0, 0, 0, 0]);
        assert_eq!(Header::decode(&header.encode().unwrap()).unwrap(), header);
    }

    #[test]
    fn test_empty_request_is_one_frame() {
        let frames = ControlPacket::new(Command::GetInfo).frames().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], [0u8; PACKET_LEN]);
    }

    #[test]
    fn test_register_write_frames() {
        // 20 registers of 4 bytes, 14 per frame
        let pairs: Vec<_> = (0..20u16).map(|i| (i, 0x100 + i)).collect();
        let pkt = ControlPacket::write_registers(&pairs);
        let frames = pkt.frames().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][0], 0x55);
        assert_eq!(frames[0][2], 14);
        assert_eq!(frames[1][2], 6);
        // First register of the second frame is address 14
        assert_eq!(&frames[1][HEADER_LEN..HEADER_LEN + 4], &[0, 14, 0x01, 14]);
        // Unused payload stays zeroed
        assert!(frames[1][HEADER_LEN + 24..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_register_read_roundtrip() {
        let mut pkt = ControlPacket::read_registers(&[0x0002, 0x0003]);
        let frames = pkt.frames().unwrap();
        assert_eq!(frames[0][2], 2);
        let response = reply(
            &frames[0],
            Status::Completed,
            &[0, 2, 0xAB, 0xCD, 0, 3, 0x12, 0x34],
        );
        pkt.parse_response(&response).unwrap();
        pkt.ensure_completed().unwrap();
        assert_eq!(pkt.register_values(2).unwrap(), [0xABCD, 0x1234]);
        assert!(pkt.register_values(15).is_err());
    }

    #[test]
    fn test_failed_status() {
        let mut pkt = ControlPacket::new(Command::Lms7002Rst);
        let frames = pkt.frames().unwrap();
        pkt.parse_response(&reply(&frames[0], Status::Busy, &[]))
            .unwrap();
        assert_eq!(pkt.status, Status::Busy);
        assert!(matches!(
            pkt.ensure_completed(),
            Err(Error::CommandFailed(Status::Busy))
        ));
    }

    #[test]
    fn test_first_failure_wins() {
        let pairs: Vec<_> = (0..20u16).map(|i| (i, i)).collect();
        let mut pkt = ControlPacket::write_registers(&pairs);
        let frames = pkt.frames().unwrap();
        let mut response = reply(&frames[0], Status::Completed, &[]).to_vec();
        response.extend_from_slice(&reply(&frames[1], Status::Error, &[]));
        pkt.parse_response(&response).unwrap();
        assert_eq!(pkt.status, Status::Error);
        assert_eq!(pkt.in_buffer.len(), 2 * MAX_DATA_LEN);
    }

    #[test]
    fn test_unknown_status_is_undefined() {
        let mut pkt = ControlPacket::new(Command::GetInfo);
        let mut frame = [0u8; PACKET_LEN];
        frame[1] = 0xEE;
        pkt.parse_response(&frame).unwrap();
        assert_eq!(pkt.status, Status::Undefined);
    }

    #[test]
    fn test_truncated_response() {
        let mut pkt = ControlPacket::new(Command::GetInfo);
        assert!(matches!(
            pkt.parse_response(&[0u8; 10]),
            Err(Error::ShortTransfer {
                expected: 64,
                got: 10
            })
        ));
    }

    #[test]
    fn test_device_info() {
        let mut pkt = ControlPacket::new(Command::GetInfo);
        let frames = pkt.frames().unwrap();
        let payload = [
            3, 14, 1, 4, 0, 0, 0, 0, 0, 0, 0x00, 0x00, 0x00, 0x00, 0x1D, 0x58, 0x0F, 0x01,
        ];
        pkt.parse_response(&reply(&frames[0], Status::Completed, &payload))
            .unwrap();
        let info = DeviceInfo::from_response(&pkt).unwrap();
        assert_eq!(info.firmware, 3);
        assert_eq!(info.device, 14);
        assert_eq!(info.protocol, 1);
        assert_eq!(info.hardware, 4);
        assert_eq!(info.serial, 0x1D58_0F01);
    }
}
