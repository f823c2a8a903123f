//! The RDEV remote device protocol.
//!
//! Every message is a fixed 8 byte header followed by `length` payload bytes:
//!
//! ```text
//! +-----------+---------+-------------+------------+-----------------+
//! | u8 opcode | u8 unit | u32 control | u16 length | [u8] payload    |
//! +-----------+---------+-------------+------------+-----------------+
//! ```
//!
//! All integers are little endian. Replies reuse the opcode byte for a
//! [`Status`].

mod codec;
mod error;
mod net;

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

pub use codec::RdevCodec;
pub use error::*;
pub use net::{recv, recv_timeout, request, send};

pub const HEADER_LENGTH: usize = 8;
pub const MAX_PAYLOAD_LENGTH: usize = u16::MAX as usize;
pub const DEFAULT_PORT: u16 = 3930;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Open = 1,
    Close = 2,
    Read = 3,
    Write = 4,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => Opcode::Open,
            2 => Opcode::Close,
            3 => Opcode::Read,
            4 => Opcode::Write,
            id => return Err(Error::InvalidOpcode(id)),
        })
    }
}

/// Reply status, carried in the opcode byte. The codes are the usual errno
/// numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    NoEntry,
    Io,
    BadUnit,
    Busy,
    TooManyUnits,
    Other(u8),
}

impl Status {
    pub fn code(self) -> u8 {
        match self {
            Status::Success => 0,
            Status::NoEntry => 2,
            Status::Io => 5,
            Status::BadUnit => 9,
            Status::Busy => 16,
            Status::TooManyUnits => 24,
            Status::Other(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Status::Success,
            2 => Status::NoEntry,
            5 => Status::Io,
            9 => Status::BadUnit,
            16 => Status::Busy,
            24 => Status::TooManyUnits,
            code => Status::Other(code),
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::NoEntry => write!(f, "no such device (ENOENT)"),
            Status::Io => write!(f, "I/O error (EIO)"),
            Status::BadUnit => write!(f, "bad unit (EBADF)"),
            Status::Busy => write!(f, "device busy (EBUSY)"),
            Status::TooManyUnits => write!(f, "too many open units (EMFILE)"),
            Status::Other(code) => write!(f, "error code {code}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub opcode: u8,
    pub unit: u8,
    pub control: u32,
    pub length: u16,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LENGTH] {
        let mut buf = [0u8; HEADER_LENGTH];
        buf[0] = self.opcode;
        buf[1] = self.unit;
        LittleEndian::write_u32(&mut buf[2..6], self.control);
        LittleEndian::write_u16(&mut buf[6..8], self.length);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LENGTH]) -> Self {
        Header {
            opcode: buf[0],
            unit: buf[1],
            control: LittleEndian::read_u32(&buf[2..6]),
            length: LittleEndian::read_u16(&buf[6..8]),
        }
    }

    pub fn status(&self) -> Status {
        Status::from_code(self.opcode)
    }
}

/// A complete message. Requests carry an [`Opcode`] in `opcode`, replies a
/// [`Status`] code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub opcode: u8,
    pub unit: u8,
    pub control: u32,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn request(opcode: Opcode, unit: u8, control: u32, payload: Vec<u8>) -> Self {
        Message {
            opcode: opcode as u8,
            unit,
            control,
            payload,
        }
    }

    pub fn reply(unit: u8, control: u32, payload: Vec<u8>) -> Self {
        Message {
            opcode: Status::Success.code(),
            unit,
            control,
            payload,
        }
    }

    /// Error replies carry nothing but the status.
    pub fn error(status: Status) -> Self {
        Message {
            opcode: status.code(),
            unit: 0,
            control: 0,
            payload: Vec::new(),
        }
    }

    pub fn header(&self) -> Result<Header> {
        let length = u16::try_from(self.payload.len())
            .map_err(|_| Error::PayloadTooLarge(self.payload.len()))?;
        Ok(Header {
            opcode: self.opcode,
            unit: self.unit,
            control: self.control,
            length,
        })
    }

    pub fn op(&self) -> Result<Opcode> {
        Opcode::try_from(self.opcode)
    }

    pub fn status(&self) -> Status {
        Status::from_code(self.opcode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let header = Header {
            opcode: Opcode::Read as u8,
            unit: 2,
            control: 0x0000_0305,
            length: 4,
        };
        let raw = header.encode();
        assert_eq!(raw, [3, 2, 0x05, 0x03, 0, 0, 4, 0]);
        assert_eq!(Header::decode(&raw), header);
    }

    #[test]
    fn status_codes() {
        assert_eq!(Status::from_code(0), Status::Success);
        assert_eq!(Status::from_code(2), Status::NoEntry);
        assert_eq!(Status::from_code(5), Status::Io);
        assert_eq!(Status::from_code(9), Status::BadUnit);
        assert_eq!(Status::from_code(16), Status::Busy);
        assert_eq!(Status::from_code(99), Status::Other(99));
        assert_eq!(Status::Busy.code(), 16);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let message = Message {
            opcode: 9,
            unit: 0,
            control: 0,
            payload: vec![],
        };
        assert!(matches!(message.op(), Err(Error::InvalidOpcode(9))));
    }

    #[test]
    fn oversized_payload_has_no_header() {
        let message = Message::reply(0, 0, vec![0; MAX_PAYLOAD_LENGTH + 1]);
        assert!(matches!(
            message.header(),
            Err(Error::PayloadTooLarge(len)) if len == MAX_PAYLOAD_LENGTH + 1
        ));
    }
}
