use std::time::Instant;

use byteorder::{ByteOrder, LittleEndian};
use socketcan::{CanFrame, EmbeddedFrame, ExtendedId, Id, StandardId};

use crate::{Error, Result};

use super::{CAN_EFF_FLAG, CAN_EFF_MASK, CAN_SFF_MASK};

pub const MAX_DATA_LENGTH: usize = 8;

/// Brings a `can_id` into the form frames, filters and the cache use.
///
/// Extended ids carry [`CAN_EFF_FLAG`], standard ids do not. An id above the
/// 11 bit range without the flag is taken as extended. RTR and error flags are
/// dropped.
pub fn canonical_id(id: u32) -> u32 {
    let extended = id & CAN_EFF_MASK;
    if id & CAN_EFF_FLAG != 0 || extended > CAN_SFF_MASK {
        CAN_EFF_FLAG | extended
    } else {
        extended
    }
}

pub fn is_extended(id: u32) -> bool {
    id & CAN_EFF_FLAG != 0
}

/// Size of a frame on the wire, laid out like Linux' `struct can_frame`:
///
/// ```text
/// +------------+--------+---------+----------+
/// | u32 can_id | u8 dlc | [u8; 3] | [u8; 8]  |
/// +------------+--------+---------+----------+
/// ```
pub const FRAME_LENGTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    len: u8,
    data: [u8; MAX_DATA_LENGTH],
    pub received: Instant,
}

impl Frame {
    pub fn new(id: u32, payload: &[u8]) -> Result<Self> {
        if payload.len() > MAX_DATA_LENGTH {
            return Err(Error::InvalidLength {
                expected: MAX_DATA_LENGTH,
                got: payload.len(),
            });
        }
        let mut data = [0u8; MAX_DATA_LENGTH];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Frame {
            id: canonical_id(id),
            len: payload.len() as u8,
            data,
            received: Instant::now(),
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Writes the wire form into `buf` and returns its length.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let out = frame_buffer(buf)?;
        out.fill(0);
        LittleEndian::write_u32(&mut out[0..4], self.id);
        out[4] = self.len;
        out[8..8 + self.len as usize].copy_from_slice(self.data());
        Ok(FRAME_LENGTH)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_LENGTH {
            return Err(Error::InvalidLength {
                expected: FRAME_LENGTH,
                got: buf.len(),
            });
        }
        let len = buf[4] as usize;
        if len > MAX_DATA_LENGTH {
            return Err(Error::parse(format!("invalid dlc {len}")));
        }
        Frame::new(LittleEndian::read_u32(&buf[0..4]), &buf[8..8 + len])
    }

    /// Data and remote frames carry an id, error frames are dropped.
    pub(crate) fn from_socket(frame: &CanFrame) -> Option<Self> {
        if let CanFrame::Error(_) = frame {
            return None;
        }
        let id = match EmbeddedFrame::id(frame) {
            Id::Standard(id) => u32::from(id.as_raw()),
            Id::Extended(id) => id.as_raw() | CAN_EFF_FLAG,
        };
        Frame::new(id, EmbeddedFrame::data(frame)).ok()
    }

    pub(crate) fn to_socket(&self) -> Result<CanFrame> {
        let id = if is_extended(self.id) {
            ExtendedId::new(self.id & CAN_EFF_MASK).map(Id::Extended)
        } else {
            StandardId::new(self.id as u16).map(Id::Standard)
        };
        id.and_then(|id| CanFrame::new(id, self.data()))
            .ok_or_else(|| Error::parse(format!("cannot build CAN frame for id {:#x}", self.id)))
    }
}

fn frame_buffer(buf: &mut [u8]) -> Result<&mut [u8]> {
    let got = buf.len();
    buf.get_mut(..FRAME_LENGTH).ok_or(Error::InvalidLength {
        expected: FRAME_LENGTH,
        got,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_layout() {
        let frame = Frame::new(0x305, &[1, 2, 3]).unwrap();
        let mut buf = [0xffu8; 20];
        assert_eq!(frame.encode(&mut buf).unwrap(), FRAME_LENGTH);
        assert_eq!(
            &buf[..FRAME_LENGTH],
            &[0x05, 0x03, 0, 0, 3, 0, 0, 0, 1, 2, 3, 0, 0, 0, 0, 0]
        );
        assert_eq!(&buf[FRAME_LENGTH..], &[0xff; 4]);

        let decoded = Frame::decode(&buf).unwrap();
        assert_eq!(decoded.id, 0x305);
        assert_eq!(decoded.data(), &[1, 2, 3]);
    }

    #[test]
    fn short_buffers_are_rejected() {
        let frame = Frame::new(0x100, &[]).unwrap();
        assert!(matches!(
            frame.encode(&mut [0u8; 8]),
            Err(Error::InvalidLength { expected: 16, got: 8 })
        ));
        assert!(Frame::decode(&[0u8; 15]).is_err());
    }

    #[test]
    fn extended_ids_keep_their_flag() {
        assert_eq!(canonical_id(0x123), 0x123);
        assert_eq!(canonical_id(0x8000_0123), 0x8000_0123);
        assert_eq!(canonical_id(0x1000), 0x8000_1000);
        assert_eq!(canonical_id(0x4000_0123), 0x123);

        let extended = Frame::new(0x8000_0123, &[1]).unwrap();
        let standard = Frame::new(0x123, &[1]).unwrap();
        assert_ne!(extended.id, standard.id);

        let mut buf = [0u8; FRAME_LENGTH];
        extended.encode(&mut buf).unwrap();
        assert_eq!(&buf[..4], &[0x23, 0x01, 0x00, 0x80]);
        assert_eq!(Frame::decode(&buf).unwrap().id, 0x8000_0123);
    }

    #[test]
    fn socket_frames_keep_the_format() {
        let extended = Frame::new(0x8000_0123, &[1, 2]).unwrap().to_socket().unwrap();
        assert!(extended.is_extended());
        assert_eq!(Frame::from_socket(&extended).unwrap().id, 0x8000_0123);

        let standard = Frame::new(0x123, &[1, 2]).unwrap().to_socket().unwrap();
        assert!(!standard.is_extended());
        let back = Frame::from_socket(&standard).unwrap();
        assert_eq!(back.id, 0x123);
        assert_eq!(back.data(), &[1, 2]);
    }

    #[test]
    fn payload_limits() {
        assert!(Frame::new(0x100, &[0; 9]).is_err());
        let mut raw = [0u8; FRAME_LENGTH];
        raw[4] = 9;
        assert!(Frame::decode(&raw).is_err());
    }
}
