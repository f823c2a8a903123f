use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Header, Message, HEADER_LENGTH};

/// Framing for async users of the protocol, e.g. the device server.
#[derive(Debug, Default)]
pub struct RdevCodec;

impl Decoder for RdevCodec {
    type Item = Message;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LENGTH {
            src.reserve(HEADER_LENGTH - src.len());
            return Ok(None);
        }

        let mut raw = [0u8; HEADER_LENGTH];
        raw.copy_from_slice(&src[..HEADER_LENGTH]);
        let header = Header::decode(&raw);
        let total = HEADER_LENGTH + header.length as usize;

        if src.len() < total {
            // more bytes are needed
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LENGTH);
        let payload = src.split_to(header.length as usize).to_vec();

        Ok(Some(Message {
            opcode: header.opcode,
            unit: header.unit,
            control: header.control,
            payload,
        }))
    }
}

impl Encoder<Message> for RdevCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = item.header()?;
        dst.reserve(HEADER_LENGTH + item.payload.len());
        dst.put_slice(&header.encode());
        dst.put_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::{Opcode, Status};

    #[test]
    fn decode_waits_for_whole_message() {
        let mut codec = RdevCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Message::request(Opcode::Write, 1, 0x305, vec![9; 16]), &mut buf)
            .unwrap();

        let mut partial = buf.split_to(HEADER_LENGTH + 3);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);

        partial.unsplit(buf);
        let message = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(message.op().unwrap(), Opcode::Write);
        assert_eq!(message.unit, 1);
        assert_eq!(message.control, 0x305);
        assert_eq!(message.payload, vec![9; 16]);
        assert!(partial.is_empty());
    }

    #[test]
    fn decode_two_messages_from_one_buffer() {
        let mut codec = RdevCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::error(Status::BadUnit), &mut buf).unwrap();
        codec
            .encode(Message::reply(2, 0, b"serial\0".to_vec()), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.status(), Status::BadUnit);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.unit, 2);
        assert_eq!(second.payload, b"serial\0");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[tokio::test]
    async fn framed_matches_blocking_wire_format() {
        let message = Message::request(Opcode::Read, 4, 0xdead_beef, vec![8, 0, 0, 0]);

        let mut blocking = Vec::new();
        crate::send(&mut blocking, &message).unwrap();

        let mut framed = FramedWrite::new(Vec::new(), RdevCodec);
        framed.send(message.clone()).await.unwrap();
        assert_eq!(framed.get_ref(), &blocking);

        let mut reader = FramedRead::new(&blocking[..], RdevCodec);
        assert_eq!(reader.next().await.unwrap().unwrap(), message);
        assert!(reader.next().await.is_none());
    }
}
