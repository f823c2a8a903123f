use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::{Error, Header, Message, HEADER_LENGTH};

/// Writes the header, then the payload. Returns the number of bytes sent.
pub fn send<W: Write>(write: &mut W, message: &Message) -> crate::Result<usize> {
    let header = message.header()?;
    log::trace!("Sending {header:?}");

    write.write_all(&header.encode())?;
    if !message.payload.is_empty() {
        write.write_all(&message.payload)?;
    }
    write.flush()?;
    Ok(HEADER_LENGTH + message.payload.len())
}

/// Reads one message into `buf`.
///
/// At most `buf.len()` payload bytes are kept; whatever the sender put beyond
/// that is read and thrown away, so the stream stays aligned on the next
/// header. Returns the header and the number of bytes stored in `buf`.
pub fn recv<R: Read>(read: &mut R, buf: &mut [u8]) -> crate::Result<(Header, usize)> {
    let mut raw = [0u8; HEADER_LENGTH];
    read.read_exact(&mut raw).map_err(Error::from_read)?;
    let header = Header::decode(&raw);
    log::trace!("Received {header:?}");

    let length = header.length as usize;
    let kept = length.min(buf.len());
    read.read_exact(&mut buf[..kept]).map_err(Error::from_read)?;

    skip(read, length - kept)?;
    Ok((header, kept))
}

/// Like [`recv`], but gives up with [`Error::Timeout`] if nothing arrives
/// within `timeout`. Once the header starts arriving the read runs to
/// completion.
pub fn recv_timeout(
    stream: &mut TcpStream,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> crate::Result<(Header, usize)> {
    if let Some(timeout) = timeout.filter(|t| !t.is_zero()) {
        wait_readable(stream, timeout)?;
    }
    recv(stream, buf)
}

/// Sends `message` and waits for the reply. Either half failing fails the
/// whole exchange.
pub fn request(
    stream: &mut TcpStream,
    message: &Message,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> crate::Result<(Header, usize)> {
    send(stream, message)?;
    recv_timeout(stream, buf, timeout)
}

fn skip<R: Read>(read: &mut R, len: usize) -> crate::Result<()> {
    if len == 0 {
        return Ok(());
    }
    log::debug!("Discarding {len} payload bytes that did not fit the receive buffer");
    let skipped = io::copy(&mut read.by_ref().take(len as u64), &mut io::sink())?;
    if skipped != len as u64 {
        return Err(Error::Disconnected);
    }
    Ok(())
}

fn wait_readable(stream: &TcpStream, timeout: Duration) -> crate::Result<()> {
    stream.set_read_timeout(Some(timeout))?;
    let mut probe = [0u8; 1];
    let res = stream.peek(&mut probe);
    stream.set_read_timeout(None)?;

    match res {
        Ok(0) => Err(Error::Disconnected),
        Ok(_) => Ok(()),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            Err(Error::Timeout)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::net::TcpListener;

    use super::*;
    use crate::{Opcode, Status};

    #[test]
    fn send_then_recv() {
        let message = Message::request(Opcode::Write, 3, 0x1234_5678, vec![1, 2, 3]);
        let mut wire = Vec::new();
        assert_eq!(send(&mut wire, &message).unwrap(), HEADER_LENGTH + 3);

        let mut buf = [0u8; 16];
        let (header, len) = recv(&mut Cursor::new(wire), &mut buf).unwrap();
        assert_eq!(header.opcode, Opcode::Write as u8);
        assert_eq!(header.unit, 3);
        assert_eq!(header.control, 0x1234_5678);
        assert_eq!(header.length, 3);
        assert_eq!(&buf[..len], &[1, 2, 3]);
    }

    #[test]
    fn empty_payload_is_header_only() {
        let mut wire = Vec::new();
        send(&mut wire, &Message::error(Status::Busy)).unwrap();
        assert_eq!(wire, vec![16, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn short_buffer_keeps_stream_framed() {
        let mut wire = Vec::new();
        send(&mut wire, &Message::reply(0, 7, (0..32).collect())).unwrap();
        send(&mut wire, &Message::reply(1, 8, vec![0xaa, 0xbb])).unwrap();
        let mut wire = Cursor::new(wire);

        let mut small = [0u8; 4];
        let (header, len) = recv(&mut wire, &mut small).unwrap();
        assert_eq!(header.length, 32);
        assert_eq!(len, 4);
        assert_eq!(small, [0, 1, 2, 3]);

        let mut buf = [0u8; 8];
        let (header, len) = recv(&mut wire, &mut buf).unwrap();
        assert_eq!(header.unit, 1);
        assert_eq!(header.control, 8);
        assert_eq!(&buf[..len], &[0xaa, 0xbb]);
    }

    #[test]
    fn truncated_header_is_disconnect() {
        let mut buf = [0u8; 4];
        let res = recv(&mut Cursor::new(vec![1, 0, 0]), &mut buf);
        assert!(matches!(res, Err(Error::Disconnected)));
    }

    #[test]
    fn truncated_payload_is_disconnect() {
        let mut wire = Vec::new();
        send(&mut wire, &Message::reply(0, 0, vec![1; 10])).unwrap();
        wire.truncate(HEADER_LENGTH + 5);

        let mut buf = [0u8; 2];
        let res = recv(&mut Cursor::new(wire), &mut buf);
        assert!(matches!(res, Err(Error::Disconnected)));
    }

    #[test]
    fn recv_timeout_expires_without_data() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let mut buf = [0u8; 4];
        let res = recv_timeout(&mut client, &mut buf, Some(Duration::from_millis(50)));
        assert!(matches!(res, Err(Error::Timeout)));
    }

    #[test]
    fn request_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let (header, len) = recv(&mut stream, &mut buf).unwrap();
            assert_eq!(header.opcode, Opcode::Open as u8);
            assert_eq!(&buf[..len], b"can0\0");
            send(&mut stream, &Message::reply(0, 0, b"can\0".to_vec())).unwrap();
        });

        let mut client = TcpStream::connect(addr).unwrap();
        let mut buf = [0u8; 16];
        let (header, len) = request(
            &mut client,
            &Message::request(Opcode::Open, 0, 0, b"can0\0".to_vec()),
            &mut buf,
            Some(Duration::from_secs(5)),
        )
        .unwrap();
        assert!(header.status().is_success());
        assert_eq!(&buf[..len], b"can\0");
        server.join().unwrap();
    }
}
