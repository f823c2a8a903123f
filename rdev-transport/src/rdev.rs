//! Client side of the RDEV protocol: a device on a remote `rdevd` used as if
//! it were local.
//!
//! `target` is `host[:port]`, `options` is the name of the device as
//! configured on the server.

use std::net::TcpStream;
use std::time::Duration;

use parking_lot::Mutex;
use rdev_proto::{Header, Message, Opcode, Status, DEFAULT_PORT, MAX_PAYLOAD_LENGTH};

use crate::options::{field, host_port};
use crate::{Error, Result, Transport};

pub const KIND: &str = "rdev";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest transport kind name accepted in an OPEN reply.
const KIND_LENGTH: usize = 32;

struct Session {
    stream: TcpStream,
    unit: u8,
    kind: String,
}

pub struct RdevTransport {
    host: String,
    port: u16,
    name: String,
    timeout: Duration,
    session: Mutex<Option<Session>>,
}

impl RdevTransport {
    pub fn new(target: &str, options: &str) -> Result<Self> {
        let (host, port) = host_port(target, DEFAULT_PORT)?;
        let name = field(options, 0);
        if name.is_empty() {
            return Err(Error::parse("rdev needs a device name in the options"));
        }
        Ok(RdevTransport {
            host,
            port,
            name: name.to_owned(),
            timeout: DEFAULT_TIMEOUT,
            session: Mutex::new(None),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn device(&self) -> &str {
        &self.name
    }

    /// Transport kind of the device on the server side, once open.
    pub fn remote_kind(&self) -> Option<String> {
        self.session.lock().as_ref().map(|s| s.kind.clone())
    }

    pub fn unit(&self) -> Option<u8> {
        self.session.lock().as_ref().map(|s| s.unit)
    }

    /// Runs one exchange on the open session. A broken exchange leaves the
    /// stream in an unknown state, so the session is dropped and the next
    /// `open` reconnects.
    fn exchange<F>(&self, f: F) -> Result<usize>
    where
        F: FnOnce(&mut Session, Duration) -> rdev_proto::Result<(Header, usize)>,
    {
        let mut guard = self.session.lock();
        let session = guard.as_mut().ok_or(Error::NotOpen)?;
        match f(session, self.timeout) {
            Ok((header, len)) => match header.status() {
                Status::Success => Ok(len),
                status => Err(Error::Remote(status)),
            },
            Err(e) => {
                log::debug!("lost connection to {}:{}: {e}", self.host, self.port);
                *guard = None;
                Err(e.into())
            }
        }
    }
}

fn kind_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

impl Transport for RdevTransport {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn open(&self) -> Result<()> {
        let mut session = self.session.lock();
        if session.is_some() {
            return Ok(());
        }

        let mut stream = TcpStream::connect((self.host.as_str(), self.port))?;
        stream.set_nodelay(true)?;

        let mut name = self.name.clone().into_bytes();
        name.push(0);
        let mut kind = [0u8; KIND_LENGTH];
        let (header, len) = rdev_proto::request(
            &mut stream,
            &Message::request(Opcode::Open, 0, 0, name),
            &mut kind,
            Some(self.timeout),
        )?;

        let status = header.status();
        if !status.is_success() {
            log::debug!("server refused {}: {status}", self.name);
            return Err(Error::Remote(status));
        }

        let kind = kind_name(&kind[..len]);
        log::debug!(
            "opened {} on {}:{} as unit {} ({kind})",
            self.name,
            self.host,
            self.port,
            header.unit
        );
        *session = Some(Session {
            stream,
            unit: header.unit,
            kind,
        });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let Some(mut session) = self.session.lock().take() else {
            return Ok(());
        };
        let message = Message::request(Opcode::Close, session.unit, 0, Vec::new());
        let reply = rdev_proto::request(&mut session.stream, &message, &mut [], Some(self.timeout));
        match reply {
            Ok((header, _)) if !header.status().is_success() => {
                log::debug!("closing {} failed: {}", self.name, header.status());
            }
            Ok(_) => {}
            Err(e) => log::debug!("closing {} failed: {e}", self.name),
        }
        Ok(())
    }

    fn read(&self, control: u32, buf: &mut [u8]) -> Result<usize> {
        let wanted = buf.len().min(MAX_PAYLOAD_LENGTH) as u16;
        let mut length = vec![0u8; 4];
        length[..2].copy_from_slice(&wanted.to_le_bytes());

        self.exchange(|session, timeout| {
            let message = Message::request(Opcode::Read, session.unit, control, length);
            rdev_proto::request(&mut session.stream, &message, buf, Some(timeout))
        })
    }

    fn write(&self, control: u32, buf: &[u8]) -> Result<usize> {
        if buf.len() > MAX_PAYLOAD_LENGTH {
            return Err(rdev_proto::Error::PayloadTooLarge(buf.len()).into());
        }
        self.exchange(|session, timeout| {
            let message = Message::request(Opcode::Write, session.unit, control, buf.to_vec());
            rdev_proto::request(&mut session.stream, &message, &mut [], Some(timeout))
        })?;
        Ok(buf.len())
    }
}

impl Drop for RdevTransport {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::debug!("closing {} on drop failed: {e}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    #[test]
    fn targets() {
        let rdev = RdevTransport::new("gateway", "can0").unwrap();
        assert_eq!((rdev.host.as_str(), rdev.port), ("gateway", DEFAULT_PORT));
        assert_eq!(rdev.device(), "can0");
        assert!(RdevTransport::new("gateway:4000", "").is_err());
        assert!(RdevTransport::new("", "can0").is_err());
    }

    #[test]
    fn kind_is_nul_terminated() {
        assert_eq!(kind_name(b"can\0"), "can");
        assert_eq!(kind_name(b"serial"), "serial");
        assert_eq!(kind_name(b""), "");
    }

    #[test]
    fn not_open() {
        let rdev = RdevTransport::new("127.0.0.1:1", "can0").unwrap();
        assert!(matches!(rdev.read(0, &mut [0u8; 16]), Err(Error::NotOpen)));
        assert!(rdev.unit().is_none());
        rdev.close().unwrap();
    }

    #[test]
    fn refused_open_reports_status() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let (header, len) = rdev_proto::recv(&mut conn, &mut buf).unwrap();
            assert_eq!(header.opcode, Opcode::Open as u8);
            assert_eq!(&buf[..len], b"missing\0");
            rdev_proto::send(&mut conn, &Message::error(Status::NoEntry)).unwrap();
            conn.flush().unwrap();
        });

        let rdev = RdevTransport::new(&format!("127.0.0.1:{port}"), "missing").unwrap();
        assert!(matches!(rdev.open(), Err(Error::Remote(Status::NoEntry))));
        assert!(rdev.remote_kind().is_none());
        server.join().unwrap();
    }
}
