//! Plain TCP transport, e.g. for serial-to-ethernet bridges.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::options::host_port;
use crate::{Config, ConfigReply, Error, Result, Transport};

pub const KIND: &str = "ip";

pub const DEFAULT_PORT: u16 = 23;

/// A read returns once the line has been quiet this long.
const GATHER_TIMEOUT: Duration = Duration::from_secs(1);

pub struct IpTransport {
    host: String,
    port: u16,
    stream: Mutex<Option<Arc<TcpStream>>>,
}

impl IpTransport {
    pub fn new(target: &str, _options: &str) -> Result<Self> {
        let (host, port) = host_port(target, DEFAULT_PORT)?;
        Ok(IpTransport {
            host,
            port,
            stream: Mutex::new(None),
        })
    }

    pub fn address(&self) -> (&str, u16) {
        (&self.host, self.port)
    }

    fn current(&self) -> Result<Arc<TcpStream>> {
        self.stream.lock().clone().ok_or(Error::NotOpen)
    }
}

impl Transport for IpTransport {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn open(&self) -> Result<()> {
        let mut stream = self.stream.lock();
        if stream.is_none() {
            let connected = TcpStream::connect((self.host.as_str(), self.port))?;
            connected.set_read_timeout(Some(GATHER_TIMEOUT))?;
            log::debug!("connected to {}:{}", self.host, self.port);
            *stream = Some(Arc::new(connected));
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.stream.lock().take();
        Ok(())
    }

    /// Gathers bytes until `buf` is full, the peer closes or the line stays
    /// quiet for a second.
    fn read(&self, _control: u32, buf: &mut [u8]) -> Result<usize> {
        let stream = self.current()?;
        let mut filled = 0;
        while filled < buf.len() {
            match (&*stream).read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn write(&self, _control: u32, buf: &[u8]) -> Result<usize> {
        let stream = self.current()?;
        (&*stream).write_all(buf)?;
        Ok(buf.len())
    }

    fn config(&self, op: Config) -> Result<ConfigReply> {
        match op {
            Config::GetFd => Ok(ConfigReply::Fd(
                self.stream.lock().as_ref().map(|s| s.as_raw_fd()),
            )),
            _ => Err(Error::Unsupported(KIND)),
        }
    }
}
