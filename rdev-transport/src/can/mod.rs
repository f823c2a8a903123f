//! SocketCAN transport.
//!
//! `target` is the interface name, `options` is `"<bitrate>,<filter>,<buffer>"`,
//! e.g. `"500000,0x300-0x30f,yes"`. Reads and writes exchange whole frames in
//! the [`frame::FRAME_LENGTH`] byte wire form.
//!
//! Without buffering a read pulls frames off the socket until one with the
//! requested id shows up. With buffering a background thread keeps the latest
//! frame of every id in a range and reads are served from that cache.

mod cache;
mod filter;
pub mod frame;
mod link;
mod reader;

use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use socketcan::{CanFilter, CanSocket, Socket, SocketOptions};

use crate::options::{field, flag, number_or};
use crate::{Config, ConfigReply, Error, Result, Transport};

pub use cache::{FrameCache, RetryPolicy};
pub use filter::{FilterSet, MAX_FILTER_IDS};
pub use frame::Frame;
pub use reader::{BufferReader, FrameSource, Recv};

pub const KIND: &str = "can";

pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
/// Direct reads with this id return the next frame, whatever its id.
pub const CAN_ID_ANY: u32 = 0xFFFF;

pub const DEFAULT_BITRATE: u32 = 250_000;

/// Read timeout of a buffered socket, bounds how long stopping the reader
/// takes.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

type SharedSocket = Arc<RwLock<Option<Arc<CanSocket>>>>;

struct Buffer {
    cache: Arc<FrameCache>,
    reader: BufferReader,
}

pub struct CanTransport {
    interface: String,
    bitrate: u32,
    socket: SharedSocket,
    filter: Arc<Mutex<Option<FilterSet>>>,
    buffer: Mutex<Option<Buffer>>,
    retry: Mutex<RetryPolicy>,
}

impl CanTransport {
    pub fn new(target: &str, options: &str) -> Result<Self> {
        let interface = field(target, 0);
        if interface.is_empty() {
            return Err(Error::parse("missing CAN interface"));
        }
        let bitrate = number_or(field(options, 0), DEFAULT_BITRATE)?;
        let filter: FilterSet = field(options, 1).parse()?;
        let buffered = flag(field(options, 2));

        let transport = CanTransport {
            interface: interface.to_owned(),
            bitrate,
            socket: Arc::new(RwLock::new(None)),
            filter: Arc::new(Mutex::new(None)),
            buffer: Mutex::new(None),
            retry: Mutex::new(RetryPolicy::default()),
        };

        if let (Some(min), Some(max)) = (filter.min(), filter.max()) {
            transport.set_filter(filter)?;
            if buffered {
                transport.start_buffer(min, max + 1)?;
            }
        }

        log::debug!("can {interface}: {bitrate} bit/s, buffered: {buffered}");
        Ok(transport)
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    pub fn is_buffered(&self) -> bool {
        self.buffer.lock().is_some()
    }

    fn current_socket(&self) -> Option<Arc<CanSocket>> {
        self.socket.read().clone()
    }

    fn set_filter(&self, set: FilterSet) -> Result<()> {
        let socket = self.current_socket();
        let mut filter = self.filter.lock();
        if filter.is_some() {
            return Err(Error::FilterActive);
        }
        if set.is_empty() {
            return Ok(());
        }
        if let Some(socket) = socket {
            install_filter(&socket, &set)?;
        }
        *filter = Some(set);
        Ok(())
    }

    fn clear_filter(&self) -> Result<()> {
        let socket = self.current_socket();
        let mut filter = self.filter.lock();
        if filter.take().is_some() {
            if let Some(socket) = socket {
                socket.set_filter_accept_all()?;
            }
        }
        Ok(())
    }

    fn start_buffer(&self, start: u32, end: u32) -> Result<()> {
        // Held throughout so `open` cannot slip in a socket without the
        // poll timeout.
        let socket = self.socket.read();
        let mut buffer = self.buffer.lock();
        if buffer.is_some() {
            return Err(Error::BufferActive);
        }
        let cache = Arc::new(FrameCache::new(start, end)?);
        if let Some(socket) = &*socket {
            socket.set_read_timeout(POLL_INTERVAL)?;
        }
        let reader = BufferReader::spawn(
            SocketSource {
                socket: self.socket.clone(),
            },
            cache.clone(),
            self.filter.clone(),
        )?;
        *buffer = Some(Buffer { cache, reader });
        Ok(())
    }

    fn stop_buffer(&self) -> Result<()> {
        let buffer = self.buffer.lock().take().ok_or(Error::BufferInactive)?;
        // The reader needs the socket slot to finish, so it is not held here.
        buffer.reader.stop();
        if let Some(socket) = self.current_socket() {
            socket.set_read_timeout(None::<Duration>)?;
        }
        Ok(())
    }

    fn read_direct(&self, socket: &CanSocket, id: u32) -> Result<Option<Frame>> {
        loop {
            let frame = match socket.read_frame() {
                Ok(frame) => frame,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let Some(frame) = Frame::from_socket(&frame) else {
                continue;
            };
            if id == CAN_ID_ANY || frame.id == frame::canonical_id(id) {
                return Ok(Some(frame));
            }
        }
    }
}

fn install_filter(socket: &CanSocket, set: &FilterSet) -> Result<()> {
    let filters: Vec<CanFilter> = set
        .ids()
        .map(|id| {
            let mask = if frame::is_extended(id) { CAN_EFF_MASK } else { CAN_SFF_MASK };
            CanFilter::new(id, CAN_EFF_FLAG | mask)
        })
        .collect();
    socket.set_filters(&filters)?;
    Ok(())
}

impl Transport for CanTransport {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn open(&self) -> Result<()> {
        let mut slot = self.socket.write();
        if slot.is_some() {
            return Ok(());
        }

        link::configure(&self.interface, self.bitrate)?;
        let socket = CanSocket::open(&self.interface)?;
        if let Some(set) = &*self.filter.lock() {
            install_filter(&socket, set)?;
        }

        let buffer = self.buffer.lock();
        if buffer.is_some() {
            socket.set_read_timeout(POLL_INTERVAL)?;
        }
        *slot = Some(Arc::new(socket));
        if let Some(buffer) = &*buffer {
            buffer.reader.wake();
        }

        log::debug!("opened {}", self.interface);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.socket.write().take().is_some() {
            log::debug!("closed {}", self.interface);
        }
        Ok(())
    }

    fn read(&self, control: u32, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < frame::FRAME_LENGTH {
            return Err(Error::InvalidLength {
                expected: frame::FRAME_LENGTH,
                got: buf.len(),
            });
        }
        let socket = self.current_socket().ok_or(Error::NotOpen)?;

        let cache = self.buffer.lock().as_ref().map(|b| b.cache.clone());
        let frame = match cache {
            Some(cache) => {
                let retry = *self.retry.lock();
                cache.lookup(frame::canonical_id(control), &retry)?
            }
            None => match self.read_direct(&socket, control)? {
                Some(frame) => frame,
                None => return Ok(0),
            },
        };
        frame.encode(buf)
    }

    fn write(&self, _control: u32, buf: &[u8]) -> Result<usize> {
        let socket = self.current_socket().ok_or(Error::NotOpen)?;
        let frame = Frame::decode(buf)?;
        socket.write_frame(&frame.to_socket()?)?;
        Ok(frame::FRAME_LENGTH)
    }

    fn config(&self, op: Config) -> Result<ConfigReply> {
        match op {
            Config::SetFilter(set) => self.set_filter(set)?,
            Config::ClearFilter => self.clear_filter()?,
            Config::SetRange { start, end } => self.set_filter(FilterSet::range(start, end)?)?,
            Config::ParseFilter(spec) => self.set_filter(spec.parse()?)?,
            Config::StartBuffer { start, end } => self.start_buffer(start, end)?,
            Config::StopBuffer => self.stop_buffer()?,
            Config::SetRetry(policy) => *self.retry.lock() = policy,
            Config::GetFd => {
                return Ok(ConfigReply::Fd(
                    self.current_socket().map(|socket| socket.as_raw_fd()),
                ))
            }
        }
        Ok(ConfigReply::Done)
    }
}

/// Feeds the buffer reader from whatever socket the transport currently has
/// open.
struct SocketSource {
    socket: SharedSocket,
}

impl FrameSource for SocketSource {
    fn next_frame(&mut self) -> Recv {
        let Some(socket) = self.socket.read().clone() else {
            return Recv::Closed;
        };
        match socket.read_frame() {
            Ok(frame) => match Frame::from_socket(&frame) {
                Some(frame) => Recv::Frame(frame),
                None => Recv::Idle,
            },
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Recv::Idle
            }
            Err(e) => Recv::Failed(e),
        }
    }
}
