//! Serial port transport.
//!
//! `target` is the device path, a bare name like `ttyUSB0` is looked up under
//! `/dev`. `options` is `"<baud>,<data>,<parity>,<stop>,<vmin>,<vtime>"` and
//! defaults to `9600,8,N,1,0,5`. `vtime` is in tenths of a second.

use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_serial::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};

use crate::options::{field, number_or};
use crate::{Error, Result, Transport};

pub const KIND: &str = "serial";

pub const DEFAULT_BAUD_RATE: u32 = 9600;
const DEFAULT_VTIME: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// Minimum number of bytes a read waits for.
    pub vmin: usize,
    pub timeout: Duration,
}

impl SerialSettings {
    pub fn parse(options: &str) -> Result<Self> {
        let data_bits = match number_or(field(options, 1), 8)? {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            n => return Err(Error::parse(format!("invalid data bits {n}"))),
        };
        let parity = match field(options, 2).chars().next().map(|c| c.to_ascii_uppercase()) {
            None | Some('N') => Parity::None,
            Some('E') => Parity::Even,
            Some('O') => Parity::Odd,
            Some(c) => return Err(Error::parse(format!("invalid parity {c:?}"))),
        };
        let stop_bits = match number_or(field(options, 3), 1)? {
            2 => StopBits::Two,
            _ => StopBits::One,
        };
        let vtime = number_or(field(options, 5), DEFAULT_VTIME)?;

        Ok(SerialSettings {
            baud_rate: number_or(field(options, 0), DEFAULT_BAUD_RATE)?,
            data_bits,
            parity,
            stop_bits,
            vmin: number_or(field(options, 4), 0)? as usize,
            timeout: Duration::from_millis(u64::from(vtime) * 100),
        })
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        SerialSettings {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            vmin: 0,
            timeout: Duration::from_millis(u64::from(DEFAULT_VTIME) * 100),
        }
    }
}

pub struct SerialTransport {
    path: String,
    settings: SerialSettings,
    port: Mutex<Option<Box<dyn SerialPort>>>,
}

impl SerialTransport {
    pub fn new(target: &str, options: &str) -> Result<Self> {
        let path = field(target, 0);
        if path.is_empty() {
            return Err(Error::parse("missing serial device"));
        }
        Ok(SerialTransport {
            path: path.to_owned(),
            settings: SerialSettings::parse(options)?,
            port: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    fn device_path(&self) -> String {
        if Path::new(&self.path).exists() || self.path.starts_with("/dev") {
            self.path.clone()
        } else {
            format!("/dev/{}", self.path)
        }
    }
}

fn timed_out(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

impl Transport for SerialTransport {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn open(&self) -> Result<()> {
        let mut port = self.port.lock();
        if port.is_some() {
            return Ok(());
        }
        let path = self.device_path();
        let s = &self.settings;
        let opened = tokio_serial::new(&path, s.baud_rate)
            .data_bits(s.data_bits)
            .parity(s.parity)
            .stop_bits(s.stop_bits)
            .timeout(s.timeout)
            .open()?;
        opened.clear(ClearBuffer::All)?;
        log::debug!("opened {path} at {} baud", s.baud_rate);
        *port = Some(opened);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(port) = self.port.lock().take() {
            if let Err(e) = port.clear(ClearBuffer::Input) {
                log::debug!("flushing {} failed: {e}", self.path);
            }
        }
        Ok(())
    }

    /// Returns 0 when nothing arrives within the read timeout.
    fn read(&self, _control: u32, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.port.lock();
        let port = guard.as_mut().ok_or(Error::NotOpen)?;
        if buf.is_empty() {
            return Ok(0);
        }

        let wanted = self.settings.vmin.clamp(1, buf.len());
        let mut filled = 0;
        while filled < wanted {
            match port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if timed_out(&e) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn write(&self, _control: u32, buf: &[u8]) -> Result<usize> {
        let mut guard = self.port.lock();
        let port = guard.as_mut().ok_or(Error::NotOpen)?;
        port.write_all(buf)?;
        port.flush()?;
        Ok(buf.len())
    }
}
