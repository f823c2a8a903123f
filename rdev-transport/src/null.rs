use crate::{Result, Transport};

pub const KIND: &str = "null";

/// Accepts everything and moves no data. Useful as a placeholder device.
#[derive(Debug, Default)]
pub struct NullTransport {
    target: String,
    options: String,
}

impl NullTransport {
    pub fn new(target: &str, options: &str) -> Self {
        NullTransport {
            target: target.to_owned(),
            options: options.to_owned(),
        }
    }
}

impl Transport for NullTransport {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn open(&self) -> Result<()> {
        log::trace!("null open {} ({})", self.target, self.options);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn read(&self, _control: u32, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    fn write(&self, _control: u32, _buf: &[u8]) -> Result<usize> {
        Ok(0)
    }
}
