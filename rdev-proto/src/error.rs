use thiserror::Error;

use crate::Status;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    Disconnected,

    #[error("Timeout while waiting for message")]
    Timeout,

    #[error("Payload of {0} bytes too large for protocol")]
    PayloadTooLarge(usize),

    #[error("Invalid opcode {0} in protocol")]
    InvalidOpcode(u8),

    #[error("Remote error: {0}")]
    Status(Status),
}

impl Error {
    pub(crate) fn from_read(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::Disconnected,
            _ => Error::IOError(e),
        }
    }
}
