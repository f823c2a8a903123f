use rdev_proto::Status;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Protocol Error: {0}")]
    ProtocolError(#[from] rdev_proto::Error),

    #[error("Invalid transport specification: {0}")]
    Parse(String),

    #[error("Unknown transport {0}")]
    UnknownTransport(String),

    #[error("Transport is not open")]
    NotOpen,

    #[error("Link configuration of {interface} failed: {message}")]
    Netlink { interface: String, message: String },

    #[error("A filter is already installed, clear it first")]
    FilterActive,

    #[error("Buffering is already running")]
    BufferActive,

    #[error("Buffering is not running")]
    BufferInactive,

    #[error("CAN id {0:#x} is outside the buffered range")]
    NotBuffered(u32),

    #[error("No frame for CAN id {0:#x} arrived in time")]
    Timeout(u32),

    #[error("Buffer of {got} bytes where {expected} are required")]
    InvalidLength { expected: usize, got: usize },

    #[error("Operation not supported by the {0} transport")]
    Unsupported(&'static str),

    #[error("Serial Error: {0}")]
    SerialError(#[from] tokio_serial::Error),

    #[error("Bluetooth Error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    #[error("Peripheral has no characteristic {0}")]
    MissingCharacteristic(String),

    #[error("Server Error: {0}")]
    Remote(Status),
}

impl Error {
    pub(crate) fn parse<S: Into<String>>(message: S) -> Self {
        Error::Parse(message.into())
    }
}
