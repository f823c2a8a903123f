//! Uniform access to byte and frame oriented devices.
//!
//! Every transport (CAN, serial, IP, Bluetooth LE, null and the RDEV client
//! proxy) is created from a target and an option string and then driven
//! through the same [`Transport`] trait, so callers never need to know what is
//! underneath.
//! Dropping a transport closes it and releases everything it holds.

pub mod bt;
pub mod can;
pub mod error;
pub mod ip;
pub mod null;
pub mod options;
pub mod rdev;
pub mod serial;

use std::collections::HashMap;
use std::os::unix::io::RawFd;

pub use error::*;

pub use can::{FilterSet, RetryPolicy};

pub trait Transport: Send + Sync {
    /// Name of the transport kind, as used in the registry.
    fn kind(&self) -> &'static str;

    /// Acquires the underlying device. Opening an open transport is a no-op.
    fn open(&self) -> Result<()>;

    /// Releases the underlying device. Closing a closed transport is a no-op.
    fn close(&self) -> Result<()>;

    /// `control` carries transport specific addressing, e.g. the CAN id to
    /// wait for.
    fn read(&self, control: u32, buf: &mut [u8]) -> Result<usize>;

    fn write(&self, control: u32, buf: &[u8]) -> Result<usize>;

    fn config(&self, op: Config) -> Result<ConfigReply> {
        let _ = op;
        Err(Error::Unsupported(self.kind()))
    }
}

/// Transport specific side channel operations.
#[derive(Debug, Clone)]
pub enum Config {
    SetFilter(FilterSet),
    ClearFilter,
    /// Filter on every id in `[start, end)`.
    SetRange { start: u32, end: u32 },
    ParseFilter(String),
    /// Start caching the latest frame of every id in `[start, end)`.
    StartBuffer { start: u32, end: u32 },
    StopBuffer,
    SetRetry(RetryPolicy),
    GetFd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigReply {
    Done,
    Fd(Option<RawFd>),
}

type Factory = Box<dyn Fn(&str, &str) -> Result<Box<dyn Transport>> + Send + Sync>;

/// Maps transport kind names to constructors.
pub struct TransportRegistry {
    factories: HashMap<String, Factory>,
}

impl TransportRegistry {
    pub fn empty() -> Self {
        TransportRegistry {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&str, &str) -> Result<Box<dyn Transport>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_owned(), Box::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Creates a transport instance. Only parses `target` and `options`, the
    /// device is not touched until [`Transport::open`].
    pub fn create(&self, kind: &str, target: &str, options: &str) -> Result<Box<dyn Transport>> {
        if let Some(factory) = self.factories.get(kind) {
            factory(target, options)
        } else {
            Err(Error::UnknownTransport(kind.to_owned()))
        }
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        let mut registry = TransportRegistry::empty();

        registry.register(can::KIND, |target, options| {
            Ok(Box::new(can::CanTransport::new(target, options)?))
        });
        registry.register(serial::KIND, |target, options| {
            Ok(Box::new(serial::SerialTransport::new(target, options)?))
        });
        registry.register(ip::KIND, |target, options| {
            Ok(Box::new(ip::IpTransport::new(target, options)?))
        });
        registry.register(bt::KIND, |target, options| {
            Ok(Box::new(bt::BtTransport::new(target, options)?))
        });
        registry.register(null::KIND, |target, options| {
            Ok(Box::new(null::NullTransport::new(target, options)))
        });
        registry.register(rdev::KIND, |target, options| {
            Ok(Box::new(rdev::RdevTransport::new(target, options)?))
        });

        registry
    }
}
