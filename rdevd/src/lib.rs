//! RDEV device server.
//!
//! Exports the devices named in a [`Config`] over TCP. Every connection gets
//! its own [`Session`] with a private unit table, while the [`Registry`] of
//! devices and their transports is shared by all of them.

pub mod config;
pub mod registry;
pub mod server;
pub mod session;

pub use config::{Config, ConfigError, DeviceConfig};
pub use registry::Registry;
pub use server::{listen, serve};
pub use session::Session;
