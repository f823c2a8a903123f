//! The devices a server exports.
//!
//! A [`Device`] is shared by every connection. Its transport is created on
//! the first open and kept for the lifetime of the server; it is opened while
//! at least one unit anywhere refers to it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use rdev_transport::{Transport, TransportRegistry};

use crate::config::DeviceConfig;

/// Held by the unit that has an exclusive device open.
pub type Claim = OwnedMutexGuard<()>;

#[derive(Default)]
struct DeviceState {
    transport: Option<Arc<dyn Transport>>,
    opens: usize,
}

pub struct Device {
    config: DeviceConfig,
    transports: Arc<TransportRegistry>,
    exclusive: Arc<AsyncMutex<()>>,
    state: Mutex<DeviceState>,
}

impl Device {
    fn new(config: DeviceConfig, transports: Arc<TransportRegistry>) -> Self {
        Device {
            config,
            transports,
            exclusive: Arc::new(AsyncMutex::new(())),
            state: Mutex::new(DeviceState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_shared(&self) -> bool {
        self.config.shared
    }

    /// Reserves an exclusive device without waiting. Shared devices need no
    /// claim and always succeed with `None`.
    pub fn claim(&self) -> Result<Option<Claim>, Busy> {
        if self.config.shared {
            return Ok(None);
        }
        self.exclusive
            .clone()
            .try_lock_owned()
            .map(Some)
            .map_err(|_| Busy)
    }

    /// Creates the transport if needed and opens it. Blocks.
    pub fn acquire(&self) -> rdev_transport::Result<Arc<dyn Transport>> {
        let mut state = self.state.lock();
        let transport = match &state.transport {
            Some(transport) => transport.clone(),
            None => {
                let c = &self.config;
                let transport: Arc<dyn Transport> =
                    Arc::from(self.transports.create(&c.transport, &c.target, &c.options)?);
                log::debug!("created {} transport for {}", c.transport, c.name);
                state.transport = Some(transport.clone());
                transport
            }
        };
        transport.open()?;
        state.opens += 1;
        Ok(transport)
    }

    /// Gives back one open. The last one closes the transport, and with
    /// `destroy` also drops it so the next open starts from scratch. Blocks.
    pub fn release(&self, destroy: bool) -> rdev_transport::Result<()> {
        let mut state = self.state.lock();
        state.opens = state.opens.saturating_sub(1);
        if state.opens > 0 {
            return Ok(());
        }
        let result = match &state.transport {
            Some(transport) => transport.close(),
            None => Ok(()),
        };
        if destroy && state.transport.take().is_some() {
            log::debug!("destroyed transport of {}", self.config.name);
        }
        result
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().opens
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Busy;

/// Name to device lookup, fixed at startup.
pub struct Registry {
    devices: HashMap<String, Arc<Device>>,
}

impl Registry {
    pub fn new(devices: Vec<DeviceConfig>, transports: TransportRegistry) -> Self {
        let transports = Arc::new(transports);
        Registry {
            devices: devices
                .into_iter()
                .map(|config| {
                    let name = config.name.clone();
                    (name, Arc::new(Device::new(config, transports.clone())))
                })
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Device>> {
        self.devices.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, shared: bool) -> DeviceConfig {
        DeviceConfig {
            name: name.into(),
            transport: "null".into(),
            target: String::new(),
            options: String::new(),
            shared,
        }
    }

    #[test]
    fn lookup() {
        let registry = Registry::new(
            vec![device("a", false), device("b", true)],
            TransportRegistry::default(),
        );
        assert_eq!(registry.len(), 2);
        assert!(registry.get("a").is_some());
        assert!(registry.get("c").is_none());
        assert!(registry.get("b").unwrap().is_shared());
    }

    #[test]
    fn exclusive_claim() {
        let registry = Registry::new(vec![device("a", false)], TransportRegistry::default());
        let a = registry.get("a").unwrap();
        let claim = a.claim().unwrap();
        assert!(claim.is_some());
        assert_eq!(a.claim().err(), Some(Busy));
        drop(claim);
        assert!(a.claim().unwrap().is_some());
    }

    #[test]
    fn shared_devices_need_no_claim() {
        let registry = Registry::new(vec![device("b", true)], TransportRegistry::default());
        let b = registry.get("b").unwrap();
        let _first = b.claim().unwrap();
        assert!(b.claim().unwrap().is_none());
    }

    #[test]
    fn open_counting() {
        let registry = Registry::new(vec![device("b", true)], TransportRegistry::default());
        let b = registry.get("b").unwrap();
        let first = b.acquire().unwrap();
        let second = b.acquire().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(b.open_count(), 2);

        b.release(true).unwrap();
        assert_eq!(b.open_count(), 1);
        assert!(b.state.lock().transport.is_some());

        b.release(true).unwrap();
        assert_eq!(b.open_count(), 0);
        assert!(b.state.lock().transport.is_none());
    }

    #[test]
    fn creation_errors_leave_no_transport() {
        let mut config = device("c", false);
        config.transport = "can".into();
        config.options = "500000,0x30g".into();
        let registry = Registry::new(vec![config], TransportRegistry::default());
        let c = registry.get("c").unwrap();
        assert!(c.acquire().is_err());
        assert_eq!(c.open_count(), 0);
        assert!(c.state.lock().transport.is_none());
    }
}
