//! Bluetooth LE transport.
//!
//! `target` is the peripheral's address, e.g. `"20:91:48:4c:5b:8a"`.
//! `options` names the GATT characteristic to talk through, either as a 16 bit
//! UUID (`ffe1`, `0xffe1`) or in full. Without options the serial
//! characteristic of HM-10 style modules (`ffe1`) is used if the peripheral
//! has one, the first characteristic it offers otherwise.
//!
//! Writes go to the characteristic. Notifications on it are collected in the
//! background and handed out by reads.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use btleplug::api::bleuuid::uuid_from_u16;
use btleplug::api::{
    BDAddr, Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::options::field;
use crate::{Error, Result, Transport};

pub const KIND: &str = "bt";

pub const DEFAULT_CHARACTERISTIC: u16 = 0xffe1;

const SCAN_TIMEOUT: Duration = Duration::from_secs(10);
const SCAN_POLL: Duration = Duration::from_millis(250);

/// A read looks for notified data this many times, a second apart.
const READ_ATTEMPTS: u32 = 3;
const READ_BACKOFF: Duration = Duration::from_secs(1);

/// Notified bytes kept until a read picks them up. Anything beyond is dropped.
pub const MAX_PENDING: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtSettings {
    pub address: BDAddr,
    pub characteristic: Option<Uuid>,
}

impl BtSettings {
    pub fn parse(target: &str, options: &str) -> Result<Self> {
        let target = field(target, 0);
        if target.is_empty() {
            return Err(Error::parse("missing bluetooth address"));
        }
        let address = target
            .parse::<BDAddr>()
            .map_err(|_| Error::parse(format!("invalid bluetooth address {target:?}")))?;
        let characteristic = match field(options, 0) {
            "" => None,
            uuid => Some(parse_uuid(uuid)?),
        };
        Ok(BtSettings {
            address,
            characteristic,
        })
    }
}

/// Parses a 16 bit short form (hex, optional `0x`) or a full UUID.
pub fn parse_uuid(s: &str) -> Result<Uuid> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    let uuid = if digits.len() <= 4 {
        u16::from_str_radix(digits, 16).ok().map(uuid_from_u16)
    } else {
        Uuid::parse_str(digits).ok()
    };
    uuid.ok_or_else(|| Error::parse(format!("invalid characteristic {s:?}")))
}

struct Session {
    runtime: Runtime,
    peripheral: Peripheral,
    characteristic: Characteristic,
    notifications: JoinHandle<()>,
}

pub struct BtTransport {
    settings: BtSettings,
    session: Mutex<Option<Session>>,
    received: Arc<Mutex<Vec<u8>>>,
}

impl BtTransport {
    pub fn new(target: &str, options: &str) -> Result<Self> {
        Ok(BtTransport {
            settings: BtSettings::parse(target, options)?,
            session: Mutex::new(None),
            received: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn settings(&self) -> &BtSettings {
        &self.settings
    }

    /// Connects, subscribes and starts collecting notifications. Runs on the
    /// session's own runtime.
    async fn connect(&self) -> Result<(Peripheral, Characteristic, JoinHandle<()>)> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(btleplug::Error::DeviceNotFound)?;
        let peripheral = find(&adapter, self.settings.address).await?;

        peripheral.connect().await?;
        match self.subscribe(&peripheral).await {
            Ok((characteristic, notifications)) => Ok((peripheral, characteristic, notifications)),
            Err(e) => {
                if let Err(e) = peripheral.disconnect().await {
                    log::debug!("disconnecting {} failed: {e}", self.settings.address);
                }
                Err(e)
            }
        }
    }

    async fn subscribe(&self, peripheral: &Peripheral) -> Result<(Characteristic, JoinHandle<()>)> {
        peripheral.discover_services().await?;
        let characteristics = peripheral.characteristics();
        let wanted = self
            .settings
            .characteristic
            .unwrap_or_else(|| uuid_from_u16(DEFAULT_CHARACTERISTIC));
        let characteristic = match characteristics.iter().find(|c| c.uuid == wanted) {
            Some(c) => c.clone(),
            None if self.settings.characteristic.is_none() => characteristics
                .iter()
                .next()
                .cloned()
                .ok_or_else(|| Error::MissingCharacteristic(wanted.to_string()))?,
            None => return Err(Error::MissingCharacteristic(wanted.to_string())),
        };
        log::debug!("using characteristic {}", characteristic.uuid);

        peripheral.subscribe(&characteristic).await?;
        let mut stream = peripheral.notifications().await?;
        let received = self.received.clone();
        let uuid = characteristic.uuid;
        let notifications = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                let mut received = received.lock();
                let room = MAX_PENDING.saturating_sub(received.len());
                let value = &notification.value;
                received.extend_from_slice(&value[..value.len().min(room)]);
            }
        });
        Ok((characteristic, notifications))
    }

    fn take_received(&self, buf: &mut [u8]) -> Option<usize> {
        let mut received = self.received.lock();
        if received.is_empty() {
            return None;
        }
        let n = received.len().min(buf.len());
        buf[..n].copy_from_slice(&received[..n]);
        received.drain(..n);
        Some(n)
    }
}

async fn find(adapter: &Adapter, address: BDAddr) -> Result<Peripheral> {
    adapter.start_scan(ScanFilter::default()).await?;
    let found = tokio::time::timeout(SCAN_TIMEOUT, async {
        loop {
            for peripheral in adapter.peripherals().await? {
                if peripheral.address() == address {
                    return Ok::<_, btleplug::Error>(peripheral);
                }
            }
            tokio::time::sleep(SCAN_POLL).await;
        }
    })
    .await;
    if let Err(e) = adapter.stop_scan().await {
        log::debug!("stopping scan failed: {e}");
    }
    match found {
        Ok(peripheral) => Ok(peripheral?),
        Err(_) => {
            log::debug!("{address} not seen within {SCAN_TIMEOUT:?}");
            Err(btleplug::Error::DeviceNotFound.into())
        }
    }
}

impl Transport for BtTransport {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn open(&self) -> Result<()> {
        let mut session = self.session.lock();
        if session.is_some() {
            return Ok(());
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("bt")
            .enable_all()
            .build()?;
        match runtime.block_on(self.connect()) {
            Ok((peripheral, characteristic, notifications)) => {
                log::debug!("connected to {}", self.settings.address);
                *session = Some(Session {
                    runtime,
                    peripheral,
                    characteristic,
                    notifications,
                });
                Ok(())
            }
            Err(e) => {
                runtime.shutdown_background();
                Err(e)
            }
        }
    }

    fn close(&self) -> Result<()> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };
        let result = session.runtime.block_on(async {
            if let Err(e) = session.peripheral.unsubscribe(&session.characteristic).await {
                log::debug!("unsubscribing failed: {e}");
            }
            session.peripheral.disconnect().await
        });
        session.notifications.abort();
        session.runtime.shutdown_background();
        self.received.lock().clear();
        log::debug!("disconnected from {}", self.settings.address);
        Ok(result?)
    }

    /// Returns 0 when nothing was notified within the read attempts.
    fn read(&self, _control: u32, buf: &mut [u8]) -> Result<usize> {
        if self.session.lock().is_none() {
            return Err(Error::NotOpen);
        }
        for attempt in 1..=READ_ATTEMPTS {
            if let Some(n) = self.take_received(buf) {
                return Ok(n);
            }
            if attempt < READ_ATTEMPTS {
                thread::sleep(READ_BACKOFF);
            }
        }
        Ok(0)
    }

    /// Drops unread notifications, a reply read after this write belongs to it.
    fn write(&self, _control: u32, buf: &[u8]) -> Result<usize> {
        let session = self.session.lock();
        let session = session.as_ref().ok_or(Error::NotOpen)?;
        self.received.lock().clear();

        let kind = if session.characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        session
            .runtime
            .block_on(session.peripheral.write(&session.characteristic, buf, kind))?;
        Ok(buf.len())
    }
}

impl Drop for BtTransport {
    fn drop(&mut self) {
        // Blocking on the session runtime is not allowed from async code,
        // there the connection is only torn down.
        if Handle::try_current().is_err() {
            if let Err(e) = self.close() {
                log::warn!("closing {} failed: {e}", self.settings.address);
            }
        } else if let Some(session) = self.session.lock().take() {
            session.notifications.abort();
            session.runtime.shutdown_background();
        }
    }
}
