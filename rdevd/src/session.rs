//! Per connection request handling.

use std::sync::Arc;

use rdev_proto::{Message, Opcode, Status};
use rdev_transport::Transport;
use tokio::task;

use crate::registry::{Claim, Device, Registry};

/// Units one connection may have open at a time.
pub const MAX_UNITS: usize = 8;

struct Unit {
    device: Arc<Device>,
    transport: Arc<dyn Transport>,
    claim: Option<Claim>,
    open: bool,
}

/// The unit table of one connection.
///
/// Unit numbers stay valid until the connection ends. A closed unit keeps its
/// number, requests on it fail with EBADF, and its slot is reused by a later
/// open.
pub struct Session {
    registry: Arc<Registry>,
    units: Vec<Unit>,
}

/// Runs a blocking transport call off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, Status>
where
    F: FnOnce() -> rdev_transport::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            log::debug!("transport error: {e}");
            Err(Status::Io)
        }
        Err(e) => {
            log::error!("transport call panicked: {e}");
            Err(Status::Io)
        }
    }
}

fn device_name(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

fn requested_length(payload: &[u8]) -> usize {
    match payload {
        [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]) as usize,
        _ => 0,
    }
}

impl Session {
    pub fn new(registry: Arc<Registry>) -> Self {
        Session {
            registry,
            units: Vec::new(),
        }
    }

    pub fn open_units(&self) -> usize {
        self.units.iter().filter(|u| u.open).count()
    }

    /// Handles one request and returns the reply to send.
    pub async fn handle(&mut self, request: Message) -> Message {
        let (opcode, unit) = (request.opcode, request.unit);
        let result = match request.op() {
            Ok(Opcode::Open) => self.open(&request.payload).await,
            Ok(Opcode::Close) => self.close(request.unit).await,
            Ok(Opcode::Read) => self.read(&request).await,
            Ok(Opcode::Write) => self.write(request).await,
            Err(_) => {
                log::debug!("unknown opcode {opcode}");
                Err(Status::NoEntry)
            }
        };

        match result {
            Ok(reply) => reply,
            Err(status) => {
                log::debug!("request {opcode} on unit {unit} failed: {status}");
                Message::error(status)
            }
        }
    }

    fn unit(&self, unit: u8) -> Result<&Unit, Status> {
        self.units
            .get(unit as usize)
            .filter(|u| u.open)
            .ok_or(Status::BadUnit)
    }

    async fn open(&mut self, payload: &[u8]) -> Result<Message, Status> {
        let name = device_name(payload);
        let device = self.registry.get(&name).ok_or(Status::NoEntry)?;

        let slot = self.units.iter().position(|u| !u.open);
        if slot.is_none() && self.units.len() >= MAX_UNITS {
            return Err(Status::TooManyUnits);
        }

        let claim = device.claim().map_err(|_| Status::Busy)?;
        let transport = {
            let device = device.clone();
            blocking(move || device.acquire()).await?
        };

        let mut kind = transport.kind().as_bytes().to_vec();
        kind.push(0);
        let unit = Unit {
            device,
            transport,
            claim,
            open: true,
        };
        let index = match slot {
            Some(index) => {
                self.units[index] = unit;
                index
            }
            None => {
                self.units.push(unit);
                self.units.len() - 1
            }
        };

        log::debug!("opened {name} as unit {index}");
        Ok(Message::reply(index as u8, 0, kind))
    }

    async fn close(&mut self, unit: u8) -> Result<Message, Status> {
        self.unit(unit)?;
        let entry = &mut self.units[unit as usize];
        entry.open = false;
        let claim = entry.claim.take();
        let device = entry.device.clone();

        let result = blocking(move || device.release(false)).await;
        drop(claim);
        result?;

        log::debug!("closed unit {unit}");
        Ok(Message::reply(unit, 0, Vec::new()))
    }

    async fn read(&self, request: &Message) -> Result<Message, Status> {
        let transport = self.unit(request.unit)?.transport.clone();
        let control = request.control;
        let length = requested_length(&request.payload);

        let data = blocking(move || {
            let mut buf = vec![0u8; length];
            let n = transport.read(control, &mut buf)?;
            buf.truncate(n);
            Ok(buf)
        })
        .await?;
        Ok(Message::reply(request.unit, control, data))
    }

    async fn write(&self, request: Message) -> Result<Message, Status> {
        let transport = self.unit(request.unit)?.transport.clone();
        let Message {
            unit,
            control,
            payload,
            ..
        } = request;

        blocking(move || transport.write(control, &payload)).await?;
        Ok(Message::reply(unit, control, Vec::new()))
    }

    /// Closes every unit still open. Transports nobody else uses are
    /// destroyed.
    pub async fn shutdown(&mut self) {
        for (index, unit) in self.units.drain(..).enumerate() {
            if !unit.open {
                continue;
            }
            let device = unit.device.clone();
            if blocking(move || device.release(true)).await.is_err() {
                log::warn!("closing unit {index} ({}) failed", unit.device.name());
            }
            drop(unit.claim);
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use rdev_transport::TransportRegistry;

    use super::*;
    use crate::config::DeviceConfig;

    /// Keeps the last written buffer and hands it back on read.
    #[derive(Default)]
    struct Loopback {
        data: Mutex<Vec<u8>>,
        open: Mutex<bool>,
    }

    impl Transport for Loopback {
        fn kind(&self) -> &'static str {
            "loopback"
        }

        fn open(&self) -> rdev_transport::Result<()> {
            *self.open.lock() = true;
            Ok(())
        }

        fn close(&self) -> rdev_transport::Result<()> {
            *self.open.lock() = false;
            Ok(())
        }

        fn read(&self, _control: u32, buf: &mut [u8]) -> rdev_transport::Result<usize> {
            if !*self.open.lock() {
                return Err(rdev_transport::Error::NotOpen);
            }
            let data = self.data.lock();
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            Ok(n)
        }

        fn write(&self, _control: u32, buf: &[u8]) -> rdev_transport::Result<usize> {
            *self.data.lock() = buf.to_vec();
            Ok(buf.len())
        }
    }

    fn registry() -> Arc<Registry> {
        let mut transports = TransportRegistry::default();
        transports.register("loopback", |_, _| Ok(Box::<Loopback>::default()));
        let device = |name: &str, transport: &str, shared| DeviceConfig {
            name: name.into(),
            transport: transport.into(),
            target: "127.0.0.1:1".into(),
            options: String::new(),
            shared,
        };
        Arc::new(Registry::new(
            vec![
                device("loop", "loopback", false),
                device("shared", "loopback", true),
                device("broken", "ip", false),
            ],
            transports,
        ))
    }

    fn open(name: &str) -> Message {
        let mut payload = name.as_bytes().to_vec();
        payload.push(0);
        Message::request(Opcode::Open, 0, 0, payload)
    }

    fn read(unit: u8, len: u16) -> Message {
        let mut payload = len.to_le_bytes().to_vec();
        payload.extend([0, 0]);
        Message::request(Opcode::Read, unit, 0x305, payload)
    }

    #[tokio::test]
    async fn open_write_read_close() {
        let mut session = Session::new(registry());

        let reply = session.handle(open("loop")).await;
        assert_eq!(reply.status(), Status::Success);
        assert_eq!(reply.unit, 0);
        assert_eq!(reply.payload, b"loopback\0");

        let reply = session
            .handle(Message::request(Opcode::Write, 0, 0x305, b"abcdef".to_vec()))
            .await;
        assert_eq!(reply.status(), Status::Success);
        assert!(reply.payload.is_empty());

        let reply = session.handle(read(0, 4)).await;
        assert_eq!(reply.status(), Status::Success);
        assert_eq!(reply.control, 0x305);
        assert_eq!(reply.payload, b"abcd");

        let reply = session.handle(Message::request(Opcode::Close, 0, 0, vec![])).await;
        assert_eq!(reply.status(), Status::Success);
        assert_eq!(session.handle(read(0, 4)).await.status(), Status::BadUnit);
        assert_eq!(
            session.handle(Message::request(Opcode::Close, 0, 0, vec![])).await.status(),
            Status::BadUnit
        );
    }

    #[tokio::test]
    async fn arbitration() {
        let registry = registry();
        let mut a = Session::new(registry.clone());
        let mut b = Session::new(registry.clone());

        assert_eq!(a.handle(open("loop")).await.status(), Status::Success);
        assert_eq!(b.handle(open("loop")).await.status(), Status::Busy);
        assert_eq!(a.handle(open("loop")).await.status(), Status::Busy);

        assert_eq!(a.handle(open("shared")).await.status(), Status::Success);
        assert_eq!(b.handle(open("shared")).await.status(), Status::Success);

        a.handle(Message::request(Opcode::Close, 0, 0, vec![])).await;
        let reply = b.handle(open("loop")).await;
        assert_eq!(reply.status(), Status::Success);
        assert_eq!(reply.unit, 1);
    }

    #[tokio::test]
    async fn shared_device_stays_open_for_others() {
        let registry = registry();
        let mut a = Session::new(registry.clone());
        let mut b = Session::new(registry.clone());

        a.handle(open("shared")).await;
        b.handle(open("shared")).await;
        b.handle(Message::request(Opcode::Write, 0, 0, b"hi".to_vec())).await;

        a.shutdown().await;
        let reply = b.handle(read(0, 8)).await;
        assert_eq!(reply.status(), Status::Success);
        assert_eq!(reply.payload, b"hi");
        assert_eq!(registry.get("shared").unwrap().open_count(), 1);
    }

    #[tokio::test]
    async fn errors_are_replies() {
        let mut session = Session::new(registry());

        let reply = session.handle(open("nope")).await;
        assert_eq!(reply.status(), Status::NoEntry);
        assert!(reply.payload.is_empty());

        let unknown = Message {
            opcode: 42,
            unit: 0,
            control: 0,
            payload: vec![],
        };
        assert_eq!(session.handle(unknown).await.status(), Status::NoEntry);
        assert_eq!(session.handle(read(3, 8)).await.status(), Status::BadUnit);

        // nothing listens on the target, so opening fails and frees the claim
        assert_eq!(session.handle(open("broken")).await.status(), Status::Io);
        assert!(registry_claim_free(&session, "broken"));
    }

    fn registry_claim_free(session: &Session, name: &str) -> bool {
        session.registry.get(name).unwrap().claim().is_ok()
    }

    #[tokio::test]
    async fn unit_limit_and_slot_reuse() {
        let mut session = Session::new(registry());
        for unit in 0..MAX_UNITS {
            let reply = session.handle(open("shared")).await;
            assert_eq!(reply.unit as usize, unit);
        }
        assert_eq!(session.handle(open("shared")).await.status(), Status::TooManyUnits);

        session.handle(Message::request(Opcode::Close, 3, 0, vec![])).await;
        assert_eq!(session.open_units(), MAX_UNITS - 1);
        let reply = session.handle(open("shared")).await;
        assert_eq!(reply.status(), Status::Success);
        assert_eq!(reply.unit, 3);
    }

    #[test]
    fn request_parsing() {
        assert_eq!(device_name(b"can0\0garbage"), "can0");
        assert_eq!(device_name(b"can0"), "can0");
        assert_eq!(requested_length(&[0x10, 0x01, 0, 0]), 0x110);
        assert_eq!(requested_length(&[7]), 0);
    }
}
