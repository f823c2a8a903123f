use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rdev_proto::RdevCodec;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use crate::registry::Registry;
use crate::session::Session;

/// Pause after a failed `accept`, e.g. when the process is out of file
/// descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Binds `addr` and serves the devices of `registry` on it.
pub async fn listen(addr: SocketAddr, registry: Arc<Registry>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("rdevd listening on {}", listener.local_addr()?);
    serve(listener, registry).await
}

/// Accepts connections forever, each one handled by its own task. A failed
/// accept is logged and retried, it never takes the server down.
pub async fn serve(listener: TcpListener, registry: Arc<Registry>) -> anyhow::Result<()> {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("accept failed: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let registry = registry.clone();
        tokio::task::spawn(async move {
            if let Err(e) = run_client(stream, addr, registry).await {
                log::error!("client {addr}: {e}");
                log::debug!("client {addr}: {e:?}");
            }
        });
    }
}

async fn run_client(stream: TcpStream, addr: SocketAddr, registry: Arc<Registry>) -> anyhow::Result<()> {
    log::info!("client {addr} connected");
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, RdevCodec);
    let mut session = Session::new(registry);

    let result = async {
        while let Some(request) = framed.next().await {
            let request = request?;
            log::trace!("{addr} <- {request:?}");
            let reply = session.handle(request).await;
            log::trace!("{addr} -> {reply:?}");
            framed.send(reply).await?;
        }
        anyhow::Ok(())
    }
    .await;

    session.shutdown().await;
    log::debug!("client {addr} disconnected");
    result
}
