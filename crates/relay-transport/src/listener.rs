//! Inbound connection acceptor.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;

use crate::connection::Connection;
use crate::error::TransportError;

pub struct Acceptor {
    listener: TcpListener,
    local: SocketAddr,
}

impl Acceptor {
    /// Bind to `hostname:port` (port 0 for OS-assigned).
    pub async fn bind(hostname: &str, port: u16) -> Result<Self, TransportError> {
        let addr: SocketAddr = format!("{hostname}:{port}")
            .parse()
            .map_err(|_| TransportError::Address(format!("{hostname}:{port}")))?;
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!("Client listener bound to {local}");
        Ok(Self { listener, local })
    }

    /// The actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub async fn accept(&self) -> Result<Connection, TransportError> {
        let (stream, _) = self.listener.accept().await?;
        Connection::from_stream(stream)
    }
}
