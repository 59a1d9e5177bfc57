//! UDP channel
//!
//! Each OSDP frame travels in its own datagram, which suits IP-to-RS485
//! gateways that forward datagrams onto the bus verbatim.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::{Channel, error::*, would_block_as_empty};

/// UDP channel
pub struct UdpChannel {
    addr: String,
    port: u16,
    socket: Option<std::net::UdpSocket>,
    remote_addr: Option<SocketAddr>,
    connect_timeout: Duration,
}

impl UdpChannel {
    /// Create new UDP channel
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
            socket: None,
            remote_addr: None,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Set timeout for address resolution and socket setup
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Resolve address to SocketAddr
    async fn resolve_addr(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.remote_addr {
            return Ok(addr);
        }

        let addr_str = format!("{}:{}", self.addr, self.port);

        let addr = tokio::net::lookup_host(&addr_str)
            .await
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", addr_str, e)))?
            .next()
            .ok_or_else(|| Error::InvalidAddress(format!("No addresses found for {}", addr_str)))?;

        self.remote_addr = Some(addr);
        Ok(addr)
    }

    /// Bind a local socket and fix the remote end
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }

        let connect_timeout = self.connect_timeout;
        let setup = async {
            let remote = self.resolve_addr().await?;
            debug!("Connecting to {} via UDP...", remote);

            let local = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = UdpSocket::bind(local).await.map_err(Error::Io)?;
            socket.connect(remote).await.map_err(Error::Io)?;
            Ok::<_, Error>(socket)
        };

        let socket = timeout(connect_timeout, setup)
            .await
            .map_err(|_| Error::ConnectionTimeout)??;

        debug!("Connected to {} via UDP", self.describe());

        self.socket = Some(socket.into_std()?);
        Ok(())
    }

    /// Drop the socket
    pub fn disconnect(&mut self) {
        if self.socket.take().is_some() {
            debug!("Disconnecting from {}...", self.describe());
        }
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }
}

impl Channel for UdpChannel {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;

        let n = would_block_as_empty(socket.recv(buf))?;
        if n > 0 {
            trace!("Received {} bytes via UDP: {}", n, hex::encode(&buf[..n]));
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;

        trace!("Sending {} bytes via UDP: {}", buf.len(), hex::encode(buf));

        let written = socket.send(buf)?;
        if written != buf.len() {
            return Err(Error::ShortWrite {
                written,
                expected: buf.len(),
            });
        }
        Ok(written)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        self.remote_addr
            .map(|addr| format!("udp://{}", addr))
            .unwrap_or_else(|| format!("udp://{}:{}", self.addr, self.port))
    }
}
