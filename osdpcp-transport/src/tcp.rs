//! TCP channel, for PDs behind serial-to-Ethernet bridges

use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::{Channel, error::*, would_block_as_empty};

/// TCP channel
///
/// Connecting is async; once connected the socket is driven without a
/// runtime through the non-blocking [`Channel`] calls.
pub struct TcpChannel {
    addr: String,
    port: u16,
    socket_addr: Option<SocketAddr>,
    stream: Option<std::net::TcpStream>,
    connect_timeout: Duration,
}

impl TcpChannel {
    /// Create new TCP channel
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
            socket_addr: None,
            stream: None,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Resolve address to SocketAddr
    async fn resolve_addr(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.socket_addr {
            return Ok(addr);
        }

        let addr_str = format!("{}:{}", self.addr, self.port);

        let addr = tokio::net::lookup_host(&addr_str)
            .await
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", addr_str, e)))?
            .next()
            .ok_or_else(|| Error::InvalidAddress(format!("No addresses found for {}", addr_str)))?;

        self.socket_addr = Some(addr);
        Ok(addr)
    }

    /// Connect to the remote end
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }

        let addr = self.resolve_addr().await?;

        debug!("Connecting to {}...", addr);

        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectionTimeout)?
            .map_err(Error::Io)?;

        // Disable Nagle's algorithm, frames are small and latency bound
        stream.set_nodelay(true)?;

        // Stays in non-blocking mode
        let stream = stream.into_std()?;

        debug!("Connected to {}", addr);

        self.stream = Some(stream);
        Ok(())
    }

    /// Close the connection
    pub fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!("Disconnecting from {}...", self.describe());
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

impl Channel for TcpChannel {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        match stream.read(buf) {
            Ok(0) if !buf.is_empty() => {
                warn!("Connection closed by {}", self.addr);
                self.stream = None;
                Err(Error::ConnectionClosed)
            }
            Ok(n) => {
                trace!("Received {} bytes: {}", n, hex::encode(&buf[..n]));
                Ok(n)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        // A full socket buffer accepts only part of the frame; the caller
        // sees the short count
        let written = would_block_as_empty(stream.write(buf))?;
        trace!("Sent {} of {} bytes: {}", written, buf.len(), hex::encode(&buf[..written]));
        Ok(written)
    }

    fn flush(&mut self) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        match stream.flush() {
            Err(e) if e.kind() != ErrorKind::WouldBlock => Err(Error::Io(e)),
            _ => Ok(()),
        }
    }

    fn describe(&self) -> String {
        self.socket_addr
            .map(|addr| format!("tcp://{}", addr))
            .unwrap_or_else(|| format!("tcp://{}:{}", self.addr, self.port))
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        if self.is_connected() {
            debug!("TCP channel dropped while connected, closing");
            self.disconnect();
        }
    }
}
