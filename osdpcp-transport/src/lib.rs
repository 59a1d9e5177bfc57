//! Transport layer for OSDP
//!
//! Provides the byte channel the control panel talks to PDs through, with
//! RS-485 serial, TCP and UDP implementations.

pub mod error;
pub mod serial;
pub mod tcp;
pub mod udp;

pub use error::{Error, Result};
pub use serial::{SerialChannel, SerialConfig};
pub use tcp::TcpChannel;
pub use udp::UdpChannel;

/// Non-blocking byte channel shared by all PDs on one bus
///
/// The control panel never waits on a channel: `read` returns whatever is
/// buffered right now (possibly nothing) and `write` hands a whole frame to
/// the OS.
pub trait Channel: Send {
    /// Read available bytes into `buf`, returning 0 when there are none
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf`, returning the number of bytes accepted
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Push out anything buffered by `write`
    fn flush(&mut self) -> Result<()>;

    /// Human readable endpoint, used in logs
    fn describe(&self) -> String;
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        (**self).write(buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Map a non-blocking read or write result onto the channel contract
pub(crate) fn would_block_as_empty(result: std::io::Result<usize>) -> Result<usize> {
    match result {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
        Err(e) => Err(Error::Io(e)),
    }
}
