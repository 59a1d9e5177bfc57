//! RS-485 serial channel

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, trace};

use crate::{Channel, error::*};

/// Serial line settings
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    /// Upper bound for a single blocking write
    pub write_timeout: Duration,
}

impl SerialConfig {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            write_timeout: Duration::from_millis(100),
        }
    }
}

/// Serial channel (8N1, no flow control)
pub struct SerialChannel {
    config: SerialConfig,
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    /// Open the port described by `config`
    pub fn open(config: SerialConfig) -> Result<Self> {
        debug!("Opening {} at {} baud", config.path, config.baud_rate);

        let port = serialport::new(&config.path, config.baud_rate)
            .flow_control(serialport::FlowControl::None)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(config.write_timeout)
            .open()?;

        port.clear(serialport::ClearBuffer::All)?;

        Ok(Self { config, port })
    }

    /// Line settings in use
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

impl Channel for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        // Only read what is already buffered so the call never blocks
        let available = self.port.bytes_to_read()? as usize;
        if available == 0 || buf.is_empty() {
            return Ok(0);
        }

        let want = available.min(buf.len());
        match self.port.read(&mut buf[..want]) {
            Ok(n) => {
                trace!("Received {} bytes: {}", n, hex::encode(&buf[..n]));
                Ok(n)
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(0),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        trace!("Sending {} bytes: {}", buf.len(), hex::encode(buf));
        self.port.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        self.port.flush()?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.config.path, self.config.baud_rate)
    }
}
