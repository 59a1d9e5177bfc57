//! File transfer to PDs (osdp_FILETRANSFER)
//!
//! The application supplies the file contents through [`FileOps`]; the
//! control panel slices them into fragments, one per exchange, and follows
//! the PD's osdp_FTSTAT flow control (delay, fragment size, finishing).

use std::io;
use std::time::{Duration, Instant};

use bytes::Bytes;
use osdpcp_core::command::FileTransfer;
use osdpcp_core::constants::DEFAULT_FILE_FRAGMENT_SIZE;
use osdpcp_core::reply::FileTransferStatus;
use osdpcp_types::{FileTxState, FileTxStatus};
use tracing::{debug, warn};

/// Application hooks that back a file transfer
pub trait FileOps: Send {
    /// Open the file for `file_id` and return its size in bytes
    fn open(&mut self, file_id: u8) -> io::Result<u32>;

    /// Read up to `buf.len()` bytes at `offset`
    fn read_chunk(&mut self, offset: u32, buf: &mut [u8]) -> io::Result<usize>;

    /// Write bytes received from the PD at `offset`
    fn write_chunk(&mut self, _offset: u32, _data: &[u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    /// Called after every acknowledged fragment and on completion
    fn progress(&mut self, _status: &FileTxStatus) {}

    /// Release the file
    fn close(&mut self, file_id: u8);
}

/// Outgoing transfer bookkeeping for one PD
#[derive(Debug)]
pub(crate) struct FileTx {
    file_id: u8,
    size: u32,
    offset: u32,
    fragment_size: usize,
    /// Bytes carried by the fragment in flight
    in_flight: u32,
    not_before: Option<Instant>,
    finishing: bool,
    status_code: i16,
}

impl FileTx {
    pub(crate) fn start(ops: &mut dyn FileOps, file_id: u8) -> io::Result<Self> {
        let size = ops.open(file_id)?;
        debug!(file_id, size, "File transfer opened");

        Ok(Self {
            file_id,
            size,
            offset: 0,
            fragment_size: DEFAULT_FILE_FRAGMENT_SIZE,
            in_flight: 0,
            not_before: None,
            finishing: false,
            status_code: 0,
        })
    }

    pub(crate) fn status(&self, state: FileTxState) -> FileTxStatus {
        FileTxStatus {
            file_id: self.file_id,
            offset: self.offset,
            size: self.size,
            state,
            status_code: self.status_code,
        }
    }

    /// Whether the PD's requested delay has passed
    pub(crate) fn is_ready(&self, now: Instant) -> bool {
        self.not_before.is_none_or(|t| now >= t)
    }

    /// Build the next fragment
    ///
    /// Once all data is out and the PD reports it is still finishing, empty
    /// fragments keep the transfer alive.
    pub(crate) fn next_fragment(&mut self, ops: &mut dyn FileOps) -> io::Result<FileTransfer> {
        let remaining = self.size.saturating_sub(self.offset) as usize;
        let len = remaining.min(self.fragment_size);

        let mut buf = vec![0u8; len];
        let read = if len > 0 {
            ops.read_chunk(self.offset, &mut buf)?
        } else {
            0
        };
        if read == 0 && len > 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file {} ended at offset {}", self.file_id, self.offset),
            ));
        }
        buf.truncate(read);
        self.in_flight = read as u32;

        Ok(FileTransfer {
            file_type: self.file_id,
            total_size: self.size,
            offset: self.offset,
            data: Bytes::from(buf),
        })
    }

    /// Apply the PD's answer to the fragment in flight
    ///
    /// `None` stands for a plain osdp_ACK. Returns the resulting state.
    pub(crate) fn on_status(
        &mut self,
        status: Option<&FileTransferStatus>,
        now: Instant,
    ) -> FileTxState {
        self.offset = self.offset.saturating_add(self.in_flight).min(self.size);
        self.in_flight = 0;

        let Some(status) = status else {
            self.finishing = false;
            return self.state();
        };

        self.status_code = status.status;
        if status.is_error() {
            warn!(file_id = self.file_id, status = status.status, "PD aborted file transfer");
            return FileTxState::Aborted;
        }

        self.not_before = (status.delay_ms > 0)
            .then(|| now + Duration::from_millis(status.delay_ms as u64));
        if status.update_msg_max > 0 {
            self.fragment_size = status.update_msg_max as usize;
        }
        self.finishing = status.status == FileTransferStatus::FINISHING;

        self.state()
    }

    fn state(&self) -> FileTxState {
        if self.offset >= self.size && !self.finishing {
            FileTxState::Done
        } else {
            FileTxState::InProgress
        }
    }

    pub(crate) fn abort(&mut self) -> FileTxStatus {
        self.in_flight = 0;
        self.status(FileTxState::Aborted)
    }

    pub(crate) fn file_id(&self) -> u8 {
        self.file_id
    }
}
