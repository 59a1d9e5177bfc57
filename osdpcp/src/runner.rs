//! Background driver for a [`ControlPanel`]
//!
//! [`PollingControlPanel`] owns the engine behind a mutex and ticks it from
//! a tokio task. Events are queued into a bounded channel and drained by
//! the application, so the event callback never runs application code
//! while the engine is locked.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use osdpcp_core::Command;
use osdpcp_types::{Event, FileTxStatus};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    cp::{ControlPanel, PdHandle},
    error::{Error, Result},
    file::FileOps,
};

/// Default time between two ticks
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(20);

/// Default time `stop` waits for the tick task
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Default capacity of the event queue
pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 256;

/// How often the `*_wait` helpers look at the engine
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Event tagged with its PD and arrival time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdEvent {
    pub address: u8,
    pub event: Event,
    pub received_at: DateTime<Utc>,
}

/// Thread-safe control panel ticked by a background task
pub struct PollingControlPanel {
    cp: Arc<Mutex<ControlPanel>>,
    events: mpsc::Receiver<PdEvent>,
    tick_interval: Duration,
    stop_timeout: Duration,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl PollingControlPanel {
    /// Wrap `cp` with the default event queue size
    pub fn new(cp: ControlPanel) -> Self {
        Self::with_queue_size(cp, DEFAULT_EVENT_QUEUE_SIZE)
    }

    /// Wrap `cp`; events beyond `queue_size` undrained ones are dropped
    pub fn with_queue_size(mut cp: ControlPanel, queue_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));

        cp.register_event_callback(move |address, event| {
            let name = event.name();
            let event = PdEvent {
                address,
                event,
                received_at: Utc::now(),
            };
            if let Err(e) = tx.try_send(event) {
                warn!(address, event = name, error = %e, "Event queue full, event dropped");
            }
        });

        Self {
            cp: Arc::new(Mutex::new(cp)),
            events: rx,
            tick_interval: DEFAULT_TICK_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            stop_tx: None,
            task: None,
        }
    }

    /// Set tick interval
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set how long `stop` waits before aborting the tick task
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Check if the background task is running
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Spawn the tick task on the current tokio runtime
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let cp = Arc::clone(&self.cp);
        let interval = self.tick_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => cp.lock().tick(),
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Tick task stopped");
        });

        info!(interval_ms = interval.as_millis() as u64, "Control panel started");
        self.stop_tx = Some(stop_tx);
        self.task = Some(task);
        Ok(())
    }

    /// Stop the tick task
    ///
    /// A task that does not exit within the stop timeout is aborted and
    /// [`Error::StopTimeout`] is returned.
    pub async fn stop(&mut self) -> Result<()> {
        let (Some(stop_tx), Some(mut task)) = (self.stop_tx.take(), self.task.take()) else {
            return Err(Error::NotRunning);
        };

        let _ = stop_tx.send(true);
        match tokio::time::timeout(self.stop_timeout, &mut task).await {
            Ok(Ok(())) => {
                info!("Control panel stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Tick task ended abnormally");
                Ok(())
            }
            Err(_) => {
                warn!("Tick task did not stop in time, aborting");
                task.abort();
                Err(Error::StopTimeout(self.stop_timeout))
            }
        }
    }

    /// Stop ticking and release the engine
    pub async fn teardown(mut self) {
        if self.is_running() {
            let _ = self.stop().await;
        }
        let cp = Arc::clone(&self.cp);
        drop(self);
        match Arc::try_unwrap(cp) {
            Ok(cp) => cp.into_inner().teardown(),
            Err(_) => warn!("Control panel still shared at teardown"),
        }
    }

    /// Run `f` on the locked engine
    pub fn with_control_panel<R>(&self, f: impl FnOnce(&mut ControlPanel) -> R) -> R {
        f(&mut *self.cp.lock())
    }

    fn with_pd<R>(&self, address: u8, f: impl FnOnce(&mut ControlPanel, PdHandle) -> R) -> Result<R> {
        let mut cp = self.cp.lock();
        let handle = cp.pd(address)?;
        Ok(f(&mut *cp, handle))
    }

    pub fn is_online(&self, address: u8) -> Result<bool> {
        self.with_pd(address, |cp, pd| cp.is_online(pd))
    }

    pub fn is_sc_active(&self, address: u8) -> Result<bool> {
        self.with_pd(address, |cp, pd| cp.sc_active(pd))
    }

    /// Secure channel mask, bit `i` for the `i`-th registered PD
    pub fn sc_status(&self) -> u128 {
        self.cp.lock().sc_status_mask()
    }

    pub fn online_count(&self) -> usize {
        self.cp.lock().online_mask().count_ones() as usize
    }

    pub fn sc_active_count(&self) -> usize {
        self.cp.lock().sc_status_mask().count_ones() as usize
    }

    pub fn send_command(&self, address: u8, command: Command) -> Result<()> {
        self.with_pd(address, |cp, pd| cp.send_command(pd, command))?
    }

    pub fn register_file_ops(&self, address: u8, ops: Box<dyn FileOps>) -> Result<()> {
        self.with_pd(address, |cp, pd| cp.register_file_ops(pd, ops))?
    }

    pub fn file_tx_status(&self, address: u8) -> Result<Option<FileTxStatus>> {
        self.with_pd(address, |cp, pd| cp.file_tx_status(pd))
    }

    /// Wait for the next event
    ///
    /// Returns `None` once the engine is gone.
    pub async fn next_event(&mut self) -> Option<PdEvent> {
        self.events.recv().await
    }

    /// Take the next queued event without waiting
    pub fn try_next_event(&mut self) -> Option<PdEvent> {
        self.events.try_recv().ok()
    }

    /// Take all queued events
    pub fn drain_events(&mut self) -> Vec<PdEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }

    async fn wait_until(&self, timeout: Duration, mut done: impl FnMut(&ControlPanel) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done(&*self.cp.lock()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Wait for the PD at `address` to come online
    pub async fn online_wait(&self, address: u8, timeout: Duration) -> Result<bool> {
        let pd = self.cp.lock().pd(address)?;
        Ok(self.wait_until(timeout, |cp| cp.is_online(pd)).await)
    }

    /// Wait for every PD to come online
    pub async fn online_wait_all(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |cp| all_set(cp.online_mask(), cp.pd_count()))
            .await
    }

    /// Wait for the secure channel of the PD at `address`
    pub async fn sc_wait(&self, address: u8, timeout: Duration) -> Result<bool> {
        let pd = self.cp.lock().pd(address)?;
        Ok(self.wait_until(timeout, |cp| cp.sc_active(pd)).await)
    }

    /// Wait for the secure channel of every PD
    pub async fn sc_wait_all(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |cp| all_set(cp.sc_status_mask(), cp.pd_count()))
            .await
    }
}

fn all_set(mask: u128, count: usize) -> bool {
    count > 0 && mask.count_ones() as usize == count
}

impl Drop for PollingControlPanel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            debug!("Polling control panel dropped while running, aborting tick task");
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cp::CpConfig;
    use osdpcp_transport::{Channel, Result as TransportResult};
    use osdpcp_types::PdInfo;
    use pretty_assertions::assert_eq;

    /// Bus without any PD attached
    struct SilentBus;

    impl Channel for SilentBus {
        fn read(&mut self, _buf: &mut [u8]) -> TransportResult<usize> {
            Ok(0)
        }

        fn write(&mut self, buf: &[u8]) -> TransportResult<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> TransportResult<()> {
            Ok(())
        }

        fn describe(&self) -> String {
            "silent".into()
        }
    }

    fn polling_cp() -> PollingControlPanel {
        let config = CpConfig::default()
            .with_response_timeout(Duration::from_millis(5))
            .with_max_retries(1);
        let mut cp = ControlPanel::with_config(Box::new(SilentBus), config);
        cp.register(PdInfo::builder().address(7).build().unwrap()).unwrap();
        PollingControlPanel::new(cp).with_tick_interval(Duration::from_millis(1))
    }

    #[test]
    fn test_all_set() {
        assert!(!all_set(0, 0));
        assert!(all_set(0b111, 3));
        assert!(!all_set(0b101, 3));
    }

    #[tokio::test]
    async fn test_unknown_address() {
        let pcp = polling_cp();
        assert!(matches!(pcp.is_online(5), Err(Error::UnknownAddress(5))));
        assert!(matches!(
            pcp.send_command(5, Command::Poll),
            Err(Error::UnknownAddress(5))
        ));
    }

    #[tokio::test]
    async fn test_silent_pd_goes_offline() {
        let mut pcp = polling_cp();
        pcp.start().unwrap();
        assert!(matches!(pcp.start(), Err(Error::AlreadyRunning)));

        let event = tokio::time::timeout(Duration::from_secs(2), pcp.next_event())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.address, 7);
        assert_eq!(event.event, Event::Offline);

        assert!(!pcp.online_wait(7, Duration::from_millis(10)).await.unwrap());
        assert_eq!(pcp.online_count(), 0);

        pcp.stop().await.unwrap();
        assert!(matches!(pcp.stop().await, Err(Error::NotRunning)));
        pcp.teardown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_aborts_stuck_task() {
        let mut pcp = polling_cp().with_stop_timeout(Duration::from_millis(50));
        let engine = Arc::clone(&pcp.cp);

        // Hold the engine so the next tick blocks the task
        let guard = engine.lock();
        pcp.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(pcp.stop().await, Err(Error::StopTimeout(_))));
        assert!(!pcp.is_running());
        drop(guard);

        pcp.start().unwrap();
        assert!(pcp.is_running());
        pcp.stop().await.unwrap();
    }
}
