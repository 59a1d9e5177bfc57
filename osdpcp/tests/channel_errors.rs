use std::sync::Arc;
use std::time::{Duration, Instant};

use mockall::mock;
use osdpcp::{ControlPanel, CpConfig, Event, PdInfo};
use osdpcp_transport::{Channel, Error as TransportError, Result as TransportResult};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

mock! {
    pub Bus {}

    impl Channel for Bus {
        fn read(&mut self, buf: &mut [u8]) -> TransportResult<usize>;
        fn write(&mut self, buf: &[u8]) -> TransportResult<usize>;
        fn flush(&mut self) -> TransportResult<()>;
        fn describe(&self) -> String;
    }
}

fn control_panel(bus: MockBus) -> (ControlPanel, Arc<Mutex<Vec<(u8, Event)>>>) {
    let config = CpConfig::default()
        .with_response_timeout(Duration::from_millis(50))
        .with_max_retries(1);
    let mut cp = ControlPanel::with_config(Box::new(bus), config);
    cp.register(PdInfo::builder().address(3).build().unwrap())
        .unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    cp.register_event_callback(move |address, event| sink.lock().push((address, event)));
    (cp, events)
}

#[test]
fn test_write_errors_count_as_retries() {
    let mut bus = MockBus::new();
    bus.expect_describe().return_const("mock".to_string());
    bus.expect_write()
        .times(2)
        .returning(|_| Err(TransportError::ConnectionClosed));
    bus.expect_flush().never();
    bus.expect_read().returning(|_| Ok(0));

    let (mut cp, events) = control_panel(bus);
    let pd = cp.pd(3).unwrap();

    let mut now = Instant::now();
    for _ in 0..5 {
        now += Duration::from_millis(10);
        cp.tick_at(now);
    }

    assert!(!cp.is_online(pd));
    assert_eq!(events.lock().clone(), vec![(3, Event::Offline)]);
}

#[test]
fn test_read_errors_take_pd_offline() {
    let mut bus = MockBus::new();
    bus.expect_describe().return_const("mock".to_string());
    bus.expect_write().returning(|buf| Ok(buf.len()));
    bus.expect_flush().returning(|| Ok(()));
    bus.expect_read()
        .returning(|_| Err(TransportError::Io(std::io::ErrorKind::BrokenPipe.into())));

    let (mut cp, events) = control_panel(bus);

    let mut now = Instant::now();
    for _ in 0..5 {
        now += Duration::from_millis(10);
        cp.tick_at(now);
    }

    assert_eq!(events.lock().clone(), vec![(3, Event::Offline)]);
    assert_eq!(cp.online_mask(), 0);
}

#[test]
fn test_garbage_on_the_line_is_a_failed_attempt() {
    let mut bus = MockBus::new();
    bus.expect_describe().return_const("mock".to_string());
    bus.expect_write().returning(|buf| Ok(buf.len()));
    bus.expect_flush().returning(|| Ok(()));

    // A frame with a broken CRC after every write
    let mut pending = false;
    bus.expect_read().returning(move |buf| {
        pending = !pending;
        if !pending {
            return Ok(0);
        }
        let frame = [0x53, 0x83, 0x08, 0x00, 0x04, 0x40, 0x00, 0x00];
        buf[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    });

    let (mut cp, events) = control_panel(bus);
    let pd = cp.pd(3).unwrap();

    let mut now = Instant::now();
    for _ in 0..10 {
        now += Duration::from_millis(10);
        cp.tick_at(now);
    }

    assert!(!cp.is_online(pd));
    assert!(events.lock().contains(&(3, Event::Offline)));
}

#[test]
fn test_short_write_is_a_failed_attempt() {
    let mut bus = MockBus::new();
    bus.expect_describe().return_const("mock".to_string());

    let sent = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&sent);
    bus.expect_write().times(2).returning(move |buf| {
        record.lock().push(buf.to_vec());
        Ok(buf.len() - 1)
    });
    bus.expect_flush().returning(|| Ok(()));
    bus.expect_read().returning(|_| Ok(0));

    let (mut cp, events) = control_panel(bus);
    let pd = cp.pd(3).unwrap();

    let mut now = Instant::now();
    for _ in 0..5 {
        now += Duration::from_millis(10);
        cp.tick_at(now);
    }

    // The retry sends the whole frame again
    let sent = sent.lock();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], sent[1]);
    assert!(!cp.is_online(pd));
    assert_eq!(events.lock().clone(), vec![(3, Event::Offline)]);
}
