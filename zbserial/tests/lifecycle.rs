//! Lifecycle tests against a scripted in-memory backend.

use {
    std::{
        collections::{HashMap, VecDeque},
        io,
        sync::{
            Arc, Mutex, OnceLock,
            atomic::{AtomicBool, AtomicUsize, Ordering},
            mpsc::Receiver,
        },
        thread,
        time::Duration,
    },
    zbserial::{
        DataBits, Error, FlowControl, Parity, PortEvent, PortHandle, SerialPort, SerialSettings,
    },
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
struct MockControl {
    /// Marker for the state found on the device before anyone opened it.
    tag: u32,
    settings: Option<SerialSettings>,
    raw: bool,
}

#[derive(Debug)]
struct DeviceState {
    control: Mutex<MockControl>,
    rx: Mutex<VecDeque<u8>>,
    written: Mutex<Vec<u8>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_wait: AtomicBool,
    fail_write_control: AtomicBool,
    flushes: AtomicUsize,
    released: AtomicUsize,
}

impl DeviceState {
    fn control(&self) -> MockControl {
        self.control.lock().unwrap().clone()
    }

    fn push_rx(&self, bytes: &[u8]) {
        self.rx.lock().unwrap().extend(bytes);
    }
}

fn registry() -> &'static Mutex<HashMap<String, Arc<DeviceState>>> {
    static DEVICES: OnceLock<Mutex<HashMap<String, Arc<DeviceState>>>> = OnceLock::new();
    DEVICES.get_or_init(Default::default)
}

fn attach(name: &str) -> Arc<DeviceState> {
    let device = Arc::new(DeviceState {
        control: Mutex::new(MockControl {
            tag: 7,
            settings: None,
            raw: false,
        }),
        rx: Mutex::new(VecDeque::new()),
        written: Mutex::new(Vec::new()),
        fail_reads: AtomicBool::new(false),
        fail_writes: AtomicBool::new(false),
        fail_wait: AtomicBool::new(false),
        fail_write_control: AtomicBool::new(false),
        flushes: AtomicUsize::new(0),
        released: AtomicUsize::new(0),
    });
    registry()
        .lock()
        .unwrap()
        .insert(name.to_string(), Arc::clone(&device));
    device
}

struct MockHandle {
    device: Arc<DeviceState>,
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.device.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl PortHandle for MockHandle {
    type ControlBlock = MockControl;

    fn open(identifier: &str) -> io::Result<Self> {
        let device = registry()
            .lock()
            .unwrap()
            .get(identifier)
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        Ok(Self { device })
    }

    fn read_control(&self) -> io::Result<MockControl> {
        Ok(self.device.control())
    }

    fn write_control(&self, block: &MockControl) -> io::Result<()> {
        if self.device.fail_write_control.load(Ordering::SeqCst) {
            return Err(io::Error::other("control block rejected"));
        }
        *self.device.control.lock().unwrap() = block.clone();
        Ok(())
    }

    fn apply_settings(block: &mut MockControl, settings: &SerialSettings) {
        block.settings = Some(SerialSettings {
            baud_rate: settings.effective_baud_rate(),
            ..*settings
        });
        block.raw = true;
    }

    fn flush(&self) -> io::Result<()> {
        self.device.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.device.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        let mut rx = self.device.rx.lock().unwrap();
        let n = buf.len().min(rx.len());
        for (slot, byte) in buf.iter_mut().zip(rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.device.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.device.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        if self.device.fail_wait.load(Ordering::SeqCst) {
            return Err(io::Error::other("wait failed"));
        }
        if !self.device.rx.lock().unwrap().is_empty() {
            return Ok(true);
        }
        thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(false)
    }
}

fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .try_init();
}

fn mock_port(name: &str) -> SerialPort<MockHandle> {
    SerialPort::with_backend(name, SerialSettings::default())
}

fn wait_for(events: &Receiver<PortEvent>, wanted: PortEvent) -> Vec<PortEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.recv_timeout(EVENT_TIMEOUT) {
        seen.push(event);
        if event == wanted {
            return seen;
        }
    }
    panic!("timed out waiting for {wanted}, saw {seen:?}");
}

fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached");
}

fn count(events: &[PortEvent], wanted: PortEvent) -> usize {
    events.iter().filter(|&&event| event == wanted).count()
}

#[test]
fn test_fresh_port_is_closed() {
    let mut port = mock_port("mock-fresh");
    let events = port.events();

    assert!(!port.is_open());
    assert!(port.close().is_ok());
    assert!(events.try_recv().is_err());
}

#[test]
fn test_open_close_restores_control_block() {
    let device = attach("mock-restore");
    let before = device.control();

    let mut port = mock_port("mock-restore");
    port.set_baud_rate(9600).unwrap();
    port.open().unwrap();
    assert!(port.is_open());

    let applied = device.control();
    assert!(applied.raw);
    assert_eq!(applied.tag, before.tag);
    assert_eq!(applied.settings.map(|s| s.baud_rate), Some(9600));
    assert!(device.flushes.load(Ordering::SeqCst) >= 1);

    port.close().unwrap();
    assert!(!port.is_open());
    assert_eq!(device.control(), before);
    assert_eq!(device.released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_open_and_close_notify_once() {
    attach("mock-notify");
    let mut port = mock_port("mock-notify");
    let events = port.events();

    port.open().unwrap();
    port.close().unwrap();
    port.close().unwrap();

    let seen: Vec<_> = events.try_iter().collect();
    assert_eq!(seen, vec![PortEvent::Opened, PortEvent::Closed]);
}

#[test]
fn test_callbacks_fire_for_subscribed_event() {
    attach("mock-callbacks");
    let mut port = mock_port("mock-callbacks");

    let opened = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&opened);
    let id = port.subscribe(PortEvent::Opened, move || {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    port.open().unwrap();
    port.close().unwrap();
    assert!(port.unsubscribe(id));
    port.open().unwrap();

    assert_eq!(opened.load(Ordering::SeqCst), 1);
}

#[test]
fn test_open_missing_device() {
    let mut port = mock_port("mock-missing");
    let events = port.events();

    let err = port.open().unwrap_err();
    assert!(matches!(err, Error::OpenFailure { ref port, .. } if port == "mock-missing"));
    assert!(!port.is_open());
    assert!(events.try_recv().is_err());
}

#[test]
fn test_open_rejected_control_block_leaves_port_closed() {
    let device = attach("mock-open-reject");
    device.fail_write_control.store(true, Ordering::SeqCst);

    let mut port = mock_port("mock-open-reject");
    let events = port.events();

    assert!(matches!(port.open(), Err(Error::OpenFailure { .. })));
    assert!(!port.is_open());
    assert_eq!(device.released.load(Ordering::SeqCst), 1);
    assert!(events.try_recv().is_err());
}

#[test]
fn test_reopen_closes_previous_session_first() {
    let device = attach("mock-reopen");
    let before = device.control();

    let mut port = mock_port("mock-reopen");
    let events = port.events();
    port.open().unwrap();
    port.open().unwrap();
    port.close().unwrap();

    let seen: Vec<_> = events.try_iter().collect();
    assert_eq!(seen, vec![
        PortEvent::Opened,
        PortEvent::Closed,
        PortEvent::Opened,
        PortEvent::Closed,
    ]);
    assert_eq!(device.control(), before);
}

#[test]
fn test_write_and_read_transfer_bytes() {
    init_logger();
    let device = attach("mock-transfer");
    let mut port = mock_port("mock-transfer");
    port.set_debug_logging(true);
    port.open().unwrap();

    assert_eq!(port.write(&[0x01, 0x02, 0x03]).unwrap(), 3);
    assert_eq!(*device.written.lock().unwrap(), vec![0x01, 0x02, 0x03]);

    device.push_rx(&[0xaa, 0xbb]);
    let mut buf = [0u8; 8];
    assert_eq!(port.read(&mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], &[0xaa, 0xbb]);
    assert_eq!(port.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_partial_read_returns_single_call_result() {
    let device = attach("mock-partial");
    let mut port = mock_port("mock-partial");
    port.open().unwrap();

    device.push_rx(&[1, 2, 3, 4, 5]);
    let mut buf = [0u8; 2];
    assert_eq!(port.read(&mut buf).unwrap(), 2);
    assert_eq!(buf, [1, 2]);
    assert_eq!(device.rx.lock().unwrap().len(), 3);
}

#[test]
fn test_transfers_on_closed_port_do_not_touch_device() {
    let device = attach("mock-not-open");
    let mut port = mock_port("mock-not-open");

    assert!(matches!(port.write(&[1]), Err(Error::NotOpen)));
    assert!(matches!(port.read(&mut [0u8; 1]), Err(Error::NotOpen)));
    assert!(device.written.lock().unwrap().is_empty());
}

#[test]
fn test_read_failure_forces_close_with_single_error() {
    let device = attach("mock-read-fail");
    let before = device.control();

    let mut port = mock_port("mock-read-fail");
    let events = port.events();
    port.open().unwrap();

    device.fail_reads.store(true, Ordering::SeqCst);
    assert!(matches!(port.read(&mut [0u8; 4]), Err(Error::Transfer(_))));
    assert!(!port.is_open());
    assert!(matches!(port.read(&mut [0u8; 4]), Err(Error::NotOpen)));

    let seen: Vec<_> = events.try_iter().collect();
    assert_eq!(seen, vec![
        PortEvent::Opened,
        PortEvent::Error,
        PortEvent::Closed
    ]);
    assert_eq!(device.control(), before);
}

#[test]
fn test_write_failure_forces_close() {
    let device = attach("mock-write-fail");
    let mut port = mock_port("mock-write-fail");
    let events = port.events();
    port.open().unwrap();

    device.fail_writes.store(true, Ordering::SeqCst);
    assert!(matches!(port.write(&[1, 2]), Err(Error::Transfer(_))));
    assert!(!port.is_open());

    let seen: Vec<_> = events.try_iter().collect();
    assert_eq!(count(&seen, PortEvent::Error), 1);
    assert_eq!(count(&seen, PortEvent::Closed), 1);
}

#[test]
fn test_watcher_failure_closes_port_without_owner_call() {
    let device = attach("mock-watch-fail");
    let before = device.control();

    let mut port = mock_port("mock-watch-fail");
    let events = port.events();
    port.open().unwrap();

    device.fail_wait.store(true, Ordering::SeqCst);
    let seen = wait_for(&events, PortEvent::Closed);
    assert_eq!(seen, vec![
        PortEvent::Opened,
        PortEvent::Error,
        PortEvent::Closed
    ]);
    assert!(!port.is_open());
    assert_eq!(device.control(), before);
    wait_until(|| device.released.load(Ordering::SeqCst) == 1);

    assert!(matches!(port.write(&[1]), Err(Error::NotOpen)));
    port.close().unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(events.try_recv().is_err());
}

#[test]
fn test_watcher_failure_notifies_callbacks() {
    let device = attach("mock-watch-callback");
    let mut port = mock_port("mock-watch-callback");
    let closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closed);
    port.subscribe(PortEvent::Closed, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    port.open().unwrap();

    device.fail_wait.store(true, Ordering::SeqCst);
    wait_until(|| closed.load(Ordering::SeqCst) == 1);
    assert!(!port.is_open());
}

#[test]
fn test_data_available_is_raised_by_watcher() {
    let device = attach("mock-data");
    let mut port = mock_port("mock-data");
    let events = port.events();
    port.open().unwrap();

    device.push_rx(b"hello");
    wait_for(&events, PortEvent::DataAvailable);

    let mut buf = [0u8; 16];
    let n = port.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello");
}

#[test]
fn test_data_available_waits_for_read_before_repeating() {
    let device = attach("mock-coalesce");
    let mut port = mock_port("mock-coalesce");
    let events = port.events();
    port.open().unwrap();

    device.push_rx(&[1]);
    wait_for(&events, PortEvent::DataAvailable);

    device.push_rx(&[2]);
    thread::sleep(Duration::from_millis(100));
    assert!(events.try_recv().is_err());

    let mut buf = [0u8; 4];
    assert_eq!(port.read(&mut buf).unwrap(), 2);

    device.push_rx(&[3]);
    wait_for(&events, PortEvent::DataAvailable);
}

#[test]
fn test_setters_reconfigure_open_port() {
    let device = attach("mock-setters");
    let mut port = mock_port("mock-setters");
    port.open().unwrap();

    port.set_baud_rate(115200).unwrap();
    port.set_parity(Parity::Odd).unwrap();
    port.set_flow_control(FlowControl::Hardware).unwrap();
    port.set_data_bits(7).unwrap();

    let applied = device.control().settings.unwrap();
    assert_eq!(applied.baud_rate, 115200);
    assert_eq!(applied.parity, Parity::Odd);
    assert_eq!(applied.flow_control, FlowControl::Hardware);
    assert_eq!(applied.data_bits, DataBits::Seven);

    port.set_baud_rate(12345).unwrap();
    assert_eq!(port.baud_rate(), 19200);
    assert_eq!(device.control().settings.unwrap().baud_rate, 19200);
}

#[test]
fn test_invalid_data_bits_on_open_port_change_nothing() {
    let device = attach("mock-bits");
    let mut port = mock_port("mock-bits");
    port.open().unwrap();
    let applied = device.control();

    assert!(matches!(port.set_data_bits(9), Err(Error::InvalidDataBits(9))));
    assert_eq!(port.data_bits(), DataBits::Eight);
    assert_eq!(device.control(), applied);
}

#[test]
fn test_configure_failure_keeps_stored_setting() {
    let device = attach("mock-configure-fail");
    let mut port = mock_port("mock-configure-fail");
    port.open().unwrap();

    device.fail_write_control.store(true, Ordering::SeqCst);
    assert!(matches!(port.set_parity(Parity::Even), Err(Error::Configure(_))));
    assert_eq!(port.parity(), Parity::Even);
    assert!(port.is_open());
}

#[test]
fn test_identifier_change_ignored_while_open() {
    attach("mock-ident");
    let mut port = mock_port("mock-ident");
    port.open().unwrap();

    port.set_identifier("mock-other");
    assert_eq!(port.identifier(), "mock-ident");

    port.close().unwrap();
    port.set_identifier("mock-other");
    assert_eq!(port.identifier(), "mock-other");
}

#[test]
fn test_drop_closes_and_restores() {
    let device = attach("mock-drop");
    let before = device.control();

    let mut port = mock_port("mock-drop");
    let events = port.events();
    port.open().unwrap();
    drop(port);

    assert_eq!(device.control(), before);
    assert_eq!(device.released.load(Ordering::SeqCst), 1);
    let seen: Vec<_> = events.try_iter().collect();
    assert_eq!(seen, vec![PortEvent::Opened, PortEvent::Closed]);
}
