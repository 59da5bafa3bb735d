//! POSIX serial backend: termios control block, `poll` readiness.
//!
//! Ports are opened with `O_NOCTTY | O_NONBLOCK` so that neither opening a
//! modem line nor reading an idle port can block the caller. Readiness is
//! reported by `poll(2)` with a bounded timeout; there is no way to interrupt
//! the wait, so the watcher re-checks its stop flag after every timeout.

use {
    crate::port::{DataBits, FlowControl, Parity, PortEnumerator, PortHandle, SerialSettings},
    log::{debug, trace, warn},
    nix::{
        errno::Errno,
        fcntl::OFlag,
        poll::{PollFd, PollFlags, PollTimeout, poll},
        sys::termios::{
            self, BaudRate, ControlFlags, FlushArg, InputFlags, LocalFlags, OutputFlags, SetArg,
            SpecialCharacterIndices, Termios,
        },
    },
    std::{
        fs::{self, File, OpenOptions},
        io::{self, Read as _, Write as _},
        os::{fd::AsFd, unix::fs::OpenOptionsExt},
        time::Duration,
    },
};

/// Directory scanned for device nodes.
const DEVICE_DIR: &str = "/dev";

/// Stable per-device symlinks maintained by udev.
const BY_ID_DIR: &str = "/dev/serial/by-id";

/// On-board UARTs. Most of these nodes exist whether or not hardware is behind
/// them, so each one is checked before being listed.
#[cfg(target_os = "linux")]
const LEGACY_PREFIXES: &[&str] = &["ttyS"];
#[cfg(not(target_os = "linux"))]
const LEGACY_PREFIXES: &[&str] = &["ttyS", "ttyd"];

/// USB adapters. Listed without probing.
#[cfg(target_os = "linux")]
const USB_PREFIXES: &[&str] = &["ttyUSB", "ttyACM"];
#[cfg(not(target_os = "linux"))]
const USB_PREFIXES: &[&str] = &["cu.", "ttyUSB", "ttyACM", "ttyU"];

fn open_flags() -> i32 {
    (OFlag::O_NOCTTY | OFlag::O_NONBLOCK).bits()
}

/// Serial port handle backed by a device file.
#[derive(Debug)]
pub struct PosixHandle {
    file: File,
}

impl PortHandle for PosixHandle {
    type ControlBlock = Termios;

    fn open(identifier: &str) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(open_flags())
            .open(identifier)?;
        trace!("Opened {identifier}");
        Ok(Self { file })
    }

    fn read_control(&self) -> io::Result<Termios> {
        Ok(termios::tcgetattr(&self.file)?)
    }

    fn write_control(&self, block: &Termios) -> io::Result<()> {
        Ok(termios::tcsetattr(&self.file, SetArg::TCSANOW, block)?)
    }

    fn apply_settings(block: &mut Termios, settings: &SerialSettings) {
        let mut control = match settings.data_bits {
            DataBits::Five => ControlFlags::CS5,
            DataBits::Six => ControlFlags::CS6,
            DataBits::Seven => ControlFlags::CS7,
            DataBits::Eight => ControlFlags::CS8,
        };

        match settings.parity {
            Parity::None => {},
            Parity::Odd => control |= ControlFlags::PARENB | ControlFlags::PARODD,
            Parity::Even => control |= ControlFlags::PARENB,
        }

        control |= ControlFlags::CREAD;

        let mut input = InputFlags::IGNPAR | InputFlags::IGNBRK;

        // The three groups are mutually exclusive; `control` and `input` start
        // from scratch, so each arm only has to set its own bits.
        match settings.flow_control {
            FlowControl::None => control |= ControlFlags::CLOCAL,
            FlowControl::Hardware => control |= ControlFlags::CRTSCTS,
            FlowControl::Software => input |= InputFlags::IXON | InputFlags::IXOFF,
        }

        block.control_flags = control;
        block.input_flags = input;
        block.output_flags = OutputFlags::empty();
        block.local_flags = LocalFlags::empty();
        block.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        block.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;

        let speed = baud_rate_constant(settings.effective_baud_rate());
        if let Err(e) = termios::cfsetspeed(block, speed) {
            warn!("cfsetspeed failed: {e}");
        }
    }

    fn flush(&self) -> io::Result<()> {
        Ok(termios::tcflush(&self.file, FlushArg::TCIOFLUSH)?)
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match (&self.file).read(buf) {
            Ok(n) => Ok(n),
            Err(e) if is_transient(&e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match (&self.file).write(buf) {
            Ok(n) => Ok(n),
            Err(e) if is_transient(&e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];

        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) | Err(Errno::EINTR) => Ok(false),
            Ok(_) => {
                let revents = fds[0]
                    .revents()
                    .unwrap_or(PollFlags::empty());
                if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL)
                {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        format!("device reported {revents:?}"),
                    ));
                }
                Ok(revents.contains(PollFlags::POLLIN))
            },
            Err(e) => Err(e.into()),
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Map a supported baud rate onto its termios constant.
fn baud_rate_constant(baud_rate: u32) -> BaudRate {
    match baud_rate {
        300 => BaudRate::B300,
        600 => BaudRate::B600,
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        _ => BaudRate::B19200,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceClass {
    Legacy,
    Usb,
}

fn classify(name: &str) -> Option<DeviceClass> {
    if USB_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(DeviceClass::Usb)
    } else if LEGACY_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(DeviceClass::Legacy)
    } else {
        None
    }
}

#[cfg(target_os = "linux")]
mod serial_info {
    /// Kernel `struct serial_struct` from `<linux/serial.h>`.
    #[repr(C)]
    #[derive(Debug, Default)]
    #[allow(dead_code)]
    pub struct SerialStruct {
        pub kind: i32,
        pub line: i32,
        pub port: u32,
        pub irq: i32,
        pub flags: i32,
        pub xmit_fifo_size: i32,
        pub custom_divisor: i32,
        pub baud_base: i32,
        pub close_delay: u16,
        pub io_type: u8,
        pub reserved_char: u8,
        pub hub6: i32,
        pub closing_wait: u16,
        pub closing_wait2: u16,
        pub iomem_base: usize,
        pub iomem_reg_shift: u16,
        pub port_high: u32,
        pub iomap_base: usize,
    }

    nix::ioctl_read_bad!(tiocgserial, nix::libc::TIOCGSERIAL, SerialStruct);
}

/// Ask the driver whether a UART is really behind the node.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn is_legacy_serial_port(path: &str) -> bool {
    use {
        serial_info::{SerialStruct, tiocgserial},
        std::os::fd::AsRawFd,
    };

    let file = match OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(open_flags())
        .open(path)
    {
        Ok(file) => file,
        Err(e) => {
            debug!("Cannot open port {path}: {e}");
            return false;
        },
    };

    let mut info = SerialStruct::default();
    // SAFETY: `info` matches the kernel layout and outlives the call; the fd is
    // open for the duration of the ioctl.
    match unsafe { tiocgserial(file.as_raw_fd(), &mut info) } {
        Ok(_) => info.port != 0,
        Err(e) => {
            debug!("Cannot get serial info for {path}: {e}");
            false
        },
    }
}

/// Without `TIOCGSERIAL` the best available check is whether the node opens.
#[cfg(not(target_os = "linux"))]
fn is_legacy_serial_port(path: &str) -> bool {
    match OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(open_flags())
        .open(path)
    {
        Ok(_) => true,
        Err(e) => {
            debug!("Cannot open port {path}: {e}");
            false
        },
    }
}

fn scan_device_dir(ports: &mut Vec<String>) {
    let entries = match fs::read_dir(DEVICE_DIR) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot read {DEVICE_DIR}: {e}");
            return;
        },
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let path = format!("{DEVICE_DIR}/{name}");

        match classify(name) {
            Some(DeviceClass::Usb) => ports.push(path),
            Some(DeviceClass::Legacy) => {
                if is_legacy_serial_port(&path) {
                    ports.push(path);
                }
            },
            None => {},
        }
    }
}

fn scan_by_id_dir(ports: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(BY_ID_DIR) else {
        return;
    };

    for entry in entries.flatten() {
        let link = entry.path();
        match fs::canonicalize(&link) {
            Ok(target) => ports.push(
                target
                    .to_string_lossy()
                    .into_owned(),
            ),
            Err(e) => debug!("Cannot resolve {}: {e}", link.display()),
        }
    }
}

/// Device-file enumerator for Unix hosts.
pub struct PosixPortEnumerator;

impl PortEnumerator for PosixPortEnumerator {
    fn enumerate() -> Vec<String> {
        let mut ports = Vec::new();
        scan_device_dir(&mut ports);
        scan_by_id_dir(&mut ports);
        trace!("Raw serial candidates: {ports:?}");
        ports
    }
}
