//! Platform serial backends.
//!
//! Everything OS specific lives behind two traits:
//!
//! - [`PortHandle`]: one open OS serial handle together with its control block
//!   (termios on Unix, `DCB` on Windows).
//! - [`PortEnumerator`]: a snapshot of the serial device identifiers on the host.
//!
//! ```text
//! +--------------------------+
//! |        SerialPort        |   lifecycle, notifications, debug trace
//! +------------+-------------+
//!              |
//!              v
//! +------------+-------------+
//! |     PortHandle trait     |
//! +------------+-------------+
//!              |
//!     +--------+---------+
//!     v                  v
//! +---+----------+  +----+-----------+
//! | PosixHandle  |  | WindowsHandle  |
//! | termios+poll |  | DCB+overlapped |
//! +--------------+  +----------------+
//! ```
//!
//! The implementation for the build host is exported as [`NativeHandle`] and
//! [`NativePortEnumerator`].

#[cfg(unix)]
pub mod posix;

#[cfg(windows)]
pub mod windows;

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// Baud rates the control block can be programmed with.
pub const SUPPORTED_BAUD_RATES: [u32; 10] = [
    300, 600, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200,
];

/// Rate used when an unsupported baud rate is requested.
pub const FALLBACK_BAUD_RATE: u32 = 19200;

/// Map a requested baud rate onto the supported set.
///
/// Unsupported values fall back to [`FALLBACK_BAUD_RATE`].
pub fn normalize_baud_rate(baud_rate: u32) -> u32 {
    if SUPPORTED_BAUD_RATES.contains(&baud_rate) {
        baud_rate
    } else {
        FALLBACK_BAUD_RATE
    }
}

/// Serial line settings.
///
/// The default is 19200 baud, 8 data bits, no parity, no flow control. One stop
/// bit is always used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    /// Baud rate, always a member of [`SUPPORTED_BAUD_RATES`] once normalized.
    pub baud_rate: u32,
    /// Data bits.
    pub data_bits: DataBits,
    /// Parity.
    pub parity: Parity,
    /// Flow control.
    pub flow_control: FlowControl,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: FALLBACK_BAUD_RATE,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialSettings {
    /// Create settings with the given baud rate and defaults for the rest.
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate: normalize_baud_rate(baud_rate),
            ..Default::default()
        }
    }

    /// Set the data bits.
    #[must_use]
    pub fn with_data_bits(mut self, data_bits: DataBits) -> Self {
        self.data_bits = data_bits;
        self
    }

    /// Set the parity.
    #[must_use]
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Set the flow control.
    #[must_use]
    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Baud rate that will actually be programmed.
    pub fn effective_baud_rate(&self) -> u32 {
        normalize_baud_rate(self.baud_rate)
    }
}

impl fmt::Display for SerialSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}{}1 flow={}",
            self.effective_baud_rate(),
            u8::from(self.data_bits),
            self.parity.code(),
            self.flow_control
        )
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 5 data bits.
    Five,
    /// 6 data bits.
    Six,
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

impl TryFrom<u8> for DataBits {
    type Error = Error;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            5 => Ok(Self::Five),
            6 => Ok(Self::Six),
            7 => Ok(Self::Seven),
            8 => Ok(Self::Eight),
            other => Err(Error::InvalidDataBits(other)),
        }
    }
}

impl From<DataBits> for u8 {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

impl Parity {
    /// Single-letter code as used in "8N1" notation.
    pub fn code(self) -> char {
        match self {
            Self::None => 'N',
            Self::Odd => 'O',
            Self::Even => 'E',
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Odd => "odd",
            Self::Even => "even",
        })
    }
}

impl FromStr for Parity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            other => Err(format!("unknown parity '{other}' (expected none, odd or even)")),
        }
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No handshake; modem control lines are ignored.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
    /// Software flow control (XON/XOFF).
    Software,
}

impl fmt::Display for FlowControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Hardware => "hardware",
            Self::Software => "xonxoff",
        })
    }
}

impl FromStr for FlowControl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "hardware" | "rtscts" => Ok(Self::Hardware),
            "software" | "xonxoff" => Ok(Self::Software),
            other => Err(format!(
                "unknown flow control '{other}' (expected none, hardware or xonxoff)"
            )),
        }
    }
}

/// One open OS serial handle.
///
/// All transfer methods take `&self`: the watcher thread polls readiness while
/// the owner reads and writes through the same handle. The handle is released
/// when the value is dropped.
pub trait PortHandle: Send + Sync + Sized + 'static {
    /// OS control block holding the line settings.
    type ControlBlock: Clone + Send + fmt::Debug;

    /// Acquire the handle for `identifier` in read/write, non-blocking or
    /// overlapped-capable mode.
    fn open(identifier: &str) -> io::Result<Self>;

    /// Read the control block currently programmed into the handle.
    fn read_control(&self) -> io::Result<Self::ControlBlock>;

    /// Push a control block to the handle.
    fn write_control(&self, block: &Self::ControlBlock) -> io::Result<()>;

    /// Edit `block` in place so it encodes `settings` in raw mode.
    ///
    /// Fields unrelated to the line settings are left as they are.
    fn apply_settings(block: &mut Self::ControlBlock, settings: &SerialSettings);

    /// Discard pending input and output in the OS buffers.
    fn flush(&self) -> io::Result<()>;

    /// One OS-level read. Returns `Ok(0)` when nothing is buffered.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// One OS-level write. May transfer fewer bytes than requested.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Block until the handle is readable.
    ///
    /// Returns `Ok(false)` when `timeout` elapsed or the wait was interrupted
    /// by [`PortHandle::interrupt_wait`]. Backends with an immediately
    /// cancellable wait may ignore `timeout`.
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool>;

    /// Wake a thread blocked in [`PortHandle::wait_readable`], if the
    /// platform supports it.
    fn interrupt_wait(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Trait for listing serial device identifiers on the host.
///
/// This is separated from [`PortHandle`] because it's a static operation that
/// doesn't require an open port instance.
pub trait PortEnumerator {
    /// Raw candidate identifiers, in discovery order, possibly with duplicates.
    ///
    /// Never fails: a source that cannot be read contributes nothing.
    fn enumerate() -> Vec<String>;
}

/// Format bytes as space-separated lowercase hex pairs.
pub fn format_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(unix)]
pub use posix::{PosixHandle as NativeHandle, PosixPortEnumerator as NativePortEnumerator};

#[cfg(windows)]
pub use windows::{WindowsHandle as NativeHandle, WindowsPortEnumerator as NativePortEnumerator};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_baud_rates_pass_through() {
        for rate in SUPPORTED_BAUD_RATES {
            assert_eq!(normalize_baud_rate(rate), rate);
        }
    }

    #[test]
    fn test_unsupported_baud_rate_falls_back() {
        assert_eq!(normalize_baud_rate(0), 19200);
        assert_eq!(normalize_baud_rate(1), 19200);
        assert_eq!(normalize_baud_rate(921600), 19200);
        assert_eq!(normalize_baud_rate(9601), 19200);
    }

    #[test]
    fn test_serial_settings_default() {
        let settings = SerialSettings::default();
        assert_eq!(settings.baud_rate, 19200);
        assert_eq!(settings.data_bits, DataBits::Eight);
        assert_eq!(settings.parity, Parity::None);
        assert_eq!(settings.flow_control, FlowControl::None);
    }

    #[test]
    fn test_serial_settings_builder() {
        let settings = SerialSettings::new(9600)
            .with_data_bits(DataBits::Seven)
            .with_parity(Parity::Even)
            .with_flow_control(FlowControl::Hardware);

        assert_eq!(settings.baud_rate, 9600);
        assert_eq!(settings.data_bits, DataBits::Seven);
        assert_eq!(settings.parity, Parity::Even);
        assert_eq!(settings.flow_control, FlowControl::Hardware);
        assert_eq!(settings.to_string(), "9600 7E1 flow=hardware");
    }

    #[test]
    fn test_serial_settings_new_normalizes() {
        assert_eq!(SerialSettings::new(12345).baud_rate, 19200);
    }

    #[test]
    fn test_data_bits_try_from() {
        assert_eq!(DataBits::try_from(5).ok(), Some(DataBits::Five));
        assert_eq!(DataBits::try_from(8).ok(), Some(DataBits::Eight));
        assert!(matches!(
            DataBits::try_from(4),
            Err(Error::InvalidDataBits(4))
        ));
        assert!(matches!(
            DataBits::try_from(9),
            Err(Error::InvalidDataBits(9))
        ));
    }

    #[test]
    fn test_parity_and_flow_parse() {
        assert_eq!("EVEN".parse::<Parity>(), Ok(Parity::Even));
        assert_eq!("n".parse::<Parity>(), Ok(Parity::None));
        assert!("mark".parse::<Parity>().is_err());

        assert_eq!("rtscts".parse::<FlowControl>(), Ok(FlowControl::Hardware));
        assert_eq!("xonxoff".parse::<FlowControl>(), Ok(FlowControl::Software));
        assert!("dsr".parse::<FlowControl>().is_err());
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[]), "");
        assert_eq!(format_hex(&[0x01, 0x02, 0x03]), "01 02 03");
        assert_eq!(format_hex(&[0x7e, 0xff, 0x00]), "7e ff 00");
    }
}
