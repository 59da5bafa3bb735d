//! # zbserial
//!
//! Cross-platform asynchronous serial ports for talking to ZigBee radios.
//!
//! This crate provides:
//!
//! - Serial device discovery in natural order ([`discover_ports`])
//! - A [`SerialPort`] with an explicit open/close lifecycle that restores the
//!   device's original line settings on close
//! - A background watcher that raises [`PortEvent::DataAvailable`] when input
//!   is pending, leaving the read itself to the caller
//! - Port lifecycle notifications (opened, closed, error)
//!
//! ## Supported Platforms
//!
//! - **Unix**: termios + `poll(2)` (Linux, macOS, BSDs)
//! - **Windows**: `DCB` + overlapped I/O
//!
//! ## Example
//!
//! ```rust,no_run
//! use {
//!     std::time::Duration,
//!     zbserial::{Parity, PortEvent, SerialPort, discover_ports},
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let Some(identifier) = discover_ports().into_iter().next() else {
//!         return Ok(());
//!     };
//!
//!     let mut port = SerialPort::new(identifier);
//!     port.set_baud_rate(9600)?;
//!     port.set_parity(Parity::None)?;
//!     port.set_debug_logging(true);
//!
//!     let events = port.events();
//!     port.open()?;
//!     port.write(&[0x01, 0x02, 0x03])?;
//!
//!     while let Ok(event) = events.recv_timeout(Duration::from_millis(500)) {
//!         if event == PortEvent::DataAvailable {
//!             let mut buf = [0u8; 64];
//!             let n = port.read(&mut buf)?;
//!             println!("received {n} bytes");
//!             break;
//!         }
//!     }
//!
//!     port.close()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod events;
pub mod host;
pub mod natural;
pub mod port;
pub mod serial;
mod watcher;

pub use {
    error::{Error, Result},
    events::{ListenerId, Notifier, PortEvent},
    host::{discover_ports, discover_with, sort_ports},
    natural::natural_cmp,
    port::{
        DataBits, FALLBACK_BAUD_RATE, FlowControl, NativeHandle, NativePortEnumerator, Parity,
        PortEnumerator, PortHandle, SUPPORTED_BAUD_RATES, SerialSettings, format_hex,
        normalize_baud_rate,
    },
    serial::SerialPort,
};
