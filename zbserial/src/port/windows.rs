//! Windows serial backend: `DCB` control block, overlapped I/O.
//!
//! The port is opened with `FILE_FLAG_OVERLAPPED`. Reads and writes share one
//! manual-reset event; the watcher waits for `EV_RXCHAR` through
//! `WaitCommEvent` on a second event so both can be in flight at once.
//! A third event latches a stop request: the watcher waits on it together
//! with the comm event, so a close unblocks the watcher whether or not its
//! `WaitCommEvent` has been issued yet.
//!
//! Read timeouts are configured as "return whatever is buffered" and the
//! overlapped wait itself is `INFINITE`: a transfer that the driver leaves
//! pending blocks the caller until it completes.

#![allow(unsafe_code)]

use {
    crate::port::{FlowControl, Parity, PortEnumerator, PortHandle, SerialSettings},
    log::{trace, warn},
    std::{
        ffi::OsStr,
        fmt, io, iter, mem,
        os::windows::ffi::OsStrExt,
        ptr,
        time::Duration,
    },
    windows_sys::Win32::{
        Devices::Communication::{
            COMMTIMEOUTS, DCB, EV_RXCHAR, EVENPARITY, GetCommState, NOPARITY, ODDPARITY,
            ONESTOPBIT, PURGE_RXCLEAR, PURGE_TXCLEAR, PurgeComm, SetCommMask, SetCommState,
            SetCommTimeouts, WaitCommEvent,
        },
        Foundation::{
            BOOL, CloseHandle, ERROR_INSUFFICIENT_BUFFER, ERROR_IO_PENDING, FALSE, GENERIC_READ,
            GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE, TRUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
        },
        Storage::FileSystem::{
            CreateFileW, FILE_FLAG_OVERLAPPED, OPEN_EXISTING, QueryDosDeviceW, ReadFile, WriteFile,
        },
        System::{
            IO::{CancelIo, GetOverlappedResult, OVERLAPPED},
            Threading::{
                CreateEventW, INFINITE, ResetEvent, SetEvent, WaitForMultipleObjects,
                WaitForSingleObject,
            },
        },
    },
};

// DCB flag bitfield layout (winbase.h).
const F_BINARY: u32 = 1 << 0;
const F_PARITY: u32 = 1 << 1;
const F_OUTX_CTS_FLOW: u32 = 1 << 2;
const F_OUTX_DSR_FLOW: u32 = 1 << 3;
const DTR_CONTROL_SHIFT: u32 = 4;
const DTR_CONTROL_MASK: u32 = 0b11 << DTR_CONTROL_SHIFT;
const F_DSR_SENSITIVITY: u32 = 1 << 6;
const F_OUTX: u32 = 1 << 8;
const F_INX: u32 = 1 << 9;
const F_ERROR_CHAR: u32 = 1 << 10;
const F_NULL: u32 = 1 << 11;
const RTS_CONTROL_SHIFT: u32 = 12;
const RTS_CONTROL_MASK: u32 = 0b11 << RTS_CONTROL_SHIFT;
const F_ABORT_ON_ERROR: u32 = 1 << 14;
const CONTROL_HANDSHAKE: u32 = 2;

/// `WaitForMultipleObjects` result for the second handle, the stop event.
const STOP_SIGNALED: u32 = WAIT_OBJECT_0 + 1;

/// Initial `QueryDosDeviceW` buffer, in UTF-16 units.
const DOS_DEVICE_BUFFER: usize = 65535;
const DOS_DEVICE_BUFFER_MAX: usize = DOS_DEVICE_BUFFER * 16;

/// Copy of a port's `DCB`.
#[derive(Clone, Copy)]
pub struct CommState(pub DCB);

impl fmt::Debug for CommState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommState")
            .field("baud_rate", &self.0.BaudRate)
            .field("byte_size", &self.0.ByteSize)
            .field("parity", &self.0.Parity)
            .field("stop_bits", &self.0.StopBits)
            .field("flags", &format_args!("{:#06x}", self.0._bitfield))
            .finish()
    }
}

/// Serial port handle opened for overlapped I/O.
pub struct WindowsHandle {
    port: HANDLE,
    io_event: HANDLE,
    wait_event: HANDLE,
    /// Set once by [`PortHandle::interrupt_wait`]; never reset.
    stop_event: HANDLE,
}

// SAFETY: the handles are plain kernel object references. Transfers and the
// comm-event wait use separate events and separate OVERLAPPED structures, so
// the watcher thread and the owner never share per-call state.
unsafe impl Send for WindowsHandle {}
// SAFETY: see above.
unsafe impl Sync for WindowsHandle {}

impl Drop for WindowsHandle {
    fn drop(&mut self) {
        unsafe {
            if self.port != INVALID_HANDLE_VALUE {
                CloseHandle(self.port);
            }
            for event in [self.io_event, self.wait_event, self.stop_event] {
                if !event.is_null() {
                    CloseHandle(event);
                }
            }
        }
    }
}

fn to_wide(s: &str) -> Vec<u16> {
    OsStr::new(s)
        .encode_wide()
        .chain(iter::once(0))
        .collect()
}

/// `COM10` and above are only reachable through the device namespace.
fn device_path(identifier: &str) -> String {
    if identifier.starts_with(r"\\.\") {
        identifier.to_string()
    } else {
        format!(r"\\.\{identifier}")
    }
}

fn check(ok: BOOL) -> io::Result<()> {
    if ok == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn create_event() -> io::Result<HANDLE> {
    let event = unsafe { CreateEventW(ptr::null(), TRUE, FALSE, ptr::null()) };
    if event.is_null() {
        Err(io::Error::last_os_error())
    } else {
        Ok(event)
    }
}

fn is_pending(err: &io::Error) -> bool {
    err.raw_os_error() == Some(ERROR_IO_PENDING as i32)
}

/// Milliseconds for a bounded kernel wait. Never `INFINITE`.
fn wait_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis())
        .unwrap_or(u32::MAX)
        .min(INFINITE - 1)
}

fn overlapped_with(event: HANDLE) -> OVERLAPPED {
    let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
    overlapped.hEvent = event;
    overlapped
}

impl WindowsHandle {
    fn stop_requested(&self) -> bool {
        unsafe { WaitForSingleObject(self.stop_event, 0) == WAIT_OBJECT_0 }
    }

    /// Abandon a pending operation and wait until the OS lets go of `overlapped`.
    fn cancel_pending(&self, overlapped: &OVERLAPPED) {
        let mut ignored = 0u32;
        unsafe {
            CancelIo(self.port);
            GetOverlappedResult(self.port, overlapped, &mut ignored, TRUE);
        }
    }

    /// Complete an overlapped `ReadFile`/`WriteFile` started with `ok`.
    fn finish_transfer(
        &self,
        ok: BOOL,
        overlapped: &OVERLAPPED,
        transferred: u32,
    ) -> io::Result<usize> {
        if ok != 0 {
            return Ok(transferred as usize);
        }

        let err = io::Error::last_os_error();
        if !is_pending(&err) {
            return Err(err);
        }

        let mut transferred = 0u32;
        match unsafe { WaitForSingleObject(overlapped.hEvent, INFINITE) } {
            WAIT_OBJECT_0 => {
                check(unsafe {
                    GetOverlappedResult(self.port, overlapped, &mut transferred, TRUE)
                })?;
                Ok(transferred as usize)
            },
            WAIT_TIMEOUT => {
                self.cancel_pending(overlapped);
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "overlapped transfer timed out",
                ))
            },
            _ => {
                let err = io::Error::last_os_error();
                self.cancel_pending(overlapped);
                Err(err)
            },
        }
    }
}

impl PortHandle for WindowsHandle {
    type ControlBlock = CommState;

    fn open(identifier: &str) -> io::Result<Self> {
        let path = to_wide(&device_path(identifier));
        let port = unsafe {
            CreateFileW(
                path.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                0,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if port == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }

        // Drop releases whatever has been created so far.
        let mut handle = Self {
            port,
            io_event: ptr::null_mut(),
            wait_event: ptr::null_mut(),
            stop_event: ptr::null_mut(),
        };

        check(unsafe { SetCommMask(port, EV_RXCHAR) })?;

        let timeouts = COMMTIMEOUTS {
            ReadIntervalTimeout: u32::MAX,
            ReadTotalTimeoutMultiplier: 0,
            ReadTotalTimeoutConstant: 0,
            WriteTotalTimeoutMultiplier: 0,
            WriteTotalTimeoutConstant: 0,
        };
        check(unsafe { SetCommTimeouts(port, &timeouts) })?;

        handle.io_event = create_event()?;
        handle.wait_event = create_event()?;
        handle.stop_event = create_event()?;

        trace!("Opened {identifier}");
        Ok(handle)
    }

    fn read_control(&self) -> io::Result<CommState> {
        let mut dcb: DCB = unsafe { mem::zeroed() };
        dcb.DCBlength = u32::try_from(mem::size_of::<DCB>()).unwrap_or(u32::MAX);
        check(unsafe { GetCommState(self.port, &mut dcb) })?;
        Ok(CommState(dcb))
    }

    fn write_control(&self, block: &CommState) -> io::Result<()> {
        check(unsafe { SetCommState(self.port, &block.0) })
    }

    fn apply_settings(block: &mut CommState, settings: &SerialSettings) {
        let dcb = &mut block.0;

        dcb.BaudRate = settings.effective_baud_rate();
        dcb.ByteSize = u8::from(settings.data_bits);
        dcb.StopBits = ONESTOPBIT;
        dcb.Parity = match settings.parity {
            Parity::None => NOPARITY,
            Parity::Odd => ODDPARITY,
            Parity::Even => EVENPARITY,
        };

        let mut flags = dcb._bitfield;
        flags |= F_BINARY;
        flags &= !(F_PARITY | F_ERROR_CHAR | F_NULL | F_ABORT_ON_ERROR | F_DSR_SENSITIVITY);
        if settings.parity != Parity::None {
            flags |= F_PARITY;
        }

        flags &= !(F_OUTX_CTS_FLOW
            | F_OUTX_DSR_FLOW
            | DTR_CONTROL_MASK
            | F_OUTX
            | F_INX
            | RTS_CONTROL_MASK);
        match settings.flow_control {
            FlowControl::None => {},
            FlowControl::Hardware => {
                flags |= F_OUTX_CTS_FLOW
                    | F_OUTX_DSR_FLOW
                    | (CONTROL_HANDSHAKE << DTR_CONTROL_SHIFT)
                    | (CONTROL_HANDSHAKE << RTS_CONTROL_SHIFT);
            },
            FlowControl::Software => flags |= F_OUTX | F_INX,
        }
        dcb._bitfield = flags;
    }

    fn flush(&self) -> io::Result<()> {
        check(unsafe { PurgeComm(self.port, PURGE_RXCLEAR | PURGE_TXCLEAR) })
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        let mut overlapped = overlapped_with(self.io_event);
        let mut transferred = 0u32;
        let ok = unsafe {
            ReadFile(
                self.port,
                buf.as_mut_ptr(),
                len,
                &mut transferred,
                &mut overlapped,
            )
        };
        self.finish_transfer(ok, &overlapped, transferred)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        let mut overlapped = overlapped_with(self.io_event);
        let mut transferred = 0u32;
        let ok = unsafe {
            WriteFile(
                self.port,
                buf.as_ptr(),
                len,
                &mut transferred,
                &mut overlapped,
            )
        };
        self.finish_transfer(ok, &overlapped, transferred)
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        if self.stop_requested() {
            return Ok(false);
        }
        unsafe { ResetEvent(self.wait_event) };

        let mut mask = 0u32;
        let mut overlapped = overlapped_with(self.wait_event);
        if unsafe { WaitCommEvent(self.port, &mut mask, &mut overlapped) } == 0 {
            let err = io::Error::last_os_error();
            if !is_pending(&err) {
                return Err(err);
            }

            let events = [self.wait_event, self.stop_event];
            match unsafe { WaitForMultipleObjects(2, events.as_ptr(), FALSE, wait_millis(timeout)) }
            {
                WAIT_OBJECT_0 => {},
                STOP_SIGNALED | WAIT_TIMEOUT => {
                    self.cancel_pending(&overlapped);
                    return Ok(false);
                },
                _ => {
                    let err = io::Error::last_os_error();
                    self.cancel_pending(&overlapped);
                    return Err(err);
                },
            }

            let mut ignored = 0u32;
            check(unsafe { GetOverlappedResult(self.port, &overlapped, &mut ignored, FALSE) })?;
        }

        Ok(mask & EV_RXCHAR != 0)
    }

    fn interrupt_wait(&self) -> io::Result<()> {
        check(unsafe { SetEvent(self.stop_event) })?;
        check(unsafe { SetCommMask(self.port, EV_RXCHAR) })
    }
}

/// Split a `REG_MULTI_SZ`-style buffer into its strings.
fn split_multi_sz(buf: &[u16]) -> Vec<String> {
    buf.split(|&unit| unit == 0)
        .filter(|s| !s.is_empty())
        .map(String::from_utf16_lossy)
        .collect()
}

/// `COM<number>` exactly.
fn is_com_port(name: &str) -> bool {
    name.strip_prefix("COM")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

fn query_dos_devices() -> io::Result<Vec<String>> {
    let mut capacity = DOS_DEVICE_BUFFER;
    loop {
        let mut buf = vec![0u16; capacity];
        let len = unsafe {
            QueryDosDeviceW(
                ptr::null(),
                buf.as_mut_ptr(),
                u32::try_from(buf.len()).unwrap_or(u32::MAX),
            )
        };
        if len == 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(ERROR_INSUFFICIENT_BUFFER as i32)
                && capacity < DOS_DEVICE_BUFFER_MAX
            {
                capacity *= 2;
                continue;
            }
            return Err(err);
        }
        buf.truncate(len as usize);
        return Ok(split_multi_sz(&buf));
    }
}

/// DOS device table enumerator for Windows hosts.
pub struct WindowsPortEnumerator;

impl PortEnumerator for WindowsPortEnumerator {
    fn enumerate() -> Vec<String> {
        match query_dos_devices() {
            Ok(names) => names
                .into_iter()
                .filter(|name| is_com_port(name))
                .collect(),
            Err(e) => {
                warn!("Cannot query DOS device names: {e}");
                Vec::new()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_state() -> CommState {
        CommState(unsafe { mem::zeroed() })
    }

    #[test]
    fn test_is_com_port() {
        assert!(is_com_port("COM1"));
        assert!(is_com_port("COM256"));
        assert!(!is_com_port("COM"));
        assert!(!is_com_port("COMx"));
        assert!(!is_com_port("LPT1"));
        assert!(!is_com_port("com3"));
    }

    #[test]
    fn test_split_multi_sz() {
        let raw: Vec<u16> = "COM1\0LPT1\0COM10\0\0".encode_utf16().collect();
        assert_eq!(split_multi_sz(&raw), vec!["COM1", "LPT1", "COM10"]);
    }

    #[test]
    fn test_device_path() {
        assert_eq!(device_path("COM12"), r"\\.\COM12");
        assert_eq!(device_path(r"\\.\COM3"), r"\\.\COM3");
    }

    #[test]
    fn test_apply_settings_line() {
        let mut state = blank_state();
        let settings = SerialSettings::new(9600).with_parity(Parity::Odd);
        WindowsHandle::apply_settings(&mut state, &settings);

        assert_eq!(state.0.BaudRate, 9600);
        assert_eq!(state.0.ByteSize, 8);
        assert_eq!(state.0.Parity, ODDPARITY);
        assert_eq!(state.0.StopBits, ONESTOPBIT);
        assert_ne!(state.0._bitfield & F_BINARY, 0);
        assert_ne!(state.0._bitfield & F_PARITY, 0);
    }

    #[test]
    fn test_apply_settings_flow_groups_are_exclusive() {
        let mut state = blank_state();
        let hardware = SerialSettings::default().with_flow_control(FlowControl::Hardware);
        WindowsHandle::apply_settings(&mut state, &hardware);
        assert_ne!(state.0._bitfield & F_OUTX_CTS_FLOW, 0);
        assert_eq!(state.0._bitfield & (F_OUTX | F_INX), 0);

        let software = SerialSettings::default().with_flow_control(FlowControl::Software);
        WindowsHandle::apply_settings(&mut state, &software);
        assert_eq!(state.0._bitfield & (F_OUTX_CTS_FLOW | F_OUTX_DSR_FLOW), 0);
        assert_eq!(state.0._bitfield & (DTR_CONTROL_MASK | RTS_CONTROL_MASK), 0);
        assert_eq!(state.0._bitfield & (F_OUTX | F_INX), F_OUTX | F_INX);

        let none = SerialSettings::default();
        WindowsHandle::apply_settings(&mut state, &none);
        assert_eq!(state.0._bitfield & !(F_BINARY), 0);
    }

    #[test]
    fn test_wait_millis_is_bounded() {
        assert_eq!(wait_millis(Duration::from_millis(250)), 250);
        assert_eq!(wait_millis(Duration::from_secs(u64::MAX)), INFINITE - 1);
    }

    #[test]
    fn test_stop_before_wait_is_not_lost() {
        let handle = WindowsHandle {
            port: INVALID_HANDLE_VALUE,
            io_event: create_event().unwrap(),
            wait_event: create_event().unwrap(),
            stop_event: create_event().unwrap(),
        };
        assert!(!handle.stop_requested());

        // The comm mask cannot be set on a missing port; the stop still latches.
        let _ = handle.interrupt_wait();
        assert!(handle.stop_requested());
        assert!(!handle.wait_readable(Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn test_unsupported_baud_rate_programs_fallback() {
        let mut state = blank_state();
        WindowsHandle::apply_settings(&mut state, &SerialSettings {
            baud_rate: 250000,
            ..Default::default()
        });
        assert_eq!(state.0.BaudRate, 19200);
    }
}
