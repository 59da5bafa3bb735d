//! Serial port lifecycle.
//!
//! [`SerialPort`] owns the configuration of one serial device and, while
//! open, the OS handle, the control block snapshot taken at open time and the
//! watcher thread. Every open is paired with a close that restores the
//! snapshot, whether the close is explicit, forced by a failed transfer or
//! wait, or triggered by dropping the port.

use {
    crate::{
        error::{Error, Result},
        events::{ListenerId, Notifier, PortEvent},
        port::{
            DataBits, FlowControl, NativeHandle, Parity, PortHandle, SerialSettings, format_hex,
            normalize_baud_rate,
        },
        watcher::{Relay, Session, Signal, Watcher},
    },
    log::{debug, info, warn},
    std::{
        fmt, io,
        sync::{
            Arc, Mutex, MutexGuard, PoisonError,
            atomic::{AtomicBool, Ordering},
            mpsc::Receiver,
        },
    },
};

/// Resources held while the port is open.
struct Link<H: PortHandle> {
    identifier: String,
    handle: Arc<H>,
    /// Control block found on the device at open time.
    saved: H::ControlBlock,
    /// Control block currently programmed.
    active: H::ControlBlock,
    session: Arc<Session>,
    watcher: Watcher,
}

/// State reachable from both the owner and the watcher thread.
struct Shared<H: PortHandle> {
    notifier: Notifier,
    debug: AtomicBool,
    link: Mutex<Option<Link<H>>>,
}

impl<H: PortHandle> Shared<H> {
    fn new() -> Self {
        Self {
            notifier: Notifier::new(),
            debug: AtomicBool::new(false),
            link: Mutex::new(None),
        }
    }

    fn debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    fn lock_link(&self) -> MutexGuard<'_, Option<Link<H>>> {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Detach the link if it still belongs to `session`.
    fn take_session(&self, session: &Arc<Session>) -> Option<Link<H>> {
        self.lock_link()
            .take_if(|link| Arc::ptr_eq(&link.session, session))
    }

    /// Raise the error notification once, then close the session if nobody
    /// else has.
    fn fail_session(&self, session: &Arc<Session>) {
        let link = self.take_session(session);
        if session.mark_failed() {
            self.notifier.emit(PortEvent::Error);
        }
        if let Some(link) = link {
            let _ = self.shutdown(link);
        }
    }

    /// Stop the watcher, restore the snapshot, flush and release the handle.
    fn shutdown(&self, link: Link<H>) -> Result<()> {
        let Link {
            identifier,
            handle,
            saved,
            watcher,
            ..
        } = link;

        watcher.stop(&*handle);

        let restored = handle.write_control(&saved);
        if let Err(e) = &restored {
            warn!("Cannot restore settings of {identifier}: {e}");
        }
        if let Err(e) = handle.flush() {
            debug!("Flush on close of {identifier} failed: {e}");
        }
        drop(handle);

        if self.debug() {
            info!("Port closed.");
        }
        debug!("Closed {identifier}");
        self.notifier.emit(PortEvent::Closed);
        restored.map_err(Error::Io)
    }
}

/// An asynchronous serial port.
///
/// Reads and writes are performed by the owner. A background watcher raises
/// [`PortEvent::DataAvailable`] when input is pending; subscribe with
/// [`SerialPort::subscribe`] or take a channel with [`SerialPort::events`].
///
/// If waiting on the device fails, the watcher raises [`PortEvent::Error`]
/// and closes the port itself, so [`PortEvent::Closed`] follows without any
/// further call from the owner.
///
/// ```rust,no_run
/// use {
///     std::{sync::mpsc::RecvTimeoutError, time::Duration},
///     zbserial::{PortEvent, SerialPort},
/// };
///
/// let mut port = SerialPort::new("/dev/ttyUSB0");
/// port.set_baud_rate(115200)?;
/// let events = port.events();
/// port.open()?;
/// port.write(&[0x01, 0x02, 0x03])?;
///
/// let mut buf = [0u8; 256];
/// loop {
///     match events.recv_timeout(Duration::from_secs(1)) {
///         Ok(PortEvent::DataAvailable) => {
///             let n = port.read(&mut buf)?;
///             println!("{:02x?}", &buf[..n]);
///         },
///         Ok(PortEvent::Error | PortEvent::Closed) => break,
///         Ok(PortEvent::Opened) => {},
///         Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// # Ok::<(), zbserial::Error>(())
/// ```
pub struct SerialPort<H: PortHandle = NativeHandle> {
    identifier: String,
    settings: SerialSettings,
    shared: Arc<Shared<H>>,
}

impl<H: PortHandle> fmt::Debug for SerialPort<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialPort")
            .field("identifier", &self.identifier)
            .field("settings", &self.settings)
            .field("debug", &self.debug_logging())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl SerialPort {
    /// Create a closed port for `identifier` with default settings.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self::with_backend(identifier, SerialSettings::default())
    }

    /// Create a closed port for `identifier` with the given settings.
    pub fn with_settings(identifier: impl Into<String>, settings: SerialSettings) -> Self {
        Self::with_backend(identifier, settings)
    }
}

impl<H: PortHandle> SerialPort<H> {
    /// Create a closed port that will open `identifier` through `H`.
    pub fn with_backend(identifier: impl Into<String>, settings: SerialSettings) -> Self {
        Self {
            identifier: identifier.into(),
            settings: SerialSettings {
                baud_rate: settings.effective_baud_rate(),
                ..settings
            },
            shared: Arc::new(Shared::new()),
        }
    }

    /// Device identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Change the device identifier. Ignored while the port is open.
    pub fn set_identifier(&mut self, identifier: impl Into<String>) {
        self.reap_failed();
        if self.shared.lock_link().is_some() {
            debug!("Ignoring identifier change while {} is open", self.identifier);
            return;
        }
        self.identifier = identifier.into();
    }

    /// Current line settings.
    pub fn settings(&self) -> SerialSettings {
        self.settings
    }

    /// Replace all line settings, reapplying them if the port is open.
    pub fn set_settings(&mut self, settings: SerialSettings) -> Result<()> {
        self.settings = SerialSettings {
            baud_rate: settings.effective_baud_rate(),
            ..settings
        };
        self.reconfigure()
    }

    /// Baud rate. Always a supported rate.
    pub fn baud_rate(&self) -> u32 {
        self.settings.baud_rate
    }

    /// Set the baud rate. Unsupported rates are replaced by 19200.
    pub fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        let normalized = normalize_baud_rate(baud_rate);
        if normalized != baud_rate {
            debug!("Unsupported baud rate {baud_rate}, using {normalized}");
        }
        self.settings.baud_rate = normalized;
        self.reconfigure()
    }

    /// Data bits.
    pub fn data_bits(&self) -> DataBits {
        self.settings.data_bits
    }

    /// Set the data bits. Values outside 5..=8 are rejected and leave the
    /// current setting unchanged.
    pub fn set_data_bits(&mut self, data_bits: u8) -> Result<()> {
        let data_bits = DataBits::try_from(data_bits)?;
        self.settings.data_bits = data_bits;
        self.reconfigure()
    }

    /// Parity.
    pub fn parity(&self) -> Parity {
        self.settings.parity
    }

    /// Set the parity.
    pub fn set_parity(&mut self, parity: Parity) -> Result<()> {
        self.settings.parity = parity;
        self.reconfigure()
    }

    /// Flow control.
    pub fn flow_control(&self) -> FlowControl {
        self.settings.flow_control
    }

    /// Set the flow control.
    pub fn set_flow_control(&mut self, flow_control: FlowControl) -> Result<()> {
        self.settings.flow_control = flow_control;
        self.reconfigure()
    }

    /// Whether transfers and lifecycle changes are traced through `log`.
    pub fn debug_logging(&self) -> bool {
        self.shared.debug()
    }

    /// Enable or disable the transfer trace.
    pub fn set_debug_logging(&mut self, enabled: bool) {
        self.shared
            .debug
            .store(enabled, Ordering::Relaxed);
    }

    /// Whether the port is open.
    ///
    /// Turns `false` as soon as a failure has been detected, even while the
    /// close sequence is still running.
    pub fn is_open(&self) -> bool {
        self.shared
            .lock_link()
            .as_ref()
            .is_some_and(|link| !link.session.has_failed())
    }

    /// Register `callback` for `event`.
    ///
    /// `DataAvailable`, and the `Error` and `Closed` raised by a failed wait,
    /// are delivered on the watcher thread.
    pub fn subscribe<F>(&self, event: PortEvent, callback: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared
            .notifier
            .subscribe(event, callback)
    }

    /// Remove a callback registered with [`SerialPort::subscribe`].
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.shared.notifier.unsubscribe(id)
    }

    /// Receive every event of this port on a channel.
    pub fn events(&self) -> Receiver<PortEvent> {
        self.shared.notifier.channel()
    }

    /// Open the port.
    ///
    /// Any previous session is closed first. On failure the port stays closed
    /// and no notification is raised.
    pub fn open(&mut self) -> Result<()> {
        if let Err(e) = self.close() {
            warn!("Closing previous session of {} failed: {e}", self.identifier);
        }

        let open_failure = |port: &str, source: io::Error| {
            warn!("Cannot open {port}: {source}");
            Error::OpenFailure {
                port: port.to_string(),
                source,
            }
        };

        let handle = H::open(&self.identifier).map_err(|e| open_failure(&self.identifier, e))?;
        let saved = handle
            .read_control()
            .map_err(|e| open_failure(&self.identifier, e))?;

        let mut active = saved.clone();
        H::apply_settings(&mut active, &self.settings);
        if let Err(e) = handle
            .write_control(&active)
            .and_then(|()| handle.flush())
        {
            restore(&handle, &saved);
            return Err(open_failure(&self.identifier, e));
        }

        let handle = Arc::new(handle);
        let session = Session::new();

        // Held across the spawn so a failing first wait cannot miss the link.
        let mut slot = self.shared.lock_link();
        let watcher = match Watcher::spawn(
            &self.identifier,
            Arc::clone(&handle),
            Arc::clone(&session),
            self.relay(&session),
        ) {
            Ok(watcher) => watcher,
            Err(e) => {
                drop(slot);
                warn!("Cannot start watcher for {}: {e}", self.identifier);
                restore(&*handle, &saved);
                return Err(Error::Io(e));
            },
        };

        *slot = Some(Link {
            identifier: self.identifier.clone(),
            handle,
            saved,
            active,
            session,
            watcher,
        });

        if self.debug_logging() {
            info!("Port opened.");
        }
        debug!("Opened {} at {}", self.identifier, self.settings);
        // Still under the lock: a watcher failure reports after this.
        self.shared
            .notifier
            .emit(PortEvent::Opened);
        drop(slot);
        Ok(())
    }

    /// Close the port. Closing a closed port does nothing.
    ///
    /// The close always completes; an error only reports that the control
    /// block snapshot could not be written back.
    pub fn close(&mut self) -> Result<()> {
        let link = self.shared.lock_link().take();
        match link {
            Some(link) => self.shared.shutdown(link),
            None => Ok(()),
        }
    }

    /// Read whatever is buffered, up to `buf.len()` bytes, in one OS call.
    ///
    /// A failed read closes the port after raising [`PortEvent::Error`].
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let (handle, session) = self.transfer_target()?;

        // Re-arm before reading so input arriving during the read is reported.
        session.arm();
        let result = handle.read(buf);
        drop(handle);

        match result {
            Ok(n) => {
                if self.debug_logging() && n > 0 {
                    info!("Read: {}", format_hex(&buf[..n]));
                }
                Ok(n)
            },
            Err(e) => Err(self.fail(&session, e)),
        }
    }

    /// Write up to `buf.len()` bytes in one OS call and return how many were
    /// accepted.
    ///
    /// A failed write closes the port after raising [`PortEvent::Error`].
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let (handle, session) = self.transfer_target()?;

        let result = handle.write(buf);
        drop(handle);

        match result {
            Ok(n) => {
                if self.debug_logging() && n > 0 {
                    info!("Write: {}", format_hex(&buf[..n]));
                }
                Ok(n)
            },
            Err(e) => Err(self.fail(&session, e)),
        }
    }

    /// Handle and session of the open link, without holding the lock during
    /// the transfer.
    fn transfer_target(&mut self) -> Result<(Arc<H>, Arc<Session>)> {
        self.reap_failed();
        let slot = self.shared.lock_link();
        let link = slot.as_ref().ok_or(Error::NotOpen)?;
        Ok((Arc::clone(&link.handle), Arc::clone(&link.session)))
    }

    fn relay(&self, session: &Arc<Session>) -> Relay {
        let shared = Arc::clone(&self.shared);
        let session = Arc::clone(session);
        Box::new(move |signal| match signal {
            Signal::DataReady => shared
                .notifier
                .emit(PortEvent::DataAvailable),
            Signal::WaitFailed => shared.fail_session(&session),
        })
    }

    fn reconfigure(&mut self) -> Result<()> {
        self.reap_failed();
        self.configure()
    }

    /// Program the current settings into the open handle.
    ///
    /// The stored settings are kept even if the OS rejects them.
    fn configure(&mut self) -> Result<()> {
        let mut slot = self.shared.lock_link();
        let Some(link) = slot.as_mut() else {
            return Ok(());
        };

        H::apply_settings(&mut link.active, &self.settings);
        link.handle.write_control(&link.active).map_err(|e| {
            warn!(
                "Cannot apply {} to {}: {e}",
                self.settings, self.identifier
            );
            Error::Configure(e)
        })
    }

    fn fail(&self, session: &Arc<Session>, error: io::Error) -> Error {
        warn!("Transfer on {} failed: {error}", self.identifier);
        self.shared.fail_session(session);
        Error::Transfer(error)
    }

    /// Finish closing a session that failed while its close was in flight.
    fn reap_failed(&mut self) {
        let link = self
            .shared
            .lock_link()
            .take_if(|link| link.session.has_failed());
        if let Some(link) = link {
            let _ = self.shared.shutdown(link);
        }
    }
}

impl<H: PortHandle> Drop for SerialPort<H> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("Close on drop failed: {e}");
        }
    }
}

fn restore<H: PortHandle>(handle: &H, saved: &H::ControlBlock) {
    if let Err(e) = handle.write_control(saved) {
        warn!("Cannot restore settings: {e}");
    }
}
