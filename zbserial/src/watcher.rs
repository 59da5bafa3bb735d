//! Readiness watcher thread.
//!
//! One watcher runs per open port. It only waits for the handle to become
//! readable and passes that on; reading is left to the port's owner.

use {
    crate::port::PortHandle,
    log::{debug, warn},
    std::{
        io,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// Upper bound on how long a stop request can go unnoticed on backends
/// without a cancellable wait.
pub(crate) const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause while input is pending but the last notification is still unread.
const IDLE_BACKOFF: Duration = Duration::from_millis(10);

/// What the watcher observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// The handle is readable.
    DataReady,
    /// Waiting on the handle failed; the watcher has stopped.
    WaitFailed,
}

/// Receives watcher signals on the watcher thread.
pub(crate) type Relay = Box<dyn Fn(Signal) + Send>;

/// State shared between one open session and its watcher.
#[derive(Debug)]
pub(crate) struct Session {
    running: AtomicBool,
    failed: AtomicBool,
    armed: AtomicBool,
}

impl Session {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(true),
            failed: AtomicBool::new(false),
            armed: AtomicBool::new(true),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Flag the session as failed. Returns `true` for the first caller only.
    pub(crate) fn mark_failed(&self) -> bool {
        !self.failed.swap(true, Ordering::SeqCst)
    }

    /// Allow the next readiness to be reported.
    pub(crate) fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    fn take_armed(&self) -> bool {
        self.armed.swap(false, Ordering::SeqCst)
    }
}

/// Running watcher thread.
#[derive(Debug)]
pub(crate) struct Watcher {
    session: Arc<Session>,
    thread: Option<JoinHandle<()>>,
}

impl Watcher {
    pub(crate) fn spawn<H: PortHandle>(
        identifier: &str,
        handle: Arc<H>,
        session: Arc<Session>,
        relay: Relay,
    ) -> io::Result<Self> {
        let shared = Arc::clone(&session);
        let thread = thread::Builder::new()
            .name(format!("watch {identifier}"))
            .spawn(move || run(&*handle, &shared, &relay))?;

        Ok(Self {
            session,
            thread: Some(thread),
        })
    }

    /// Stop the loop and wait for the thread to exit.
    ///
    /// Called from the watcher thread itself (a callback closing the port),
    /// the thread is detached instead and exits on its next iteration.
    pub(crate) fn stop<H: PortHandle>(mut self, handle: &H) {
        self.session.running.store(false, Ordering::SeqCst);
        if let Err(e) = handle.interrupt_wait() {
            debug!("Cannot interrupt watcher wait: {e}");
        }

        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            debug!("Watcher stopped from its own thread, detaching");
            return;
        }
        if thread.join().is_err() {
            warn!("Watcher thread panicked");
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.session.running.store(false, Ordering::SeqCst);
    }
}

fn run<H: PortHandle>(handle: &H, session: &Session, relay: &Relay) {
    debug!("Watcher started");

    while session.is_running() && !session.has_failed() {
        match handle.wait_readable(POLL_TIMEOUT) {
            Ok(false) => {},
            Ok(true) => {
                if session.take_armed() {
                    relay(Signal::DataReady);
                } else {
                    thread::sleep(IDLE_BACKOFF);
                }
            },
            Err(e) => {
                if session.is_running() {
                    warn!("Watcher wait failed: {e}");
                    relay(Signal::WaitFailed);
                }
                break;
            },
        }
    }

    debug!("Watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_failed_reports_first_caller_only() {
        let session = Session::new();
        assert!(!session.has_failed());
        assert!(session.mark_failed());
        assert!(!session.mark_failed());
        assert!(session.has_failed());
    }

    #[test]
    fn test_armed_is_consumed_once() {
        let session = Session::new();
        assert!(session.take_armed());
        assert!(!session.take_armed());
        session.arm();
        assert!(session.take_armed());
    }

    #[test]
    fn test_dropping_watcher_clears_running() {
        let session = Session::new();
        drop(Watcher {
            session: Arc::clone(&session),
            thread: None,
        });
        assert!(!session.is_running());
    }
}
