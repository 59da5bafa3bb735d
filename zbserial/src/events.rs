//! Port notifications.
//!
//! A [`Notifier`] keeps a registry of callbacks per [`PortEvent`] plus any
//! number of channel subscribers. Events are delivered synchronously on the
//! thread that raises them: the owner's thread for `Opened`/`Closed` and
//! transfer errors, the watcher thread for `DataAvailable` and wait failures.
//! Consumers that need the events on their own loop use
//! [`Notifier::channel`].

use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, Sender},
    },
};

/// Zero-argument notifications raised by a [`SerialPort`](crate::SerialPort).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortEvent {
    /// The port finished opening.
    Opened,
    /// The port finished closing.
    Closed,
    /// A transfer or the watcher failed; the port is closed (or closing).
    Error,
    /// Input is buffered and a `read()` will likely return data.
    DataAvailable,
}

impl fmt::Display for PortEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Opened => "port-opened",
            Self::Closed => "port-closed",
            Self::Error => "port-error",
            Self::DataAvailable => "data-available",
        })
    }
}

/// Handle returned by `subscribe`, used to remove the callback again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Registration {
    id: ListenerId,
    event: PortEvent,
    callback: Callback,
}

/// Callback and channel registry shared between a port and its watcher.
#[derive(Default)]
pub struct Notifier {
    next_id: AtomicU64,
    listeners: Mutex<Vec<Registration>>,
    senders: Mutex<Vec<Sender<PortEvent>>>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let channels = self
            .senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("Notifier")
            .field("listeners", &listeners)
            .field("channels", &channels)
            .finish_non_exhaustive()
    }
}

impl Notifier {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `event`.
    pub fn subscribe<F>(&self, event: PortEvent, callback: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                id,
                event,
                callback: Arc::new(callback),
            });
        id
    }

    /// Remove a callback. Returns `false` if `id` was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|registration| registration.id != id);
        listeners.len() != before
    }

    /// Receive every event on a channel.
    ///
    /// The sender is dropped once the receiver goes away.
    pub fn channel(&self) -> Receiver<PortEvent> {
        let (tx, rx) = mpsc::channel();
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver `event` to its callbacks, then to every channel.
    pub fn emit(&self, event: PortEvent) {
        log::trace!("Emitting {event}");

        // Callbacks may subscribe or emit again, so run them unlocked.
        let callbacks: Vec<Callback> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|registration| registration.event == event)
            .map(|registration| Arc::clone(&registration.callback))
            .collect();
        for callback in callbacks {
            callback();
        }

        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event).is_ok());
    }
}
