//! Cooperative shutdown for worker slots.
//!
//! Slots sleep on a channel that never carries a message; dropping the only
//! sender disconnects it and wakes every sleeper at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

/// Creates a connected trigger/signal pair.
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (sender, receiver) = bounded::<()>(0);
    let flag = Arc::new(AtomicBool::new(false));
    (
        ShutdownTrigger {
            flag: Arc::clone(&flag),
            sender: Arc::new(Mutex::new(Some(sender))),
        },
        ShutdownSignal { flag, receiver },
    )
}

/// Requests shutdown. Cheap to clone; safe to call from a signal handler
/// thread and more than once.
#[derive(Clone)]
pub struct ShutdownTrigger {
    flag: Arc<AtomicBool>,
    sender: Arc<Mutex<Option<Sender<()>>>>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

/// Observed by worker slots.
#[derive(Clone)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    receiver: Receiver<()>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleeps for up to `timeout`. Returns `true` if shutdown was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        match self.receiver.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => self.is_triggered(),
            Err(RecvTimeoutError::Disconnected) | Ok(()) => true,
        }
    }
}
