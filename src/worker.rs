//! Thread lifecycle helpers shared by the tailer, reporter and alert loops

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::debug;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Cooperative, idempotent cancellation token
///
/// Clones share the same flag. Cancelling more than once is harmless: only the
/// first call reports that it initiated the stop.
///
/// Besides the flag, the signal carries a channel that disconnects on cancel,
/// so blocked threads can wait on it in a `select!` next to their real work.
#[derive(Debug, Clone)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
    /// Dropped on cancel, which disconnects every clone of `wake`
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    wake: Receiver<()>,
}

impl Default for StopSignal {
    fn default() -> Self {
        let (trigger, wake) = crossbeam_channel::bounded(0);
        Self {
            stopped: Arc::new(AtomicBool::new(false)),
            trigger: Arc::new(Mutex::new(Some(trigger))),
            wake,
        }
    }
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Returns `false` if a stop was already requested.
    pub fn cancel(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        let mut trigger = self
            .trigger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        trigger.take();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Channel that never yields a value and disconnects once cancelled
    ///
    /// Use it as a `recv` arm in `crossbeam_channel::select!`.
    pub fn wake(&self) -> &Receiver<()> {
        &self.wake
    }

    /// Sleep for up to `duration`, waking as soon as a stop is requested
    ///
    /// Returns `true` if the signal fired.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        match self.wake.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => self.is_stopped(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

/// A named background thread paired with the signal that stops it
///
/// The thread closure receives its own clone of the stop signal and hands its
/// owned state back through the join handle.
#[derive(Debug)]
pub struct Worker<T> {
    name: String,
    stop: StopSignal,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> Worker<T> {
    /// Spawn `body` on a new thread called `name`
    pub fn spawn<F>(name: impl Into<String>, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(StopSignal) -> T + Send + 'static,
    {
        let name = name.into();
        let stop = StopSignal::new();
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(thread_stop))?;

        Ok(Self { name, stop, handle })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the thread body has returned
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the thread and wait for it, returning its state
    ///
    /// `Err` carries the panic message if the thread panicked.
    pub fn stop(self) -> Result<T, String> {
        if !self.stop.cancel() {
            debug!("{} was already stopping", self.name);
        }
        self.handle.join().map_err(|payload| panic_message(payload.as_ref()))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
