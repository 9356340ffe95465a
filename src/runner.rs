//! Consume-and-tick loop shared by the section reporter and the threshold alert
//!
//! A [`TaskRunner`] moves its task onto a dedicated thread, so the task's state
//! has exactly one writer while it runs. The state is handed back when the
//! runner is stopped.

use crate::error::TaskError;
use crate::events::{LogEvent, Timestamp};
use crate::worker::{StopSignal, Worker};
use chrono::Utc;
use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

/// Shortest tick interval a runner will honour
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Stateful consumer of an event stream with a periodic tick
pub trait WindowTask: Send + 'static {
    /// Value handed to the presentation layer
    type Output: Send + 'static;

    /// Thread name, also used in log lines and errors
    fn name(&self) -> &str;

    /// Time between two calls to [`on_tick`](Self::on_tick)
    fn tick_interval(&self) -> Duration;

    /// Handle one event from the stream
    fn on_event(&mut self, event: &LogEvent) -> Option<Self::Output>;

    /// Periodic housekeeping, independent of incoming events
    fn on_tick(&mut self, now: Timestamp) -> Option<Self::Output>;
}

/// Runs a [`WindowTask`] on its own thread
pub struct TaskRunner<T: WindowTask> {
    name: String,
    /// Present while idle; moved into the thread while running
    task: Option<T>,
    output: Sender<T::Output>,
    worker: Option<Worker<T>>,
}

impl<T: WindowTask> TaskRunner<T> {
    /// Wrap `task`; everything it emits is sent to `output`
    pub fn new(task: T, output: Sender<T::Output>) -> Self {
        Self {
            name: task.name().to_string(),
            task: Some(task),
            output,
            worker: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Begin consuming `events` on a new thread
    ///
    /// A loop that already ended because its input closed is reclaimed first,
    /// so the runner can be pointed at a new stream without calling `stop`.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` while the loop thread is still alive.
    pub fn start(&mut self, events: Receiver<LogEvent>) -> Result<(), TaskError> {
        match self.worker.as_ref().map(|worker| worker.is_finished()) {
            Some(false) => return Err(TaskError::AlreadyRunning(self.name.clone())),
            Some(true) => {
                debug!("{} loop already ended, reclaiming its state", self.name);
                self.stop()?;
            }
            None => {}
        }
        let task = self.task.take().ok_or_else(|| {
            TaskError::Panicked(self.name.clone(), "task state was lost".to_string())
        })?;

        let output = self.output.clone();
        let worker = Worker::spawn(self.name.clone(), move |stop| {
            run_loop(task, events, output, stop)
        })
        .map_err(|source| TaskError::Spawn {
            name: self.name.clone(),
            source,
        })?;

        self.worker = Some(worker);
        info!("{} started", self.name);
        Ok(())
    }

    /// Stop the thread and take the task state back
    ///
    /// Also used to reclaim the state after the loop ended on its own because
    /// the input stream closed.
    ///
    /// # Errors
    ///
    /// `NotRunning` if the runner was never started or is already stopped.
    pub fn stop(&mut self) -> Result<(), TaskError> {
        let worker = self
            .worker
            .take()
            .ok_or_else(|| TaskError::NotRunning(self.name.clone()))?;

        let task = worker
            .stop()
            .map_err(|message| TaskError::Panicked(self.name.clone(), message))?;
        self.task = Some(task);
        info!("{} stopped", self.name);
        Ok(())
    }

    /// Whether the loop thread is still alive
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|worker| !worker.is_finished())
            .unwrap_or(false)
    }

    /// Task state, available only while the runner is idle
    pub fn task(&self) -> Option<&T> {
        self.task.as_ref()
    }
}

impl<T: WindowTask> Drop for TaskRunner<T> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.stop() {
                warn!("{} did not stop cleanly: {}", self.name, e);
            }
        }
    }
}

fn run_loop<T: WindowTask>(
    mut task: T,
    events: Receiver<LogEvent>,
    output: Sender<T::Output>,
    stop: StopSignal,
) -> T {
    let interval = task.tick_interval().max(MIN_TICK_INTERVAL);
    let mut next_tick = Instant::now() + interval;

    while !stop.is_stopped() {
        let now = Instant::now();
        if now >= next_tick {
            next_tick += interval;
            if next_tick <= now {
                // Fell behind by more than a whole interval; don't replay missed ticks
                next_tick = now + interval;
            }
            let emitted = task.on_tick(Utc::now());
            if !emit(&stop, &output, emitted) {
                break;
            }
            continue;
        }

        crossbeam_channel::select! {
            recv(events) -> received => match received {
                Ok(event) => {
                    let emitted = task.on_event(&event);
                    if !emit(&stop, &output, emitted) {
                        break;
                    }
                }
                Err(_) => {
                    info!("{}: input stream closed", task.name());
                    break;
                }
            },
            recv(stop.wake()) -> _ => break,
            default(next_tick - now) => {}
        }
    }

    debug!("{} loop exited", task.name());
    task
}

/// Forward `value` unless a stop was requested; returns `false` once stopped
fn emit<O>(stop: &StopSignal, output: &Sender<O>, value: Option<O>) -> bool {
    let Some(value) = value else {
        return true;
    };
    if stop.is_stopped() {
        return false;
    }
    if output.send(value).is_err() {
        debug!("Output receiver dropped, discarding value");
    }
    true
}
