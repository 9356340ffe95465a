//! Ordered fan-out of parsed events to independently buffered subscribers
//!
//! Each subscriber gets its own bounded channel. Publishing sends the event to
//! every subscriber in registration order, blocking on a full buffer before
//! moving on, so a slow consumer delays the ones registered after it
//! and eventually the publisher itself. Nothing is dropped to relieve that
//! pressure.

use crate::error::DistributorError;
use crate::events::LogEvent;
use crate::worker::StopSignal;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{debug, info};

/// Default number of events buffered per subscriber
pub const DEFAULT_BUFFER_CAPACITY: usize = 10;

/// Outcome of offering one event to one subscriber
enum Delivery {
    Sent,
    Gone,
}

/// Cloneable handle used to open new subscriptions
///
/// Registrations travel to the distributor over a channel and are adopted
/// before the next publish, so subscribing never touches the distributor's
/// state directly.
#[derive(Debug, Clone)]
pub struct Subscriptions {
    registrations: Sender<Sender<LogEvent>>,
    capacity: usize,
}

impl Subscriptions {
    /// Open a new receive-only event stream
    ///
    /// # Errors
    ///
    /// Returns `DistributorError::Closed` once the distributor has shut down.
    pub fn subscribe(&self) -> Result<Receiver<LogEvent>, DistributorError> {
        let (sender, receiver) = crossbeam_channel::bounded(self.capacity);
        self.registrations
            .send(sender)
            .map_err(|_| DistributorError::Closed)?;
        Ok(receiver)
    }

    /// Buffer size of each new subscription
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Publisher side of the fan-out
#[derive(Debug)]
pub struct EventDistributor {
    subscribers: Vec<Sender<LogEvent>>,
    registrations: Option<Receiver<Sender<LogEvent>>>,
}

impl EventDistributor {
    /// Create a distributor and the handle used to subscribe to it
    ///
    /// A capacity of zero is raised to one so every subscriber has a buffer.
    pub fn new(capacity: usize) -> (Self, Subscriptions) {
        let (registrations_tx, registrations_rx) = crossbeam_channel::unbounded();
        let distributor = Self {
            subscribers: Vec::new(),
            registrations: Some(registrations_rx),
        };
        let subscriptions = Subscriptions {
            registrations: registrations_tx,
            capacity: capacity.max(1),
        };
        (distributor, subscriptions)
    }

    /// Adopt subscriptions opened since the last call
    fn accept_registrations(&mut self) {
        if let Some(registrations) = &self.registrations {
            for subscriber in registrations.try_iter() {
                self.subscribers.push(subscriber);
            }
        }
    }

    /// Number of live subscribers, including ones not yet adopted
    pub fn subscriber_count(&mut self) -> usize {
        self.accept_registrations();
        self.subscribers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.registrations.is_none()
    }

    /// Deliver `event` to every subscriber in registration order
    ///
    /// Blocks while a subscriber's buffer is full, without polling; the wait
    /// ends when the subscriber takes an event or `stop` fires. Subscribers whose receiver
    /// was dropped are removed. Returns the number of subscribers reached.
    ///
    /// # Errors
    ///
    /// `Closed` after [`close`](Self::close); `Cancelled` if `stop` fires while
    /// waiting on a full buffer, in which case later subscribers do not get the
    /// event.
    pub fn publish(&mut self, event: &LogEvent, stop: &StopSignal) -> Result<usize, DistributorError> {
        if self.is_closed() {
            return Err(DistributorError::Closed);
        }
        self.accept_registrations();

        let mut delivered = 0;
        let mut index = 0;
        while index < self.subscribers.len() {
            let outcome = {
                let subscriber = &self.subscribers[index];
                match subscriber.try_send(event.clone()) {
                    Ok(()) => Delivery::Sent,
                    Err(TrySendError::Disconnected(_)) => Delivery::Gone,
                    Err(TrySendError::Full(pending)) => {
                        if stop.is_stopped() {
                            return Err(DistributorError::Cancelled);
                        }
                        debug!("Subscriber {} is full, waiting", index);
                        crossbeam_channel::select! {
                            send(subscriber, pending) -> sent => match sent {
                                Ok(()) => Delivery::Sent,
                                Err(_) => Delivery::Gone,
                            },
                            recv(stop.wake()) -> _ => return Err(DistributorError::Cancelled),
                        }
                    }
                }
            };

            match outcome {
                Delivery::Sent => {
                    delivered += 1;
                    index += 1;
                }
                Delivery::Gone => {
                    debug!("Subscriber {} went away, removing it", index);
                    self.subscribers.remove(index);
                }
            }
        }

        Ok(delivered)
    }

    /// Stop distributing and end every subscriber stream
    ///
    /// Each stream observes end-of-stream exactly once. Calling this again is
    /// a no-op and returns `false`.
    pub fn close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.accept_registrations();
        self.registrations = None;

        let closed = self.subscribers.len();
        self.subscribers.clear();
        info!("Event distributor closed {} subscriber stream(s)", closed);
        true
    }
}

impl Drop for EventDistributor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crossbeam_channel::{RecvTimeoutError, TryRecvError};
    use std::thread;
    use std::time::Duration;

    fn event(path: &str) -> LogEvent {
        LogEvent::new(Utc::now(), path)
    }

    #[test]
    fn test_every_subscriber_sees_same_ordered_events() {
        let (mut distributor, subscriptions) = EventDistributor::new(16);
        let first = subscriptions.subscribe().unwrap();
        let second = subscriptions.subscribe().unwrap();
        let stop = StopSignal::new();

        for path in ["/a", "/b", "/c"] {
            assert_eq!(distributor.publish(&event(path), &stop).unwrap(), 2);
        }
        distributor.close();

        let first: Vec<_> = first.iter().map(|e| e.resource_path).collect();
        let second: Vec<_> = second.iter().map(|e| e.resource_path).collect();
        assert_eq!(first, vec!["/a", "/b", "/c"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_close_ends_streams_once() {
        let (mut distributor, subscriptions) = EventDistributor::new(4);
        let receiver = subscriptions.subscribe().unwrap();

        assert!(distributor.close());
        assert!(!distributor.close());

        assert_eq!(receiver.try_recv(), Err(TryRecvError::Disconnected));
        assert_eq!(receiver.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn test_subscribe_after_close_fails() {
        let (mut distributor, subscriptions) = EventDistributor::new(4);
        distributor.close();

        assert_eq!(
            subscriptions.subscribe().unwrap_err(),
            DistributorError::Closed
        );
        assert_eq!(
            distributor.publish(&event("/a"), &StopSignal::new()),
            Err(DistributorError::Closed)
        );
    }

    #[test]
    fn test_late_subscriber_only_sees_later_events() {
        let (mut distributor, subscriptions) = EventDistributor::new(4);
        let early = subscriptions.subscribe().unwrap();
        let stop = StopSignal::new();

        distributor.publish(&event("/before"), &stop).unwrap();
        let late = subscriptions.subscribe().unwrap();
        distributor.publish(&event("/after"), &stop).unwrap();
        distributor.close();

        assert_eq!(early.iter().count(), 2);
        let late: Vec<_> = late.iter().map(|e| e.resource_path).collect();
        assert_eq!(late, vec!["/after"]);
    }

    #[test]
    fn test_dropped_subscriber_is_removed() {
        let (mut distributor, subscriptions) = EventDistributor::new(4);
        let kept = subscriptions.subscribe().unwrap();
        drop(subscriptions.subscribe().unwrap());
        let stop = StopSignal::new();

        assert_eq!(distributor.publish(&event("/a"), &stop).unwrap(), 1);
        assert_eq!(distributor.subscriber_count(), 1);
        assert_eq!(kept.recv().unwrap().resource_path, "/a");
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let (_distributor, subscriptions) = EventDistributor::new(0);
        assert_eq!(subscriptions.capacity(), 1);
    }

    #[test]
    fn test_full_buffer_blocks_until_consumer_catches_up() {
        let (mut distributor, subscriptions) = EventDistributor::new(1);
        let receiver = subscriptions.subscribe().unwrap();

        let publisher = thread::spawn(move || {
            let stop = StopSignal::new();
            for i in 0..5 {
                distributor
                    .publish(&event(&format!("/{}", i)), &stop)
                    .unwrap();
            }
            distributor.close();
        });

        thread::sleep(Duration::from_millis(50));
        let received: Vec<_> = receiver.iter().map(|e| e.resource_path).collect();
        publisher.join().unwrap();
        assert_eq!(received, vec!["/0", "/1", "/2", "/3", "/4"]);
    }

    #[test]
    fn test_full_subscriber_delays_later_subscribers() {
        let (mut distributor, subscriptions) = EventDistributor::new(1);
        let first = subscriptions.subscribe().unwrap();
        let second = subscriptions.subscribe().unwrap();

        distributor.publish(&event("/0"), &StopSignal::new()).unwrap();
        assert_eq!(second.recv().unwrap().resource_path, "/0");

        // first still holds /0, so /1 stalls before reaching second
        let publisher = thread::spawn(move || {
            distributor.publish(&event("/1"), &StopSignal::new()).unwrap();
            distributor
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(second.try_recv(), Err(TryRecvError::Empty));

        assert_eq!(first.recv().unwrap().resource_path, "/0");
        let delayed = second.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(delayed.resource_path, "/1");
        assert_eq!(first.recv().unwrap().resource_path, "/1");

        let mut distributor = publisher.join().unwrap();
        assert!(distributor.close());
    }

    #[test]
    fn test_blocked_publish_is_cancellable() {
        let (mut distributor, subscriptions) = EventDistributor::new(1);
        let receiver = subscriptions.subscribe().unwrap();
        let stop = StopSignal::new();

        distributor.publish(&event("/fills-buffer"), &stop).unwrap();

        let remote = stop.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.cancel();
        });

        assert_eq!(
            distributor.publish(&event("/blocked"), &stop),
            Err(DistributorError::Cancelled)
        );
        canceller.join().unwrap();

        assert_eq!(receiver.recv().unwrap().resource_path, "/fills-buffer");
        assert_eq!(
            receiver.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Timeout)
        );
    }
}
