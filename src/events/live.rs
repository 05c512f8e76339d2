use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::Event;
use crate::metrics::RegistryMetrics;

#[derive(Debug)]
struct Subscriber {
    repository: Option<String>,
    tx: mpsc::Sender<Arc<Event>>,
}

/// Best effort fan-out to connected listeners. Each listener has a small
/// buffer of its own; once it is full, further events are dropped for that
/// listener alone.
#[derive(Debug)]
pub struct LiveStream {
    buffer: usize,
    subscribers: Mutex<Vec<Subscriber>>,
    metrics: RegistryMetrics,
}

impl LiveStream {
    pub fn new(buffer: usize, metrics: RegistryMetrics) -> Self {
        Self {
            buffer: buffer.max(1),
            subscribers: Mutex::new(vec![]),
            metrics,
        }
    }

    /// Listen for events, optionally for one repository only. Dropping the
    /// receiver unsubscribes.
    pub fn subscribe(&self, repository: Option<String>) -> mpsc::Receiver<Arc<Event>> {
        let (tx, rx) = mpsc::channel(self.buffer);

        let mut subscribers = self.subscribers.lock();
        subscribers.push(Subscriber { repository, tx });
        self.metrics.live_subscribers.set(subscribers.len() as i64);

        rx
    }

    pub fn publish(&self, event: &Event) {
        let event = Arc::new(event.clone());
        let mut subscribers = self.subscribers.lock();

        subscribers.retain(|subscriber| {
            if subscriber
                .repository
                .as_ref()
                .is_some_and(|repository| repository != &event.target.repository)
            {
                return !subscriber.tx.is_closed();
            }

            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    self.metrics.live_events_dropped.inc();
                    warn!(event_id = %event.id, "Live subscriber is behind, dropping event");
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Live subscriber went away");
                    false
                }
            }
        });

        self.metrics.live_subscribers.set(subscribers.len() as i64);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
