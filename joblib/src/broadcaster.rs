use crate::events::JobEvent;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Identifies one subscriber within a single job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Fans job events out to any number of bounded subscriber queues.
///
/// Delivery never waits: a subscriber whose queue is full misses the event, and
/// a subscriber whose receiver has been dropped is forgotten. The producer is
/// never slowed down by a slow viewer.
#[derive(Debug, Default)]
pub struct Broadcaster {
    next_id: u64,
    subscribers: Vec<(SubscriberId, mpsc::Sender<JobEvent>)>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber with room for `capacity` pending events.
    pub fn add(&mut self, capacity: usize) -> (SubscriberId, mpsc::Receiver<JobEvent>) {
        // a zero-capacity tokio channel panics on creation
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = SubscriberId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, tx));
        (id, rx)
    }

    /// Returns false if the subscriber was already gone.
    pub fn remove(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub_id, _)| *sub_id != id);
        self.subscribers.len() != before
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn broadcast(&mut self, event: &JobEvent) {
        self.subscribers.retain(|(_, tx)| match tx.try_send(event.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            // only retain subscribers who have not dropped
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Deliver `last` best-effort, then drop every sender so each receiver sees end-of-stream.
    pub fn close(&mut self, last: JobEvent) {
        for (_, tx) in self.subscribers.drain(..) {
            let _ = tx.try_send(last.clone());
        }
    }
}
