//! The event bus: a bounded mpsc channel that every producer (gateway,
//! channel adapters, cron) shares and the dispatcher drains.

use tokio::sync::{mpsc, oneshot};

use crate::{
    error::{Error, Result},
    types::{Event, Reply},
};

/// Final disposition of one event, reported to tracked senders.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The agent produced `replies`; `delivered` of them reached a channel.
    Completed { replies: Vec<Reply>, delivered: usize },
    Failed { error: String },
}

impl Outcome {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// An event plus an optional completion slot.
#[derive(Debug)]
pub struct Envelope {
    pub event: Event,
    pub completion: Option<oneshot::Sender<Outcome>>,
}

impl Envelope {
    /// Report the outcome to the tracked sender, if any. A dropped receiver is
    /// not an error.
    pub fn complete(&mut self, outcome: Outcome) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(outcome);
        }
    }
}

/// Cloneable producer half of the bus.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Envelope>,
}

pub type EventReceiver = mpsc::Receiver<Envelope>;

impl EventSender {
    /// Enqueue an event without waiting for its outcome.
    pub async fn send(&self, event: Event) -> Result<()> {
        self.tx
            .send(Envelope {
                event,
                completion: None,
            })
            .await
            .map_err(|_| Error::BusClosed)
    }

    /// Enqueue an event and get a receiver for its outcome.
    pub async fn send_tracked(&self, event: Event) -> Result<oneshot::Receiver<Outcome>> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                event,
                completion: Some(done_tx),
            })
            .await
            .map_err(|_| Error::BusClosed)?;
        Ok(done_rx)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a bus with room for `capacity` queued envelopes.
#[must_use]
pub fn event_bus(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx }, rx)
}
