//! Source events
//!
//! `EventBus` broadcasts `SourceEvent`s from the worker to any number of
//! listeners over unbounded crossbeam channels.

use std::sync::{Mutex, PoisonError};

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Discrete events broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// A connection attempt is starting
    Connecting { reconnect: bool },
    /// An audio response is open
    Connected { url: String, reconnect: bool },
    /// Retries for the current track gave up; moving on to this URL
    NextTrack(String),
    /// ICY metadata announced a new track title
    TrackInfo(String),
    /// Retries gave up and no playlist entry is left; the source paused
    NoMoreTracks,
}

/// Broadcast mechanism for source events
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<SourceEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a new event bus with no subscribers
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to events. Returns a receiver that will get all future events.
    pub fn subscribe(&self) -> Receiver<SourceEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Emit an event to all subscribers. Removes disconnected subscribers.
    pub fn emit(&self, event: SourceEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
