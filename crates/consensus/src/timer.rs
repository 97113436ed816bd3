//! Tokio timers for the node runner
//!
//! Each armed timer is a task that sleeps and then pushes
//! `Event::Timer { id, round }` onto the node's event queue. The round is
//! carried in the event so a timer that raced a round change is recognised
//! as stale by the state machine.

use crate::event::{Event, TimerId};
use crate::types::Round;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub struct TimerManager {
    timers: HashMap<TimerId, JoinHandle<()>>,
    event_tx: mpsc::UnboundedSender<Event>,
}

impl TimerManager {
    pub fn new(event_tx: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            timers: HashMap::new(),
            event_tx,
        }
    }

    /// Arm `id` for `round`, replacing any pending timer with the same id
    pub fn set_timer(&mut self, id: TimerId, round: Round, duration: Duration) {
        self.cancel_timer(id);

        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            trace!(?id, round, "Timer fired");
            // receiver gone means the node is shutting down
            let _ = event_tx.send(Event::Timer { id, round });
        });

        self.timers.insert(id, handle);
        debug!(?id, round, ?duration, "Timer set");
    }

    /// Cancel a timer; no-op if it is not armed or already fired
    pub fn cancel_timer(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
            trace!(?id, "Timer cancelled");
        }
    }

    pub fn cancel_all(&mut self) {
        for (id, handle) in self.timers.drain() {
            handle.abort();
            trace!(?id, "Timer cancelled (shutdown)");
        }
    }

    /// Number of armed timers, including ones that fired but were not cleared
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
