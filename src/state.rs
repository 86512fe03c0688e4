//! Optimistic channel state, shared between components.
//!
//! The board cannot be read back, so the last commanded state is the
//! only state there is. Components that act on a channel (a pulse
//! finishing, a switch toggling) publish through this store instead of
//! reaching into each other; interested parties subscribe for changes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::mpsc::{Receiver, Sender, channel};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateEvent {
    pub channel: u8,
    pub on: bool,
}

#[derive(Default)]
pub struct ChannelStates {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    states: HashMap<u8, bool>,
    subscribers: Vec<Sender<StateEvent>>,
}

impl ChannelStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a commanded state and notify subscribers.
    pub fn set(&self, channel: u8, on: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.states.insert(channel, on);

        let event = StateEvent { channel, on };
        inner.subscribers.retain(|tx| tx.send(event).is_ok());
    }

    /// Last commanded state, defaulting to off for untouched channels.
    pub fn get(&self, channel: u8) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.states.get(&channel).copied().unwrap_or(false)
    }

    pub fn subscribe(&self) -> Receiver<StateEvent> {
        let (tx, rx) = channel();
        self.inner.lock().unwrap().subscribers.push(tx);
        rx
    }
}
