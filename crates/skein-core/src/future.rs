//! Futures
//!
//! A future pairs a completion event with a byte payload filled in by the
//! producer before the event triggers. Task launches return one; predicates
//! can be built from one.

use parking_lot::Mutex;
use skein_base::Event;
use std::sync::Arc;

/// A value produced asynchronously, observable after its event triggers
#[derive(Clone, Debug)]
pub struct Future {
    event: Event,
    value: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Future {
    pub fn new(event: Event) -> Self {
        Self {
            event,
            value: Arc::new(Mutex::new(None)),
        }
    }

    /// The event gating observation of the value
    pub fn event(&self) -> Event {
        self.event
    }

    /// Store the payload; called by the producer before triggering
    pub fn set(&self, bytes: Vec<u8>) {
        *self.value.lock() = Some(bytes);
    }

    /// The payload, if produced yet
    pub fn get(&self) -> Option<Vec<u8>> {
        self.value.lock().clone()
    }

    /// Interpret the payload as a boolean (first byte non-zero)
    pub fn get_bool(&self) -> Option<bool> {
        self.value.lock().as_ref().map(|b| b.first().copied().unwrap_or(0) != 0)
    }
}
