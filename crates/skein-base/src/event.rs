//! Generational events
//!
//! An [`Event`] is the handle every subsystem waits on and triggers: a
//! one-shot distributed future identified by `(id, generation)`. Slots in
//! the [`EventTable`] are recycled after they trigger; the generation
//! counter disambiguates stale handles, so a handle whose generation is
//! older than the slot's live generation is simply "already triggered".
//!
//! ## State model
//!
//! ```text
//! Pending ──trigger──▶ Triggered     (slot recycled, waiters run with Ok)
//!    │
//!    └────poison────▶ Poisoned       (slot retired, waiters run with Err)
//! ```
//!
//! A triggered event never untriggers. Poisoned slots are never recycled so
//! the failure cause stays observable for the life of the table.

use crate::error::{Result, RuntimeError};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};

/// Observable state of an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventState {
    /// Not yet triggered
    Pending,
    /// Triggered successfully
    Triggered,
    /// Triggered with a failure cause
    Poisoned(RuntimeError),
}

/// Immutable event handle
///
/// Cheap to copy and store; all behavior lives on the [`EventTable`] the
/// handle was created by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    id: u32,
    gen: u32,
}

impl Event {
    /// The no-event sentinel; always triggered
    pub const NONE: Event = Event { id: 0, gen: 0 };

    /// Whether this handle refers to a real event slot
    pub fn exists(&self) -> bool {
        self.id != 0
    }

    /// Slot identifier (diagnostics only)
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Generation of the slot this handle refers to
    pub fn generation(&self) -> u32 {
        self.gen
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}/{}", self.id, self.gen)
    }
}

type Waiter = Box<dyn FnOnce(Result<()>) + Send>;

struct EventSlot {
    /// Generation currently being produced by this slot
    gen: u32,
    triggered: bool,
    poison: Option<RuntimeError>,
    waiters: Vec<Waiter>,
}

#[derive(Default)]
struct TableInner {
    slots: Vec<EventSlot>,
    free: Vec<usize>,
}

/// Process-wide table of event slots
///
/// Created by the runtime during initialization and passed by handle to
/// every component that creates or observes events. Blocking waits share a
/// single condition variable; triggers broadcast.
pub struct EventTable {
    inner: Mutex<TableInner>,
    cond: Condvar,
    /// Back-reference handed to merge waiters
    self_ref: Weak<EventTable>,
}

impl EventTable {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            inner: Mutex::new(TableInner::default()),
            cond: Condvar::new(),
            self_ref: weak.clone(),
        })
    }

    /// Allocate a fresh untriggered event
    pub fn create(&self) -> Event {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.free.pop() {
            let slot = &mut inner.slots[idx];
            slot.gen += 1;
            slot.triggered = false;
            slot.poison = None;
            debug_assert!(slot.waiters.is_empty());
            Event {
                id: idx as u32 + 1,
                gen: slot.gen,
            }
        } else {
            inner.slots.push(EventSlot {
                gen: 1,
                triggered: false,
                poison: None,
                waiters: Vec::new(),
            });
            Event {
                id: inner.slots.len() as u32,
                gen: 1,
            }
        }
    }

    /// Trigger an event; runs waiters and recycles the slot
    ///
    /// Triggering an event twice is a contract violation; the second call is
    /// ignored (with a debug assertion in test builds).
    pub fn trigger(&self, ev: Event) {
        self.finish(ev, None)
    }

    /// Trigger an event into the failed state
    ///
    /// Waiters observe the cause; the slot is retired rather than recycled
    /// so later polls still see the failure.
    pub fn poison(&self, ev: Event, cause: RuntimeError) {
        self.finish(ev, Some(cause))
    }

    fn finish(&self, ev: Event, cause: Option<RuntimeError>) {
        if !ev.exists() {
            return;
        }
        let waiters;
        {
            let mut inner = self.inner.lock();
            let idx = ev.id as usize - 1;
            let slot = &mut inner.slots[idx];
            if slot.gen != ev.gen || slot.triggered || slot.poison.is_some() {
                debug_assert!(false, "event {ev} finished twice");
                return;
            }
            waiters = std::mem::take(&mut slot.waiters);
            match cause {
                None => {
                    slot.triggered = true;
                    inner.free.push(idx);
                }
                Some(err) => {
                    tracing::debug!(event = %ev, error = %err, "event_poisoned");
                    slot.poison = Some(err);
                }
            }
        }
        self.cond.notify_all();
        let outcome = self.outcome(ev);
        for w in waiters {
            w(outcome.clone());
        }
    }

    fn state_locked(inner: &TableInner, ev: Event) -> EventState {
        if !ev.exists() {
            return EventState::Triggered;
        }
        let slot = &inner.slots[ev.id as usize - 1];
        if slot.gen > ev.gen {
            // slot moved on; that generation completed cleanly
            EventState::Triggered
        } else if let Some(err) = &slot.poison {
            EventState::Poisoned(err.clone())
        } else if slot.triggered {
            EventState::Triggered
        } else {
            EventState::Pending
        }
    }

    /// Current state of the event
    pub fn poll(&self, ev: Event) -> EventState {
        Self::state_locked(&self.inner.lock(), ev)
    }

    /// Whether the event has reached a final state (triggered or poisoned)
    pub fn has_triggered(&self, ev: Event) -> bool {
        !matches!(self.poll(ev), EventState::Pending)
    }

    fn outcome(&self, ev: Event) -> Result<()> {
        match self.poll(ev) {
            EventState::Poisoned(err) => Err(err),
            _ => Ok(()),
        }
    }

    /// Block until the event reaches a final state
    ///
    /// Returns the failure cause if the event was poisoned. This is one of
    /// the runtime's only suspension points.
    pub fn wait(&self, ev: Event) -> Result<()> {
        let mut inner = self.inner.lock();
        loop {
            match Self::state_locked(&inner, ev) {
                EventState::Pending => self.cond.wait(&mut inner),
                EventState::Triggered => return Ok(()),
                EventState::Poisoned(err) => return Err(err),
            }
        }
    }

    /// Register a callback to run when the event reaches a final state
    ///
    /// Runs inline if the event is already final. The callback receives the
    /// failure cause for poisoned events.
    pub fn add_waiter(&self, ev: Event, f: impl FnOnce(Result<()>) + Send + 'static) {
        {
            let mut inner = self.inner.lock();
            if matches!(Self::state_locked(&inner, ev), EventState::Pending) {
                let slot = &mut inner.slots[ev.id as usize - 1];
                slot.waiters.push(Box::new(f));
                return;
            }
        }
        f(self.outcome(ev));
    }

    /// Merge a set of events into one
    ///
    /// The result triggers once every input has reached a final state and is
    /// poisoned if any input was poisoned (the first observed cause wins).
    /// Merging an empty or fully-triggered set yields [`Event::NONE`].
    pub fn merge(&self, events: &[Event]) -> Event {
        let mut pending = Vec::new();
        let mut first_poison = None;
        for &ev in events {
            match self.poll(ev) {
                EventState::Pending => pending.push(ev),
                EventState::Triggered => {}
                EventState::Poisoned(err) => {
                    if first_poison.is_none() {
                        first_poison = Some(err);
                    }
                }
            }
        }
        if pending.is_empty() {
            return match first_poison {
                None => Event::NONE,
                Some(err) => {
                    let ev = self.create();
                    self.poison(ev, err);
                    ev
                }
            };
        }

        let result = self.create();
        let state = Arc::new(Mutex::new((pending.len(), first_poison)));
        for ev in pending {
            let table = self.self_ref.upgrade().expect("event table alive");
            let state = Arc::clone(&state);
            self.add_waiter(ev, move |outcome| {
                let finished = {
                    let mut st = state.lock();
                    st.0 -= 1;
                    if let Err(err) = outcome {
                        if st.1.is_none() {
                            st.1 = Some(err);
                        }
                    }
                    if st.0 == 0 {
                        Some(st.1.take())
                    } else {
                        None
                    }
                };
                match finished {
                    Some(None) => table.trigger(result),
                    Some(Some(err)) => table.poison(result, err),
                    None => {}
                }
            });
        }
        result
    }
}

// ================================================================================================
// Tests
// ================================================================================================
