//! Event-returning locks
//!
//! A [`Reservation`] is the runtime's non-blocking mutex: acquisition either
//! succeeds immediately or hands back an [`Event`] that triggers when
//! ownership has been transferred to the caller. Components suspend by
//! registering a waiter on that event instead of blocking a thread.

use crate::event::{Event, EventTable};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Outcome of a reservation acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The caller now holds the reservation
    Granted,
    /// The caller holds the reservation once this event triggers
    Wait(Event),
}

/// A non-blocking, event-returning mutex
///
/// Grants are strictly FIFO. When [`Acquire::Wait`] is returned, the event
/// triggering *is* the grant; the caller must eventually call
/// [`Reservation::release`], in both cases.
pub struct Reservation {
    state: Mutex<ResInner>,
}

#[derive(Default)]
struct ResInner {
    held: bool,
    queue: VecDeque<Event>,
}

impl Default for Reservation {
    fn default() -> Self {
        Self::new()
    }
}

impl Reservation {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ResInner::default()),
        }
    }

    /// Attempt to acquire the reservation
    pub fn acquire(&self, events: &EventTable) -> Acquire {
        let mut st = self.state.lock();
        if !st.held {
            st.held = true;
            Acquire::Granted
        } else {
            let ev = events.create();
            st.queue.push_back(ev);
            Acquire::Wait(ev)
        }
    }

    /// Acquire, blocking the calling thread until granted
    ///
    /// One of the runtime's suspension points; prefer [`Reservation::acquire`]
    /// plus an event waiter on runtime threads.
    pub fn acquire_blocking(&self, events: &EventTable) {
        match self.acquire(events) {
            Acquire::Granted => {}
            Acquire::Wait(ev) => {
                // wait failure is impossible: grants are never poisoned
                let _ = events.wait(ev);
            }
        }
    }

    /// Release the reservation, granting the next waiter if any
    pub fn release(&self, events: &EventTable) {
        let next = {
            let mut st = self.state.lock();
            debug_assert!(st.held);
            match st.queue.pop_front() {
                Some(ev) => Some(ev),
                None => {
                    st.held = false;
                    None
                }
            }
        };
        if let Some(ev) = next {
            // ownership transfers to the waiter as the event triggers
            events.trigger(ev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventState;

    #[test]
    fn test_uncontended_grant() {
        let events = EventTable::new();
        let res = Reservation::new();
        assert_eq!(res.acquire(&events), Acquire::Granted);
        res.release(&events);
        assert_eq!(res.acquire(&events), Acquire::Granted);
        res.release(&events);
    }

    #[test]
    fn test_fifo_grants() {
        let events = EventTable::new();
        let res = Reservation::new();
        assert_eq!(res.acquire(&events), Acquire::Granted);

        let w1 = match res.acquire(&events) {
            Acquire::Wait(ev) => ev,
            Acquire::Granted => panic!("should have queued"),
        };
        let w2 = match res.acquire(&events) {
            Acquire::Wait(ev) => ev,
            Acquire::Granted => panic!("should have queued"),
        };

        assert_eq!(events.poll(w1), EventState::Pending);
        res.release(&events);
        assert_eq!(events.poll(w1), EventState::Triggered);
        assert_eq!(events.poll(w2), EventState::Pending);
        res.release(&events);
        assert_eq!(events.poll(w2), EventState::Triggered);
        res.release(&events);

        assert_eq!(res.acquire(&events), Acquire::Granted);
        res.release(&events);
    }
}
