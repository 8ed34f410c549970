// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A small table-driven state machine.
//!
//! Events with no transition from the current state are no-ops that return
//! false; the machine never panics on unknown input. The machine itself is
//! not synchronized — wrap it in a mutex when shared.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct StateMachine<S, E> {
    state: S,
    last_event: Option<E>,
    transitions: HashMap<S, HashMap<E, S>>,
}

// === impl StateMachine ===

impl<S, E> StateMachine<S, E>
where
    S: Copy + Eq + Hash,
    E: Copy + Eq + Hash,
{
    pub fn new(initial: S) -> Self {
        Self {
            state: initial,
            last_event: None,
            transitions: HashMap::new(),
        }
    }

    /// Builds a machine from a `(from, event, to)` table.
    pub fn with_transitions(initial: S, table: &[(S, E, S)]) -> Self {
        let mut machine = Self::new(initial);
        for (from, event, to) in table {
            machine.add_transition(*from, *event, *to);
        }
        machine
    }

    pub fn add_transition(&mut self, from: S, event: E, to: S) {
        self.transitions.entry(from).or_default().insert(event, to);
    }

    /// Applies `event`. Returns false — and changes nothing, including
    /// `last_event` — when the current state has no transition for it.
    pub fn transition(&mut self, event: E) -> bool {
        let Some(next) = self
            .transitions
            .get(&self.state)
            .and_then(|events| events.get(&event))
        else {
            return false;
        };
        self.state = *next;
        self.last_event = Some(event);
        true
    }

    pub fn can_transition(&self, event: E) -> bool {
        self.transitions
            .get(&self.state)
            .is_some_and(|events| events.contains_key(&event))
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn last_event(&self) -> Option<E> {
        self.last_event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Event {
        Go,
        Next,
        Success,
        Error,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum State {
        First,
        Working,
        DoneOne,
        DoneTwo,
        Failed,
    }

    fn machine(initial: State) -> StateMachine<State, Event> {
        StateMachine::with_transitions(
            initial,
            &[
                (State::First, Event::Go, State::Working),
                (State::Working, Event::Error, State::Failed),
                (State::Working, Event::Success, State::DoneOne),
                (State::DoneOne, Event::Next, State::DoneTwo),
            ],
        )
    }

    #[test]
    fn transitions() {
        let mut fsm = machine(State::First);

        assert!(!fsm.transition(Event::Success));
        assert!(!fsm.transition(Event::Error));
        assert!(!fsm.transition(Event::Next));
        assert_eq!(fsm.state(), State::First);
        assert_eq!(fsm.last_event(), None);

        assert!(fsm.transition(Event::Go));
        assert_eq!(fsm.last_event(), Some(Event::Go));
        assert_eq!(fsm.state(), State::Working);

        // no self-transition declared
        assert!(!fsm.transition(Event::Go));
        assert_eq!(fsm.last_event(), Some(Event::Go));
        assert_eq!(fsm.state(), State::Working);

        assert!(fsm.transition(Event::Error));
        assert_eq!(fsm.state(), State::Failed);

        let mut resumed = machine(State::Working);
        assert!(resumed.transition(Event::Success));
        assert_eq!(resumed.state(), State::DoneOne);
        assert!(resumed.transition(Event::Next));
        assert_eq!(resumed.state(), State::DoneTwo);
    }

    #[test]
    fn can_transition_previews_the_table() {
        let fsm = machine(State::First);
        assert!(fsm.can_transition(Event::Go));
        assert!(!fsm.can_transition(Event::Success));
    }
}
