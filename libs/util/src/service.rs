// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Service lifecycle.
//!
//! A service moves through Setup → Init → Start → Stop → Reset; the
//! [`ServiceController`] guards each operation with a state machine so an
//! operation issued in the wrong phase is a warned no-op, not a crash. The
//! [`Service`] trait supplies the public operations: each one opens the
//! controller (`op_start`), runs the `do_*` hook, and closes it with the
//! hook's verdict (`op_end`). Controllers are observable; every accepted
//! transition notifies.

use core::fmt;

use std::sync::{Arc, Mutex};

use crate::observable::{Handler, Observable};
use crate::state_machine::StateMachine;
use crate::sync;

/// A lifecycle operation a caller can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Setup,
    Init,
    Start,
    Stop,
    Reset,
}

/// An event fed to the lifecycle state machine: a requested operation or the
/// completion verdict of the running one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceEvent {
    Setup,
    Init,
    Start,
    Stop,
    Reset,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    None,
    Configuring,
    Configured,
    Initializing,
    Stopped,
    Starting,
    Running,
    Stopping,
    Resetting,
    Error,
}

/// The default lifecycle table. Op-phase states accept exactly one verdict
/// pair; every op-phase error lands in `Error`.
const TRANSITIONS: &[(ServiceState, ServiceEvent, ServiceState)] = {
    use ServiceEvent as E;
    use ServiceState as S;
    &[
        // none -> setup -> configured
        (S::None, E::Setup, S::Configuring),
        (S::Configuring, E::Error, S::Error),
        (S::Configuring, E::Success, S::Configured),
        // configured -> init -> stopped
        (S::Configured, E::Init, S::Initializing),
        (S::Initializing, E::Error, S::Error),
        (S::Initializing, E::Success, S::Stopped),
        // stopped -> start -> running
        (S::Stopped, E::Start, S::Starting),
        (S::Starting, E::Error, S::Error),
        (S::Starting, E::Success, S::Running),
        // running -> stop -> stopped
        (S::Running, E::Stop, S::Stopping),
        (S::Stopping, E::Error, S::Error),
        (S::Stopping, E::Success, S::Stopped),
        // configured or stopped -> reset -> none
        (S::Configured, E::Reset, S::Resetting),
        (S::Stopped, E::Reset, S::Resetting),
        (S::Resetting, E::Error, S::Error),
        (S::Resetting, E::Success, S::None),
    ]
};

/// Observable state machine governing a service's lifecycle transitions.
pub struct ServiceController {
    machine: Mutex<StateMachine<ServiceState, ServiceEvent>>,
    observable: Observable<ServiceController>,
}

/// An object with a Setup/Init/Start/Stop/Reset lifecycle.
///
/// Implementors provide the `do_*` hooks and (usually) a controller; the
/// provided operations wrap the hooks in the controller's op guard. Without a
/// controller the hooks run unguarded.
pub trait Service: Send + Sync {
    fn controller(&self) -> Option<&ServiceController> {
        None
    }

    /// Name used in lifecycle diagnostics.
    fn service_name(&self) -> String {
        String::new()
    }

    fn is_running(&self) -> bool;

    fn do_setup(&self) -> bool {
        true
    }

    fn do_init(&self) -> bool {
        true
    }

    fn do_start(&self) -> bool {
        true
    }

    fn do_stop(&self) -> bool {
        true
    }

    fn do_reset(&self) -> bool {
        true
    }

    fn setup(&self) -> bool {
        run_operation(self, Operation::Setup)
    }

    fn init(&self) -> bool {
        run_operation(self, Operation::Init)
    }

    fn start(&self) -> bool {
        run_operation(self, Operation::Start)
    }

    fn stop(&self) -> bool {
        run_operation(self, Operation::Stop)
    }

    fn reset(&self) -> bool {
        run_operation(self, Operation::Reset)
    }

    /// The controller's state, `None`-state when the service has no
    /// controller.
    fn state(&self) -> ServiceState {
        self.controller()
            .map_or(ServiceState::None, ServiceController::state)
    }
}

fn run_operation<S: Service + ?Sized>(service: &S, op: Operation) -> bool {
    let Some(controller) = service.controller() else {
        return dispatch_hook(service, op);
    };
    if !controller.op_start(op) {
        tracing::warn!(
            service = %service.service_name(),
            state = %controller.state(),
            operation = %op,
            "operation forbidden in current state",
        );
        return false;
    }
    let ok = dispatch_hook(service, op);
    controller.op_end(op, ok);
    ok
}

fn dispatch_hook<S: Service + ?Sized>(service: &S, op: Operation) -> bool {
    match op {
        Operation::Setup => service.do_setup(),
        Operation::Init => service.do_init(),
        Operation::Start => service.do_start(),
        Operation::Stop => service.do_stop(),
        Operation::Reset => service.do_reset(),
    }
}

// === impl ServiceController ===

impl ServiceController {
    pub fn new() -> Self {
        Self {
            machine: Mutex::new(StateMachine::with_transitions(
                ServiceState::None,
                TRANSITIONS,
            )),
            observable: Observable::new(),
        }
    }

    /// Declares Setup skippable: Init becomes legal straight from `None`.
    pub fn optional_setup(&self) {
        sync::lock(&self.machine).add_transition(
            ServiceState::None,
            ServiceEvent::Init,
            ServiceState::Initializing,
        );
    }

    /// Declares Setup and Init skippable: Start becomes legal straight from
    /// `None`. For thread-backed services with nothing to configure.
    pub fn optional_init(&self) {
        sync::lock(&self.machine).add_transition(
            ServiceState::None,
            ServiceEvent::Start,
            ServiceState::Starting,
        );
    }

    /// Enters the op-phase of `op`. Returns false — leaving the state
    /// untouched — when the operation is forbidden in the current state.
    pub fn op_start(&self, op: Operation) -> bool {
        let accepted = sync::lock(&self.machine).transition(op.into());
        if accepted {
            self.observable.notify_observers(self);
        }
        accepted
    }

    /// Leaves the op-phase of `op` with the operation's verdict.
    pub fn op_end(&self, op: Operation, success: bool) -> bool {
        let event = if success {
            ServiceEvent::Success
        } else {
            ServiceEvent::Error
        };
        let accepted = sync::lock(&self.machine).transition(event);
        if !accepted {
            tracing::warn!(operation = %op, success, "op_end outside of an op-phase");
        }
        self.observable.notify_observers(self);
        accepted
    }

    pub fn state(&self) -> ServiceState {
        sync::lock(&self.machine).state()
    }

    pub fn last_event(&self) -> Option<ServiceEvent> {
        sync::lock(&self.machine).last_event()
    }

    pub fn add_observer(&self, observer: &Arc<dyn Handler<ServiceController>>) -> bool {
        self.observable.add_observer(observer, false)
    }

    pub fn remove_observer(&self, observer: &Arc<dyn Handler<ServiceController>>) {
        self.observable.remove_observer(observer);
    }
}

impl Default for ServiceController {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServiceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceController")
            .field("state", &self.state())
            .field("last_event", &self.last_event())
            .finish()
    }
}

// === impl Operation ===

impl From<Operation> for ServiceEvent {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Setup => ServiceEvent::Setup,
            Operation::Init => ServiceEvent::Init,
            Operation::Start => ServiceEvent::Start,
            Operation::Stop => ServiceEvent::Stop,
            Operation::Reset => ServiceEvent::Reset,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Setup => "setup",
            Operation::Init => "init",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Reset => "reset",
        };
        f.pad(name)
    }
}

// === impl ServiceState ===

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::None => "none",
            ServiceState::Configuring => "configuring",
            ServiceState::Configured => "configured",
            ServiceState::Initializing => "initializing",
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Resetting => "resetting",
            ServiceState::Error => "error",
        };
        f.pad(name)
    }
}

// === impl ServiceEvent ===

impl fmt::Display for ServiceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceEvent::Setup => "setup",
            ServiceEvent::Init => "init",
            ServiceEvent::Start => "start",
            ServiceEvent::Stop => "stop",
            ServiceEvent::Reset => "reset",
            ServiceEvent::Success => "success",
            ServiceEvent::Error => "error",
        };
        f.pad(name)
    }
}
