// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Dedicated worker threads.
//!
//! [`Worker`] owns one named thread running a caller-provided body;
//! [`StepWorker`] runs a [`Runnable`] at a fixed frequency with pause/resume.
//! Long-running bodies observe [`Worker::is_started`] to terminate in bounded
//! time when [`Worker::stop`] is called.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::sync;
use crate::time::{hz_from_period, period_from_hz};
use crate::waitable::Waitable;

/// A unit of repeatable work.
pub trait Runnable: Send + Sync {
    /// One run. Returning false asks the driving worker to stop.
    fn run(&self) -> bool;
}

pub struct Worker {
    shared: Arc<WorkerShared>,
    handle: std::sync::Mutex<Option<JoinHandle<bool>>>,
}

struct WorkerShared {
    started: AtomicBool,
    running: AtomicBool,
}

/// A worker stepping a [`Runnable`] at a configured frequency.
pub struct StepWorker {
    worker: Worker,
    shared: Arc<StepShared>,
}

struct StepShared {
    /// Step period in nanoseconds; zero means unconfigured.
    period: AtomicI64,
    paused: AtomicBool,
    waitable: Waitable,
}

// === impl Worker ===

impl Worker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                started: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
            handle: std::sync::Mutex::new(None),
        }
    }

    /// Spawns the worker thread. A no-op returning true when already
    /// started; false when the thread could not be spawned.
    pub fn start(&self, name: &str, body: impl FnOnce() -> bool + Send + 'static) -> bool {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return true;
        }

        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                shared.running.store(true, Ordering::Release);
                let result = body();
                shared.running.store(false, Ordering::Release);
                result
            });

        match spawned {
            Ok(handle) => {
                *sync::lock(&self.handle) = Some(handle);
                true
            }
            Err(error) => {
                tracing::error!(worker = %name, %error, "could not spawn worker thread");
                self.shared.started.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Clears the started flag and joins the thread. Idempotent. The body is
    /// responsible for observing [`Worker::is_started`] promptly.
    pub fn stop(&self) -> bool {
        self.shared.started.store(false, Ordering::Release);
        let handle = sync::lock(&self.handle).take();
        match handle {
            Some(handle) => handle.join().unwrap_or(false),
            None => true,
        }
    }

    /// Whether the worker has been started and not yet stopped. Worker
    /// bodies poll this as their shutdown signal.
    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    /// Whether the worker thread is currently executing its body.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

// === impl StepWorker ===

impl StepWorker {
    pub fn new() -> Self {
        Self {
            worker: Worker::new(),
            shared: Arc::new(StepShared {
                period: AtomicI64::new(0),
                paused: AtomicBool::new(false),
                waitable: Waitable::new(),
            }),
        }
    }

    /// Sets the step frequency. Fails (with an error log) for frequencies at
    /// or below zero.
    pub fn set_frequency(&self, hz: f64) -> bool {
        let Some(period) = period_from_hz(hz) else {
            tracing::error!(frequency = hz, "frequency must be above zero");
            return false;
        };
        let nanos = i64::try_from(period.as_nanos()).unwrap_or(i64::MAX);
        self.shared.period.store(nanos, Ordering::Release);
        true
    }

    pub fn frequency(&self) -> f64 {
        let nanos = self.shared.period.load(Ordering::Acquire);
        hz_from_period(Duration::from_nanos(nanos.max(0).cast_unsigned()))
    }

    /// Holds the loop before its next step.
    pub fn pause(&self) {
        let _guard = self.shared.waitable.guard();
        self.shared.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        let _guard = self.shared.waitable.guard();
        self.shared.paused.store(false, Ordering::Release);
        self.shared.waitable.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Starts stepping `runnable`. Refuses to start without a configured
    /// frequency. The runnable returning false ends the loop.
    pub fn start(&self, name: &str, runnable: Arc<dyn Runnable>) -> bool {
        let period = self.shared.period.load(Ordering::Acquire);
        if period <= 0 {
            tracing::error!(worker = %name, "no frequency configured");
            return false;
        }
        let period = Duration::from_nanos(period.cast_unsigned());

        let shared = self.shared.clone();
        let worker_shared = self.worker.shared.clone();
        self.worker.start(name, move || {
            let started = || worker_shared.started.load(Ordering::Acquire);
            loop {
                shared
                    .waitable
                    .wait(|| !shared.paused.load(Ordering::Acquire) || !started());
                if !started() {
                    break;
                }
                if !runnable.run() {
                    return false;
                }
                shared.waitable.wait_for(period, || !started());
                if !started() {
                    break;
                }
            }
            true
        })
    }

    /// Stops and joins the stepping thread, resuming it first so a paused
    /// loop can observe the stop.
    pub fn stop(&self) -> bool {
        self.worker.shared.started.store(false, Ordering::Release);
        {
            let _guard = self.shared.waitable.guard();
            self.shared.waitable.notify_all();
        }
        self.worker.stop()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }
}

impl Default for StepWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn worker_runs_its_body_once() {
        let worker = Worker::new();
        let count = Arc::new(AtomicUsize::new(0));
        let captured = count.clone();
        assert!(worker.start("test-worker", move || {
            captured.fetch_add(1, Ordering::SeqCst);
            true
        }));
        assert!(worker.stop());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!worker.is_running());
    }

    struct Counter(AtomicUsize);

    impl Runnable for Counter {
        fn run(&self) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn step_worker_needs_a_frequency() {
        let step = StepWorker::new();
        assert!(!step.start("unconfigured", Arc::new(Counter(AtomicUsize::new(0)))));
        assert!(!step.set_frequency(0.0));
        assert!(!step.set_frequency(-10.0));
        assert!(step.set_frequency(1000.0));
    }

    #[test]
    fn step_worker_steps_at_its_frequency() {
        let step = StepWorker::new();
        assert!(step.set_frequency(1000.0));
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        assert!(step.start("stepper", counter.clone()));

        std::thread::sleep(Duration::from_millis(200));
        assert!(step.stop());
        let steps = counter.0.load(Ordering::SeqCst);
        // 1 kHz for 200 ms; wide bounds, CI machines stall
        assert!(steps >= 4, "only {steps} steps");
    }

    #[test]
    fn step_worker_pauses_and_resumes() {
        let step = StepWorker::new();
        assert!(step.set_frequency(1000.0));
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        step.pause();
        assert!(step.start("paused-stepper", counter.clone()));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        step.resume();
        std::thread::sleep(Duration::from_millis(100));
        assert!(counter.0.load(Ordering::SeqCst) > 0);
        assert!(step.stop());
    }
}
