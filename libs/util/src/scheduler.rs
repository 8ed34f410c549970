// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A pausable, time-ordered task dispatcher.
//!
//! One dedicated thread plays [`Task`]s in non-decreasing eligibility order,
//! ties broken by insertion order. Additions park in a side list drained at
//! the top of each loop iteration, so callers never touch the time-ordered
//! queue directly; played one-shot tasks park in a trash list dropped the
//! same way. Pausing suspends the countdown of every relative (`run_in`)
//! task: resume shifts their targets by the pause duration, while absolute
//! (`run_at`) tasks keep their target and fire as soon as possible once
//! overdue — after a long pause that burst is not rate limited.
//!
//! A task played more than `overrun_at` after its target counts as an
//! overrun; overruns are counted, never fatal. A task within
//! `acceptable_preplay` of its target plays early instead of spinning the
//! wait.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::clock::{Clock, default_clock};
use crate::named::{Anchor, Named};
use crate::service::{Service, ServiceController};
use crate::sync;
use crate::task::Task;
use crate::time::Timestamp;

const DEFAULT_OVERRUN_AT: Duration = Duration::from_millis(10);
const DEFAULT_ACCEPTABLE_PREPLAY: Duration = Duration::from_nanos(100);

pub struct Scheduler {
    named: Named,
    controller: ServiceController,
    this: Weak<Scheduler>,

    clock: RwLock<Arc<dyn Clock>>,
    /// Eligibility time (ns) and insertion sequence → queued task.
    queue: Mutex<BTreeMap<(i64, u64), QueuedTask>>,
    to_add: Mutex<Vec<Arc<Task>>>,
    adds_pending: AtomicBool,
    trash: Mutex<Vec<Arc<Task>>>,
    seq: AtomicU64,

    running: AtomicBool,
    paused: AtomicBool,
    /// Start of run in clock nanoseconds, shifted forward across pauses;
    /// the base of every `run_in` target.
    begin_run: AtomicI64,
    paused_at: AtomicI64,

    overruns: AtomicU64,
    overrun_at: AtomicI64,
    preplay: AtomicI64,
    no_delay: AtomicBool,

    task_waitable: crate::waitable::Waitable,
    pause_waitable: crate::waitable::Waitable,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct QueuedTask {
    task: Arc<Task>,
    /// Relative tasks shift with pauses; absolute ones do not.
    relative: bool,
}

// === impl Scheduler ===

impl Scheduler {
    /// Creates a stopped scheduler. Setup and Init are optional: `start()`
    /// is legal immediately.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not a valid tree name.
    pub fn new(name: impl Into<String>) -> Arc<Scheduler> {
        let name = name.into();
        Arc::new_cyclic(|this: &Weak<Scheduler>| {
            let anchor: Weak<dyn Anchor> = this.clone();
            let controller = ServiceController::new();
            controller.optional_setup();
            controller.optional_init();
            Scheduler {
                named: Named::new(name, anchor),
                controller,
                this: this.clone(),
                clock: RwLock::new(default_clock()),
                queue: Mutex::new(BTreeMap::new()),
                to_add: Mutex::new(Vec::new()),
                adds_pending: AtomicBool::new(false),
                trash: Mutex::new(Vec::new()),
                seq: AtomicU64::new(0),
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                begin_run: AtomicI64::new(0),
                paused_at: AtomicI64::new(0),
                overruns: AtomicU64::new(0),
                overrun_at: AtomicI64::new(duration_nanos(DEFAULT_OVERRUN_AT)),
                preplay: AtomicI64::new(duration_nanos(DEFAULT_ACCEPTABLE_PREPLAY)),
                no_delay: AtomicBool::new(false),
                task_waitable: crate::waitable::Waitable::new(),
                pause_waitable: crate::waitable::Waitable::new(),
                thread: Mutex::new(None),
            }
        })
    }

    pub fn named(&self) -> &Named {
        &self.named
    }

    pub fn set_clock(&self, clock: Arc<dyn Clock>) {
        *sync::write(&self.clock) = clock;
    }

    pub fn now(&self) -> Timestamp {
        sync::read(&self.clock).now()
    }

    /// Overruns counted since start.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Acquire)
    }

    /// Lateness after which a played task counts as an overrun.
    pub fn set_overrun_at(&self, threshold: Duration) {
        self.overrun_at
            .store(duration_nanos(threshold), Ordering::Release);
    }

    /// Slack within which a task may play ahead of its target instead of
    /// waiting out the remainder.
    pub fn set_acceptable_preplay(&self, slack: Duration) {
        self.preplay.store(duration_nanos(slack), Ordering::Release);
    }

    /// Plays every task as soon as it is seen, ignoring targets. Test and
    /// fast-replay aid.
    pub fn set_no_delay(&self, active: bool) {
        self.no_delay.store(active, Ordering::Release);
    }

    /// Parks `task` for the dispatch loop. Eligibility: `run_at` tasks at
    /// their absolute target (overdue targets play immediately), `run_in`
    /// tasks at start-of-run + delay, targetless tasks right away.
    pub fn add_task(&self, task: Arc<Task>) {
        sync::lock(&self.to_add).push(task);
        self.adds_pending.store(true, Ordering::Release);
        let _guard = self.task_waitable.guard();
        self.task_waitable.notify_all();
    }

    /// Removes `task` whether it is still parked, queued, or already played.
    /// A task being played at this instant completes but is not rescheduled.
    /// Returns whether the task was found somewhere.
    pub fn remove_task(&self, task: &Arc<Task>) -> bool {
        let mut found = false;
        {
            let mut to_add = sync::lock(&self.to_add);
            let before = to_add.len();
            to_add.retain(|parked| !Arc::ptr_eq(parked, task));
            found |= to_add.len() != before;
        }
        {
            let mut queue = sync::lock(&self.queue);
            let key = queue
                .iter()
                .find(|(_, queued)| Arc::ptr_eq(&queued.task, task))
                .map(|(key, _)| *key);
            if let Some(key) = key {
                if let Some(queued) = queue.remove(&key) {
                    sync::lock(&self.trash).push(queued.task);
                }
                found = true;
            }
        }
        let _guard = self.task_waitable.guard();
        self.task_waitable.notify_all();
        found
    }

    pub fn clear_tasks(&self) {
        {
            let mut trash = sync::lock(&self.trash);
            trash.extend(sync::lock(&self.to_add).drain(..));
            let drained = std::mem::take(&mut *sync::lock(&self.queue));
            trash.extend(drained.into_values().map(|queued| queued.task));
        }
        let _guard = self.task_waitable.guard();
        self.task_waitable.notify_all();
    }

    /// Number of tasks waiting to play (parked additions included).
    pub fn task_count(&self) -> usize {
        sync::lock(&self.queue).len() + sync::lock(&self.to_add).len()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Freezes dispatch. Relative tasks stop counting down; absolute tasks
    /// keep their targets.
    pub fn pause(&self) {
        if self.paused.swap(true, Ordering::AcqRel) {
            return;
        }
        self.paused_at
            .store(self.now().nanoseconds(), Ordering::Release);
        let _guard = self.task_waitable.guard();
        self.task_waitable.notify_all();
    }

    /// Thaws dispatch, shifting every pending relative task — and the base
    /// of future relative targets — forward by the pause duration.
    pub fn resume(&self) {
        if !self.paused.load(Ordering::Acquire) {
            return;
        }
        let shift = self.now().nanoseconds() - self.paused_at.load(Ordering::Acquire);
        {
            let mut queue = sync::lock(&self.queue);
            let entries = std::mem::take(&mut *queue);
            for ((due, seq), queued) in entries {
                let due = if queued.relative { due + shift } else { due };
                queue.insert((due, seq), queued);
            }
        }
        self.begin_run.fetch_add(shift, Ordering::AcqRel);
        self.paused.store(false, Ordering::Release);
        {
            let _guard = self.pause_waitable.guard();
            self.pause_waitable.notify_all();
        }
        let _guard = self.task_waitable.guard();
        self.task_waitable.notify_all();
    }

    fn drain_added(&self) {
        let parked = {
            let mut to_add = sync::lock(&self.to_add);
            self.adds_pending.store(false, Ordering::Release);
            std::mem::take(&mut *to_add)
        };
        if parked.is_empty() {
            return;
        }
        let begin_run = self.begin_run.load(Ordering::Acquire);
        let mut queue = sync::lock(&self.queue);
        for task in parked {
            let (due, relative) = match (task.run_at(), task.run_in()) {
                (Some(at), _) => (at.nanoseconds(), false),
                (None, Some(delay)) => (begin_run + duration_nanos(delay), true),
                (None, None) => (self.now().nanoseconds(), false),
            };
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            queue.insert((due, seq), QueuedTask { task, relative });
        }
    }

    fn drain_trash(&self) {
        sync::lock(&self.trash).clear();
    }

    fn run_loop(&self) {
        enum Step {
            Play { due: i64, queued: QueuedTask },
            Idle,
            WaitUntil(i64),
        }

        while self.running.load(Ordering::Acquire) {
            self.pause_waitable
                .wait(|| !self.is_paused() || !self.running.load(Ordering::Acquire));
            if !self.running.load(Ordering::Acquire) {
                break;
            }

            self.drain_added();
            self.drain_trash();

            let now = self.now().nanoseconds();
            let preplay = self.preplay.load(Ordering::Acquire);
            let step = {
                let mut queue = sync::lock(&self.queue);
                match queue.first_key_value() {
                    None => Step::Idle,
                    Some(((due, _), _))
                        if self.no_delay.load(Ordering::Acquire) || now + preplay >= *due =>
                    {
                        match queue.pop_first() {
                            Some(((due, _), queued)) => Step::Play { due, queued },
                            None => Step::Idle,
                        }
                    }
                    Some(((due, _), _)) => Step::WaitUntil(*due),
                }
            };

            let interrupted = || {
                !self.running.load(Ordering::Acquire)
                    || self.is_paused()
                    || self.adds_pending.load(Ordering::Acquire)
            };
            match step {
                Step::Play { due, queued } => self.play(due, queued),
                Step::Idle => {
                    self.task_waitable.wait(interrupted);
                }
                Step::WaitUntil(due) => {
                    let remaining = Duration::from_nanos((due - now).max(0).cast_unsigned());
                    self.task_waitable.wait_for(remaining, interrupted);
                }
            }
        }

        self.drain_trash();
    }

    fn play(&self, due: i64, queued: QueuedTask) {
        let played_at = self.now();
        let late = played_at.nanoseconds() - due;
        if late > self.overrun_at.load(Ordering::Acquire) {
            self.overruns.fetch_add(1, Ordering::AcqRel);
            tracing::warn!(
                scheduler = %self.named.name(),
                late_ns = late,
                "task overrun",
            );
        }

        let keep = queued.task.run();
        queued.task.mark_run(played_at);

        match queued.task.period() {
            Some(period) if keep => {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                sync::lock(&self.queue)
                    .insert((due + duration_nanos(period), seq), queued);
            }
            _ => sync::lock(&self.trash).push(queued.task),
        }
    }
}

impl Service for Scheduler {
    fn controller(&self) -> Option<&ServiceController> {
        Some(&self.controller)
    }

    fn service_name(&self) -> String {
        self.named.full_name()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn do_start(&self) -> bool {
        if self.running.swap(true, Ordering::AcqRel) {
            return true;
        }
        self.paused.store(false, Ordering::Release);
        self.begin_run
            .store(self.now().nanoseconds(), Ordering::Release);

        let Some(this) = self.this.upgrade() else {
            self.running.store(false, Ordering::Release);
            return false;
        };
        let spawned = std::thread::Builder::new()
            .name(self.named.name().to_owned())
            .spawn(move || this.run_loop());
        match spawned {
            Ok(handle) => {
                *sync::lock(&self.thread) = Some(handle);
                true
            }
            Err(error) => {
                tracing::error!(scheduler = %self.named.name(), %error, "could not spawn scheduler thread");
                self.running.store(false, Ordering::Release);
                false
            }
        }
    }

    fn do_stop(&self) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return true;
        }
        {
            let _guard = self.task_waitable.guard();
            self.task_waitable.notify_all();
        }
        {
            let _guard = self.pause_waitable.guard();
            self.pause_waitable.notify_all();
        }
        let handle = sync::lock(&self.thread).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.drain_trash();
        true
    }

    fn do_reset(&self) -> bool {
        self.clear_tasks();
        self.drain_trash();
        self.overruns.store(0, Ordering::Release);
        true
    }
}

impl Anchor for Scheduler {
    fn named(&self) -> &Named {
        &self.named
    }

    fn service(&self) -> Option<&dyn Service> {
        Some(self)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn description(&self) -> String {
        format!("scheduler ({})", self.controller.state())
    }
}

fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}
