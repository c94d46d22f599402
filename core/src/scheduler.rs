//! Cooperative task scheduling primitives
//!
//! Tasks run to completion on a single thread and tell the scheduler when
//! they want to run next by returning a [`TaskStatus`]. Interrupt handlers
//! and other tasks wake a parked task through its [`TaskHandle`].

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::options::TICK_FREQUENCY;

/// Scheduler time in ticks since start.
pub type Ticks = u64;

/// Converts milliseconds to scheduler ticks, rounding up.
pub const fn ms_to_ticks(ms: u32) -> Ticks {
    (ms as u64 * TICK_FREQUENCY as u64).div_ceil(1000)
}

/// What a task asks of the scheduler after one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TaskStatus {
    /// Run again on the next scheduler pass.
    RunImmediate,
    /// Run again after the given number of ticks.
    RunLater(Ticks),
    /// Run again when no foreground task is ready.
    RunBackground,
    /// Park until resumed through the task handle.
    Suspend,
}

impl TaskStatus {
    /// Run-later request for a delay in milliseconds.
    pub const fn run_later_ms(ms: u32) -> Self {
        Self::run_later(ms_to_ticks(ms))
    }

    pub const fn run_later(ticks: Ticks) -> Self {
        if ticks == 0 {
            Self::RunImmediate
        } else {
            Self::RunLater(ticks)
        }
    }

    const fn foreground_delay(self) -> Ticks {
        match self {
            Self::RunLater(ticks) => ticks,
            _ => 0,
        }
    }
}

/// Combines the requests of two sub-operations of one task.
///
/// A suspend request defers to the other one. A background request mixed
/// with a foreground one becomes immediate. Otherwise the earlier wins.
pub fn prioritise(a: TaskStatus, b: TaskStatus) -> TaskStatus {
    match (a, b) {
        (TaskStatus::Suspend, other) | (other, TaskStatus::Suspend) => other,
        (TaskStatus::RunBackground, TaskStatus::RunBackground) => TaskStatus::RunBackground,
        _ => TaskStatus::run_later(a.foreground_delay().min(b.foreground_delay())),
    }
}

/// Shareable wakeup handle for a task.
///
/// `resume` only sets an atomic flag, so it is safe to call from interrupt
/// handlers and from other tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    resumed: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that the owning task runs on the next scheduler pass.
    pub fn resume(&self) {
        self.resumed.store(true, Ordering::Release);
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed.load(Ordering::Acquire)
    }

    /// True if both handles wake the same task.
    pub fn ptr_eq(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.resumed, &other.resumed)
    }

    fn take_resume(&self) -> bool {
        self.resumed.swap(false, Ordering::AcqRel)
    }
}

/// Per-task scheduling record.
#[derive(Debug)]
pub struct TaskState {
    name: &'static str,
    handle: TaskHandle,
    wake_at: Option<Ticks>,
    background: bool,
}

impl TaskState {
    /// New tasks are due immediately.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handle: TaskHandle::new(),
            wake_at: Some(0),
            background: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }

    /// Tick at which the task is next due, or `None` while suspended.
    pub fn wake_at(&self) -> Option<Ticks> {
        self.wake_at
    }

    pub fn is_suspended(&self) -> bool {
        self.wake_at.is_none() && !self.handle.is_resumed()
    }

    fn is_ready(&self, now: Ticks) -> bool {
        self.handle.is_resumed() || self.wake_at.is_some_and(|due| now >= due)
    }

    fn schedule(&mut self, status: TaskStatus, now: Ticks) {
        self.background = status == TaskStatus::RunBackground;
        self.wake_at = match status {
            TaskStatus::RunImmediate | TaskStatus::RunBackground => Some(now),
            TaskStatus::RunLater(ticks) => Some(now.saturating_add(ticks)),
            TaskStatus::Suspend => None,
        };
    }
}

/// A cooperatively scheduled unit of work.
pub trait Task {
    fn task_state(&mut self) -> &mut TaskState;

    /// Runs one step and reports when to run next.
    fn run_step(&mut self) -> TaskStatus;
}

/// Tick clock and task dispatcher.
#[derive(Debug, Default)]
pub struct Scheduler {
    now: Ticks,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Ticks {
        self.now
    }

    /// Advances the clock by one tick (timer interrupt).
    pub fn tick(&mut self) {
        self.advance(1);
    }

    pub fn advance(&mut self, ticks: Ticks) {
        self.now = self.now.saturating_add(ticks);
    }

    /// Runs `task` once if it has been resumed or is due. Returns whether it
    /// ran.
    pub fn visit<T: Task + ?Sized>(&self, task: &mut T) -> bool {
        let now = self.now;
        let state = task.task_state();
        if !state.is_ready(now) {
            return false;
        }
        // Clear before running so a resume raised during the step is kept.
        state.handle.take_resume();
        state.background = false;

        let status = task.run_step();
        task.task_state().schedule(status, now);
        true
    }

    /// One scheduler pass: every ready foreground task runs; background
    /// tasks run only if no foreground task did. Returns the number of
    /// tasks that ran.
    pub fn run_once(&self, tasks: &mut [&mut dyn Task]) -> usize {
        let mut ran = 0;
        for task in tasks.iter_mut() {
            let state = task.task_state();
            if state.background && !state.handle.is_resumed() {
                continue;
            }
            if self.visit(&mut **task) {
                ran += 1;
            }
        }
        if ran == 0 {
            for task in tasks.iter_mut() {
                if task.task_state().background && self.visit(&mut **task) {
                    ran += 1;
                }
            }
        }
        ran
    }

    /// Earliest tick any task is due, used to decide how long the idle loop
    /// may sleep. `None` means every task is parked until an interrupt.
    pub fn next_wakeup(&self, tasks: &mut [&mut dyn Task]) -> Option<Ticks> {
        tasks
            .iter_mut()
            .filter_map(|task| {
                let state = task.task_state();
                if state.handle.is_resumed() {
                    Some(self.now)
                } else {
                    state.wake_at
                }
            })
            .min()
    }
}
