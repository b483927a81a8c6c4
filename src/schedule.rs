//! Periodic task dispatcher owned by each collector.
//!
//! A [`Schedule`] holds a small set of named tasks (`data`, `instance`,
//! `counter`, ...) with independent intervals. The collector worker asks
//! [`Schedule::next_due`] what to run and how long to wait, runs the task,
//! and reports back with [`Schedule::mark_ran`] or
//! [`Schedule::apply_standoff`].
//!
//! Timing is anti-drift: a task due at `t` is rescheduled for `t + interval`
//! rather than `now + interval`, so per-cycle jitter never accumulates. A
//! cycle that overruns its interval makes the next cycle due immediately,
//! but never queues more than one catch-up cycle.
//!
//! A schedule is owned by exactly one worker and is not concurrency-safe;
//! tasks of one collector therefore never run concurrently.

use std::time::Duration;

use tokio::time::Instant;

use crate::errors::PollerError;

/// Initial standoff applied after a failing cycle.
pub const STANDOFF_START: Duration = Duration::from_secs(60);

/// Upper bound for the doubling standoff.
pub const STANDOFF_CAP: Duration = Duration::from_secs(15 * 60);

#[derive(Debug)]
struct Task {
    name: String,
    interval: Duration,
    due: Instant,
    standoff: Duration,
    last_elapsed: Duration,
    runs: u64,
    failures: u64,
}

/// Named periodic tasks with drift correction and failure standoff.
#[derive(Debug)]
pub struct Schedule {
    tasks: Vec<Task>,
    standoff_start: Duration,
    standoff_cap: Duration,
    // While set, only this task runs; the others are suspended until it
    // succeeds again (target unreachable and similar conditions).
    stalled: Option<usize>,
}

impl Default for Schedule {
    fn default() -> Self {
        Self::new()
    }
}

impl Schedule {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            standoff_start: STANDOFF_START,
            standoff_cap: STANDOFF_CAP,
            stalled: None,
        }
    }

    /// Override the standoff window; used by tests and fast-retry configs.
    pub fn with_standoff(mut self, start: Duration, cap: Duration) -> Self {
        self.standoff_start = start;
        self.standoff_cap = cap;
        self
    }

    /// Add a task. Names are unique and the interval must be positive.
    ///
    /// With `run_now` the task is due immediately; otherwise one full
    /// interval from now. Tasks keep FIFO order for tie-breaking.
    pub fn add_task(
        &mut self,
        name: impl Into<String>,
        interval: Duration,
        run_now: bool,
    ) -> Result<(), PollerError> {
        let name = name.into();
        if interval.is_zero() {
            return Err(PollerError::InvalidParam(format!(
                "task {name}: interval must be positive"
            )));
        }
        if self.tasks.iter().any(|t| t.name == name) {
            return Err(PollerError::InvalidParam(format!("duplicate task: {name}")));
        }
        let now = Instant::now();
        self.tasks.push(Task {
            name,
            interval,
            due: if run_now { now } else { now + interval },
            standoff: Duration::ZERO,
            last_elapsed: Duration::ZERO,
            runs: 0,
            failures: 0,
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Whether the schedule is waiting out a standoff.
    pub fn is_stalled(&self) -> bool {
        self.stalled.is_some()
    }

    /// The earliest-due task and the non-negative wait until then.
    ///
    /// While stalled, only the stalled task is offered.
    pub fn next_due(&self) -> Option<(&str, Duration)> {
        let now = Instant::now();
        let task = match self.stalled {
            Some(idx) => self.tasks.get(idx),
            None => self.tasks.iter().min_by_key(|t| t.due),
        }?;
        Some((&task.name, task.due.saturating_duration_since(now)))
    }

    /// Record a finished run.
    ///
    /// On success the task is rescheduled anti-drift
    /// (`due = max(now, due + interval)`), its standoff resets, and a stall
    /// on this task clears. On failure the task waits a full interval from
    /// now; a following [`Schedule::apply_standoff`] pushes it out further.
    pub fn mark_ran(&mut self, name: &str, elapsed: Duration, ok: bool) {
        let stalled_here = self
            .stalled
            .is_some_and(|idx| self.tasks[idx].name == name);
        if let Some(task) = self.tasks.iter_mut().find(|t| t.name == name) {
            task.last_elapsed = elapsed;
            task.runs += 1;
            if ok {
                let now = Instant::now();
                task.due = (task.due + task.interval).max(now);
                task.standoff = Duration::ZERO;
                if stalled_here {
                    self.stalled = None;
                }
            } else {
                task.failures += 1;
                task.due = Instant::now() + task.interval;
            }
        }
    }

    /// Push the task out by its standoff, doubling up to the cap, and stall
    /// the schedule on it.
    pub fn apply_standoff(&mut self, name: &str) -> Duration {
        let Some(idx) = self.tasks.iter().position(|t| t.name == name) else {
            return Duration::ZERO;
        };
        let task = &mut self.tasks[idx];
        task.standoff = if task.standoff.is_zero() {
            self.standoff_start
        } else {
            (task.standoff * 2).min(self.standoff_cap)
        };
        task.due = Instant::now() + task.standoff;
        self.stalled = Some(idx);
        task.standoff
    }

    /// Duration of the task's last run.
    pub fn last_elapsed(&self, name: &str) -> Option<Duration> {
        self.tasks
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.last_elapsed)
    }

    /// (runs, failures) counters of a task.
    pub fn counters(&self, name: &str) -> Option<(u64, u64)> {
        self.tasks
            .iter()
            .find(|t| t.name == name)
            .map(|t| (t.runs, t.failures))
    }
}
