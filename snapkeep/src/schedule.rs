//! Cron scheduling with cooperative cancellation.
//!
//! A [`Scheduler`] owns one [`Job`] and fires it at every occurrence of a
//! 5-field cron expression. Firings never overlap: the loop sleeps until the
//! next occurrence, runs the job to completion, then computes the following
//! occurrence.
//!
//! Cancellation is checked in two places. During the sleep it wins the
//! `select!` and the loop stops without firing again. During a job it is
//! only observed after the job returns, so an in-flight job is never cut
//! short.
//!
//! ```text
//!  Idle ──spawn──▶ Running ──cancel while sleeping──▶ Cancelled
//!                     │
//!                     └──cancel during job / schedule exhausted──▶ Completed
//! ```

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use croner::Cron;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ScheduleError;

/// A parsed cron expression.
#[derive(Debug, Clone)]
pub struct Schedule {
    expression: String,
    cron: Cron,
}

impl Schedule {
    /// Parses a cron expression such as `*/15 * * * *`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::InvalidExpression`] if the expression is
    /// malformed.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chrono::{TimeZone, Utc};
    /// use snapkeep::schedule::Schedule;
    ///
    /// let schedule = Schedule::parse("*/15 * * * *")?;
    /// let after = Utc.with_ymd_and_hms(2024, 1, 1, 10, 7, 0).unwrap();
    /// assert_eq!(
    ///     schedule.next_after(after)?,
    ///     Utc.with_ymd_and_hms(2024, 1, 1, 10, 15, 0).unwrap()
    /// );
    /// # Ok::<(), snapkeep::error::ScheduleError>(())
    /// ```
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let cron = Cron::new(expression)
            .parse()
            .map_err(|e| ScheduleError::InvalidExpression {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            expression: expression.to_string(),
            cron,
        })
    }

    /// The expression this schedule was parsed from.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Returns the first occurrence strictly after `after`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::NoNextOccurrence`] if the expression never
    /// matches again.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        self.cron
            .find_next_occurrence(&after, false)
            .map_err(|_| ScheduleError::NoNextOccurrence {
                expression: self.expression.clone(),
                after,
            })
    }

    /// Returns up to `count` occurrences after `after`, in order.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = after;
        while times.len() < count {
            let Ok(next) = self.next_after(cursor) else {
                break;
            };
            times.push(next);
            cursor = next;
        }
        times
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Source of wall-clock time for the scheduler.
pub trait Clock: Send + Sync + 'static {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A wall clock driven by tokio's monotonic time.
///
/// Starts at a fixed wall time and advances with [`tokio::time::Instant`], so
/// it follows `tokio::time::pause` and `advance` in tests.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin_wall: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl MonotonicClock {
    /// Creates a clock reading `start` at the current tokio instant.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            origin_wall: start,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        TimeDelta::from_std(self.origin.elapsed())
            .ok()
            .and_then(|elapsed| self.origin_wall.checked_add_signed(elapsed))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Work fired by the scheduler.
#[async_trait]
pub trait Job: Send + 'static {
    /// Error a single run can fail with.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Runs once for the occurrence at `fired_at`.
    async fn run(&mut self, fired_at: DateTime<Utc>) -> Result<(), Self::Error>;
}

/// A [`Job`] built from a closure. See [`job_fn`].
pub struct FnJob<F>(F);

/// Wraps a closure returning a future as a [`Job`].
///
/// # Examples
///
/// ```rust
/// use snapkeep::schedule::{job_fn, Scheduler};
///
/// let job = job_fn(|fired_at| async move {
///     println!("fired at {fired_at}");
///     Ok::<(), std::io::Error>(())
/// });
/// let _scheduler = Scheduler::new("0 * * * *", job)?;
/// # Ok::<(), snapkeep::error::ScheduleError>(())
/// ```
pub fn job_fn<F>(f: F) -> FnJob<F> {
    FnJob(f)
}

#[async_trait]
impl<F, Fut, E> Job for FnJob<F>
where
    F: FnMut(DateTime<Utc>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    type Error = E;

    async fn run(&mut self, fired_at: DateTime<Utc>) -> Result<(), E> {
        (self.0)(fired_at).await
    }
}

/// Observable scheduler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Constructed, not yet running.
    Idle,
    /// Waiting for or running a job.
    Running,
    /// Stopped after a job, or because the schedule ran out.
    Completed,
    /// Stopped while waiting, without firing again.
    Cancelled,
}

/// How a scheduler run ended.
#[derive(Debug)]
pub enum Completion<E> {
    /// Cancelled while waiting for the next occurrence.
    Cancelled,
    /// Cancelled while a job was running; carries that job's error, if any.
    Completed(Option<E>),
    /// The expression has no further occurrences.
    Exhausted,
}

impl<E> Completion<E> {
    /// Returns the error of the last job, if the run ended after one.
    pub fn into_error(self) -> Option<E> {
        match self {
            Self::Completed(error) => error,
            Self::Cancelled | Self::Exhausted => None,
        }
    }
}

type ErrorObserver<E> = Box<dyn FnMut(&E) + Send>;

/// Fires a job on a cron schedule until cancelled.
pub struct Scheduler<J: Job, C: Clock = SystemClock> {
    schedule: Schedule,
    job: J,
    clock: C,
    cancel: CancellationToken,
    state: watch::Sender<SchedulerState>,
    on_error: Option<ErrorObserver<J::Error>>,
}

impl<J: Job> Scheduler<J, SystemClock> {
    /// Creates a scheduler on the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::InvalidExpression`] if `expression` does not
    /// parse. Nothing is started.
    pub fn new(expression: &str, job: J) -> Result<Self, ScheduleError> {
        Ok(Self::from_schedule(Schedule::parse(expression)?, job))
    }

    /// Creates a scheduler from an already parsed schedule.
    pub fn from_schedule(schedule: Schedule, job: J) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            schedule,
            job,
            clock: SystemClock,
            cancel: CancellationToken::new(),
            state,
            on_error: None,
        }
    }
}

impl<J: Job, C: Clock> Scheduler<J, C> {
    /// Replaces the clock.
    pub fn with_clock<C2: Clock>(self, clock: C2) -> Scheduler<J, C2> {
        Scheduler {
            schedule: self.schedule,
            job: self.job,
            clock,
            cancel: self.cancel,
            state: self.state,
            on_error: self.on_error,
        }
    }

    /// Registers a callback invoked with every job error.
    #[must_use]
    pub fn on_error(mut self, observer: impl FnMut(&J::Error) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(observer));
        self
    }

    /// The schedule being followed.
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Token that stops the scheduler when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Runs the loop on the current task until it is cancelled or the
    /// schedule is exhausted.
    #[tracing::instrument(name = "scheduler", skip_all, fields(schedule = %self.schedule))]
    pub async fn run(mut self) -> Completion<J::Error> {
        self.state.send_replace(SchedulerState::Running);
        tracing::info!("scheduler started");

        let mut last_fired: Option<DateTime<Utc>> = None;

        let completion = loop {
            if self.cancel.is_cancelled() {
                break Completion::Cancelled;
            }

            let now = self.clock.now();
            // Never fire the same occurrence twice if the clock reads early.
            let after = last_fired.map_or(now, |fired| fired.max(now));
            let next = match self.schedule.next_after(after) {
                Ok(next) => next,
                Err(e) => {
                    tracing::warn!(error = %e, "schedule exhausted");
                    break Completion::Exhausted;
                }
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tracing::debug!(next = %next, wait = ?wait, "waiting for next run");

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    tracing::debug!("cancelled while waiting");
                    break Completion::Cancelled;
                }
                () = tokio::time::sleep(wait) => {}
            }

            last_fired = Some(next);
            tracing::debug!(fired_at = %next, "running job");
            let last_error = match AssertUnwindSafe(self.job.run(next)).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "job failed");
                    if let Some(observer) = self.on_error.as_mut() {
                        observer(&e);
                    }
                    Some(e)
                }
                Err(panic) => {
                    tracing::error!(panic = panic_message(panic.as_ref()), "job panicked");
                    None
                }
            };

            if self.cancel.is_cancelled() {
                tracing::debug!("cancelled during job");
                break Completion::Completed(last_error);
            }
        };

        let state = match completion {
            Completion::Cancelled => SchedulerState::Cancelled,
            Completion::Completed(_) | Completion::Exhausted => SchedulerState::Completed,
        };
        self.state.send_replace(state);
        tracing::info!(?state, "scheduler stopped");
        completion
    }

    /// Starts the loop on a new tokio task.
    pub fn spawn(self) -> SchedulerHandle<J::Error> {
        let cancel = self.cancel.clone();
        let state = self.state.subscribe();
        let task = tokio::spawn(self.run());
        SchedulerHandle { cancel, state, task }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Handle to a spawned [`Scheduler`].
pub struct SchedulerHandle<E> {
    cancel: CancellationToken,
    state: watch::Receiver<SchedulerState>,
    task: JoinHandle<Completion<E>>,
}

impl<E> SchedulerHandle<E> {
    /// Requests cancellation. Calling it more than once has no further
    /// effect.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Returns `true` once the scheduler task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the scheduler to stop.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::TaskFailed`] if the scheduler task itself
    /// panicked or was aborted.
    pub async fn wait(self) -> Result<Completion<E>, ScheduleError> {
        join(self.task).await
    }
}

async fn join<E>(task: JoinHandle<Completion<E>>) -> Result<Completion<E>, ScheduleError> {
    task.await.map_err(|e| ScheduleError::TaskFailed {
        reason: e.to_string(),
    })
}

/// Spawns `scheduler` and stops it when `shutdown` resolves.
///
/// Exactly one cancel is sent on shutdown; an in-flight job finishes first.
/// Returns early if the scheduler stops on its own.
///
/// # Errors
///
/// Returns [`ScheduleError::TaskFailed`] if the scheduler task failed.
pub async fn run_until_shutdown<J, C, F>(
    scheduler: Scheduler<J, C>,
    shutdown: F,
) -> Result<Completion<J::Error>, ScheduleError>
where
    J: Job,
    C: Clock,
    F: Future<Output = ()>,
{
    let SchedulerHandle { cancel, mut task, .. } = scheduler.spawn();

    tokio::select! {
        result = &mut task => {
            return result.map_err(|e| ScheduleError::TaskFailed { reason: e.to_string() });
        }
        () = shutdown => {
            tracing::info!("shutdown requested, waiting for scheduler to stop");
            cancel.cancel();
        }
    }

    join(task).await
}
