//! Scheduling primitives: clocks, periodic tasks and two-phase worker shutdown
//!
//! Every periodic activity of an execution (jail polling, output flushing, telemetry
//! tailing) runs on its own thread and waits through a [`Clock`], so tests can drive
//! time by hand with [`ManualClock`] instead of sleeping.

use std::cell::Cell;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::errors::Result;

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Source of time for timestamps and periodic waits
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;

    /// Block for `period` or until `cancel` fires (a message or a dropped sender).
    /// Returns `true` when cancelled.
    fn wait(&self, period: Duration, cancel: &Receiver<()>) -> bool;
}

/// Real time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn wait(&self, period: Duration, cancel: &Receiver<()>) -> bool {
        !matches!(cancel.recv_timeout(period), Err(RecvTimeoutError::Timeout))
    }
}

struct ManualState {
    base: DateTime<Utc>,
    elapsed: Duration,
    waiting: usize,
}

/// Hand-driven clock for deterministic tests
///
/// Waiters only wake when [`ManualClock::advance`] moves time past their deadline
/// or when they are cancelled.
pub struct ManualClock {
    state: Mutex<ManualState>,
    changed: Condvar,
}

impl ManualClock {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                base,
                elapsed: Duration::ZERO,
                waiting: 0,
            }),
            changed: Condvar::new(),
        }
    }

    /// Move time forward and wake every waiter whose deadline has passed
    pub fn advance(&self, by: Duration) {
        let mut state = lock(&self.state);
        state.elapsed += by;
        self.changed.notify_all();
    }

    /// Number of threads currently parked in [`Clock::wait`]
    pub fn waiters(&self) -> usize {
        lock(&self.state).waiting
    }

    /// Block until at least `count` threads are parked, or `timeout` elapses in real time
    pub fn wait_for_waiters(&self, count: usize, timeout: Duration) -> bool {
        let guard = lock(&self.state);
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |state| state.waiting < count)
            .unwrap_or_else(|poison| poison.into_inner());
        guard.waiting >= count
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let state = lock(&self.state);
        let elapsed = chrono::Duration::from_std(state.elapsed).unwrap_or_default();
        state.base + elapsed
    }

    fn wait(&self, period: Duration, cancel: &Receiver<()>) -> bool {
        let mut state = lock(&self.state);
        let deadline = state.elapsed + period;
        state.waiting += 1;
        self.changed.notify_all();

        let cancelled = loop {
            match cancel.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break true,
                Err(TryRecvError::Empty) => {}
            }
            if state.elapsed >= deadline {
                break false;
            }
            // Cancellation arrives over a channel, so re-check it periodically.
            state = self
                .changed
                .wait_timeout(state, Duration::from_millis(5))
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poison| poison.into_inner().0);
        };

        state.waiting -= 1;
        self.changed.notify_all();
        cancelled
    }
}

/// A tick closure run every period on a dedicated thread until cancelled
///
/// After [`PeriodicTask::cancel`] returns, the closure never runs again.
pub struct PeriodicTask {
    name: String,
    cancel_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Start ticking. The first tick happens one `period` after spawning; returning
    /// `ControlFlow::Break` from the closure ends the task on its own.
    pub fn spawn<F>(
        name: impl Into<String>,
        period: Duration,
        clock: Arc<dyn Clock>,
        mut tick: F,
    ) -> Result<Self>
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let name = name.into();
        let (cancel_tx, cancel_rx) = channel();

        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            while !clock.wait(period, &cancel_rx) {
                if tick().is_break() {
                    break;
                }
            }
        })?;

        Ok(Self {
            name,
            cancel_tx: Some(cancel_tx),
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the task thread has exited (cancelled or broke out on its own)
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stop ticking and wait for an in-flight tick to complete
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }

        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                warn!("Periodic task {} panicked", self.name);
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Handed to a [`Worker`] body to observe stop requests and its emission gate
pub struct WorkerContext {
    stop_rx: Receiver<()>,
    stopped: Cell<bool>,
    gate: Arc<AtomicBool>,
}

impl WorkerContext {
    /// Non-blocking check for a stop request
    pub fn stop_requested(&self) -> bool {
        if !self.stopped.get() {
            match self.stop_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => self.stopped.set(true),
                Err(TryRecvError::Empty) => {}
            }
        }
        self.stopped.get()
    }

    /// Wait one period on `clock`; returns `true` once a stop was requested
    pub fn wait_for_stop(&self, clock: &dyn Clock, period: Duration) -> bool {
        if self.stopped.get() {
            return true;
        }
        if clock.wait(period, &self.stop_rx) {
            self.stopped.set(true);
        }
        self.stopped.get()
    }

    /// False once the owner force-cancelled this worker; nothing may be emitted after that
    pub fn is_open(&self) -> bool {
        self.gate.load(Ordering::Acquire)
    }
}

/// How a worker shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The worker acknowledged within the grace period
    Graceful,
    /// The grace period expired; the gate was closed and the thread detached
    Forced,
    /// Shutdown was already performed
    AlreadyStopped,
}

/// Background thread with a two-phase cancellation protocol:
/// request stop, await acknowledgment for a grace period, then force cancel.
pub struct Worker {
    name: String,
    stop_tx: Option<Sender<()>>,
    ack_rx: Receiver<()>,
    gate: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Result<Self>
    where
        F: FnOnce(&WorkerContext) + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = channel();
        let (ack_tx, ack_rx) = channel();
        let gate = Arc::new(AtomicBool::new(true));

        let ctx = WorkerContext {
            stop_rx,
            stopped: Cell::new(false),
            gate: Arc::clone(&gate),
        };

        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            body(&ctx);
            let _ = ack_tx.send(());
        })?;

        Ok(Self {
            name,
            stop_tx: Some(stop_tx),
            ack_rx,
            gate,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Two-phase shutdown bounded by `grace`
    pub fn shutdown(&mut self, grace: Duration) -> ShutdownOutcome {
        let Some(stop_tx) = self.stop_tx.take() else {
            return ShutdownOutcome::AlreadyStopped;
        };
        let _ = stop_tx.send(());

        match self.ack_rx.recv_timeout(grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(thread) = self.thread.take() {
                    if thread.join().is_err() {
                        warn!("Worker {} panicked", self.name);
                    }
                }
                debug!("Worker {} stopped gracefully", self.name);
                ShutdownOutcome::Graceful
            }
            Err(RecvTimeoutError::Timeout) => {
                self.gate.store(false, Ordering::Release);
                self.thread.take();
                warn!(
                    "Worker {} did not acknowledge stop within {:?}; cancelled",
                    self.name, grace
                );
                ShutdownOutcome::Forced
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.stop_tx.is_some() {
            self.gate.store(false, Ordering::Release);
            self.stop_tx.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn system_clock_wait_returns_false_on_timeout() {
        let (_tx, rx) = channel::<()>();
        assert!(!SystemClock.wait(Duration::from_millis(5), &rx));
    }

    #[test]
    fn system_clock_wait_returns_true_when_cancelled() {
        let (tx, rx) = channel::<()>();
        tx.send(()).unwrap();
        assert!(SystemClock.wait(Duration::from_secs(5), &rx));

        let (tx, rx) = channel::<()>();
        drop(tx);
        assert!(SystemClock.wait(Duration::from_secs(5), &rx));
    }

    #[test]
    fn manual_clock_now_follows_advance() {
        let base = Utc::now();
        let clock = ManualClock::new(base);
        clock.advance(Duration::from_secs(3));
        assert_eq!(clock.now(), base + chrono::Duration::seconds(3));
    }

    #[test]
    fn periodic_task_ticks_once_per_manual_period() {
        let clock = Arc::new(ManualClock::default());
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);

        let mut task = PeriodicTask::spawn(
            "test-ticker",
            Duration::from_millis(500),
            clock.clone(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            },
        )
        .unwrap();

        for expected in 1..=3 {
            assert!(clock.wait_for_waiters(1, Duration::from_secs(2)));
            clock.advance(Duration::from_millis(500));
            let start = Instant::now();
            while ticks.load(Ordering::SeqCst) < expected && start.elapsed() < Duration::from_secs(2)
            {
                thread::sleep(Duration::from_millis(1));
            }
            assert_eq!(ticks.load(Ordering::SeqCst), expected);
        }

        task.cancel();
        assert!(task.is_finished());
        clock.advance(Duration::from_secs(10));
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn periodic_task_stops_itself_on_break() {
        let clock = Arc::new(ManualClock::default());
        let task = PeriodicTask::spawn("breaker", Duration::from_millis(10), clock.clone(), || {
            ControlFlow::Break(())
        })
        .unwrap();

        assert!(clock.wait_for_waiters(1, Duration::from_secs(2)));
        clock.advance(Duration::from_millis(10));

        let start = Instant::now();
        while !task.is_finished() && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(task.is_finished());
    }

    #[test]
    fn periodic_task_cancel_is_idempotent() {
        let mut task = PeriodicTask::spawn(
            "idle",
            Duration::from_secs(60),
            Arc::new(SystemClock),
            || ControlFlow::Continue(()),
        )
        .unwrap();
        task.cancel();
        task.cancel();
        assert!(task.is_finished());
        assert_eq!(task.name(), "idle");
    }

    #[test]
    fn worker_acknowledges_graceful_stop() {
        let mut worker = Worker::spawn("graceful", |ctx| {
            while !ctx.wait_for_stop(&SystemClock, Duration::from_millis(5)) {}
        })
        .unwrap();

        assert_eq!(
            worker.shutdown(Duration::from_millis(500)),
            ShutdownOutcome::Graceful
        );
        assert_eq!(
            worker.shutdown(Duration::from_millis(500)),
            ShutdownOutcome::AlreadyStopped
        );
    }

    #[test]
    fn worker_is_forced_when_it_ignores_stop() {
        let observed_gate = Arc::new(AtomicBool::new(true));
        let seen = Arc::clone(&observed_gate);

        let mut worker = Worker::spawn("stubborn", move |ctx| {
            thread::sleep(Duration::from_millis(300));
            seen.store(ctx.is_open(), Ordering::SeqCst);
        })
        .unwrap();

        assert_eq!(
            worker.shutdown(Duration::from_millis(20)),
            ShutdownOutcome::Forced
        );

        thread::sleep(Duration::from_millis(400));
        assert!(!observed_gate.load(Ordering::SeqCst));
    }

    #[test]
    fn worker_context_remembers_stop() {
        let mut worker = Worker::spawn("sticky", |ctx| {
            while !ctx.stop_requested() {
                thread::sleep(Duration::from_millis(1));
            }
            assert!(ctx.stop_requested());
            assert!(ctx.wait_for_stop(&SystemClock, Duration::from_secs(60)));
        })
        .unwrap();
        assert_eq!(
            worker.shutdown(Duration::from_secs(2)),
            ShutdownOutcome::Graceful
        );
    }
}
