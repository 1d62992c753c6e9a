//! Completion queue and event handling
//!
//! Backends push [`Completion`]s into a per-context [`CompletionQueue`]. The
//! queue is drained by whichever caller currently holds the events lock (the
//! active event handler), which matches each completion with its in-flight
//! record, writes the results into the [`Transfer`] and runs the callback.
//!
//! Callers that are not the active handler wait as event waiters and are
//! signalled every time the handler finishes a round.

use crate::backend::{Backend, Completion, TransferId};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::lock;
use crate::transfer::Transfer;
use protocol::{TransferStatus, UsbError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Completion callback of a submitted transfer
pub(crate) type Callback = Box<dyn FnOnce(&Transfer, TransferStatus, usize) + Send + 'static>;

#[derive(Default)]
struct QueueState {
    items: VecDeque<Completion>,
    /// Makes the current or next handling round return
    interrupted: bool,
    /// Makes a parked handler recompute its wake-up time and keep waiting
    rescheduled: bool,
}

/// Completions waiting to be dispatched
#[derive(Default)]
pub struct CompletionQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, completion: Completion) {
        lock(&self.state).items.push_back(completion);
        self.ready.notify_all();
    }

    /// Wake a handler blocked in [`CompletionQueue::wait`] without a completion
    pub fn interrupt(&self) {
        lock(&self.state).interrupted = true;
        self.ready.notify_all();
    }

    fn reschedule(&self) {
        lock(&self.state).rescheduled = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait up to `timeout` for completions, an interrupt or a reschedule,
    /// then drain. The flag tells whether the wait was interrupted.
    pub(crate) fn wait(&self, timeout: Duration) -> (Vec<Completion>, bool) {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        while state.items.is_empty() && !state.interrupted && !state.rescheduled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = match self.ready.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        state.rescheduled = false;
        let interrupted = std::mem::take(&mut state.interrupted);
        (state.items.drain(..).collect(), interrupted)
    }

    fn drain(&self) -> Vec<Completion> {
        lock(&self.state).items.drain(..).collect()
    }
}

/// Where a backend reports completions
#[derive(Clone)]
pub struct CompletionSink {
    queue: Arc<CompletionQueue>,
}

impl CompletionSink {
    pub fn new(queue: Arc<CompletionQueue>) -> Self {
        Self { queue }
    }

    pub fn complete(&self, completion: Completion) {
        trace!(
            "Completion queued for transfer {}: {}",
            completion.id, completion.status
        );
        self.queue.push(completion);
    }
}

struct InFlight {
    /// Keeps the transfer alive while it is on the bus
    transfer: Transfer,
    callback: Callback,
    deadline: Option<Instant>,
    timed_out: bool,
}

/// Per-context event machinery
pub(crate) struct EventLoop {
    backend: Arc<dyn Backend>,
    queue: Arc<CompletionQueue>,
    in_flight: Mutex<HashMap<TransferId, InFlight>>,
    /// Whether some caller holds the events lock
    handler: Mutex<bool>,
    handler_released: Condvar,
    /// Bumped every time waiters are signalled
    waiters: Mutex<u64>,
    waiters_signal: Condvar,
    closing: AtomicUsize,
}

impl EventLoop {
    pub(crate) fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            queue: Arc::new(CompletionQueue::new()),
            in_flight: Mutex::new(HashMap::new()),
            handler: Mutex::new(false),
            handler_released: Condvar::new(),
            waiters: Mutex::new(0),
            waiters_signal: Condvar::new(),
            closing: AtomicUsize::new(0),
        }
    }

    pub(crate) fn sink(&self) -> CompletionSink {
        CompletionSink::new(self.queue.clone())
    }

    /// Record a transfer as outstanding before it reaches the backend
    pub(crate) fn register(
        &self,
        id: TransferId,
        transfer: Transfer,
        callback: Callback,
        timeout: Duration,
    ) {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        lock(&self.in_flight).insert(
            id,
            InFlight {
                transfer,
                callback,
                deadline,
                timed_out: false,
            },
        );
        if deadline.is_some() {
            self.queue.reschedule();
        }
    }

    /// Drop the record of a transfer the backend refused
    pub(crate) fn unregister(&self, id: TransferId) {
        lock(&self.in_flight).remove(&id);
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    pub(crate) fn try_lock(&self) -> Option<EventsLock<'_>> {
        let mut held = lock(&self.handler);
        if *held {
            return None;
        }
        *held = true;
        Some(EventsLock {
            events: self,
            released: false,
        })
    }

    pub(crate) fn lock(&self) -> EventsLock<'_> {
        let mut held = lock(&self.handler);
        while *held {
            held = match self.handler_released.wait(held) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        *held = true;
        EventsLock {
            events: self,
            released: false,
        }
    }

    fn release(&self) {
        *lock(&self.handler) = false;
        self.handler_released.notify_one();
        self.signal_waiters();
    }

    pub(crate) fn handler_active(&self) -> bool {
        *lock(&self.handler)
    }

    pub(crate) fn lock_waiters(&self) -> EventWaiters<'_> {
        EventWaiters {
            events: self,
            guard: Some(lock(&self.waiters)),
        }
    }

    fn signal_waiters(&self) {
        let mut generation = lock(&self.waiters);
        *generation = generation.wrapping_add(1);
        self.waiters_signal.notify_all();
    }

    pub(crate) fn handling_ok(&self) -> bool {
        self.closing.load(Ordering::Acquire) == 0
    }

    /// Mark a handle close in progress; the active handler is woken so it can
    /// notice through [`EventLoop::handling_ok`]
    pub(crate) fn begin_close(&self) {
        self.closing.fetch_add(1, Ordering::AcqRel);
        self.queue.reschedule();
    }

    pub(crate) fn end_close(&self) {
        self.closing.fetch_sub(1, Ordering::AcqRel);
        self.signal_waiters();
    }

    pub(crate) fn interrupt(&self) {
        self.queue.interrupt();
    }

    /// Time until the earliest pending transfer deadline
    pub(crate) fn next_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        lock(&self.in_flight)
            .values()
            .filter(|entry| !entry.timed_out)
            .filter_map(|entry| entry.deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Request cancellation of every transfer whose deadline has passed
    fn expire_timeouts(&self) {
        let now = Instant::now();
        let expired: Vec<TransferId> = lock(&self.in_flight)
            .iter_mut()
            .filter(|(_, entry)| !entry.timed_out && entry.deadline.is_some_and(|d| d <= now))
            .map(|(id, entry)| {
                entry.timed_out = true;
                *id
            })
            .collect();

        for id in expired {
            debug!("Transfer {} timed out, cancelling", id);
            match self.backend.cancel(id) {
                Ok(()) | Err(UsbError::NotFound) => {}
                Err(e) => warn!("Failed to cancel timed out transfer {}: {}", id, e),
            }
        }
    }

    /// Handle events until at least one completion is dispatched, the
    /// handler is interrupted or `timeout` elapses; the caller holds the
    /// events lock
    pub(crate) fn handle_locked(&self, timeout: Duration) {
        let end = Instant::now() + timeout;
        loop {
            let remaining = end.saturating_duration_since(Instant::now());
            if !self.handling_ok() {
                // A handle is being closed; step aside until it is done
                if self.wait_for_close(remaining) {
                    continue;
                }
                break;
            }
            self.expire_timeouts();

            let wait = match self.next_timeout() {
                Some(until_deadline) => remaining.min(until_deadline),
                None => remaining,
            };
            let (mut completions, interrupted) = self.queue.wait(wait);

            self.expire_timeouts();
            completions.extend(self.queue.drain());

            let dispatched = !completions.is_empty();
            for completion in completions {
                self.dispatch(completion);
            }
            if dispatched || interrupted || Instant::now() >= end {
                break;
            }
        }

        self.signal_waiters();
    }

    /// Sleep until no handle close is in progress, at most `limit`
    ///
    /// Returns whether handling may continue.
    fn wait_for_close(&self, limit: Duration) -> bool {
        let generation = lock(&self.waiters);
        if self.handling_ok() || limit.is_zero() {
            return self.handling_ok();
        }
        let current = *generation;
        // end_close bumps the generation after clearing its close marker
        let _ = self
            .waiters_signal
            .wait_timeout_while(generation, limit, |g| {
                *g == current && !self.handling_ok()
            });
        self.handling_ok()
    }

    fn dispatch(&self, completion: Completion) {
        let Some(entry) = lock(&self.in_flight).remove(&completion.id) else {
            warn!("Dropping completion for unknown transfer {}", completion.id);
            return;
        };

        let mut status = completion.status;
        if entry.timed_out && status == TransferStatus::Cancelled {
            status = TransferStatus::TimedOut;
        }
        let actual_length = completion.actual_length;

        trace!(
            "Dispatching transfer {}: status={}, actual_length={}",
            completion.id, status, actual_length
        );

        entry.transfer.complete(status, completion);
        (entry.callback)(&entry.transfer, status, actual_length);
        // entry.transfer dropped here: the engine's strong reference ends
    }

    /// Forget every outstanding transfer without running callbacks
    pub(crate) fn abandon_all(&self) -> usize {
        let abandoned: Vec<InFlight> = lock(&self.in_flight).drain().map(|(_, e)| e).collect();
        for entry in &abandoned {
            entry.transfer.abandon();
        }
        abandoned.len()
    }
}

/// Proof of being the active event handler
///
/// Released by [`EventsLock::unlock`] or on drop. Releasing also signals
/// event waiters.
pub struct EventsLock<'a> {
    events: &'a EventLoop,
    released: bool,
}

impl EventsLock<'_> {
    pub fn unlock(mut self) {
        self.released = true;
        self.events.release();
    }

    pub(crate) fn belongs_to(&self, events: &EventLoop) -> bool {
        std::ptr::eq(self.events, events)
    }
}

impl Drop for EventsLock<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.events.release();
        }
    }
}

/// The event waiters lock
///
/// Held while checking a condition that the active handler may change, then
/// [`EventWaiters::wait_for_event`] atomically releases it and sleeps.
pub struct EventWaiters<'a> {
    events: &'a EventLoop,
    guard: Option<MutexGuard<'a, u64>>,
}

impl EventWaiters<'_> {
    /// Sleep until the active handler signals or `timeout` elapses
    ///
    /// Returns `true` if the timeout elapsed without a signal.
    pub fn wait_for_event(&mut self, timeout: Option<Duration>) -> bool {
        let Some(guard) = self.guard.take() else {
            return true;
        };
        let generation = *guard;
        let signal = &self.events.waiters_signal;

        let (guard, timed_out) = match timeout {
            Some(timeout) => {
                match signal.wait_timeout_while(guard, timeout, |g| *g == generation) {
                    Ok((guard, result)) => (guard, result.timed_out()),
                    Err(poisoned) => {
                        let (guard, result) = poisoned.into_inner();
                        (guard, result.timed_out())
                    }
                }
            }
            None => match signal.wait_while(guard, |g| *g == generation) {
                Ok(guard) => (guard, false),
                Err(poisoned) => (poisoned.into_inner(), false),
            },
        };

        self.guard = Some(guard);
        timed_out
    }

    pub fn unlock(self) {}
}

/// Background thread driving a context's event loop
///
/// The usual setup for callers that only use asynchronous transfers and do
/// not want to drive events themselves.
pub struct EventThread {
    context: Context,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventThread {
    /// How long one handling round may block before checking for stop
    const POLL_INTERVAL: Duration = Duration::from_millis(100);

    pub fn spawn(context: Context) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread_context = context.clone();

        let thread = std::thread::Builder::new()
            .name("usb-events".to_string())
            .spawn(move || run_event_thread(thread_context, thread_stop))
            .map_err(|e| {
                warn!("Failed to spawn event thread: {}", e);
                Error::Usb(UsbError::NoMem)
            })?;

        Ok(Self {
            context,
            stop,
            thread: Some(thread),
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.context.interrupt_event_handler();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Event thread panicked");
        }
    }
}

impl Drop for EventThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_event_thread(context: Context, stop: Arc<AtomicBool>) {
    debug!("Event thread started");

    while !stop.load(Ordering::Acquire) {
        match context.handle_events_timeout(EventThread::POLL_INTERVAL) {
            Ok(()) => {}
            Err(Error::InvalidContext) => break,
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(EventThread::POLL_INTERVAL);
            }
        }
    }

    debug!("Event thread stopped");
}
