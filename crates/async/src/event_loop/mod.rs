//! The single-timeline scheduler.
//!
//! An [`EventLoop`] owns three things: a queue of timers ordered by deadline,
//! the tasks spawned on it, and a queue of tasks that were woken. Everything
//! registered against one loop runs on the thread that created it and never
//! concurrently with anything else on that loop.
//!
//! The loop's notion of "now" comes from a clock that is either the system's
//! monotonic clock or a virtual clock that only moves when the loop has nothing
//! else to do. The virtual variant makes timer races fully deterministic and is
//! what the tests in this workspace run on.
//!
//! # Example
//!
//! ```
//! use micro_async::EventLoop;
//! use std::time::Duration;
//!
//! let event_loop = EventLoop::virtual_time();
//! let el = event_loop.clone();
//! let value = event_loop
//!     .block_on(async move {
//!         el.sleep(Duration::from_secs(5)).await?;
//!         Ok(42)
//!     })
//!     .unwrap();
//!
//! assert_eq!(value, 42);
//! assert_eq!(event_loop.now(), Duration::from_secs(5));
//! ```

mod task;
mod timer;

pub use timer::TimerHandle;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::{debug, trace};

use crate::worker::WorkerPool;
use crate::{AsyncError, Deferred, Promise};
use task::{ReadyQueue, SettleOnCompletion, Task, TaskId};
use timer::{TimerCallback, TimerQueue};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug)]
enum Clock {
    System { origin: Instant },
    Virtual { now: Cell<Duration> },
}

impl Clock {
    fn now(&self) -> Duration {
        match self {
            Clock::System { origin } => origin.elapsed(),
            Clock::Virtual { now } => now.get(),
        }
    }
}

struct Shared {
    clock: Clock,
    timers: RefCell<TimerQueue>,
    tasks: RefCell<HashMap<TaskId, Rc<Task>>>,
    next_task_id: Cell<TaskId>,
    ready: Arc<ReadyQueue>,
    workers: RefCell<WorkerPool>,
    outstanding_jobs: Rc<Cell<usize>>,
    shut_down: Cell<bool>,
}

/// A cooperative scheduler for timers and tasks.
///
/// `EventLoop` is a cheap handle (`Rc` inside); clones drive the same loop.
/// It is `!Send`: run one loop per thread and use
/// [`run_in_worker`](EventLoop::run_in_worker) to move blocking work away.
///
/// Tasks commonly hold a clone of the loop they run on, so a loop with
/// pending work is not freed by dropping the handles. Call
/// [`shutdown`](EventLoop::shutdown) to release it.
#[derive(Clone)]
pub struct EventLoop {
    shared: Rc<Shared>,
}

/// A non-owning reference to an [`EventLoop`], held by callbacks that the loop
/// itself stores so the loop is not kept alive by its own timers.
#[derive(Clone, Debug)]
pub(crate) struct WeakEventLoop {
    shared: Weak<Shared>,
}

impl WeakEventLoop {
    pub(crate) fn upgrade(&self) -> Option<EventLoop> {
        self.shared.upgrade().map(|shared| EventLoop { shared })
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("clock", &self.shared.clock)
            .field("timers", &self.shared.timers.borrow().live())
            .field("tasks", &self.shared.tasks.borrow().len())
            .finish()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Configures an [`EventLoop`] before it is created.
#[derive(Debug)]
pub struct EventLoopBuilder {
    virtual_time: bool,
    worker_threads: Option<usize>,
    worker_thread_name: String,
}

impl EventLoopBuilder {
    fn new() -> Self {
        Self { virtual_time: false, worker_threads: None, worker_thread_name: String::from("micro-async-worker") }
    }

    /// Uses a virtual clock that starts at zero and only advances when the
    /// loop would otherwise wait for a timer.
    pub fn virtual_time(mut self) -> Self {
        self.virtual_time = true;
        self
    }

    /// Caps the number of threads used by [`EventLoop::run_in_worker`].
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads.max(1));
        self
    }

    pub fn worker_thread_name<S: Into<String>>(mut self, name: S) -> Self {
        self.worker_thread_name = name.into();
        self
    }

    pub fn build(self) -> EventLoop {
        let clock = if self.virtual_time {
            Clock::Virtual { now: Cell::new(Duration::ZERO) }
        } else {
            Clock::System { origin: Instant::now() }
        };

        EventLoop {
            shared: Rc::new(Shared {
                clock,
                timers: RefCell::new(TimerQueue::new()),
                tasks: RefCell::new(HashMap::new()),
                next_task_id: Cell::new(0),
                ready: Arc::new(ReadyQueue::for_current_thread()),
                workers: RefCell::new(WorkerPool::new(self.worker_threads, self.worker_thread_name)),
                outstanding_jobs: Rc::new(Cell::new(0)),
                shut_down: Cell::new(false),
            }),
        }
    }
}

impl EventLoop {
    /// Creates a loop driven by the system's monotonic clock.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a deterministic loop driven by a virtual clock.
    pub fn virtual_time() -> Self {
        Self::builder().virtual_time().build()
    }

    pub fn builder() -> EventLoopBuilder {
        EventLoopBuilder::new()
    }

    pub(crate) fn downgrade(&self) -> WeakEventLoop {
        WeakEventLoop { shared: Rc::downgrade(&self.shared) }
    }

    /// Time elapsed on this loop's clock since the loop was created.
    pub fn now(&self) -> Duration {
        self.shared.clock.now()
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.shared.clock, Clock::Virtual { .. })
    }

    /// Number of timers that may still fire.
    pub fn pending_timers(&self) -> usize {
        self.shared.timers.borrow().live()
    }

    /// Number of spawned tasks that have not finished.
    pub fn pending_tasks(&self) -> usize {
        self.shared.tasks.borrow().len()
    }

    /// Schedules `callback` to run once after `delay`.
    pub fn set_timeout<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + 'static,
    {
        if self.is_shut_down() {
            return TimerHandle::inert();
        }
        let deadline = self.now() + delay;
        let handle = self.shared.timers.borrow_mut().insert(deadline, TimerCallback::Once(Box::new(callback)));
        trace!(timer = handle.id(), ?deadline, "timer scheduled");
        handle
    }

    /// Millisecond form of [`set_timeout`](EventLoop::set_timeout). A negative
    /// delay yields a handle for a timer that never fires.
    pub fn set_timeout_ms<F>(&self, delay_ms: i64, callback: F) -> TimerHandle
    where
        F: FnOnce() + 'static,
    {
        match u64::try_from(delay_ms) {
            Ok(ms) => self.set_timeout(Duration::from_millis(ms), callback),
            Err(_) => TimerHandle::inert(),
        }
    }

    /// Schedules `callback` every `period` until the handle is cancelled.
    /// Periods shorter than one millisecond are rounded up to one.
    pub fn set_interval<F>(&self, period: Duration, callback: F) -> TimerHandle
    where
        F: FnMut() + 'static,
    {
        if self.is_shut_down() {
            return TimerHandle::inert();
        }
        let period = period.max(MIN_INTERVAL);
        let deadline = self.now() + period;
        self.shared.timers.borrow_mut().insert(deadline, TimerCallback::Repeat { period, callback: Box::new(callback) })
    }

    /// Cancels a timer; a no-op for timers that fired or were cancelled.
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        handle.cancel()
    }

    /// Returns a promise resolved after `delay`. Cancelling the promise
    /// cancels the underlying timer.
    pub fn sleep(&self, delay: Duration) -> Promise<()> {
        let deferred = Deferred::new();
        let resolver = deferred.clone();
        let timer = self.set_timeout(delay, move || {
            resolver.resolve(());
        });
        deferred.on_cancel(move || {
            timer.cancel();
        });
        deferred.promise()
    }

    /// Spawns `future` as a task on this loop.
    ///
    /// The task is first polled on the next loop turn, not synchronously.
    /// Cancelling the returned promise drops the task's future.
    pub fn spawn<T, F>(&self, future: F) -> Promise<T>
    where
        F: Future<Output = Result<T, AsyncError>> + 'static,
        T: Clone + 'static,
    {
        if self.is_shut_down() {
            return Promise::rejected(AsyncError::cancelled_with("event loop is shut down"));
        }
        let deferred = Deferred::new();
        let promise = deferred.promise();
        let id = self.spawn_task(SettleOnCompletion::new(future, deferred).boxed_local());

        let event_loop = self.downgrade();
        promise.on_cancel(move || {
            if let Some(event_loop) = event_loop.upgrade() {
                event_loop.cancel_task(id);
            }
        });
        promise
    }

    /// Spawns a fire-and-forget task. It can only be cancelled by dropping the loop.
    pub fn spawn_local<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.spawn_task(future.boxed_local());
    }

    fn spawn_task(&self, future: futures::future::LocalBoxFuture<'static, ()>) -> TaskId {
        let id = self.shared.next_task_id.get();
        self.shared.next_task_id.set(id + 1);
        if self.is_shut_down() {
            trace!(task = id, "loop is shut down, dropping task");
            return id;
        }

        let task = Rc::new(Task::new(id, future, Arc::clone(&self.shared.ready)));
        self.shared.tasks.borrow_mut().insert(id, Rc::clone(&task));
        task.schedule();
        trace!(task = id, "task spawned");
        id
    }

    fn cancel_task(&self, id: TaskId) {
        let task = self.shared.tasks.borrow_mut().remove(&id);
        if let Some(task) = task {
            debug!(task = id, "task cancelled");
            task.cancel();
        }
    }

    /// Runs `work` on the worker pool and returns a promise the loop can await
    /// without blocking. Cancelling the promise stops waiting for the result
    /// but cannot interrupt `work` once it started.
    pub fn run_in_worker<T, F>(&self, work: F) -> Promise<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Clone + Send + 'static,
    {
        let receiver = match self.shared.workers.borrow().submit(work) {
            Ok(receiver) => receiver,
            Err(e) => return Promise::rejected(e),
        };

        let jobs = OutstandingJob::register(&self.shared.outstanding_jobs);
        self.spawn(async move {
            let _job = jobs;
            receiver.await.map_err(|_canceled| AsyncError::failed("worker job ended without producing a result"))
        })
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.get()
    }

    /// Drops every pending task and timer and stops the worker pool.
    ///
    /// This breaks the reference cycles between the loop and the futures it
    /// owns. Afterwards the loop accepts no new work: timers are inert,
    /// spawned promises are cancelled and fire-and-forget tasks are dropped.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shut_down.replace(true) {
            return;
        }
        let tasks = std::mem::take(&mut *self.shared.tasks.borrow_mut());
        let timers = self.shared.timers.borrow_mut().clear();
        while self.shared.ready.pop().is_some() {}
        self.shared.workers.borrow_mut().shutdown();
        debug!(tasks = tasks.len(), timers = timers.len(), "event loop shut down");

        // dropping futures and callbacks may call back into the loop
        for task in tasks.into_values() {
            task.cancel();
        }
        drop(timers);
    }

    fn run_ready_tasks(&self) -> bool {
        let mut progressed = false;
        while let Some(id) = self.shared.ready.pop() {
            let task = self.shared.tasks.borrow().get(&id).cloned();
            let Some(task) = task else {
                continue;
            };

            progressed = true;
            if task.poll() {
                let finished = self.shared.tasks.borrow_mut().remove(&id);
                drop(finished);
                trace!(task = id, "task finished");
            }
        }
        progressed
    }

    fn fire_due_timers(&self) -> bool {
        let now = self.now();
        let mut fired = false;

        loop {
            let entry = self.shared.timers.borrow_mut().pop_due(now);
            let Some(entry) = entry else {
                break;
            };

            fired = true;
            entry.mark_fired();
            trace!(timer = entry.handle.id(), deadline = ?entry.deadline, "timer fired");
            match entry.callback {
                TimerCallback::Once(callback) => callback(),
                TimerCallback::Repeat { period, mut callback } => {
                    callback();
                    if entry.handle.is_active() && !self.is_shut_down() {
                        let deadline = entry.deadline + period;
                        self.shared.timers.borrow_mut().rearm(deadline, entry.handle, TimerCallback::Repeat { period, callback });
                    }
                }
            }
        }
        fired
    }

    /// Runs every ready task and due timer, without waiting, until neither
    /// produces further work.
    pub fn run_until_stalled(&self) {
        loop {
            let ran_tasks = self.run_ready_tasks();
            let fired_timers = self.fire_due_timers();
            if !ran_tasks && !fired_timers {
                break;
            }
        }
    }

    /// Waits for the next event no later than `limit`. Returns `false` when
    /// nothing can ever happen on this loop (or nothing before `limit` on a
    /// virtual clock).
    fn wait_for_event(&self, limit: Option<Duration>) -> bool {
        if !self.shared.ready.is_empty() {
            return true;
        }

        let next = self.shared.timers.borrow_mut().next_deadline();
        let outstanding = self.shared.outstanding_jobs.get() > 0;

        match &self.shared.clock {
            Clock::Virtual { now } => {
                if outstanding {
                    // workers run in real time, let them finish before time jumps
                    thread::park();
                    return true;
                }
                match next {
                    Some(deadline) if limit.is_none_or(|limit| deadline <= limit) => {
                        now.set(deadline.max(now.get()));
                        true
                    }
                    _ => false,
                }
            }
            Clock::System { .. } => {
                let wake_at = match (next, limit) {
                    (Some(deadline), Some(limit)) => Some(deadline.min(limit)),
                    (deadline, limit) => deadline.or(limit),
                };
                match wake_at {
                    Some(wake_at) => {
                        let now = self.now();
                        if wake_at > now {
                            thread::park_timeout(wake_at - now);
                        }
                        true
                    }
                    None if outstanding => {
                        thread::park();
                        true
                    }
                    None => false,
                }
            }
        }
    }

    /// Drives the loop until no task can make progress and no timer is left.
    pub fn run(&self) {
        loop {
            self.run_until_stalled();
            if !self.wait_for_event(None) {
                break;
            }
        }
    }

    /// Moves the loop forward by `duration`, firing timers in deadline order
    /// and running tasks between them. On the system clock this blocks for
    /// `duration`.
    pub fn advance(&self, duration: Duration) {
        let target = self.now() + duration;
        loop {
            self.run_until_stalled();
            if self.now() >= target || !self.wait_for_event(Some(target)) {
                break;
            }
        }

        if let Clock::Virtual { now } = &self.shared.clock {
            if now.get() < target {
                now.set(target);
                self.run_until_stalled();
            }
        }
    }

    /// Spawns `future` and drives the loop until it completes.
    ///
    /// Fails with [`AsyncError::Stalled`] if the loop runs out of work first;
    /// the task is cancelled in that case.
    pub fn block_on<T, F>(&self, future: F) -> Result<T, AsyncError>
    where
        F: Future<Output = Result<T, AsyncError>> + 'static,
        T: Clone + 'static,
    {
        let promise = self.spawn(future);
        loop {
            self.run_until_stalled();
            if let Some(outcome) = promise.outcome() {
                return outcome;
            }
            if !self.wait_for_event(None) {
                promise.cancel();
                return Err(AsyncError::Stalled);
            }
        }
    }
}

/// Counts a worker job as outstanding until dropped, so the loop parks instead
/// of returning while a result is still on its way.
struct OutstandingJob {
    counter: Rc<Cell<usize>>,
}

impl OutstandingJob {
    fn register(counter: &Rc<Cell<usize>>) -> Self {
        counter.set(counter.get() + 1);
        Self { counter: Rc::clone(counter) }
    }
}

impl Drop for OutstandingJob {
    fn drop(&mut self) {
        self.counter.set(self.counter.get().saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PromiseState;

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn FnOnce()>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_clone = Rc::clone(&log);
        let make = move |name: &'static str| {
            let log = Rc::clone(&log_clone);
            Box::new(move || log.borrow_mut().push(name)) as Box<dyn FnOnce()>
        };
        (log, make)
    }

    #[test]
    fn timers_fire_in_deadline_order_with_fifo_ties() {
        let event_loop = EventLoop::virtual_time();
        let (log, make) = recorder();

        event_loop.set_timeout(Duration::from_millis(30), make("c"));
        event_loop.set_timeout(Duration::from_millis(10), make("a"));
        event_loop.set_timeout(Duration::from_millis(30), make("d"));
        event_loop.set_timeout(Duration::from_millis(20), make("b"));

        event_loop.run();
        assert_eq!(*log.borrow(), vec!["a", "b", "c", "d"]);
        assert_eq!(event_loop.now(), Duration::from_millis(30));
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let event_loop = EventLoop::virtual_time();
        let (log, make) = recorder();

        let handle = event_loop.set_timeout(Duration::from_millis(10), make("cancelled"));
        event_loop.set_timeout(Duration::from_millis(20), make("kept"));
        assert!(event_loop.cancel(&handle));
        assert!(!event_loop.cancel(&handle));

        event_loop.run();
        assert_eq!(*log.borrow(), vec!["kept"]);
    }

    #[test]
    fn cancel_after_fire_is_noop() {
        let event_loop = EventLoop::virtual_time();
        let (log, make) = recorder();
        let handle = event_loop.set_timeout(Duration::ZERO, make("fired"));
        event_loop.run_until_stalled();

        assert!(handle.has_fired());
        assert!(!handle.cancel());
        assert_eq!(*log.borrow(), vec!["fired"]);
    }

    #[test]
    fn negative_delay_never_fires() {
        let event_loop = EventLoop::virtual_time();
        let (log, make) = recorder();
        let handle = event_loop.set_timeout_ms(-1, make("never"));
        event_loop.run();

        assert!(!handle.is_active());
        assert!(log.borrow().is_empty());
        assert_eq!(event_loop.pending_timers(), 0);
    }

    #[test]
    fn timer_can_cancel_a_sibling_with_the_same_deadline() {
        let event_loop = EventLoop::virtual_time();
        let (log, make) = recorder();

        let second = Rc::new(RefCell::new(None::<TimerHandle>));
        let second_clone = Rc::clone(&second);
        event_loop.set_timeout(Duration::from_millis(5), move || {
            if let Some(handle) = second_clone.borrow().as_ref() {
                handle.cancel();
            }
        });
        *second.borrow_mut() = Some(event_loop.set_timeout(Duration::from_millis(5), make("second")));

        event_loop.run();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn interval_repeats_until_cancelled() {
        let event_loop = EventLoop::virtual_time();
        let ticks = Rc::new(Cell::new(0));

        let t = Rc::clone(&ticks);
        let handle = event_loop.set_interval(Duration::from_millis(10), move || t.set(t.get() + 1));

        event_loop.advance(Duration::from_millis(35));
        assert_eq!(ticks.get(), 3);

        handle.cancel();
        event_loop.advance(Duration::from_millis(100));
        assert_eq!(ticks.get(), 3);
        assert_eq!(event_loop.now(), Duration::from_millis(135));
    }

    #[test]
    fn spawn_resolves_promise() {
        let event_loop = EventLoop::virtual_time();
        let promise = event_loop.spawn(async { Ok(5) });
        assert_eq!(promise.state(), PromiseState::Pending);

        event_loop.run_until_stalled();
        assert_eq!(promise.outcome().unwrap().unwrap(), 5);
        assert_eq!(event_loop.pending_tasks(), 0);
    }

    #[test]
    fn cancelling_spawned_task_drops_it() {
        let event_loop = EventLoop::virtual_time();
        let reached = Rc::new(Cell::new(false));

        let el = event_loop.clone();
        let r = Rc::clone(&reached);
        let promise = event_loop.spawn(async move {
            el.sleep(Duration::from_millis(100)).await?;
            r.set(true);
            Ok(())
        });

        event_loop.advance(Duration::from_millis(10));
        assert!(promise.cancel());
        event_loop.run();

        assert!(!reached.get());
        assert_eq!(promise.state(), PromiseState::Cancelled);
        assert_eq!(event_loop.pending_tasks(), 0);
        assert_eq!(event_loop.pending_timers(), 0);
    }

    #[test]
    fn task_can_cancel_itself() {
        let event_loop = EventLoop::virtual_time();
        let slot = Rc::new(RefCell::new(None::<Promise<()>>));

        let s = Rc::clone(&slot);
        let el = event_loop.clone();
        let promise = event_loop.spawn(async move {
            if let Some(me) = s.borrow().as_ref() {
                me.cancel();
            }
            el.sleep(Duration::from_secs(1)).await?;
            Ok(())
        });
        *slot.borrow_mut() = Some(promise.clone());

        event_loop.run();
        assert_eq!(promise.state(), PromiseState::Cancelled);
        assert_eq!(event_loop.pending_tasks(), 0);
    }

    #[test]
    fn block_on_reports_stall() {
        let event_loop = EventLoop::virtual_time();
        let never = Deferred::<u8>::new().promise();
        let result = event_loop.block_on(never);
        assert!(matches!(result, Err(AsyncError::Stalled)));
    }

    #[test]
    fn sleep_cancellation_cancels_timer() {
        let event_loop = EventLoop::virtual_time();
        let sleep = event_loop.sleep(Duration::from_secs(3));
        assert_eq!(event_loop.pending_timers(), 1);
        sleep.cancel();
        assert_eq!(event_loop.pending_timers(), 0);
    }

    #[test]
    fn system_clock_sleep_completes() {
        let event_loop = EventLoop::new();
        let el = event_loop.clone();
        let started = Instant::now();
        event_loop.block_on(async move { el.sleep(Duration::from_millis(20)).await }).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn run_in_worker_delivers_result() {
        let event_loop = EventLoop::builder().worker_threads(2).build();
        let promise = event_loop.run_in_worker(|| (1..=10u64).product::<u64>());
        let value = event_loop.block_on(promise).unwrap();
        assert_eq!(value, 3_628_800);
    }

    #[test]
    fn run_in_worker_on_virtual_loop() {
        let event_loop = EventLoop::virtual_time();
        let promise = event_loop.run_in_worker(|| {
            thread::sleep(Duration::from_millis(5));
            String::from("offloaded")
        });
        event_loop.run();
        assert_eq!(promise.outcome().unwrap().unwrap(), "offloaded");
        assert_eq!(event_loop.now(), Duration::ZERO);
    }

    #[test]
    fn spawn_local_runs_to_completion() {
        let event_loop = EventLoop::virtual_time();
        let done = Rc::new(Cell::new(false));
        let flag = Rc::clone(&done);
        let el = event_loop.clone();
        event_loop.spawn_local(async move {
            let _ = el.sleep(Duration::from_millis(3)).await;
            flag.set(true);
        });
        assert!(!done.get());
        event_loop.run();
        assert!(done.get());
        assert_eq!(event_loop.pending_tasks(), 0);
    }

    struct SetOnDrop(Rc<Cell<bool>>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    #[test]
    fn shutdown_drops_pending_tasks_and_timers() {
        let event_loop = EventLoop::virtual_time();
        let task_dropped = Rc::new(Cell::new(false));
        let timer_dropped = Rc::new(Cell::new(false));

        let el = event_loop.clone();
        let marker = SetOnDrop(Rc::clone(&task_dropped));
        event_loop.spawn_local(async move {
            let _marker = marker;
            let _ = Deferred::<()>::new().promise().await;
            drop(el);
        });
        let marker = SetOnDrop(Rc::clone(&timer_dropped));
        let timer = event_loop.set_timeout(Duration::from_secs(60), move || drop(marker));

        event_loop.run_until_stalled();
        assert_eq!(event_loop.pending_tasks(), 1);
        assert!(!task_dropped.get());

        let weak = event_loop.downgrade();
        event_loop.shutdown();
        assert!(task_dropped.get());
        assert!(timer_dropped.get());
        assert!(timer.is_cancelled());
        assert_eq!(event_loop.pending_tasks(), 0);
        assert_eq!(event_loop.pending_timers(), 0);

        drop(event_loop);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn shut_down_loop_accepts_no_new_work() {
        let event_loop = EventLoop::virtual_time();
        event_loop.shutdown();
        event_loop.shutdown();
        assert!(event_loop.is_shut_down());

        assert!(!event_loop.set_timeout(Duration::from_millis(1), || {}).is_active());
        assert!(!event_loop.set_interval(Duration::from_millis(1), || {}).is_active());
        let promise = event_loop.spawn(async { Ok(1) });
        assert!(promise.outcome().unwrap().unwrap_err().is_cancelled());
        assert!(event_loop.run_in_worker(|| 1).outcome().unwrap().is_err());

        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        event_loop.spawn_local(async move { flag.set(true) });
        event_loop.run();
        assert!(!ran.get());
    }

    #[test]
    fn interval_stops_when_its_callback_shuts_the_loop_down() {
        let event_loop = EventLoop::virtual_time();
        let ticks = Rc::new(Cell::new(0));
        let t = Rc::clone(&ticks);
        let el = event_loop.clone();
        event_loop.set_interval(Duration::from_millis(10), move || {
            t.set(t.get() + 1);
            el.shutdown();
        });

        event_loop.run();
        assert_eq!(ticks.get(), 1);
        assert_eq!(event_loop.pending_timers(), 0);
    }
}
