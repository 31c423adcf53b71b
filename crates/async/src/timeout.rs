//! Cancellable timeout combinator.
//!
//! [`with_timeout`] races a unit of work against a deadline timer on the same
//! [`EventLoop`]. Whichever finishes first decides the outward promise; the
//! loser is cancelled and its late outcome, if any, is ignored.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use tracing::debug;

use crate::{AsyncError, Deferred, EventLoop, Promise, TimerHandle};

/// When a guarded operation gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// No timer is created; the work may run forever.
    Never,
    After(Duration),
}

impl Deadline {
    /// Converts a millisecond count. Zero and negative values mean
    /// [`Deadline::Never`], not "expire immediately".
    pub fn from_millis(ms: i64) -> Self {
        match u64::try_from(ms) {
            Ok(ms) if ms > 0 => Deadline::After(Duration::from_millis(ms)),
            _ => Deadline::Never,
        }
    }

    /// `None` is the explicit "no timeout" sentinel.
    pub fn from_opt_millis(ms: Option<i64>) -> Self {
        ms.map_or(Deadline::Never, Deadline::from_millis)
    }
}

impl From<Duration> for Deadline {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() { Deadline::Never } else { Deadline::After(duration) }
    }
}

impl From<Option<Duration>> for Deadline {
    fn from(duration: Option<Duration>) -> Self {
        duration.map_or(Deadline::Never, Deadline::from)
    }
}

/// Shared decision state between the timer, the work and the caller.
#[derive(Debug, Default)]
struct TimeoutGuard {
    decided: Cell<bool>,
    timer: RefCell<Option<TimerHandle>>,
}

impl TimeoutGuard {
    /// Returns `true` exactly once, for whoever gets here first.
    fn decide(&self) -> bool {
        !self.decided.replace(true)
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.borrow_mut().take() {
            timer.cancel();
        }
    }
}

/// Runs `work` on `event_loop` and fails it with [`AsyncError::Timeout`] if it
/// has not settled by `deadline`.
///
/// - work settles first: the timer is cancelled and the outcome is forwarded;
/// - the timer fires first: the work task is cancelled and the returned promise
///   is rejected with a timeout naming `name`;
/// - the returned promise is cancelled: both the timer and the work are
///   cancelled.
///
/// ```
/// use micro_async::{timeout::with_timeout, AsyncError, EventLoop};
/// use std::time::Duration;
///
/// let event_loop = EventLoop::virtual_time();
/// let el = event_loop.clone();
/// let guarded = with_timeout(&event_loop, Duration::from_millis(100), "slow", async move {
///     el.sleep(Duration::from_secs(10)).await?;
///     Ok("done")
/// });
///
/// let err = event_loop.block_on(guarded).unwrap_err();
/// assert!(matches!(err, AsyncError::Timeout { ref name, .. } if name == "slow"));
/// ```
pub fn with_timeout<T, F>(event_loop: &EventLoop, deadline: impl Into<Deadline>, name: &str, work: F) -> Promise<T>
where
    F: Future<Output = Result<T, AsyncError>> + 'static,
    T: Clone + 'static,
{
    let outward = Deferred::new();
    let guard = Rc::new(TimeoutGuard::default());
    let work = event_loop.spawn(work);

    if let Deadline::After(delay) = deadline.into() {
        let started = event_loop.now();
        let weak_loop = event_loop.downgrade();
        let (timer_guard, work, outward, name) = (Rc::clone(&guard), work.clone(), outward.clone(), name.to_string());
        let timer = event_loop.set_timeout(delay, move || {
            if !timer_guard.decide() {
                return;
            }
            let elapsed = weak_loop.upgrade().map_or(delay, |el| el.now().saturating_sub(started));
            debug!(operation = %name, ?elapsed, "deadline reached, cancelling work");
            work.cancel_with(format!("timeout of `{name}`"));
            outward.reject(AsyncError::timeout(name, delay, elapsed));
        });
        *guard.timer.borrow_mut() = Some(timer);
    }

    {
        let (guard, outward) = (Rc::clone(&guard), outward.clone());
        work.on_settle(move |outcome| {
            if guard.decide() {
                guard.cancel_timer();
                outward.complete(outcome.clone());
            }
        });
    }

    outward.on_cancel(move || {
        if guard.decide() {
            guard.cancel_timer();
            work.cancel();
        }
    });

    outward.promise()
}

/// [`with_timeout`] taking the optional millisecond form, where `None` (or a
/// non-positive value) means no timeout.
pub fn with_opt_timeout<T, F>(event_loop: &EventLoop, ms: Option<i64>, name: &str, work: F) -> Promise<T>
where
    F: Future<Output = Result<T, AsyncError>> + 'static,
    T: Clone + 'static,
{
    with_timeout(event_loop, Deadline::from_opt_millis(ms), name, work)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PromiseState;

    #[test]
    fn deadline_conversions() {
        assert_eq!(Deadline::from_millis(250), Deadline::After(Duration::from_millis(250)));
        assert_eq!(Deadline::from_millis(0), Deadline::Never);
        assert_eq!(Deadline::from_millis(-5), Deadline::Never);
        assert_eq!(Deadline::from_opt_millis(None), Deadline::Never);
        assert_eq!(Deadline::from(Duration::ZERO), Deadline::Never);
    }

    #[test]
    fn work_finishing_first_wins_and_cancels_timer() {
        let event_loop = EventLoop::virtual_time();
        let el = event_loop.clone();
        let guarded = with_timeout(&event_loop, Duration::from_millis(100), "fast", async move {
            el.sleep(Duration::from_millis(40)).await?;
            Ok(7)
        });

        assert_eq!(event_loop.pending_timers(), 1);
        event_loop.run();

        assert_eq!(guarded.outcome().unwrap().unwrap(), 7);
        assert_eq!(event_loop.now(), Duration::from_millis(40));
        assert_eq!(event_loop.pending_timers(), 0);
    }

    #[test]
    fn work_error_is_forwarded() {
        let event_loop = EventLoop::virtual_time();
        let guarded: Promise<u8> =
            with_timeout(&event_loop, Duration::from_millis(100), "broken", async { Err(AsyncError::failed("broken pipe")) });

        event_loop.run();
        assert!(matches!(guarded.outcome(), Some(Err(AsyncError::Failed { .. }))));
        assert_eq!(guarded.state(), PromiseState::Rejected);
    }

    #[test]
    fn deadline_first_rejects_with_named_timeout() {
        let event_loop = EventLoop::virtual_time();
        let finished = Rc::new(Cell::new(false));

        let el = event_loop.clone();
        let f = Rc::clone(&finished);
        let guarded = with_timeout(&event_loop, Duration::from_millis(100), "download", async move {
            el.sleep(Duration::from_millis(500)).await?;
            f.set(true);
            Ok(())
        });

        event_loop.run();

        match guarded.outcome() {
            Some(Err(AsyncError::Timeout { name, deadline, elapsed })) => {
                assert_eq!(name, "download");
                assert_eq!(deadline, Duration::from_millis(100));
                assert_eq!(elapsed, Duration::from_millis(100));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!finished.get());
        assert_eq!(event_loop.pending_tasks(), 0);
    }

    #[test]
    fn late_work_completion_is_ignored() {
        let event_loop = EventLoop::virtual_time();
        let work = Deferred::<u32>::new();
        let guarded = with_timeout(&event_loop, Duration::from_millis(10), "late", work.promise());

        event_loop.run();
        assert!(guarded.outcome().unwrap().unwrap_err().is_timeout());

        // the inner promise is still pending from the producer's view and may be resolved later
        work.resolve(99);
        event_loop.run();
        assert!(guarded.outcome().unwrap().unwrap_err().is_timeout());
    }

    #[test]
    fn cancelling_the_guard_cancels_timer_and_work() {
        let event_loop = EventLoop::virtual_time();
        let dropped = Rc::new(Cell::new(false));

        struct SetOnDrop(Rc<Cell<bool>>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let el = event_loop.clone();
        let marker = SetOnDrop(Rc::clone(&dropped));
        let guarded = with_timeout(&event_loop, Duration::from_secs(1), "cancelled", async move {
            let _marker = marker;
            el.sleep(Duration::from_secs(5)).await?;
            Ok(())
        });

        event_loop.run_until_stalled();
        assert!(guarded.cancel());
        assert!(dropped.get());

        event_loop.run();
        assert_eq!(guarded.state(), PromiseState::Cancelled);
        assert!(event_loop.now() >= Duration::from_secs(5), "only the orphaned sleep timer is left to fire");
    }

    #[test]
    fn no_deadline_creates_no_timer() {
        let event_loop = EventLoop::virtual_time();
        let el = event_loop.clone();
        let guarded = with_opt_timeout(&event_loop, None, "unbounded", async move {
            el.sleep(Duration::from_secs(3600)).await?;
            Ok("eventually")
        });

        event_loop.run_until_stalled();
        assert_eq!(event_loop.pending_timers(), 1, "only the work's own sleep");
        event_loop.run();
        assert_eq!(guarded.outcome().unwrap().unwrap(), "eventually");
    }

    #[test]
    fn non_positive_millis_mean_no_timeout() {
        let event_loop = EventLoop::virtual_time();
        let el = event_loop.clone();
        let guarded = with_opt_timeout(&event_loop, Some(0), "zero", async move {
            el.sleep(Duration::from_millis(50)).await?;
            Ok(1)
        });
        event_loop.run();
        assert_eq!(guarded.outcome().unwrap().unwrap(), 1);
    }
}
